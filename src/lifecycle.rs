//! Stream lifecycle shared by the capture, encode, send and receive loops
//!
//! A stream is created, started once, stopped once. The state lives in an
//! atomic so the owning handle and its background thread can both observe
//! and advance it.
//!
//! Each stage publishes into a [`StageQueue`]. The stage keeps the queue so
//! it can discard leftovers when it stops, and hands out counted
//! [`StageReceiver`]s so its loop notices when the last consumer is gone.

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// Lifecycle of a background stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StreamState {
    Created = 0,
    Running = 1,
    Stopping = 2,
    Stopped = 3,
}

impl StreamState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => StreamState::Created,
            1 => StreamState::Running,
            2 => StreamState::Stopping,
            _ => StreamState::Stopped,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StreamState::Created => "created",
            StreamState::Running => "running",
            StreamState::Stopping => "stopping",
            StreamState::Stopped => "stopped",
        }
    }
}

/// Shared state cell plus the first fatal error reported by the loop
#[derive(Clone)]
pub struct StreamStatus<E> {
    state: Arc<AtomicU8>,
    failed: Arc<AtomicBool>,
    failure: Arc<Mutex<Option<E>>>,
}

impl<E: Clone> StreamStatus<E> {
    pub fn new() -> Self {
        Self {
            state: Arc::new(AtomicU8::new(StreamState::Created as u8)),
            failed: Arc::new(AtomicBool::new(false)),
            failure: Arc::new(Mutex::new(None)),
        }
    }

    pub fn state(&self) -> StreamState {
        StreamState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set(&self, state: StreamState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Move `from -> to`; returns the observed state on mismatch
    pub fn transition(&self, from: StreamState, to: StreamState) -> Result<(), StreamState> {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(StreamState::from_u8)
    }

    /// Record a fatal error; only the first one is kept
    pub fn fail(&self, error: E) {
        let mut failure = self.failure.lock();
        if failure.is_none() {
            *failure = Some(error);
        }
        self.failed.store(true, Ordering::Release);
    }

    pub fn failure(&self) -> Option<E> {
        self.failure.lock().clone()
    }

    /// Lock-free; safe to poll from a real-time callback
    pub fn has_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }
}

impl<E: Clone> Default for StreamStatus<E> {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Default)]
struct Consumers {
    live: AtomicUsize,
    subscribed: AtomicBool,
}

impl Consumers {
    /// Someone subscribed and every handle has since been dropped
    fn gone(&self) -> bool {
        self.subscribed.load(Ordering::Acquire) && self.live.load(Ordering::Acquire) == 0
    }
}

/// Keeps one consumer of a stage output registered while alive
pub struct ConsumerGuard {
    consumers: Arc<Consumers>,
}

impl ConsumerGuard {
    fn register(consumers: Arc<Consumers>) -> Self {
        consumers.live.fetch_add(1, Ordering::AcqRel);
        consumers.subscribed.store(true, Ordering::Release);
        Self { consumers }
    }
}

impl Clone for ConsumerGuard {
    fn clone(&self) -> Self {
        Self::register(self.consumers.clone())
    }
}

impl Drop for ConsumerGuard {
    fn drop(&mut self) {
        self.consumers.live.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Receiving end of a stage output
///
/// Derefs to the underlying crossbeam receiver. Once every handle obtained
/// from a stage is dropped, the stage sees its consumers as gone.
pub struct StageReceiver<T> {
    rx: Receiver<T>,
    guard: ConsumerGuard,
}

impl<T> StageReceiver<T> {
    /// Split into the raw receiver (for `select!`) and the registration
    pub fn into_parts(self) -> (Receiver<T>, ConsumerGuard) {
        (self.rx, self.guard)
    }
}

impl<T> Clone for StageReceiver<T> {
    fn clone(&self) -> Self {
        Self {
            rx: self.rx.clone(),
            guard: self.guard.clone(),
        }
    }
}

impl<T> Deref for StageReceiver<T> {
    type Target = Receiver<T>;

    fn deref(&self) -> &Receiver<T> {
        &self.rx
    }
}

/// Wrap a plain channel; its producer is closed by dropping senders only
impl<T> From<Receiver<T>> for StageReceiver<T> {
    fn from(rx: Receiver<T>) -> Self {
        Self {
            rx,
            guard: ConsumerGuard::register(Arc::default()),
        }
    }
}

/// Publishing end of a stage output
pub struct StageSender<T> {
    tx: Sender<T>,
    consumers: Arc<Consumers>,
}

impl<T> StageSender<T> {
    /// `Disconnected` once every subscribed consumer handle is dropped
    pub fn try_send(&self, value: T) -> Result<(), TrySendError<T>> {
        if self.consumers.gone() {
            return Err(TrySendError::Disconnected(value));
        }
        self.tx.try_send(value)
    }
}

/// Bounded output queue owned by the publishing stage
pub struct StageQueue<T> {
    rx: Receiver<T>,
    consumers: Arc<Consumers>,
}

impl<T> StageQueue<T> {
    /// The queue closes for consumers when the returned sender is dropped
    pub fn bounded(capacity: usize) -> (Self, StageSender<T>) {
        let (tx, rx) = bounded(capacity.max(1));
        let consumers = Arc::new(Consumers::default());
        (
            Self {
                rx,
                consumers: consumers.clone(),
            },
            StageSender { tx, consumers },
        )
    }

    pub fn subscribe(&self) -> StageReceiver<T> {
        StageReceiver {
            rx: self.rx.clone(),
            guard: ConsumerGuard::register(self.consumers.clone()),
        }
    }

    /// Drop everything still queued; returns how many items went
    pub fn discard_pending(&self) -> usize {
        self.rx.try_iter().count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_checks_current_state() {
        let status: StreamStatus<String> = StreamStatus::new();
        assert_eq!(status.state(), StreamState::Created);

        assert!(status.transition(StreamState::Created, StreamState::Running).is_ok());
        assert_eq!(
            status.transition(StreamState::Created, StreamState::Running),
            Err(StreamState::Running)
        );
    }

    #[test]
    fn test_first_failure_wins() {
        let status: StreamStatus<String> = StreamStatus::new();
        status.fail("first".to_string());
        status.fail("second".to_string());
        assert_eq!(status.failure().as_deref(), Some("first"));
    }

    #[test]
    fn test_failure_flag_is_set_by_fail() {
        let status: StreamStatus<String> = StreamStatus::new();
        assert!(!status.has_failed());
        status.clone().fail("xrun".to_string());
        assert!(status.has_failed());
    }

    #[test]
    fn test_sender_sees_consumers_gone() {
        let (queue, tx) = StageQueue::<u32>::bounded(4);

        // Nobody subscribed yet: items queue up
        assert!(tx.try_send(1).is_ok());

        let first = queue.subscribe();
        let second = first.clone();
        assert_eq!(first.try_recv(), Ok(1));
        drop(first);
        assert!(tx.try_send(2).is_ok());

        drop(second);
        assert!(matches!(tx.try_send(3), Err(TrySendError::Disconnected(3))));
    }

    #[test]
    fn test_split_receiver_keeps_registration() {
        let (queue, tx) = StageQueue::<u32>::bounded(4);
        let (rx, guard) = queue.subscribe().into_parts();

        assert!(tx.try_send(7).is_ok());
        assert_eq!(rx.try_recv(), Ok(7));
        drop(guard);
        assert!(matches!(tx.try_send(8), Err(TrySendError::Disconnected(8))));
    }

    #[test]
    fn test_discard_pending_empties_queue() {
        let (queue, tx) = StageQueue::<u32>::bounded(4);
        let rx = queue.subscribe();
        tx.try_send(1).unwrap();
        tx.try_send(2).unwrap();
        drop(tx);

        assert_eq!(queue.discard_pending(), 2);
        assert!(rx.try_recv().is_err());
        assert!(rx.recv().is_err(), "closed once the sender is gone");
    }
}
