//! Audio capture from input devices
//!
//! The platform delivers audio on its own thread through [`ReadCallback`],
//! which only copies bytes into the producer half of the stream's
//! [`RingBuffer`]. A dedicated drain thread wakes once per buffer duration,
//! empties the consumer half and publishes what it found as one
//! [`AudioChunk`].

use bytes::Bytes;
use cpal::traits::{DeviceTrait, StreamTrait};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::audio::buffer::{RingBuffer, RingConsumer, RingProducer, RingStats};
use crate::audio::device::{negotiate, AudioDevice, DeviceCatalog};
use crate::audio::format::CaptureStreamConfig;
use crate::constants::{DEFAULT_BUFFER_DURATION_MS, DEFAULT_CHUNK_QUEUE, DEFAULT_HEADROOM_BUFFERS};
use crate::error::AudioError;
use crate::lifecycle::{StageQueue, StageReceiver, StageSender, StreamState, StreamStatus};

/// Contiguous PCM drained from the ring buffer at one tick
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioChunk {
    pub data: Bytes,
}

impl AudioChunk {
    pub fn new(data: Bytes) -> Self {
        Self { data }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Timing and sizing of a capture stream
#[derive(Debug, Clone, Copy)]
pub struct CaptureOptions {
    /// Drain period; also the nominal chunk duration
    pub buffer_duration: Duration,
    /// Ring buffer capacity, in buffer durations
    pub headroom_buffers: u32,
    /// Chunks the outbound channel holds before new ones are dropped
    pub chunk_queue: usize,
}

impl CaptureOptions {
    pub fn headroom(&self) -> Duration {
        self.buffer_duration * self.headroom_buffers.max(1)
    }
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            buffer_duration: Duration::from_millis(DEFAULT_BUFFER_DURATION_MS),
            headroom_buffers: DEFAULT_HEADROOM_BUFFERS,
            chunk_queue: DEFAULT_CHUNK_QUEUE,
        }
    }
}

#[derive(Default)]
struct CaptureCounters {
    frames_captured: AtomicU64,
    chunks_published: AtomicU64,
    bytes_published: AtomicU64,
    chunks_dropped: AtomicU64,
    chunks_discarded: AtomicU64,
}

/// Capture statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CaptureStats {
    pub frames_captured: u64,
    pub overflows: u64,
    pub overflow_bytes: u64,
    pub chunks_published: u64,
    pub bytes_published: u64,
    pub chunks_dropped: u64,
    /// Published but still queued when the stream stopped
    pub chunks_discarded: u64,
}

/// Push edge handed to the platform: copies audio into the ring buffer
pub struct ReadCallback {
    producer: RingProducer,
    frame_bytes: usize,
    counters: Arc<CaptureCounters>,
    errors: ReadErrorHandle,
}

/// Failure path of a [`ReadCallback`], cloneable into a platform error closure
#[derive(Clone)]
pub struct ReadErrorHandle {
    status: StreamStatus<AudioError>,
    wake: Sender<()>,
}

impl ReadErrorHandle {
    /// Record a platform read/commit failure and wake the drain loop
    pub fn on_error(&self, err: AudioError) {
        error!("Capture read failed: {}", err);
        self.status.fail(err);
        let _ = self.wake.try_send(());
    }
}

impl ReadCallback {
    /// Handle one platform read of up to `frame_count_max` frames
    ///
    /// `areas` holds the interleaved samples; `None` means the platform had
    /// no sample data for this call and the same duration of silence is
    /// written instead. Returns the number of frames stored, which is zero
    /// once the stream has failed.
    pub fn on_read(&mut self, frame_count_max: usize, areas: Option<&[u8]>) -> usize {
        if self.errors.status.has_failed() {
            return 0;
        }

        let fb = self.frame_bytes;
        let written = match areas {
            Some(data) => {
                let frames = (data.len() / fb).min(frame_count_max);
                self.producer.write_frames(&data[..frames * fb], fb)
            }
            None => self.producer.write_silence(frame_count_max * fb, fb),
        };

        let frames = written / fb;
        self.counters
            .frames_captured
            .fetch_add(frames as u64, Ordering::Relaxed);

        let offered = areas.map_or(frame_count_max, |d| (d.len() / fb).min(frame_count_max));
        if frames < offered {
            warn!(
                "Capture overflow {}: dropped {} frames",
                self.producer.stats().overflow_count(),
                offered - frames
            );
        }
        frames
    }

    /// Free space in the ring buffer, in whole frames
    pub fn free_frames(&self) -> usize {
        self.producer.free() / self.frame_bytes
    }

    /// Report a platform read/commit failure; the stream stops right away
    pub fn on_error(&self, err: AudioError) {
        self.errors.on_error(err);
    }

    pub fn error_handle(&self) -> ReadErrorHandle {
        self.errors.clone()
    }
}

/// Platform stream that is open and delivering to a [`ReadCallback`]
///
/// Dropping it releases the device.
pub trait ActiveCapture {
    /// Pump pending platform events; called once per drain tick
    fn flush_events(&mut self) {}
}

/// Something that can open a capture stream for a negotiated configuration
pub trait CaptureBackend: Send {
    fn open(
        self: Box<Self>,
        config: &CaptureStreamConfig,
        callback: ReadCallback,
    ) -> Result<Box<dyn ActiveCapture>, AudioError>;
}

/// cpal-backed capture
pub struct CpalBackend {
    device: cpal::Device,
}

impl CpalBackend {
    pub fn new(device: AudioDevice) -> Self {
        Self {
            device: device.into_inner(),
        }
    }
}

struct CpalActive {
    _stream: cpal::Stream,
}

impl ActiveCapture for CpalActive {}

impl CaptureBackend for CpalBackend {
    fn open(
        self: Box<Self>,
        config: &CaptureStreamConfig,
        mut callback: ReadCallback,
    ) -> Result<Box<dyn ActiveCapture>, AudioError> {
        let frame_bytes = config.frame_bytes();
        let errors = callback.error_handle();

        let stream = self.device.build_input_stream_raw(
            &config.to_cpal(),
            config.sample_format.into(),
            move |data: &cpal::Data, _: &cpal::InputCallbackInfo| {
                let bytes = data.bytes();
                callback.on_read(bytes.len() / frame_bytes, Some(bytes));
            },
            move |err| errors.on_error(err.into()),
            None,
        )?;
        stream.play()?;

        Ok(Box::new(CpalActive { _stream: stream }))
    }
}

/// One capture session: negotiated config, ring buffer, drain thread
pub struct CaptureStream {
    config: CaptureStreamConfig,
    options: CaptureOptions,
    ring: Option<(RingProducer, RingConsumer)>,
    ring_stats: Arc<RingStats>,
    buffer_capacity: usize,
    counters: Arc<CaptureCounters>,
    status: StreamStatus<AudioError>,
    backend: Option<Box<dyn CaptureBackend>>,
    output: StageQueue<AudioChunk>,
    output_tx: Option<StageSender<AudioChunk>>,
    stop_tx: Option<Sender<()>>,
    thread_handle: Option<JoinHandle<()>>,
}

impl CaptureStream {
    /// Create a stream over `backend` without touching the device yet
    pub fn new(
        backend: Box<dyn CaptureBackend>,
        config: CaptureStreamConfig,
        options: CaptureOptions,
    ) -> Self {
        let (producer, consumer) = RingBuffer::for_stream(&config, options.headroom());
        let (output, output_tx) = StageQueue::bounded(options.chunk_queue);

        debug!(
            "Capture stream: {:?}, ring buffer {} bytes, tick {:?}",
            config,
            producer.capacity(),
            options.buffer_duration
        );

        Self {
            config,
            options,
            ring_stats: producer.stats().clone(),
            buffer_capacity: producer.capacity(),
            ring: Some((producer, consumer)),
            counters: Arc::new(CaptureCounters::default()),
            status: StreamStatus::new(),
            backend: Some(backend),
            output,
            output_tx: Some(output_tx),
            stop_tx: None,
            thread_handle: None,
        }
    }

    /// Look up `device_id`, negotiate its format and prepare a cpal stream
    ///
    /// Negotiation happens before any device stream is opened.
    pub fn open<C>(catalog: &C, device_id: &str, options: CaptureOptions) -> Result<Self, AudioError>
    where
        C: DeviceCatalog<Device = AudioDevice>,
    {
        let device = catalog.device(device_id)?;
        let caps = catalog.capabilities(&device)?;
        let config = negotiate(&caps)?;
        info!(
            "Capture {} negotiated {:?} {} Hz x{}",
            device_id, config.sample_format, config.sample_rate, config.channels
        );
        Ok(Self::new(Box::new(CpalBackend::new(device)), config, options))
    }

    /// Open the device and start the drain loop
    pub fn start(&mut self) -> Result<(), AudioError> {
        if let Err(found) = self
            .status
            .transition(StreamState::Created, StreamState::Running)
        {
            return Err(AudioError::InvalidState {
                expected: StreamState::Created.as_str(),
                found: found.as_str(),
            });
        }

        let (backend, output_tx, (producer, consumer)) =
            match (self.backend.take(), self.output_tx.take(), self.ring.take()) {
                (Some(backend), Some(tx), Some(ring)) => (backend, tx, ring),
                _ => {
                    self.status.set(StreamState::Stopped);
                    return Err(AudioError::StreamError("capture stream already consumed".into()));
                }
            };

        // A read failure wakes the drain loop through the stop channel
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let (ready_tx, ready_rx) = bounded::<Result<(), AudioError>>(1);
        let callback = ReadCallback {
            producer,
            frame_bytes: self.config.frame_bytes(),
            counters: self.counters.clone(),
            errors: ReadErrorHandle {
                status: self.status.clone(),
                wake: stop_tx.clone(),
            },
        };
        let drain = DrainLoop {
            config: self.config,
            buffer_duration: self.options.buffer_duration,
            consumer,
            counters: self.counters.clone(),
            status: self.status.clone(),
            output: output_tx,
            stop: stop_rx,
        };

        let handle = thread::Builder::new()
            .name("capture-drain".to_string())
            .spawn(move || drain.run(backend, callback, ready_tx))
            .map_err(|e| AudioError::StreamError(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                self.stop_tx = Some(stop_tx);
                self.thread_handle = Some(handle);
                info!("Audio capture started");
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(_) => {
                let _ = handle.join();
                self.status.set(StreamState::Stopped);
                Err(AudioError::StreamError("capture thread exited during start".into()))
            }
        }
    }

    /// Signal the drain loop, wait for it to exit and release the device
    ///
    /// Chunks still queued when the loop has exited are discarded, so none
    /// is observed after this returns. Returns the read failure that ended
    /// the session, if there was one.
    pub fn stop(&mut self) -> Result<(), AudioError> {
        if self
            .status
            .transition(StreamState::Created, StreamState::Stopped)
            .is_ok()
        {
            self.output_tx.take();
            return Ok(());
        }
        let _ = self
            .status
            .transition(StreamState::Running, StreamState::Stopping);

        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.try_send(());
        }
        if let Some(handle) = self.thread_handle.take() {
            handle
                .join()
                .map_err(|_| AudioError::StreamError("capture thread panicked".into()))?;
            info!("Audio capture stopped");
        }
        self.status.set(StreamState::Stopped);

        let discarded = self.output.discard_pending();
        if discarded > 0 {
            self.counters
                .chunks_discarded
                .fetch_add(discarded as u64, Ordering::Relaxed);
            debug!("Discarded {} undelivered chunks", discarded);
        }

        match self.status.failure() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Chunk stream; closes when the session ends
    ///
    /// Once every handle returned here is dropped, the drain loop ends the
    /// session at its next publish.
    pub fn chunks(&self) -> StageReceiver<AudioChunk> {
        self.output.subscribe()
    }

    pub fn state(&self) -> StreamState {
        self.status.state()
    }

    /// Failure that stopped the stream, if any
    pub fn error(&self) -> Option<AudioError> {
        self.status.failure()
    }

    pub fn config(&self) -> &CaptureStreamConfig {
        &self.config
    }

    pub fn sample_rate(&self) -> u32 {
        self.config.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.config.channels
    }

    pub fn buffer_capacity(&self) -> usize {
        self.buffer_capacity
    }

    pub fn stats(&self) -> CaptureStats {
        CaptureStats {
            frames_captured: self.counters.frames_captured.load(Ordering::Relaxed),
            overflows: self.ring_stats.overflow_count(),
            overflow_bytes: self.ring_stats.dropped_bytes(),
            chunks_published: self.counters.chunks_published.load(Ordering::Relaxed),
            bytes_published: self.counters.bytes_published.load(Ordering::Relaxed),
            chunks_dropped: self.counters.chunks_dropped.load(Ordering::Relaxed),
            chunks_discarded: self.counters.chunks_discarded.load(Ordering::Relaxed),
        }
    }
}

impl Drop for CaptureStream {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

struct DrainLoop {
    config: CaptureStreamConfig,
    buffer_duration: Duration,
    consumer: RingConsumer,
    counters: Arc<CaptureCounters>,
    status: StreamStatus<AudioError>,
    output: StageSender<AudioChunk>,
    stop: Receiver<()>,
}

impl DrainLoop {
    fn run(
        mut self,
        backend: Box<dyn CaptureBackend>,
        callback: ReadCallback,
        ready: Sender<Result<(), AudioError>>,
    ) {
        let mut active = match backend.open(&self.config, callback) {
            Ok(active) => {
                let _ = ready.send(Ok(()));
                active
            }
            Err(e) => {
                error!("Failed to open capture stream: {}", e);
                self.status.set(StreamState::Stopped);
                let _ = ready.send(Err(e));
                return;
            }
        };

        loop {
            active.flush_events();

            // Sleeping on the stop channel keeps the tick cadence while
            // letting stop() or a read failure cut the wait short.
            let woken = !matches!(
                self.stop.recv_timeout(self.buffer_duration),
                Err(RecvTimeoutError::Timeout)
            );

            if let Some(e) = self.status.failure() {
                error!("Capture stopped after device failure: {}", e);
                break;
            }

            let data = self.consumer.drain_all();
            if !data.is_empty() && !self.publish(data) {
                debug!("Chunk consumers gone, ending capture");
                break;
            }

            if woken {
                debug!("Stop requested, drain loop exiting");
                break;
            }
        }

        // Release the device before closing the chunk stream
        drop(active);
        self.status.set(StreamState::Stopped);
        debug!("Drain loop stopped");
    }

    /// Returns false once every consumer handle is gone
    fn publish(&self, data: Bytes) -> bool {
        let len = data.len();
        match self.output.try_send(AudioChunk::new(data)) {
            Ok(()) => {
                self.counters.chunks_published.fetch_add(1, Ordering::Relaxed);
                self.counters
                    .bytes_published
                    .fetch_add(len as u64, Ordering::Relaxed);
                debug!("Published {} byte chunk", len);
                true
            }
            Err(TrySendError::Full(_)) => {
                let dropped = self.counters.chunks_dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!("Chunk queue full, dropped {} bytes ({} chunks so far)", len, dropped);
                true
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }
}
