//! RTP receive loop
//!
//! Owns the UDP listener, feeds every datagram through the jitter
//! reassembler and hands reconstructed samples to a [`SampleSink`] in order.
//! The sink is closed before [`ReceiveStream::stop`] returns; packets still
//! waiting in the reassembler at that point are not delivered.

use bytes::Bytes;
use crossbeam_channel::TrySendError;
use parking_lot::Mutex;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::error::NetworkError;
use crate::lifecycle::{StageQueue, StageReceiver, StageSender, StreamState, StreamStatus};
use crate::network::jitter::{JitterReassembler, ReassembledSample, ReassemblerConfig, ReassemblerStats};
use crate::network::udp;
use crate::protocol::NetworkPacket;

/// Largest datagram the loop reads
const RECV_BUFFER_SIZE: usize = 65536;

/// Downstream consumer of reassembled samples
pub trait SampleSink: Send {
    /// An error stops the receive loop
    fn write_sample(&mut self, sample: ReassembledSample) -> Result<(), NetworkError>;

    /// Called once when the loop exits; nothing may reach consumers after
    fn close(&mut self) {}
}

/// Sink publishing samples on a bounded channel
pub struct ChannelSink {
    queue: StageQueue<ReassembledSample>,
    tx: Option<StageSender<ReassembledSample>>,
    dropped: Arc<AtomicU64>,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Self, StageReceiver<ReassembledSample>) {
        let (queue, tx) = StageQueue::bounded(capacity);
        let rx = queue.subscribe();
        (
            Self {
                queue,
                tx: Some(tx),
                dropped: Arc::new(AtomicU64::new(0)),
            },
            rx,
        )
    }

    /// Counter of samples the consumer never got: queue full, or unread at close
    pub fn dropped_counter(&self) -> Arc<AtomicU64> {
        self.dropped.clone()
    }
}

impl SampleSink for ChannelSink {
    fn write_sample(&mut self, sample: ReassembledSample) -> Result<(), NetworkError> {
        let tx = self.tx.as_ref().ok_or(NetworkError::SinkClosed)?;
        match tx.try_send(sample) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(sample)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!("Sample queue full, sample {} dropped", sample.sequence);
                Ok(())
            }
            Err(TrySendError::Disconnected(_)) => Err(NetworkError::SinkClosed),
        }
    }

    /// Closes the channel and discards samples nobody has read yet
    fn close(&mut self) {
        self.tx = None;
        let discarded = self.queue.discard_pending();
        if discarded > 0 {
            self.dropped.fetch_add(discarded as u64, Ordering::Relaxed);
            debug!("Discarded {} undelivered samples", discarded);
        }
    }
}

#[derive(Default)]
struct ReceiveCounters {
    datagrams: AtomicU64,
    bytes: AtomicU64,
    invalid_packets: AtomicU64,
    samples_delivered: AtomicU64,
}

/// Receive loop statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReceiveStats {
    pub datagrams: u64,
    pub bytes: u64,
    pub invalid_packets: u64,
    pub samples_delivered: u64,
    pub reassembler: ReassemblerStats,
}

/// Listener plus reassembler, driven by one background thread
pub struct ReceiveStream {
    status: StreamStatus<NetworkError>,
    counters: Arc<ReceiveCounters>,
    reassembler_stats: Arc<Mutex<ReassemblerStats>>,
    pending: Option<(UdpSocket, JitterReassembler, Box<dyn SampleSink>)>,
    local_addr: SocketAddr,
    stop_flag: Arc<AtomicBool>,
    thread_handle: Option<JoinHandle<()>>,
}

impl ReceiveStream {
    /// Bind the listener; the loop does not run until [`start`](Self::start)
    pub fn bind(
        addr: SocketAddr,
        read_timeout: Duration,
        config: ReassemblerConfig,
        sink: Box<dyn SampleSink>,
    ) -> Result<Self, NetworkError> {
        let socket = udp::bind_listener(addr, read_timeout)?;
        Self::from_socket(socket, config, sink)
    }

    /// Use an already bound socket; it must carry a read timeout
    pub fn from_socket(
        socket: UdpSocket,
        config: ReassemblerConfig,
        sink: Box<dyn SampleSink>,
    ) -> Result<Self, NetworkError> {
        let local_addr = socket
            .local_addr()
            .map_err(|e| NetworkError::BindFailed(e.to_string()))?;

        Ok(Self {
            status: StreamStatus::new(),
            counters: Arc::new(ReceiveCounters::default()),
            reassembler_stats: Arc::new(Mutex::new(ReassemblerStats::default())),
            pending: Some((socket, JitterReassembler::new(config), sink)),
            local_addr,
            stop_flag: Arc::new(AtomicBool::new(false)),
            thread_handle: None,
        })
    }

    pub fn start(&mut self) -> Result<(), NetworkError> {
        if self
            .status
            .transition(StreamState::Created, StreamState::Running)
            .is_err()
        {
            return Err(NetworkError::ReceiveFailed(format!(
                "receive stream is {}",
                self.status.state().as_str()
            )));
        }
        let (socket, reassembler, sink) = match self.pending.take() {
            Some(parts) => parts,
            None => return Err(NetworkError::ReceiveFailed("listener already consumed".into())),
        };

        let receive_loop = ReceiveLoop {
            socket,
            reassembler,
            sink,
            counters: self.counters.clone(),
            reassembler_stats: self.reassembler_stats.clone(),
            stop_flag: self.stop_flag.clone(),
            status: self.status.clone(),
        };
        let handle = thread::Builder::new()
            .name("rtp-receive".to_string())
            .spawn(move || receive_loop.run())
            .map_err(|e| NetworkError::ReceiveFailed(e.to_string()))?;
        self.thread_handle = Some(handle);

        info!("Receive stream started on {}", self.local_addr);
        Ok(())
    }

    /// Stop the loop and wait for it; returns the error that ended it, if any
    pub fn stop(&mut self) -> Result<(), NetworkError> {
        self.stop_flag.store(true, Ordering::SeqCst);
        if let Some(handle) = self.thread_handle.take() {
            handle
                .join()
                .map_err(|_| NetworkError::ReceiveFailed("receive thread panicked".into()))?;
            info!("Receive stream stopped");
        }
        if let Some((_, _, mut sink)) = self.pending.take() {
            sink.close();
        }
        self.status.set(StreamState::Stopped);

        match self.status.failure() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn state(&self) -> StreamState {
        self.status.state()
    }

    pub fn error(&self) -> Option<NetworkError> {
        self.status.failure()
    }

    pub fn stats(&self) -> ReceiveStats {
        ReceiveStats {
            datagrams: self.counters.datagrams.load(Ordering::Relaxed),
            bytes: self.counters.bytes.load(Ordering::Relaxed),
            invalid_packets: self.counters.invalid_packets.load(Ordering::Relaxed),
            samples_delivered: self.counters.samples_delivered.load(Ordering::Relaxed),
            reassembler: self.reassembler_stats.lock().clone(),
        }
    }
}

impl Drop for ReceiveStream {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

struct ReceiveLoop {
    socket: UdpSocket,
    reassembler: JitterReassembler,
    sink: Box<dyn SampleSink>,
    counters: Arc<ReceiveCounters>,
    reassembler_stats: Arc<Mutex<ReassemblerStats>>,
    stop_flag: Arc<AtomicBool>,
    status: StreamStatus<NetworkError>,
}

impl ReceiveLoop {
    fn run(mut self) {
        let mut buf = vec![0u8; RECV_BUFFER_SIZE];

        while !self.stop_flag.load(Ordering::SeqCst) {
            let size = match self.socket.recv_from(&mut buf) {
                Ok((size, _)) => size,
                Err(e) if udp::is_timeout(&e) => continue,
                Err(e) => {
                    error!("Listener failed: {}", e);
                    self.status.fail(NetworkError::ReceiveFailed(e.to_string()));
                    break;
                }
            };

            self.counters.datagrams.fetch_add(1, Ordering::Relaxed);
            self.counters.bytes.fetch_add(size as u64, Ordering::Relaxed);

            match NetworkPacket::decode(Bytes::copy_from_slice(&buf[..size])) {
                Ok(packet) => self.reassembler.push(packet),
                Err(e) => {
                    self.counters.invalid_packets.fetch_add(1, Ordering::Relaxed);
                    warn!("Dropping datagram of {} bytes: {}", size, e);
                    continue;
                }
            }

            let delivered = self.deliver_ready();
            *self.reassembler_stats.lock() = self.reassembler.stats();
            if let Err(e) = delivered {
                error!("Sample sink failed: {}", e);
                self.status.fail(e);
                break;
            }
        }

        let buffered = self.reassembler.buffered();
        if buffered > 0 {
            debug!("Receive loop exiting with {} packets buffered", buffered);
        }
        self.sink.close();
        self.status.set(StreamState::Stopped);
        debug!("Receive loop exited");
    }

    fn deliver_ready(&mut self) -> Result<(), NetworkError> {
        while let Some(sample) = self.reassembler.pop() {
            self.deliver(sample)?;
        }
        Ok(())
    }

    fn deliver(&mut self, sample: ReassembledSample) -> Result<(), NetworkError> {
        if sample.prev_dropped_packets > 0 {
            debug!(
                "{} packets lost before {}",
                sample.prev_dropped_packets, sample.sequence
            );
        }
        self.sink.write_sample(sample)?;
        self.counters.samples_delivered.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn packet(sequence: u16) -> Bytes {
        NetworkPacket {
            payload_type: 111,
            marker: false,
            sequence,
            timestamp: sequence as u32 * 960,
            ssrc: 7,
            payload: Bytes::from(vec![sequence as u8; 10]),
        }
        .encode()
    }

    fn stream(depth: u16) -> (ReceiveStream, StageReceiver<ReassembledSample>, UdpSocket) {
        let (sink, rx) = ChannelSink::new(64);
        let config = ReassemblerConfig {
            reorder_depth: depth,
            ..ReassemblerConfig::default()
        };
        let stream = ReceiveStream::bind(
            "127.0.0.1:0".parse().unwrap(),
            Duration::from_millis(10),
            config,
            Box::new(sink),
        )
        .unwrap();
        let sender = udp::connect_sender(stream.local_addr()).unwrap();
        (stream, rx, sender)
    }

    fn wait_for(stream: &ReceiveStream, datagrams: u64) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while stream.stats().datagrams < datagrams && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_reordered_packets_arrive_in_order() {
        let (mut stream, rx, sender) = stream(2);
        stream.start().unwrap();

        for seq in [3, 1, 2, 4, 5] {
            sender.send(&packet(seq)).unwrap();
        }

        let sequences: Vec<_> = (0..5)
            .map(|_| rx.recv_timeout(Duration::from_secs(2)).unwrap().sequence)
            .collect();
        assert_eq!(sequences, vec![1, 2, 3, 4, 5]);

        stream.stop().unwrap();
        assert_eq!(stream.state(), StreamState::Stopped);
        assert_eq!(stream.stats().samples_delivered, 5);
    }

    #[test]
    fn test_no_sample_visible_after_stop() {
        let (mut stream, rx, sender) = stream(0);
        stream.start().unwrap();

        for seq in 1..=4 {
            sender.send(&packet(seq)).unwrap();
        }
        let deadline = Instant::now() + Duration::from_secs(2);
        while stream.stats().samples_delivered < 4 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(stream.stats().samples_delivered, 4);

        // Delivered but never read
        stream.stop().unwrap();
        assert!(matches!(rx.try_recv(), Err(crossbeam_channel::TryRecvError::Disconnected)));
    }

    #[test]
    fn test_channel_sink_reports_dropped_consumer() {
        let (mut sink, rx) = ChannelSink::new(4);
        let reader = rx.clone();
        drop(rx);

        let sample = |sequence| ReassembledSample {
            sequence,
            timestamp: 0,
            payload: Bytes::new(),
            duration: Duration::from_millis(20),
            prev_dropped_packets: 0,
        };
        assert_eq!(sink.write_sample(sample(1)), Ok(()));
        assert_eq!(reader.try_recv().map(|s| s.sequence), Ok(1));

        drop(reader);
        assert_eq!(sink.write_sample(sample(2)), Err(NetworkError::SinkClosed));
    }

    #[test]
    fn test_invalid_datagrams_are_counted() {
        let (mut stream, rx, sender) = stream(0);
        stream.start().unwrap();

        sender.send(b"junk").unwrap();
        sender.send(&packet(1)).unwrap();
        wait_for(&stream, 2);

        let sample = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(sample.sequence, 1);
        stream.stop().unwrap();
        assert_eq!(stream.stats().invalid_packets, 1);
    }

    #[test]
    fn test_sink_failure_stops_loop() {
        let (mut stream, rx, sender) = stream(0);
        drop(rx);
        stream.start().unwrap();

        sender.send(&packet(1)).unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        while stream.state() != StreamState::Stopped && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }

        assert_eq!(stream.state(), StreamState::Stopped);
        assert_eq!(stream.error(), Some(NetworkError::SinkClosed));
        assert_eq!(stream.stop(), Err(NetworkError::SinkClosed));
    }

    #[test]
    fn test_start_twice_fails() {
        let (mut stream, _rx, _sender) = stream(0);
        stream.start().unwrap();
        assert!(stream.start().is_err());
        stream.stop().unwrap();
    }

    #[test]
    fn test_stop_without_start_closes_sink() {
        let (mut stream, rx, _sender) = stream(0);
        stream.stop().unwrap();
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        assert_eq!(stream.state(), StreamState::Stopped);
    }
}
