//! RTP send loop: encoded frames in, UDP datagrams out

use crossbeam_channel::{bounded, select, Receiver, Sender};
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

use crate::codec::frame_encoder::EncodedFrame;
use crate::constants::MAX_PACKET_SIZE;
use crate::error::NetworkError;
use crate::lifecycle::{ConsumerGuard, StageReceiver, StreamState, StreamStatus};
use crate::network::udp;
use crate::protocol::RtpPacketizer;

#[derive(Default)]
struct SendCounters {
    packets_sent: AtomicU64,
    bytes_sent: AtomicU64,
    oversized: AtomicU64,
}

/// Sender statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendStats {
    pub packets_sent: u64,
    pub bytes_sent: u64,
    /// Frames too large for one datagram
    pub oversized: u64,
}

pub struct FrameSender {
    status: StreamStatus<NetworkError>,
    counters: Arc<SendCounters>,
    pending: Option<(UdpSocket, RtpPacketizer, StageReceiver<EncodedFrame>)>,
    destination: SocketAddr,
    stop_tx: Option<Sender<()>>,
    thread_handle: Option<JoinHandle<()>>,
}

impl FrameSender {
    pub fn new(
        destination: SocketAddr,
        packetizer: RtpPacketizer,
        frames: StageReceiver<EncodedFrame>,
    ) -> Result<Self, NetworkError> {
        let socket = udp::connect_sender(destination)?;
        Ok(Self {
            status: StreamStatus::new(),
            counters: Arc::new(SendCounters::default()),
            pending: Some((socket, packetizer, frames)),
            destination,
            stop_tx: None,
            thread_handle: None,
        })
    }

    pub fn start(&mut self) -> Result<(), NetworkError> {
        if self
            .status
            .transition(StreamState::Created, StreamState::Running)
            .is_err()
        {
            return Err(NetworkError::SendFailed(format!(
                "sender is {}",
                self.status.state().as_str()
            )));
        }
        let (socket, packetizer, frames) = match self.pending.take() {
            Some(parts) => parts,
            None => return Err(NetworkError::SendFailed("socket already consumed".into())),
        };

        let (stop_tx, stop_rx) = bounded::<()>(1);
        let (frames, frames_guard) = frames.into_parts();
        let send_loop = SendLoop {
            socket,
            packetizer,
            frames,
            _frames_guard: frames_guard,
            stop: stop_rx,
            counters: self.counters.clone(),
            status: self.status.clone(),
        };
        let handle = thread::Builder::new()
            .name("rtp-send".to_string())
            .spawn(move || send_loop.run())
            .map_err(|e| NetworkError::SendFailed(e.to_string()))?;

        self.stop_tx = Some(stop_tx);
        self.thread_handle = Some(handle);
        info!("Frame sender started towards {}", self.destination);
        Ok(())
    }

    pub fn stop(&mut self) -> Result<(), NetworkError> {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.try_send(());
        }
        self.join()
    }

    /// Wait for the loop to end on its own once the frame stream closes
    pub fn join(&mut self) -> Result<(), NetworkError> {
        if let Some(handle) = self.thread_handle.take() {
            handle
                .join()
                .map_err(|_| NetworkError::SendFailed("send thread panicked".into()))?;
        }
        self.pending = None;
        self.status.set(StreamState::Stopped);

        match self.status.failure() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn state(&self) -> StreamState {
        self.status.state()
    }

    pub fn error(&self) -> Option<NetworkError> {
        self.status.failure()
    }

    pub fn stats(&self) -> SendStats {
        SendStats {
            packets_sent: self.counters.packets_sent.load(Ordering::Relaxed),
            bytes_sent: self.counters.bytes_sent.load(Ordering::Relaxed),
            oversized: self.counters.oversized.load(Ordering::Relaxed),
        }
    }
}

impl Drop for FrameSender {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

struct SendLoop {
    socket: UdpSocket,
    packetizer: RtpPacketizer,
    frames: Receiver<EncodedFrame>,
    _frames_guard: ConsumerGuard,
    stop: Receiver<()>,
    counters: Arc<SendCounters>,
    status: StreamStatus<NetworkError>,
}

impl SendLoop {
    fn run(mut self) {
        loop {
            let frame = select! {
                recv(self.frames) -> msg => match msg {
                    Ok(frame) => frame,
                    Err(_) => {
                        debug!("Frame stream closed, sender finishing");
                        break;
                    }
                },
                recv(self.stop) -> _ => break,
            };

            if let Err(e) = self.send(&frame) {
                error!("Send failed: {}", e);
                self.status.fail(e);
                break;
            }
        }
        self.status.set(StreamState::Stopped);
    }

    fn send(&mut self, frame: &EncodedFrame) -> Result<(), NetworkError> {
        let packet = self.packetizer.packetize(frame);
        if packet.encoded_len() > MAX_PACKET_SIZE {
            // The sequence number is spent, so the receiver sees a gap
            self.counters.oversized.fetch_add(1, Ordering::Relaxed);
            warn!(
                "Dropping frame {}: {}",
                frame.sequence,
                NetworkError::PacketTooLarge(packet.encoded_len())
            );
            return Ok(());
        }

        let bytes = packet.encode();
        self.socket
            .send(&bytes)
            .map_err(|e| NetworkError::SendFailed(e.to_string()))?;

        self.counters.packets_sent.fetch_add(1, Ordering::Relaxed);
        self.counters
            .bytes_sent
            .fetch_add(bytes.len() as u64, Ordering::Relaxed);
        Ok(())
    }
}
