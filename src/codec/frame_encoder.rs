//! Encode stage: AudioChunk stream in, EncodedFrame stream out
//!
//! Every chunk must hold exactly one legal codec window. Chunks that do not
//! are dropped before reaching the codec; a run of
//! `max_consecutive_violations` such chunks ends the session, since it means
//! the producer is framing audio wrongly rather than suffering a glitch.

use bytes::Bytes;
use crossbeam_channel::{bounded, select, Receiver, Sender, TrySendError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

use crate::audio::capture::AudioChunk;
use crate::audio::format::CaptureStreamConfig;
use crate::codec::encoder::FrameCodec;
use crate::codec::framing::{FrameAligner, FrameDuration};
use crate::constants::{DEFAULT_FRAME_QUEUE, DEFAULT_MAX_CONSECUTIVE_VIOLATIONS};
use crate::error::CodecError;
use crate::lifecycle::{ConsumerGuard, StageQueue, StageReceiver, StageSender, StreamState, StreamStatus};

/// Codec output for one window
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedFrame {
    pub data: Bytes,
    pub duration: FrameDuration,
    /// Position of the window's first sample, in samples per channel since
    /// the session started
    pub timestamp: u64,
    pub sequence: u64,
}

/// Encode stage settings
#[derive(Debug, Clone, Copy)]
pub struct EncoderOptions {
    /// Re-slice incoming chunks into windows of this duration first;
    /// `None` requires every chunk to already be one legal window
    pub window: Option<FrameDuration>,
    pub max_consecutive_violations: u32,
    pub frame_queue: usize,
}

impl Default for EncoderOptions {
    fn default() -> Self {
        Self {
            window: Some(FrameDuration::Ms20),
            max_consecutive_violations: DEFAULT_MAX_CONSECUTIVE_VIOLATIONS,
            frame_queue: DEFAULT_FRAME_QUEUE,
        }
    }
}

#[derive(Default)]
struct EncoderCounters {
    frames_encoded: AtomicU64,
    bytes_produced: AtomicU64,
    violations: AtomicU64,
    codec_failures: AtomicU64,
    frames_dropped: AtomicU64,
    frames_discarded: AtomicU64,
}

/// Encoder statistics
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EncoderStats {
    pub frames_encoded: u64,
    pub bytes_produced: u64,
    pub violations: u64,
    pub codec_failures: u64,
    /// Frames the output queue had no room for
    pub frames_dropped: u64,
    /// Encoded but still queued when the stage stopped
    pub frames_discarded: u64,
    pub average_frame_size: f32,
}

impl EncoderCounters {
    fn snapshot(&self) -> EncoderStats {
        let frames_encoded = self.frames_encoded.load(Ordering::Relaxed);
        let bytes_produced = self.bytes_produced.load(Ordering::Relaxed);
        EncoderStats {
            frames_encoded,
            bytes_produced,
            violations: self.violations.load(Ordering::Relaxed),
            codec_failures: self.codec_failures.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            frames_discarded: self.frames_discarded.load(Ordering::Relaxed),
            average_frame_size: if frames_encoded > 0 {
                bytes_produced as f32 / frames_encoded as f32
            } else {
                0.0
            },
        }
    }
}

/// Result of handing one chunk to [`ChunkEncoder`]
#[derive(Debug, PartialEq)]
pub enum ChunkOutcome {
    Encoded(EncodedFrame),
    /// Chunk lost; the session continues
    Dropped(CodecError),
    /// Framing violations kept recurring; the session must end
    Aborted(CodecError),
}

/// Synchronous core of the encode stage
pub struct ChunkEncoder {
    codec: Box<dyn FrameCodec>,
    config: CaptureStreamConfig,
    scratch: Vec<f32>,
    next_timestamp: u64,
    sequence: u64,
    consecutive_violations: u32,
    max_consecutive_violations: u32,
    counters: Arc<EncoderCounters>,
}

impl ChunkEncoder {
    /// The codec must run at the negotiated rate and channel count
    pub fn new(
        codec: Box<dyn FrameCodec>,
        config: CaptureStreamConfig,
        max_consecutive_violations: u32,
    ) -> Result<Self, CodecError> {
        if codec.sample_rate() != config.sample_rate || codec.channels() != config.channels {
            return Err(CodecError::ConfigMismatch {
                codec_rate: codec.sample_rate(),
                codec_channels: codec.channels(),
                stream_rate: config.sample_rate,
                stream_channels: config.channels,
            });
        }

        Ok(Self {
            codec,
            config,
            scratch: Vec::new(),
            next_timestamp: 0,
            sequence: 0,
            consecutive_violations: 0,
            max_consecutive_violations: max_consecutive_violations.max(1),
            counters: Arc::new(EncoderCounters::default()),
        })
    }

    pub fn encode_chunk(&mut self, chunk: &AudioChunk) -> ChunkOutcome {
        let frame_bytes = self.config.frame_bytes();
        let samples_per_channel = chunk.len() / frame_bytes;
        let duration = if chunk.len() % frame_bytes == 0 {
            FrameDuration::from_samples(samples_per_channel, self.config.sample_rate)
        } else {
            None
        };

        // Dropped audio still occupies its place on the timeline
        let timestamp = self.next_timestamp;
        self.next_timestamp += samples_per_channel as u64;

        let duration = match duration {
            Some(duration) => duration,
            None => return self.violation(chunk.len(), samples_per_channel),
        };
        self.consecutive_violations = 0;

        self.scratch.clear();
        self.config
            .sample_format
            .decode_into(&chunk.data, &mut self.scratch);

        match self.codec.encode(&self.scratch) {
            Ok(data) => {
                self.counters.frames_encoded.fetch_add(1, Ordering::Relaxed);
                self.counters
                    .bytes_produced
                    .fetch_add(data.len() as u64, Ordering::Relaxed);
                let frame = EncodedFrame {
                    data,
                    duration,
                    timestamp,
                    sequence: self.sequence,
                };
                self.sequence += 1;
                debug!(
                    "Encoded {:.1} ms window into {} bytes",
                    duration.as_millis_f32(),
                    frame.data.len()
                );
                ChunkOutcome::Encoded(frame)
            }
            Err(e) => {
                self.counters.codec_failures.fetch_add(1, Ordering::Relaxed);
                warn!("Encoding failed, frame dropped: {}", e);
                ChunkOutcome::Dropped(e)
            }
        }
    }

    fn violation(&mut self, bytes: usize, samples_per_channel: usize) -> ChunkOutcome {
        self.counters.violations.fetch_add(1, Ordering::Relaxed);
        self.consecutive_violations += 1;

        let micros = samples_per_channel as u64 * 1_000_000 / self.config.sample_rate as u64;
        warn!(
            "Illegal frame size: {} bytes ({:.3} ms), violation {} of {}",
            bytes,
            micros as f64 / 1000.0,
            self.consecutive_violations,
            self.max_consecutive_violations
        );

        if self.consecutive_violations >= self.max_consecutive_violations {
            ChunkOutcome::Aborted(CodecError::FramingAborted(self.consecutive_violations))
        } else {
            ChunkOutcome::Dropped(CodecError::IllegalFrame {
                bytes,
                samples_per_channel,
            })
        }
    }

    pub fn stats(&self) -> EncoderStats {
        self.counters.snapshot()
    }
}

/// Encode task: one thread consuming chunks, publishing frames
pub struct FrameEncoder {
    status: StreamStatus<CodecError>,
    counters: Arc<EncoderCounters>,
    pending: Option<(
        ChunkEncoder,
        Option<FrameAligner>,
        StageReceiver<AudioChunk>,
        StageSender<EncodedFrame>,
    )>,
    output: StageQueue<EncodedFrame>,
    stop_tx: Option<Sender<()>>,
    thread_handle: Option<JoinHandle<()>>,
}

impl FrameEncoder {
    /// Validate the codec against the stream and prepare the stage
    pub fn new(
        codec: Box<dyn FrameCodec>,
        config: CaptureStreamConfig,
        input: StageReceiver<AudioChunk>,
        options: EncoderOptions,
    ) -> Result<Self, CodecError> {
        let encoder = ChunkEncoder::new(codec, config, options.max_consecutive_violations)?;
        let aligner = options
            .window
            .map(|window| FrameAligner::new(&config, window))
            .transpose()?;
        let (output, output_tx) = StageQueue::bounded(options.frame_queue);

        Ok(Self {
            status: StreamStatus::new(),
            counters: encoder.counters.clone(),
            pending: Some((encoder, aligner, input, output_tx)),
            output,
            stop_tx: None,
            thread_handle: None,
        })
    }

    pub fn start(&mut self) -> Result<(), CodecError> {
        let (encoder, aligner, input, output) = match self.pending.take() {
            Some(parts) if self.status.transition(StreamState::Created, StreamState::Running).is_ok() => parts,
            other => {
                self.pending = other;
                return Err(CodecError::EncoderInit(format!(
                    "encoder is {}",
                    self.status.state().as_str()
                )));
            }
        };

        let (stop_tx, stop_rx) = bounded::<()>(1);
        let (input, input_guard) = input.into_parts();
        let task = EncodeTask {
            encoder,
            aligner,
            input,
            _input_guard: input_guard,
            output,
            stop: stop_rx,
            status: self.status.clone(),
        };
        let handle = thread::Builder::new()
            .name("frame-encoder".to_string())
            .spawn(move || task.run())
            .map_err(|e| CodecError::EncoderInit(e.to_string()))?;

        self.stop_tx = Some(stop_tx);
        self.thread_handle = Some(handle);
        info!("Frame encoder started");
        Ok(())
    }

    /// Stop the encode task and wait for it to exit
    ///
    /// Frames nobody consumed by then are discarded.
    pub fn stop(&mut self) -> Result<(), CodecError> {
        if self.pending.take().is_some() {
            self.status.set(StreamState::Stopped);
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
                .map_err(|_| CodecError::EncodingFailed("encoder thread panicked".into()))?;
        }
        self.status.set(StreamState::Stopped);

        let discarded = self.output.discard_pending();
        if discarded > 0 {
            self.counters
                .frames_discarded
                .fetch_add(discarded as u64, Ordering::Relaxed);
            debug!("Discarded {} undelivered frames", discarded);
        }

        match self.status.failure() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Wait for the task to finish on its own, after its input closed
    pub fn join(&mut self) -> Result<(), CodecError> {
        if let Some(handle) = self.thread_handle.take() {
            handle
                .join()
                .map_err(|_| CodecError::EncodingFailed("encoder thread panicked".into()))?;
        }
        self.stop()
    }

    /// Frame stream; the task ends once every handle from here is dropped
    pub fn frames(&self) -> StageReceiver<EncodedFrame> {
        self.output.subscribe()
    }

    pub fn state(&self) -> StreamState {
        self.status.state()
    }

    pub fn error(&self) -> Option<CodecError> {
        self.status.failure()
    }

    pub fn stats(&self) -> EncoderStats {
        self.counters.snapshot()
    }
}

impl Drop for FrameEncoder {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

struct EncodeTask {
    encoder: ChunkEncoder,
    aligner: Option<FrameAligner>,
    input: Receiver<AudioChunk>,
    _input_guard: ConsumerGuard,
    output: StageSender<EncodedFrame>,
    stop: Receiver<()>,
    status: StreamStatus<CodecError>,
}

impl EncodeTask {
    fn run(mut self) {
        loop {
            let chunk = select! {
                recv(self.input) -> msg => match msg {
                    Ok(chunk) => chunk,
                    Err(_) => {
                        debug!("Chunk stream closed, encoder finishing");
                        break;
                    }
                },
                recv(self.stop) -> _ => break,
            };

            if !self.process(chunk) {
                break;
            }
        }

        self.status.set(StreamState::Stopped);
        debug!("Frame encoder stopped");
    }

    /// Returns false when the session has to end
    fn process(&mut self, chunk: AudioChunk) -> bool {
        let windows = match self.aligner.as_mut() {
            Some(aligner) => aligner.push(&chunk),
            None => vec![chunk],
        };

        for window in windows {
            match self.encoder.encode_chunk(&window) {
                ChunkOutcome::Encoded(frame) => match self.output.try_send(frame) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        self.encoder
                            .counters
                            .frames_dropped
                            .fetch_add(1, Ordering::Relaxed);
                        warn!("Encoded frame queue full, frame dropped");
                    }
                    Err(TrySendError::Disconnected(_)) => {
                        debug!("Frame consumers gone, encoder finishing");
                        return false;
                    }
                },
                ChunkOutcome::Dropped(_) => {}
                ChunkOutcome::Aborted(e) => {
                    error!("Encoding stopped: {}", e);
                    self.status.fail(e);
                    return false;
                }
            }
        }
        true
    }
}
