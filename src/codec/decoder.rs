//! Opus decoder wrapper
//!
//! Provides Opus decoding with packet loss concealment, and a sample sink
//! that turns reassembled RTP samples into PCM.

use crossbeam_channel::TrySendError;
use opus::{Channels, Decoder};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::codec::framing::FrameDuration;
use crate::error::{CodecError, NetworkError};
use crate::lifecycle::{StageQueue, StageReceiver, StageSender};
use crate::network::jitter::ReassembledSample;
use crate::network::receiver::SampleSink;

/// 120 ms, the longest packet Opus can carry, in samples per channel at 48 kHz
const MAX_FRAME_SAMPLES: usize = 5760;

/// Concealment frames generated for one gap at most
const MAX_CONCEALED_FRAMES: u16 = 5;

/// Opus decoder wrapper
pub struct OpusDecoder {
    decoder: Decoder,
    sample_rate: u32,
    channels: u16,
    /// Samples per channel of the last decoded packet; sizes concealment
    frame_size: usize,
    /// Decoding buffer (reused to avoid allocations)
    decode_buffer: Vec<f32>,
    frames_decoded: u64,
    frames_lost: u64,
    samples_produced: u64,
}

impl OpusDecoder {
    /// `frame_size` is the concealment length used before any packet has
    /// been decoded
    pub fn new(sample_rate: u32, channels: u16, frame_size: usize) -> Result<Self, CodecError> {
        let opus_channels = match channels {
            1 => Channels::Mono,
            2 => Channels::Stereo,
            _ => {
                return Err(CodecError::DecoderInit(format!(
                    "Unsupported channel count: {}",
                    channels
                )))
            }
        };

        let decoder = Decoder::new(sample_rate, opus_channels)
            .map_err(|e| CodecError::DecoderInit(e.to_string()))?;

        Ok(Self {
            decoder,
            sample_rate,
            channels,
            frame_size: frame_size.clamp(1, MAX_FRAME_SAMPLES),
            decode_buffer: vec![0.0f32; MAX_FRAME_SAMPLES * channels as usize],
            frames_decoded: 0,
            frames_lost: 0,
            samples_produced: 0,
        })
    }

    /// Decode one packet into interleaved f32 samples
    pub fn decode(&mut self, data: &[u8]) -> Result<Vec<f32>, CodecError> {
        let samples = self
            .decoder
            .decode_float(data, &mut self.decode_buffer, false)
            .map_err(|e| CodecError::DecodingFailed(e.to_string()))?;

        self.frame_size = samples.max(1);
        self.frames_decoded += 1;
        Ok(self.take(samples))
    }

    /// Recover the packet before `data` from its in-band FEC copy
    pub fn decode_fec(&mut self, data: &[u8]) -> Result<Vec<f32>, CodecError> {
        let len = self.frame_size * self.channels as usize;
        let samples = self
            .decoder
            .decode_float(data, &mut self.decode_buffer[..len], true)
            .map_err(|e| CodecError::DecodingFailed(e.to_string()))?;

        self.frames_lost += 1;
        Ok(self.take(samples))
    }

    /// Conceal one lost packet
    pub fn decode_plc(&mut self) -> Result<Vec<f32>, CodecError> {
        let len = self.frame_size * self.channels as usize;
        let samples = self
            .decoder
            .decode_float(&[], &mut self.decode_buffer[..len], false)
            .map_err(|e| CodecError::DecodingFailed(e.to_string()))?;

        self.frames_lost += 1;
        Ok(self.take(samples))
    }

    fn take(&mut self, samples_per_channel: usize) -> Vec<f32> {
        let total = samples_per_channel * self.channels as usize;
        self.samples_produced += total as u64;
        self.decode_buffer[..total].to_vec()
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    pub fn stats(&self) -> DecoderStats {
        DecoderStats {
            frames_decoded: self.frames_decoded,
            frames_lost: self.frames_lost,
            samples_produced: self.samples_produced,
            loss_rate: if self.frames_decoded + self.frames_lost > 0 {
                self.frames_lost as f32 / (self.frames_decoded + self.frames_lost) as f32
            } else {
                0.0
            },
        }
    }
}

/// Decoder statistics
#[derive(Debug, Clone, Default)]
pub struct DecoderStats {
    pub frames_decoded: u64,
    pub frames_lost: u64,
    pub samples_produced: u64,
    pub loss_rate: f32,
}

/// PCM for one sample or one concealed gap
#[derive(Debug, Clone)]
pub struct DecodedAudio {
    /// RTP sequence number of the packet this audio belongs to
    pub sequence: u16,
    pub timestamp: u32,
    /// Interleaved f32
    pub samples: Vec<f32>,
    pub concealed: bool,
}

/// Sample sink decoding Opus payloads, concealing reported losses first
pub struct DecodingSink {
    decoder: OpusDecoder,
    use_fec: bool,
    queue: StageQueue<DecodedAudio>,
    tx: Option<StageSender<DecodedAudio>>,
    undecodable: Arc<AtomicU64>,
}

impl DecodingSink {
    pub fn new(
        sample_rate: u32,
        channels: u16,
        use_fec: bool,
        capacity: usize,
    ) -> Result<(Self, StageReceiver<DecodedAudio>), CodecError> {
        let frame_size = FrameDuration::Ms20.samples_per_channel(sample_rate);
        let decoder = OpusDecoder::new(sample_rate, channels, frame_size)?;
        let (queue, tx) = StageQueue::bounded(capacity);
        let rx = queue.subscribe();
        Ok((
            Self {
                decoder,
                use_fec,
                queue,
                tx: Some(tx),
                undecodable: Arc::new(AtomicU64::new(0)),
            },
            rx,
        ))
    }

    /// Payloads the decoder rejected
    pub fn undecodable_counter(&self) -> Arc<AtomicU64> {
        self.undecodable.clone()
    }

    fn publish(&self, audio: DecodedAudio) -> Result<(), NetworkError> {
        let tx = self.tx.as_ref().ok_or(NetworkError::SinkClosed)?;
        match tx.try_send(audio) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(audio)) => {
                warn!("Playback queue full, audio for {} dropped", audio.sequence);
                Ok(())
            }
            Err(TrySendError::Disconnected(_)) => Err(NetworkError::SinkClosed),
        }
    }

    fn conceal(&mut self, sample: &ReassembledSample) -> Result<(), NetworkError> {
        let lost = sample.prev_dropped_packets.min(MAX_CONCEALED_FRAMES);
        debug!(
            "Concealing {} of {} lost packets before {}",
            lost, sample.prev_dropped_packets, sample.sequence
        );

        for i in 0..lost {
            let recovered = if self.use_fec && i + 1 == lost {
                self.decoder.decode_fec(&sample.payload)
            } else {
                self.decoder.decode_plc()
            };
            match recovered {
                Ok(samples) => self.publish(DecodedAudio {
                    sequence: sample.sequence,
                    timestamp: sample.timestamp,
                    samples,
                    concealed: true,
                })?,
                Err(e) => warn!("Concealment failed: {}", e),
            }
        }
        Ok(())
    }
}

impl SampleSink for DecodingSink {
    fn write_sample(&mut self, sample: ReassembledSample) -> Result<(), NetworkError> {
        if sample.prev_dropped_packets > 0 {
            self.conceal(&sample)?;
        }

        match self.decoder.decode(&sample.payload) {
            Ok(samples) => self.publish(DecodedAudio {
                sequence: sample.sequence,
                timestamp: sample.timestamp,
                samples,
                concealed: false,
            }),
            Err(e) => {
                self.undecodable.fetch_add(1, Ordering::Relaxed);
                warn!("Packet {} undecodable: {}", sample.sequence, e);
                Ok(())
            }
        }
    }

    fn close(&mut self) {
        let stats = self.decoder.stats();
        debug!(
            "Decoder closing: {} decoded, {} concealed",
            stats.frames_decoded, stats.frames_lost
        );
        self.tx = None;
        let discarded = self.queue.discard_pending();
        if discarded > 0 {
            debug!("Discarded {} undelivered decoded frames", discarded);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encoder::{FrameCodec, OpusEncoder};
    use crate::config::OpusConfig;
    use bytes::Bytes;
    use std::time::Duration;

    fn sine_window(samples_per_channel: usize) -> Vec<f32> {
        let mut samples = Vec::with_capacity(samples_per_channel * 2);
        for i in 0..samples_per_channel {
            let t = i as f32 / 48000.0;
            let val = (t * 440.0 * 2.0 * std::f32::consts::PI).sin() * 0.5;
            samples.push(val); // Left
            samples.push(val); // Right
        }
        samples
    }

    #[test]
    fn test_decoder_creation() {
        assert!(OpusDecoder::new(48000, 2, 480).is_ok());
        assert!(OpusDecoder::new(48000, 3, 480).is_err());
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let mut encoder = OpusEncoder::new(48000, 2, &OpusConfig::default()).unwrap();
        let mut decoder = OpusDecoder::new(48000, 2, 480).unwrap();

        let window = sine_window(960);
        let encoded = encoder.encode(&window).unwrap();
        let decoded = decoder.decode(&encoded).unwrap();

        assert_eq!(decoded.len(), window.len());
        assert_eq!(decoder.frame_size(), 960);
    }

    #[test]
    fn test_plc_matches_last_frame_size() {
        let mut decoder = OpusDecoder::new(48000, 2, 480).unwrap();

        let plc = decoder.decode_plc().unwrap();
        assert_eq!(plc.len(), 480 * 2);
        assert_eq!(decoder.stats().frames_lost, 1);
    }

    fn sample(sequence: u16, payload: Bytes, prev_dropped_packets: u16) -> ReassembledSample {
        ReassembledSample {
            sequence,
            timestamp: sequence as u32 * 960,
            payload,
            duration: Duration::from_millis(20),
            prev_dropped_packets,
        }
    }

    #[test]
    fn test_sink_conceals_reported_losses() {
        let mut encoder = OpusEncoder::new(48000, 2, &OpusConfig::default()).unwrap();
        let (mut sink, rx) = DecodingSink::new(48000, 2, false, 16).unwrap();

        let first = encoder.encode(&sine_window(960)).unwrap();
        let later = encoder.encode(&sine_window(960)).unwrap();
        sink.write_sample(sample(1, first, 0)).unwrap();
        sink.write_sample(sample(4, later, 2)).unwrap();

        let out: Vec<_> = rx.try_iter().collect();
        assert_eq!(
            out.iter().map(|a| a.concealed).collect::<Vec<_>>(),
            vec![false, true, true, false]
        );
        assert!(out.iter().all(|a| a.samples.len() == 960 * 2));
    }

    #[test]
    fn test_close_discards_unread_audio() {
        let mut encoder = OpusEncoder::new(48000, 2, &OpusConfig::default()).unwrap();
        let (mut sink, rx) = DecodingSink::new(48000, 2, false, 16).unwrap();

        let payload = encoder.encode(&sine_window(960)).unwrap();
        sink.write_sample(sample(1, payload, 0)).unwrap();
        sink.close();

        assert!(matches!(
            rx.try_recv(),
            Err(crossbeam_channel::TryRecvError::Disconnected)
        ));
    }

    #[test]
    fn test_sink_skips_undecodable_payload() {
        let (mut sink, rx) = DecodingSink::new(48000, 2, false, 4).unwrap();
        let counter = sink.undecodable_counter();

        // TOC byte for a code 3 packet with no frame count
        sink.write_sample(sample(1, Bytes::from_static(&[0x03]), 0)).unwrap();
        assert_eq!(counter.load(Ordering::Relaxed), 1);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_sink_reports_closed_consumer() {
        let (mut sink, rx) = DecodingSink::new(48000, 2, false, 4).unwrap();
        drop(rx);
        let mut encoder = OpusEncoder::new(48000, 2, &OpusConfig::default()).unwrap();
        let payload = encoder.encode(&sine_window(960)).unwrap();
        assert_eq!(
            sink.write_sample(sample(1, payload, 0)),
            Err(NetworkError::SinkClosed)
        );
    }
}
