//! Opus encoder wrapper
//!
//! Provides low-latency Opus encoding behind the [`FrameCodec`] seam so the
//! framing stage can be driven by any codec with the same contract.

use bytes::Bytes;
use opus::{Application, Channels, Encoder};

use crate::codec::framing::FrameDuration;
use crate::config::{OpusApplication, OpusConfig};
use crate::error::CodecError;

/// Largest Opus packet the encoder is allowed to produce
const MAX_PACKET_SIZE: usize = 4000;

/// Codec accepting one legal-duration window of interleaved f32 PCM per call
pub trait FrameCodec: Send {
    fn sample_rate(&self) -> u32;

    fn channels(&self) -> u16;

    /// Encode one window; `window.len()` is `channels * samples_per_channel`
    /// for a legal frame duration
    fn encode(&mut self, window: &[f32]) -> Result<Bytes, CodecError>;
}

/// Opus encoder wrapper
pub struct OpusEncoder {
    encoder: Encoder,
    sample_rate: u32,
    channels: u16,
    /// Encoding buffer (reused to avoid allocations)
    encode_buffer: Vec<u8>,
}

impl OpusEncoder {
    /// Create a new Opus encoder for a fixed rate and channel count
    pub fn new(sample_rate: u32, channels: u16, config: &OpusConfig) -> Result<Self, CodecError> {
        let opus_channels = match channels {
            1 => Channels::Mono,
            2 => Channels::Stereo,
            _ => {
                return Err(CodecError::EncoderInit(format!(
                    "Unsupported channel count: {}",
                    channels
                )))
            }
        };

        let application = match config.application {
            OpusApplication::Voip => Application::Voip,
            OpusApplication::Audio => Application::Audio,
            OpusApplication::LowDelay => Application::LowDelay,
        };

        let mut encoder = Encoder::new(sample_rate, opus_channels, application)
            .map_err(|e| CodecError::EncoderInit(e.to_string()))?;
        Self::configure_encoder(&mut encoder, config)?;

        Ok(Self {
            encoder,
            sample_rate,
            channels,
            encode_buffer: vec![0u8; MAX_PACKET_SIZE],
        })
    }

    fn configure_encoder(encoder: &mut Encoder, config: &OpusConfig) -> Result<(), CodecError> {
        encoder
            .set_bitrate(opus::Bitrate::Bits(config.bitrate as i32))
            .map_err(|e| CodecError::EncoderInit(format!("Failed to set bitrate: {}", e)))?;

        encoder
            .set_vbr(config.vbr)
            .map_err(|e| CodecError::EncoderInit(format!("Failed to set VBR: {}", e)))?;

        if config.vbr && config.cvbr {
            encoder
                .set_vbr_constraint(true)
                .map_err(|e| CodecError::EncoderInit(format!("Failed to set CVBR: {}", e)))?;
        }

        encoder
            .set_inband_fec(config.fec)
            .map_err(|e| CodecError::EncoderInit(format!("Failed to set FEC: {}", e)))?;

        if config.fec {
            encoder
                .set_packet_loss_perc(config.packet_loss_perc as i32)
                .map_err(|e| CodecError::EncoderInit(format!("Failed to set packet loss: {}", e)))?;
        }

        Ok(())
    }
}

impl FrameCodec for OpusEncoder {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn channels(&self) -> u16 {
        self.channels
    }

    fn encode(&mut self, window: &[f32]) -> Result<Bytes, CodecError> {
        let channels = self.channels as usize;
        let samples_per_channel = window.len() / channels;
        if window.len() % channels != 0
            || FrameDuration::from_samples(samples_per_channel, self.sample_rate).is_none()
        {
            return Err(CodecError::IllegalFrame {
                bytes: window.len() * std::mem::size_of::<f32>(),
                samples_per_channel,
            });
        }

        let size = self
            .encoder
            .encode_float(window, &mut self.encode_buffer)
            .map_err(|e| CodecError::EncodingFailed(e.to_string()))?;

        Ok(Bytes::copy_from_slice(&self.encode_buffer[..size]))
    }
}
