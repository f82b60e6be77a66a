//! Legal codec frame durations and re-slicing of PCM into exact windows

use bytes::{Bytes, BytesMut};
use std::time::Duration;

use crate::audio::capture::AudioChunk;
use crate::audio::format::CaptureStreamConfig;
use crate::error::CodecError;

/// Durations the codec accepts for one encode call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameDuration {
    Ms2_5,
    Ms5,
    Ms10,
    Ms20,
    Ms40,
    Ms60,
}

impl FrameDuration {
    pub const ALL: [FrameDuration; 6] = [
        FrameDuration::Ms2_5,
        FrameDuration::Ms5,
        FrameDuration::Ms10,
        FrameDuration::Ms20,
        FrameDuration::Ms40,
        FrameDuration::Ms60,
    ];

    pub fn as_micros(&self) -> u64 {
        match self {
            FrameDuration::Ms2_5 => 2_500,
            FrameDuration::Ms5 => 5_000,
            FrameDuration::Ms10 => 10_000,
            FrameDuration::Ms20 => 20_000,
            FrameDuration::Ms40 => 40_000,
            FrameDuration::Ms60 => 60_000,
        }
    }

    pub fn as_duration(&self) -> Duration {
        Duration::from_micros(self.as_micros())
    }

    pub fn as_millis_f32(&self) -> f32 {
        self.as_micros() as f32 / 1000.0
    }

    /// Samples per channel in one window; truncated when the rate does not
    /// divide evenly
    pub fn samples_per_channel(&self, sample_rate: u32) -> usize {
        (sample_rate as u64 * self.as_micros() / 1_000_000) as usize
    }

    /// The legal duration that `samples_per_channel` samples span exactly
    pub fn from_samples(samples_per_channel: usize, sample_rate: u32) -> Option<Self> {
        let scaled = samples_per_channel as u64 * 1_000_000;
        Self::ALL
            .iter()
            .copied()
            .find(|d| scaled == d.as_micros() * sample_rate as u64)
    }

    pub fn from_millis(ms: f32) -> Option<Self> {
        let micros = (ms * 1000.0).round() as u64;
        Self::ALL.iter().copied().find(|d| d.as_micros() == micros)
    }
}

/// Carries PCM across chunk boundaries so every output chunk is exactly one
/// window long
pub struct FrameAligner {
    window_bytes: usize,
    pending: BytesMut,
}

impl FrameAligner {
    pub fn new(config: &CaptureStreamConfig, window: FrameDuration) -> Result<Self, CodecError> {
        let samples_per_channel = window.samples_per_channel(config.sample_rate);
        if FrameDuration::from_samples(samples_per_channel, config.sample_rate) != Some(window) {
            return Err(CodecError::IllegalFrame {
                bytes: samples_per_channel * config.frame_bytes(),
                samples_per_channel,
            });
        }

        let window_bytes = samples_per_channel * config.frame_bytes();
        Ok(Self {
            window_bytes,
            pending: BytesMut::with_capacity(window_bytes * 2),
        })
    }

    /// Append `chunk`; returns every complete window now available
    pub fn push(&mut self, chunk: &AudioChunk) -> Vec<AudioChunk> {
        self.pending.extend_from_slice(&chunk.data);

        let mut windows = Vec::with_capacity(self.pending.len() / self.window_bytes);
        while self.pending.len() >= self.window_bytes {
            let window: Bytes = self.pending.split_to(self.window_bytes).freeze();
            windows.push(AudioChunk::new(window));
        }
        windows
    }

    /// Bytes held back waiting for the rest of a window
    pub fn pending_bytes(&self) -> usize {
        self.pending.len()
    }

    pub fn window_bytes(&self) -> usize {
        self.window_bytes
    }
}
