//! PCM layouts and the negotiated capture configuration

use std::time::Duration;

/// Interleaved PCM sample layout, native endianness
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SampleFormat {
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    F32,
    F64,
}

impl SampleFormat {
    /// Bytes occupied by one sample of one channel
    pub fn bytes_per_sample(&self) -> usize {
        match self {
            SampleFormat::I8 | SampleFormat::U8 => 1,
            SampleFormat::I16 | SampleFormat::U16 => 2,
            SampleFormat::I32 | SampleFormat::U32 | SampleFormat::F32 => 4,
            SampleFormat::I64 | SampleFormat::U64 | SampleFormat::F64 => 8,
        }
    }

    /// Decode one sample to f32 in [-1.0, 1.0]
    ///
    /// `bytes` must be exactly `bytes_per_sample()` long.
    fn decode(&self, bytes: &[u8]) -> f32 {
        match self {
            SampleFormat::I8 => i8::from_ne_bytes([bytes[0]]) as f32 / 128.0,
            SampleFormat::U8 => (bytes[0] as f32 - 128.0) / 128.0,
            SampleFormat::I16 => i16::from_ne_bytes([bytes[0], bytes[1]]) as f32 / 32_768.0,
            SampleFormat::U16 => {
                (u16::from_ne_bytes([bytes[0], bytes[1]]) as f32 - 32_768.0) / 32_768.0
            }
            SampleFormat::I32 => {
                let v = i32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
                (v as f64 / 2_147_483_648.0) as f32
            }
            SampleFormat::U32 => {
                let v = u32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
                ((v as f64 - 2_147_483_648.0) / 2_147_483_648.0) as f32
            }
            SampleFormat::F32 => f32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            SampleFormat::I64 => {
                let v = i64::from_ne_bytes(eight(bytes));
                (v as f64 / 9_223_372_036_854_775_808.0) as f32
            }
            SampleFormat::U64 => {
                let v = u64::from_ne_bytes(eight(bytes));
                ((v as f64 - 9_223_372_036_854_775_808.0) / 9_223_372_036_854_775_808.0) as f32
            }
            SampleFormat::F64 => f64::from_ne_bytes(eight(bytes)) as f32,
        }
    }

    /// Append the samples encoded in `bytes` to `out` as f32
    ///
    /// Trailing bytes that do not form a whole sample are ignored.
    pub fn decode_into(&self, bytes: &[u8], out: &mut Vec<f32>) {
        let width = self.bytes_per_sample();
        out.reserve(bytes.len() / width);
        out.extend(bytes.chunks_exact(width).map(|s| self.decode(s).clamp(-1.0, 1.0)));
    }
}

fn eight(bytes: &[u8]) -> [u8; 8] {
    let mut out = [0u8; 8];
    out.copy_from_slice(&bytes[..8]);
    out
}

impl From<SampleFormat> for cpal::SampleFormat {
    fn from(format: SampleFormat) -> Self {
        match format {
            SampleFormat::I8 => cpal::SampleFormat::I8,
            SampleFormat::I16 => cpal::SampleFormat::I16,
            SampleFormat::I32 => cpal::SampleFormat::I32,
            SampleFormat::I64 => cpal::SampleFormat::I64,
            SampleFormat::U8 => cpal::SampleFormat::U8,
            SampleFormat::U16 => cpal::SampleFormat::U16,
            SampleFormat::U32 => cpal::SampleFormat::U32,
            SampleFormat::U64 => cpal::SampleFormat::U64,
            SampleFormat::F32 => cpal::SampleFormat::F32,
            SampleFormat::F64 => cpal::SampleFormat::F64,
        }
    }
}

impl SampleFormat {
    /// Map a cpal format; layouts this crate cannot decode yield `None`
    pub fn from_cpal(format: cpal::SampleFormat) -> Option<Self> {
        match format {
            cpal::SampleFormat::I8 => Some(SampleFormat::I8),
            cpal::SampleFormat::I16 => Some(SampleFormat::I16),
            cpal::SampleFormat::I32 => Some(SampleFormat::I32),
            cpal::SampleFormat::I64 => Some(SampleFormat::I64),
            cpal::SampleFormat::U8 => Some(SampleFormat::U8),
            cpal::SampleFormat::U16 => Some(SampleFormat::U16),
            cpal::SampleFormat::U32 => Some(SampleFormat::U32),
            cpal::SampleFormat::U64 => Some(SampleFormat::U64),
            cpal::SampleFormat::F32 => Some(SampleFormat::F32),
            cpal::SampleFormat::F64 => Some(SampleFormat::F64),
            _ => None,
        }
    }
}

/// Format, rate and channel count chosen for one capture session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureStreamConfig {
    pub sample_format: SampleFormat,
    pub sample_rate: u32,
    pub channels: u16,
}

impl CaptureStreamConfig {
    pub fn new(sample_format: SampleFormat, sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_format,
            sample_rate,
            channels,
        }
    }

    /// Bytes of one interleaved frame (one sample for every channel)
    pub fn frame_bytes(&self) -> usize {
        self.sample_format.bytes_per_sample() * self.channels as usize
    }

    pub fn bytes_per_second(&self) -> usize {
        self.frame_bytes() * self.sample_rate as usize
    }

    /// Byte length of `duration` worth of audio, rounded down to whole frames
    pub fn bytes_for(&self, duration: Duration) -> usize {
        let frames = self.sample_rate as u128 * duration.as_micros() / 1_000_000;
        frames as usize * self.frame_bytes()
    }

    /// Duration of `bytes` of audio; partial frames are ignored
    pub fn duration_of(&self, bytes: usize) -> Duration {
        let frames = (bytes / self.frame_bytes()) as u64;
        Duration::from_micros(frames * 1_000_000 / self.sample_rate as u64)
    }

    pub fn to_cpal(&self) -> cpal::StreamConfig {
        cpal::StreamConfig {
            channels: self.channels,
            sample_rate: cpal::SampleRate(self.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_geometry() {
        let config = CaptureStreamConfig::new(SampleFormat::I16, 48000, 2);
        assert_eq!(config.frame_bytes(), 4);
        assert_eq!(config.bytes_for(Duration::from_millis(20)), 960 * 4);
        assert_eq!(config.duration_of(960 * 4), Duration::from_millis(20));
    }

    #[test]
    fn test_decode_i16_extremes() {
        let mut out = Vec::new();
        let bytes: Vec<u8> = [i16::MIN, 0, i16::MAX]
            .iter()
            .flat_map(|s| s.to_ne_bytes())
            .collect();
        SampleFormat::I16.decode_into(&bytes, &mut out);

        assert_eq!(out.len(), 3);
        assert_eq!(out[0], -1.0);
        assert_eq!(out[1], 0.0);
        assert!((out[2] - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_decode_unsigned_is_centered() {
        let mut out = Vec::new();
        SampleFormat::U8.decode_into(&[128, 0], &mut out);
        assert_eq!(out, vec![0.0, -1.0]);

        out.clear();
        SampleFormat::U16.decode_into(&32_768u16.to_ne_bytes(), &mut out);
        assert_eq!(out, vec![0.0]);
    }

    #[test]
    fn test_decode_ignores_trailing_partial_sample() {
        let mut out = Vec::new();
        let mut bytes = 0.5f32.to_ne_bytes().to_vec();
        bytes.push(0xff);
        SampleFormat::F32.decode_into(&bytes, &mut out);
        assert_eq!(out, vec![0.5]);
    }
}
