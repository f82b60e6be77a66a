//! Streamer configuration
//!
//! Loaded from a TOML file; every field has a default so a partial or
//! missing file still yields a usable configuration.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use crate::audio::capture::CaptureOptions;
use crate::codec::frame_encoder::EncoderOptions;
use crate::codec::framing::FrameDuration;
use crate::constants::*;
use crate::error::{Error, Result};
use crate::network::jitter::ReassemblerConfig;

/// Top-level configuration file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamerConfig {
    pub capture: CaptureConfig,
    pub encoder: EncoderConfig,
    pub receive: ReceiveConfig,
    pub send: SendConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Device identifier (`input:<name>` / `output:<name>`); default input
    /// device when unset
    pub device: Option<String>,
    pub buffer_duration_ms: u64,
    pub headroom_buffers: u32,
    pub chunk_queue: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device: None,
            buffer_duration_ms: DEFAULT_BUFFER_DURATION_MS,
            headroom_buffers: DEFAULT_HEADROOM_BUFFERS,
            chunk_queue: DEFAULT_CHUNK_QUEUE,
        }
    }
}

impl CaptureConfig {
    pub fn options(&self) -> CaptureOptions {
        CaptureOptions {
            buffer_duration: Duration::from_millis(self.buffer_duration_ms),
            headroom_buffers: self.headroom_buffers,
            chunk_queue: self.chunk_queue,
        }
    }
}

/// Opus application mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpusApplication {
    Voip,
    Audio,
    LowDelay,
}

/// Opus encoder settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OpusConfig {
    pub application: OpusApplication,
    /// Bits per second
    pub bitrate: u32,
    pub vbr: bool,
    pub cvbr: bool,
    pub fec: bool,
    pub packet_loss_perc: u8,
}

impl Default for OpusConfig {
    fn default() -> Self {
        Self {
            application: OpusApplication::LowDelay,
            bitrate: DEFAULT_BITRATE,
            vbr: true,
            cvbr: true,
            fec: false,
            packet_loss_perc: 0,
        }
    }
}

impl OpusConfig {
    /// Speech settings with in-band FEC for lossy links
    pub fn voice() -> Self {
        Self {
            application: OpusApplication::Voip,
            bitrate: 32_000,
            vbr: true,
            cvbr: false,
            fec: true,
            packet_loss_perc: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    pub opus: OpusConfig,
    /// Window the frame aligner cuts chunks into; `None` requires chunks to
    /// already be exactly one window
    pub frame_ms: Option<f32>,
    pub max_consecutive_violations: u32,
    pub frame_queue: usize,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            opus: OpusConfig::default(),
            frame_ms: Some(DEFAULT_FRAME_MS),
            max_consecutive_violations: DEFAULT_MAX_CONSECUTIVE_VIOLATIONS,
            frame_queue: DEFAULT_FRAME_QUEUE,
        }
    }
}

impl EncoderConfig {
    pub fn options(&self) -> Result<EncoderOptions> {
        let window = match self.frame_ms {
            Some(ms) => Some(FrameDuration::from_millis(ms).ok_or_else(|| {
                Error::Config(format!("frame_ms {} is not a legal Opus frame duration", ms))
            })?),
            None => None,
        };

        Ok(EncoderOptions {
            window,
            max_consecutive_violations: self.max_consecutive_violations,
            frame_queue: self.frame_queue,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceiveConfig {
    pub bind: SocketAddr,
    pub reorder_depth: u16,
    pub capacity: usize,
    pub clock_rate: u32,
    pub read_timeout_ms: u64,
    pub sample_queue: usize,
    /// Decoded output layout
    pub channels: u16,
}

impl Default for ReceiveConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            reorder_depth: DEFAULT_REORDER_DEPTH,
            capacity: DEFAULT_REASSEMBLER_CAPACITY,
            clock_rate: OPUS_CLOCK_RATE,
            read_timeout_ms: DEFAULT_READ_TIMEOUT_MS,
            sample_queue: DEFAULT_SAMPLE_QUEUE,
            channels: DEFAULT_CHANNELS,
        }
    }
}

impl ReceiveConfig {
    pub fn reassembler(&self) -> ReassemblerConfig {
        ReassemblerConfig {
            reorder_depth: self.reorder_depth,
            capacity: self.capacity,
            clock_rate: self.clock_rate,
            ..ReassemblerConfig::default()
        }
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SendConfig {
    pub destination: SocketAddr,
    pub payload_type: u8,
    /// Random when unset
    pub ssrc: Option<u32>,
}

impl Default for SendConfig {
    fn default() -> Self {
        Self {
            destination: SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT)),
            payload_type: OPUS_PAYLOAD_TYPE,
            ssrc: None,
        }
    }
}

impl StreamerConfig {
    /// Parse a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: StreamerConfig = toml::from_str(&text)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Load `path` (or the per-user default location); defaults when the
    /// file does not exist
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        let path = match path.map(Path::to_path_buf).or_else(Self::default_path) {
            Some(path) => path,
            None => return Ok(Self::default()),
        };

        if path.exists() {
            Self::load(&path)
        } else {
            debug!("No configuration at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let text = toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, text)?;
        Ok(())
    }

    /// `<config dir>/media-peer-audio/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "media-peer-audio")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }
}
