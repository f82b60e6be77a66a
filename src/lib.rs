//! # Media Peer Audio
//!
//! Live audio capture, Opus framing and RTP transport for a media peer.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────── SEND PATH ─────────────────────────────────┐
//! │                                                                            │
//! │  ┌──────────────┐   callback   ┌─────────────┐   drain every buffer period │
//! │  │ Capture dev  │ ───────────▶ │ Ring Buffer │ ──────────────┐             │
//! │  │ (cpal)       │  clamp/count │ (bytes)     │               ▼             │
//! │  └──────────────┘              └─────────────┘     ┌──────────────────┐    │
//! │         ▲                                          │ capture-drain    │    │
//! │         │ negotiate rate/format                    │ AudioChunk chan  │    │
//! │  ┌──────┴───────┐                                  └────────┬─────────┘    │
//! │  │ DeviceCatalog│                                           ▼              │
//! │  └──────────────┘                                  ┌──────────────────┐    │
//! │                                                    │ frame-encoder    │    │
//! │                                                    │ align → Opus     │    │
//! │                                                    └────────┬─────────┘    │
//! │                                                             ▼              │
//! │                                                    ┌──────────────────┐    │
//! │                                                    │ rtp-send         │    │
//! │                                                    │ packetize → UDP  │    │
//! │                                                    └────────┬─────────┘    │
//! └─────────────────────────────────────────────────────────────┼──────────────┘
//!                                                               │ RTP over UDP
//! ┌──────────────────────────────── RECEIVE PATH ───────────────┼──────────────┐
//! │                                                             ▼              │
//! │  ┌──────────────────┐   push   ┌───────────────────┐  pop  ┌───────────┐  │
//! │  │ rtp-receive      │ ───────▶ │ Jitter Reassembler│ ────▶ │SampleSink │  │
//! │  │ UDP + RTP decode │          │ reorder / gaps    │       │ channel / │  │
//! │  └──────────────────┘          └───────────────────┘       │ Opus dec  │  │
//! │                                                            └───────────┘  │
//! └────────────────────────────────────────────────────────────────────────────┘
//! ```

pub mod audio;
pub mod codec;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod network;
pub mod protocol;

pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    /// Default channel count (stereo)
    pub const DEFAULT_CHANNELS: u16 = 2;

    /// Default Opus bitrate in bits per second
    pub const DEFAULT_BITRATE: u32 = 128_000;

    /// Drain period of the capture loop
    pub const DEFAULT_BUFFER_DURATION_MS: u64 = 20;

    /// Ring buffer capacity, in drain periods
    pub const DEFAULT_HEADROOM_BUFFERS: u32 = 5;

    /// Outbound chunk queue length
    pub const DEFAULT_CHUNK_QUEUE: usize = 64;

    /// Codec window the aligner cuts chunks into
    pub const DEFAULT_FRAME_MS: f32 = 20.0;

    /// Back-to-back framing violations that end an encode session
    pub const DEFAULT_MAX_CONSECUTIVE_VIOLATIONS: u32 = 3;

    /// Outbound encoded frame queue length
    pub const DEFAULT_FRAME_QUEUE: usize = 64;

    /// Default UDP port for RTP
    pub const DEFAULT_PORT: u16 = 5004;

    /// Sequence numbers a gap may stay open in the reassembler
    pub const DEFAULT_REORDER_DEPTH: u16 = 3;

    /// Packets the reassembler holds before evicting
    pub const DEFAULT_REASSEMBLER_CAPACITY: usize = 64;

    /// Receive socket read timeout; bounds how long stop takes
    pub const DEFAULT_READ_TIMEOUT_MS: u64 = 50;

    /// Reassembled sample queue length
    pub const DEFAULT_SAMPLE_QUEUE: usize = 128;

    /// RTP clock rate for Opus
    pub const OPUS_CLOCK_RATE: u32 = 48000;

    /// Dynamic payload type conventionally bound to Opus
    pub const OPUS_PAYLOAD_TYPE: u8 = 111;

    /// Maximum datagram size sent
    pub const MAX_PACKET_SIZE: usize = 1472; // MTU - IP/UDP headers
}
