//! Opus codec stage
//!
//! Legal frame durations, the encode stage that turns PCM chunks into
//! encoded frames, and decoding with loss concealment on the receive side.

pub mod decoder;
pub mod encoder;
pub mod frame_encoder;
pub mod framing;

pub use decoder::{DecodedAudio, DecodingSink, OpusDecoder};
pub use encoder::{FrameCodec, OpusEncoder};
pub use frame_encoder::{ChunkEncoder, EncodedFrame, EncoderOptions, FrameEncoder};
pub use framing::{FrameAligner, FrameDuration};
