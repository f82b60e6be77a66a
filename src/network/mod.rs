//! Network subsystem for RTP audio transport

pub mod jitter;
pub mod receiver;
pub mod sender;
pub mod udp;

pub use jitter::{JitterReassembler, ReassembledSample, ReassemblerConfig};
pub use receiver::{ChannelSink, ReceiveStream, SampleSink};
pub use sender::FrameSender;
