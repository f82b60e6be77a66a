//! Audio subsystem module

pub mod buffer;
pub mod capture;
pub mod device;
pub mod format;

pub use buffer::{RingBuffer, RingConsumer, RingProducer, RingStats};
pub use capture::{AudioChunk, CaptureBackend, CaptureOptions, CaptureStream, ReadCallback, ReadErrorHandle};
pub use device::{negotiate, AudioDevice, CpalCatalog, DeviceCapabilities, DeviceCatalog};
pub use format::{CaptureStreamConfig, SampleFormat};
