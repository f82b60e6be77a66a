//! Audio device lookup and stream format negotiation

use cpal::traits::{DeviceTrait, HostTrait};
use tracing::{debug, info};

use crate::audio::format::{CaptureStreamConfig, SampleFormat};
use crate::error::AudioError;

/// Sample rates tried in order; the first one the device supports wins
pub const PRIORITIZED_SAMPLE_RATES: [u32; 4] = [48000, 44100, 96000, 24000];

/// Sample formats tried in order, widely compatible interleaved layouts first
pub const PRIORITIZED_FORMATS: [SampleFormat; 10] = [
    SampleFormat::I16,
    SampleFormat::F32,
    SampleFormat::I32,
    SampleFormat::U16,
    SampleFormat::F64,
    SampleFormat::I64,
    SampleFormat::U32,
    SampleFormat::U64,
    SampleFormat::I8,
    SampleFormat::U8,
];

/// Inclusive range of sample rates a device advertises
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleRateRange {
    pub min: u32,
    pub max: u32,
}

impl SampleRateRange {
    pub fn new(min: u32, max: u32) -> Self {
        Self { min, max }
    }

    pub fn single(rate: u32) -> Self {
        Self::new(rate, rate)
    }

    pub fn contains(&self, rate: u32) -> bool {
        rate >= self.min && rate <= self.max
    }
}

/// What a capture device can deliver, in the order the device reports it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceCapabilities {
    pub sample_rates: Vec<SampleRateRange>,
    pub formats: Vec<SampleFormat>,
    pub channels: u16,
}

impl DeviceCapabilities {
    pub fn supports_rate(&self, rate: u32) -> bool {
        self.sample_rates.iter().any(|r| r.contains(rate))
    }

    pub fn supports_format(&self, format: SampleFormat) -> bool {
        self.formats.contains(&format)
    }
}

/// Pick a sample rate: highest priority supported, else the first range's max
pub fn negotiate_sample_rate(caps: &DeviceCapabilities) -> Result<u32, AudioError> {
    PRIORITIZED_SAMPLE_RATES
        .iter()
        .copied()
        .find(|&rate| caps.supports_rate(rate))
        .or_else(|| caps.sample_rates.first().map(|r| r.max))
        .ok_or(AudioError::NoSupportedRate)
}

/// Pick a sample format: highest priority supported, else the first advertised
pub fn negotiate_format(caps: &DeviceCapabilities) -> Result<SampleFormat, AudioError> {
    PRIORITIZED_FORMATS
        .iter()
        .copied()
        .find(|&format| caps.supports_format(format))
        .or_else(|| caps.formats.first().copied())
        .ok_or(AudioError::NoSupportedFormat)
}

/// Choose the stream configuration for a device
pub fn negotiate(caps: &DeviceCapabilities) -> Result<CaptureStreamConfig, AudioError> {
    let sample_rate = negotiate_sample_rate(caps)?;
    let sample_format = negotiate_format(caps)?;
    if caps.channels == 0 {
        return Err(AudioError::UnsupportedFormat("device reports zero channels".into()));
    }

    debug!(
        "Negotiated {:?} @ {} Hz, {} channels",
        sample_format, sample_rate, caps.channels
    );
    Ok(CaptureStreamConfig::new(sample_format, sample_rate, caps.channels))
}

/// Summary of one device as listed by a catalog
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioDeviceInfo {
    pub id: String,
    pub name: String,
    pub is_input: bool,
    pub is_default: bool,
}

/// Source of capture devices
pub trait DeviceCatalog {
    type Device;

    fn input_device_count(&self) -> usize;

    fn output_device_count(&self) -> usize;

    fn devices(&self) -> Vec<AudioDeviceInfo>;

    /// Look a device up by its stable identifier
    fn device(&self, id: &str) -> Result<Self::Device, AudioError>;

    fn capabilities(&self, device: &Self::Device) -> Result<DeviceCapabilities, AudioError>;
}

/// Wrapper around cpal device
pub struct AudioDevice {
    inner: cpal::Device,
    pub id: String,
    pub name: String,
    pub is_input: bool,
}

impl AudioDevice {
    pub fn from_cpal(device: cpal::Device, is_input: bool) -> Self {
        let name = device.name().unwrap_or_else(|_| "Unknown".to_string());
        let id = device_id(&name, is_input);
        Self {
            inner: device,
            id,
            name,
            is_input,
        }
    }

    pub fn into_inner(self) -> cpal::Device {
        self.inner
    }

    /// Collect the rate ranges, formats and channel count the device offers
    ///
    /// Output devices are captured through their monitor, so their output
    /// configurations are reported.
    pub fn capabilities(&self) -> Result<DeviceCapabilities, AudioError> {
        let ranges: Vec<cpal::SupportedStreamConfigRange> = if self.is_input {
            self.inner.supported_input_configs()?.collect()
        } else {
            self.inner.supported_output_configs()?.collect()
        };

        let mut sample_rates = Vec::new();
        let mut formats = Vec::new();
        for range in &ranges {
            let rates = SampleRateRange::new(range.min_sample_rate().0, range.max_sample_rate().0);
            if !sample_rates.contains(&rates) {
                sample_rates.push(rates);
            }
            if let Some(format) = SampleFormat::from_cpal(range.sample_format()) {
                if !formats.contains(&format) {
                    formats.push(format);
                }
            }
        }

        let channels = if self.is_input {
            self.inner.default_input_config()?.channels()
        } else {
            self.inner.default_output_config()?.channels()
        };

        Ok(DeviceCapabilities {
            sample_rates,
            formats,
            channels,
        })
    }
}

fn device_id(name: &str, is_input: bool) -> String {
    if is_input {
        format!("input:{}", name)
    } else {
        format!("output:{}", name)
    }
}

/// Device catalog backed by the default cpal host
pub struct CpalCatalog {
    host: cpal::Host,
}

impl CpalCatalog {
    pub fn new() -> Self {
        Self {
            host: cpal::default_host(),
        }
    }

    pub fn default_input_device(&self) -> Result<AudioDevice, AudioError> {
        self.host
            .default_input_device()
            .map(|d| AudioDevice::from_cpal(d, true))
            .ok_or_else(|| AudioError::DeviceNotFound("No default input device".to_string()))
    }
}

impl Default for CpalCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceCatalog for CpalCatalog {
    type Device = AudioDevice;

    fn input_device_count(&self) -> usize {
        self.host.input_devices().map(|d| d.count()).unwrap_or(0)
    }

    fn output_device_count(&self) -> usize {
        self.host.output_devices().map(|d| d.count()).unwrap_or(0)
    }

    fn devices(&self) -> Vec<AudioDeviceInfo> {
        let default_input = self.host.default_input_device().and_then(|d| d.name().ok());
        let default_output = self.host.default_output_device().and_then(|d| d.name().ok());
        let mut devices = Vec::new();

        if let Ok(inputs) = self.host.input_devices() {
            for device in inputs {
                if let Ok(name) = device.name() {
                    devices.push(AudioDeviceInfo {
                        id: device_id(&name, true),
                        is_default: default_input.as_ref() == Some(&name),
                        name,
                        is_input: true,
                    });
                }
            }
        }

        if let Ok(outputs) = self.host.output_devices() {
            for device in outputs {
                if let Ok(name) = device.name() {
                    devices.push(AudioDeviceInfo {
                        id: device_id(&name, false),
                        is_default: default_output.as_ref() == Some(&name),
                        name,
                        is_input: false,
                    });
                }
            }
        }

        devices
    }

    fn device(&self, id: &str) -> Result<AudioDevice, AudioError> {
        // Bare names are treated as input devices
        let (is_input, name) = if let Some(name) = id.strip_prefix("input:") {
            (true, name)
        } else if let Some(name) = id.strip_prefix("output:") {
            (false, name)
        } else {
            (true, id)
        };

        let devices = if is_input {
            self.host.input_devices()
        } else {
            self.host.output_devices()
        }
        .map_err(|e| AudioError::DeviceNotFound(e.to_string()))?;

        for device in devices {
            if device.name().map(|n| n == name).unwrap_or(false) {
                info!("Using audio device: {}", id);
                return Ok(AudioDevice::from_cpal(device, is_input));
            }
        }

        Err(AudioError::DeviceNotFound(id.to_string()))
    }

    fn capabilities(&self, device: &AudioDevice) -> Result<DeviceCapabilities, AudioError> {
        device.capabilities()
    }
}
