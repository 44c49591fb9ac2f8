//! Acquisition device abstraction
//!
//! The vendor SDK sits behind [`AcquisitionDevice`]: runtime lifetime,
//! enumeration, GenICam-style features and a transfer stream bound to the
//! driver's buffer ring.

use ring_buffer::BufferRing;
use std::sync::Arc;
use thiserror::Error;

/// GenICam feature names written by the driver
pub mod feature {
    pub const WIDTH: &str = "Width";
    pub const HEIGHT: &str = "Height";
    pub const OFFSET_X: &str = "OffsetX";
    pub const OFFSET_Y: &str = "OffsetY";
    pub const PIXEL_FORMAT: &str = "PixelFormat";
    pub const EXPOSURE_TIME: &str = "ExposureTime";
    pub const GAIN: &str = "Gain";
    pub const GAMMA_ENABLE: &str = "GammaEnable";
    pub const GAMMA: &str = "Gamma";
    pub const TRIGGER_SELECTOR: &str = "TriggerSelector";
    pub const TRIGGER_MODE: &str = "TriggerMode";
    pub const TRIGGER_SOURCE: &str = "TriggerSource";
    pub const LINE_DEBOUNCING_PERIOD: &str = "LineDebouncingPeriod";
    pub const PACKET_SIZE: &str = "GevSCPSPacketSize";
    pub const INTER_PACKET_DELAY: &str = "GevSCPD";
}

/// Inter-packet timeout used for every stream (milliseconds)
pub const PACKET_INTER_TIMEOUT_MS: u64 = 3_600_000;

/// Device-level errors reported by the SDK layer
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DeviceError {
    #[error("Runtime error: {0}")]
    Runtime(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Device not open")]
    NotOpen,

    #[error("Feature {name} rejected: {reason}")]
    Feature { name: String, reason: String },

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("Device offline")]
    Offline,
}

/// Typed feature value
#[derive(Debug, Clone, PartialEq)]
pub enum FeatureValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    Enum(String),
}

impl FeatureValue {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            FeatureValue::Int(v) => Some(*v),
            FeatureValue::Float(v) => Some(*v as i64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FeatureValue::Enum(s) => Some(s),
            _ => None,
        }
    }
}

/// Enumerated device
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceInfo {
    pub serial_number: String,
    pub model: String,
    pub device_class: String,
}

/// Buffer hand-off policy of a transfer stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    /// Stream only fills EMPTY buffers, never overwrites unread frames
    SynchronousWithProtect,
    /// Stream overwrites the oldest buffer
    Asynchronous,
}

/// Transfer stream settings
#[derive(Debug, Clone, PartialEq)]
pub struct StreamSettings {
    pub transfer_mode: TransferMode,
    /// Clear buffers automatically after read
    pub auto_clear: bool,
    /// Transfer timeout, -1 = infinite
    pub timeout_ms: i64,
    pub packet_inter_timeout_ms: u64,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            transfer_mode: TransferMode::SynchronousWithProtect,
            auto_clear: false,
            timeout_ms: -1,
            packet_inter_timeout_ms: PACKET_INTER_TIMEOUT_MS,
        }
    }
}

/// Vendor SDK seam
///
/// One instance controls one physical camera. Calls are serialized by the
/// owning driver.
pub trait AcquisitionDevice: Send {
    /// Initialise the SDK runtime
    fn init_runtime(&mut self) -> Result<(), DeviceError>;
    /// Shut the SDK runtime down (always succeeds)
    fn terminate_runtime(&mut self);
    /// List reachable devices
    fn enumerate(&mut self) -> Result<Vec<DeviceInfo>, DeviceError>;
    /// Open the device with `serial` exclusively
    fn open_device(&mut self, serial: &str) -> Result<(), DeviceError>;
    fn close_device(&mut self) -> Result<(), DeviceError>;
    /// Whether the opened device is still reachable
    fn is_online(&self) -> bool;

    fn set_feature(&mut self, name: &str, value: FeatureValue) -> Result<(), DeviceError>;
    fn feature(&self, name: &str) -> Result<FeatureValue, DeviceError>;

    /// Number of stream channels the device exposes
    fn stream_count(&self) -> Result<u32, DeviceError>;
    /// Create the transfer stream bound to buffer 0 of `ring`
    fn create_stream(&mut self, ring: Arc<BufferRing>) -> Result<(), DeviceError>;
    /// Attach an additional ring buffer to the stream
    fn attach_buffer(&mut self, index: usize) -> Result<(), DeviceError>;
    fn detach_buffer(&mut self, index: usize) -> Result<(), DeviceError>;
    fn configure_stream(&mut self, settings: &StreamSettings) -> Result<(), DeviceError>;
    /// Start continuous acquisition
    fn start_stream(&mut self) -> Result<(), DeviceError>;
    fn stop_stream(&mut self) -> Result<(), DeviceError>;
    /// Destroy the stream (buffers must be detached first)
    fn free_stream(&mut self) -> Result<(), DeviceError>;
}

impl<T: AcquisitionDevice + ?Sized> AcquisitionDevice for Box<T> {
    fn init_runtime(&mut self) -> Result<(), DeviceError> {
        (**self).init_runtime()
    }
    fn terminate_runtime(&mut self) {
        (**self).terminate_runtime()
    }
    fn enumerate(&mut self) -> Result<Vec<DeviceInfo>, DeviceError> {
        (**self).enumerate()
    }
    fn open_device(&mut self, serial: &str) -> Result<(), DeviceError> {
        (**self).open_device(serial)
    }
    fn close_device(&mut self) -> Result<(), DeviceError> {
        (**self).close_device()
    }
    fn is_online(&self) -> bool {
        (**self).is_online()
    }
    fn set_feature(&mut self, name: &str, value: FeatureValue) -> Result<(), DeviceError> {
        (**self).set_feature(name, value)
    }
    fn feature(&self, name: &str) -> Result<FeatureValue, DeviceError> {
        (**self).feature(name)
    }
    fn stream_count(&self) -> Result<u32, DeviceError> {
        (**self).stream_count()
    }
    fn create_stream(&mut self, ring: Arc<BufferRing>) -> Result<(), DeviceError> {
        (**self).create_stream(ring)
    }
    fn attach_buffer(&mut self, index: usize) -> Result<(), DeviceError> {
        (**self).attach_buffer(index)
    }
    fn detach_buffer(&mut self, index: usize) -> Result<(), DeviceError> {
        (**self).detach_buffer(index)
    }
    fn configure_stream(&mut self, settings: &StreamSettings) -> Result<(), DeviceError> {
        (**self).configure_stream(settings)
    }
    fn start_stream(&mut self) -> Result<(), DeviceError> {
        (**self).start_stream()
    }
    fn stop_stream(&mut self) -> Result<(), DeviceError> {
        (**self).stop_stream()
    }
    fn free_stream(&mut self) -> Result<(), DeviceError> {
        (**self).free_stream()
    }
}
