//! Industrial camera capture
//!
//! Provides the camera drivers used by the inspection boards:
//! - Line-scan and area-array drivers over an [`AcquisitionDevice`]
//! - Mock camera replaying image files
//! - Camera manager keyed by logical camera name
//!
//! Frames are delivered as mono or BGR [`Frame`]s. Bayer sensors are
//! demosaiced on read.

pub mod config;
pub mod device;
pub mod driver;
pub mod frame;
pub mod manager;
pub mod mock;
pub mod pixel;
pub mod sim;

pub use config::{CameraConfig, CameraKind, TriggerMode, DEFAULT_READ_TIMEOUT_MS};
pub use device::{AcquisitionDevice, DeviceError, DeviceInfo, FeatureValue, StreamSettings};
pub use driver::CameraDriver;
pub use frame::Frame;
pub use manager::{CameraManager, DeviceFactory, SimulatedDeviceFactory};
pub use mock::MockCamera;
pub use pixel::PixelFormat;
pub use ring_buffer::BufferState;
pub use sim::{SimulatedDevice, SimulatedSensor};

use ring_buffer::RingError;
use thiserror::Error;

/// Camera error types
#[derive(Error, Debug)]
pub enum CameraError {
    #[error("Failed to open camera: {0}")]
    DeviceOpen(String),

    #[error("Unsupported pixel format: {0}")]
    UnsupportedPixelFormat(String),

    #[error("Device reports no stream channel")]
    NoStreamChannel,

    #[error("Capture timeout")]
    Timeout,

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Device offline")]
    DeviceOffline,

    #[error("Camera not started")]
    NotStarted,

    #[error("Camera not opened")]
    NotOpened,

    #[error("Camera already started")]
    AlreadyStarted,

    #[error("Invalid format: {0}")]
    Format(String),

    #[error("Image error: {0}")]
    Image(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Release failed: {0}")]
    Release(String),

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    #[error("Buffer ring error: {0}")]
    Ring(#[from] RingError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Capability interface shared by every camera variant
///
/// Workflows and detectors only see this trait. All methods take `&self`;
/// `read` serializes concurrent callers on a per-camera lock.
pub trait Camera: Send + Sync {
    /// Logical camera name
    fn name(&self) -> &str;
    fn kind(&self) -> CameraKind;

    /// Initialise the device and open the stream
    fn start(&self) -> Result<(), CameraError>;
    /// Allocate the buffer ring and start streaming
    fn open(&self) -> Result<(), CameraError>;
    /// Blocking read; `timeout_ms == -1` waits forever
    fn read(&self, timeout_ms: i64) -> Result<Frame, CameraError>;
    /// Stop streaming and free the buffer ring
    fn release(&self) -> Result<(), CameraError>;
    /// Full teardown, backoff, start
    fn restart(&self) -> Result<(), CameraError>;
    /// Release, then close the device; `start` brings it back
    fn shutdown(&self) -> Result<(), CameraError>;
    /// Push the current configuration to the device
    fn apply_config(&self) -> Result<(), CameraError>;

    fn is_started(&self) -> bool;
    fn is_opened(&self) -> bool;

    /// Snapshot of the camera configuration
    fn config(&self) -> CameraConfig;
    fn read_timeout_ms(&self) -> i64;
    fn set_exposure(&self, exposure: f64);
    fn set_gain(&self, gain: f64);
    /// Only allowed while the camera is not started
    fn set_pixel_format(&self, format: &str) -> Result<(), CameraError>;

    /// Description of the last failed operation, cleared by the next call
    fn last_error(&self) -> Option<String>;
    fn total_frames(&self) -> u64;

    fn is_mock(&self) -> bool {
        false
    }

    /// Per-buffer fill state, empty while released
    fn buffer_states(&self) -> Vec<BufferState>;
}
