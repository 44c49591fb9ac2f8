use camera_capture::CameraError;
use inference_engine::InferenceError;
use plc_io::IoError;
use storage::StorageError;
use thiserror::Error;

/// Inspection pipeline errors
#[derive(Error, Debug)]
pub enum InspectionError {
    #[error("Camera error: {0}")]
    Camera(#[from] CameraError),

    #[error("Gateway error: {0}")]
    Gateway(#[from] IoError),

    #[error("Detection engine error: {0}")]
    Inference(#[from] InferenceError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Classification failed: {0}")]
    Classification(String),

    #[error("Signal write failed: {0}")]
    SignalWrite(String),

    #[error("Draw failed: {0}")]
    Draw(String),

    #[error("No frame available on workflow {0}")]
    NoFrame(usize),

    #[error("Invalid board id: {0}")]
    InvalidBoard(usize),

    #[error("Test run unavailable: {0}")]
    TestUnavailable(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("Unexpected error: {0}")]
    Unexpected(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl InspectionError {
    /// Errors that end a board thread instead of skipping one cycle
    pub fn is_fatal(&self) -> bool {
        matches!(self, InspectionError::Lock(_) | InspectionError::Unexpected(_))
    }
}

impl From<config::ConfigError> for InspectionError {
    fn from(e: config::ConfigError) -> Self {
        InspectionError::Config(e.to_string())
    }
}
