//! Frame Buffer Ring
//!
//! Fixed ring of hardware-style acquisition buffers shared between the
//! acquisition stream (writer) and the camera driver (reader).

mod buffer;

pub use buffer::{BufferRing, FrameSlot};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Fill state of a single acquisition buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BufferState {
    /// Owned by the stream, waiting for data
    Empty,
    /// A complete frame has been transferred
    Full,
    /// Transfer ended early (lost packets); still readable
    Incomplete,
}

impl BufferState {
    /// Whether the reader may consume a buffer in this state
    pub fn is_readable(&self) -> bool {
        matches!(self, BufferState::Full | BufferState::Incomplete)
    }
}

impl From<u8> for BufferState {
    fn from(v: u8) -> Self {
        match v {
            1 => BufferState::Full,
            2 => BufferState::Incomplete,
            _ => BufferState::Empty,
        }
    }
}

impl From<BufferState> for u8 {
    fn from(s: BufferState) -> Self {
        match s {
            BufferState::Empty => 0,
            BufferState::Full => 1,
            BufferState::Incomplete => 2,
        }
    }
}

/// Buffer ring errors
#[derive(Debug, Error)]
pub enum RingError {
    #[error("Buffer count must be at least 1")]
    ZeroCapacity,
    #[error("Buffer size must be non-zero")]
    ZeroFrameSize,
    #[error("Buffer {0} still holds an unread frame")]
    Overrun(usize),
    #[error("Buffer index {index} out of range for ring of {len}")]
    OutOfRange { index: usize, len: usize },
    #[error("Lock error: {0}")]
    Lock(String),
}
