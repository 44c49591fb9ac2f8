//! Signal gateway error types

use thiserror::Error;

/// Errors that can occur while talking to a PLC or IO card
#[derive(Debug, Error)]
pub enum IoError {
    /// TCP connection error
    #[error("Connection error: {0}")]
    Connection(String),

    /// Timeout waiting for a response
    #[error("Timeout waiting for PLC response after {0}ms")]
    Timeout(u64),

    /// Malformed or unexpected response frame
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Modbus exception response
    #[error("Modbus exception {code:02X} for function {function:02X}")]
    Exception { function: u8, code: u8 },

    /// Response does not belong to the outstanding request
    #[error("Transaction mismatch: expected {expected}, got {actual}")]
    TransactionMismatch { expected: u16, actual: u16 },

    /// Line or register outside the device range
    #[error("Address {0} out of range")]
    AddressOutOfRange(u16),

    /// Operation not supported by this gateway
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// Injected or device-reported write failure
    #[error("Write rejected: {0}")]
    WriteRejected(String),

    #[error("Lock error: {0}")]
    Lock(String),
}

impl From<std::io::Error> for IoError {
    fn from(err: std::io::Error) -> Self {
        IoError::Connection(err.to_string())
    }
}
