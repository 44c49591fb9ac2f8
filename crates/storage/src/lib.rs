//! Storage Layer
//!
//! Persists inspection results with the repository pattern: per-product
//! defect records, MES records and periodic board reports.

mod repository;

pub use repository::{DefectRecord, MesRecord, RecordKey, ReportRecord, Repository, Shift, PLC_CODE};

use thiserror::Error;

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    DatabaseError(String),
    #[error("Record not found")]
    NotFound,
    #[error("Serialization error: {0}")]
    SerializationError(String),
}
