//! Defect Detection Engine
//!
//! Contract between the inspection workflows and the classifier that turns a
//! frame into per-target defect codes, plus:
//! - the defect catalog mapping codes to category names
//! - a rule-based engine used without a trained model
//! - a scripted engine for tests

mod catalog;
mod engine;
mod scripted;

pub use catalog::{DefectCatalog, CLASSIFYING, GOOD};
pub use engine::{EngineConfig, InferenceEngine};
pub use scripted::{ScriptedCall, ScriptedEngine};

use camera_capture::Frame;
use thiserror::Error;

/// Errors during detection
#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("Model load failed: {0}")]
    ModelLoadError(String),
    #[error("Inference failed: {0}")]
    InferenceFailed(String),
    #[error("Invalid input shape: expected {expected}, got {actual}")]
    InvalidInputShape { expected: String, actual: String },
    #[error("Inference timeout after {0}ms")]
    Timeout(u64),
}

/// Classifier consumed by a workflow
///
/// `detect_analyze` returns one list per target. An empty list means the
/// target is Good; otherwise each entry is a defect code from the catalog.
pub trait DetectionEngine: Send {
    fn detect_analyze(
        &mut self,
        frame: &Frame,
        product_count: u64,
        shot: u32,
    ) -> Result<Vec<Vec<i32>>, InferenceError>;

    /// Targets reported per frame
    fn target_count(&self) -> usize;

    /// Reload product-specific parameters
    fn reconfig(&mut self, _product: &str) -> Result<(), InferenceError> {
        Ok(())
    }
}

impl<T: DetectionEngine + ?Sized> DetectionEngine for Box<T> {
    fn detect_analyze(
        &mut self,
        frame: &Frame,
        product_count: u64,
        shot: u32,
    ) -> Result<Vec<Vec<i32>>, InferenceError> {
        (**self).detect_analyze(frame, product_count, shot)
    }

    fn target_count(&self) -> usize {
        (**self).target_count()
    }

    fn reconfig(&mut self, product: &str) -> Result<(), InferenceError> {
        (**self).reconfig(product)
    }
}
