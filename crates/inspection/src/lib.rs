//! Line Inspection Pipeline
//!
//! Per-board capture, classify and PLC signalling:
//! - Capture-times controller for multi-shot products
//! - Workflows wrapping one camera and one detection engine each
//! - Detector running the capture → classify → purge → draw cycle
//! - Purge policy and result signalling
//! - Background image saving
//! - Server orchestrating board, heartbeat and merge-total threads

pub mod capture;
pub mod config;
pub mod context;
pub mod detector;
mod error;
pub mod purge;
pub mod save;
pub mod server;
pub mod workflow;

pub use capture::{CaptureTimes, CaptureTimesController};
pub use config::{BoardConfig, CameraType, GatewayConfig, InspectionConfig, SaveConfig, ShotParameters};
pub use context::{AppContext, ProductSettings, RunMode, RunStatus, SaveImageType, TestPhase, TestSettings};
pub use detector::Detector;
pub use error::InspectionError;
pub use purge::{PlcSignal, PurgeDecision, PurgeMode};
pub use save::{ImageKind, ImageSaveWorker, SaveRequest};
pub use server::{rule_engine_factory, EngineFactory, Server};
pub use workflow::Workflow;
