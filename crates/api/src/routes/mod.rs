//! API Routes

pub mod control;
pub mod results;
