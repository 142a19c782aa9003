//! Domain types used throughout the pipeline.
//!
//! This module defines:
//!
//! - points, offset fields and integer-scaled grounding-level candidates (`types`)
//! - the resumable per-point search state and its optimum (`types`)
//! - the JSON run configuration (`config`)

pub mod config;
pub mod types;

pub use config::*;
pub use types::*;
