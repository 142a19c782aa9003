//! Grounding-level search orchestration.
//!
//! Responsibilities:
//!
//! - decide which points get the full search (`coverage`)
//! - enumerate candidate grounding levels per stage (`stages`)
//! - evaluate each candidate per point (parallel over points) (`fitter`)
//! - select the optimum and its credible interval (`selection`)

pub mod coverage;
pub mod fitter;
pub mod selection;
pub mod stages;

pub use coverage::*;
pub use fitter::*;
pub use selection::*;
pub use stages::*;
