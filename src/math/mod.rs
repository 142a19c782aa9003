//! Mathematical utilities: tidal time basis and Bayesian linear inversion.

pub mod inversion;
pub mod tides;

pub use inversion::*;
pub use tides::*;
