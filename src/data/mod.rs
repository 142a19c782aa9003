//! Data sources other than the offsets CSV.
//!
//! - seeded synthetic offsets from a known tidal model (`sample`)

pub mod sample;

pub use sample::*;
