//! Linear observation model.
//!
//! - `design`: base design matrix plus the ordered optional column modifiers
//! - `params`: turning an estimated parameter vector back into tidal quantities

pub mod design;
pub mod params;

pub use design::*;
pub use params::*;
