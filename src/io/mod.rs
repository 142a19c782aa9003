//! Input/output helpers.
//!
//! - offsets CSV ingest + validation (`ingest`)
//! - search checkpoint read/write (`checkpoint`)
//! - result exports (xyz/CSV/JSON) (`export`)

pub mod checkpoint;
pub mod export;
pub mod ingest;

pub use checkpoint::*;
pub use export::*;
pub use ingest::*;
