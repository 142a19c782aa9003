//! Reporting utilities: run totals and formatted terminal output.

pub mod format;

pub use format::*;
