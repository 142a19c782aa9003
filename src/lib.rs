//! `gl-search` library crate.
//!
//! The binary (`gls`) is a thin wrapper around this library so that:
//!
//! - the search and inversion logic is testable without spawning processes
//! - modules are reusable from other drivers (batch schedulers, notebooks)
//! - code stays easy to navigate as the project grows

pub mod app;
pub mod cli;
pub mod data;
pub mod domain;
pub mod error;
pub mod fit;
pub mod io;
pub mod math;
pub mod models;
pub mod report;
