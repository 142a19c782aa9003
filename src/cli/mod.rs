//! Command-line parsing for the grounding-level search.
//!
//! The goal of this module is to keep **argument parsing** and **command dispatch**
//! separate from the inversion/search code.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use crate::domain::RunMode;

/// Top-level CLI.
#[derive(Debug, Parser)]
#[command(name = "gls", version, about = "Grounding-level search for tidal ice-shelf offsets")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Search grounding levels, invert each point, and write result tables.
    Estimate(EstimateArgs),
    /// Generate a synthetic offsets CSV from a known tidal model.
    Simulate(SimulateArgs),
}

/// Modes that need no extra parameters and can be picked from the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ModeArg {
    SimpleLinear,
    Auto,
    InvertOptimal,
}

/// Options for `gls estimate`.
#[derive(Debug, Parser, Clone)]
pub struct EstimateArgs {
    /// Offsets CSV (one row per offset field per point).
    #[arg(long, value_name = "CSV")]
    pub data: PathBuf,

    /// JSON run configuration; defaults are used when omitted.
    #[arg(long, value_name = "JSON")]
    pub config: Option<PathBuf>,

    /// Override the configured search mode.
    #[arg(long, value_enum, conflicts_with = "single_value")]
    pub mode: Option<ModeArg>,

    /// Search a single grounding level for every point.
    #[arg(long, value_name = "GL")]
    pub single_value: Option<f64>,

    /// Reuse (`continue`) or ignore (`redo`) an existing checkpoint.
    #[arg(long, value_enum)]
    pub run_mode: Option<RunMode>,

    /// Checkpoint file (overrides the configured path).
    #[arg(long, value_name = "JSON")]
    pub checkpoint: Option<PathBuf>,

    /// Output directory for xyz/CSV/JSON tables (overrides the configured path).
    #[arg(long, value_name = "DIR")]
    pub output: Option<PathBuf>,

    /// Stop after this many enumeration rounds; rerun to continue.
    #[arg(long)]
    pub max_rounds: Option<usize>,

    /// Show at most N points in the terminal table.
    #[arg(long, default_value_t = 20)]
    pub top: usize,
}

/// Options for `gls simulate`.
#[derive(Debug, Parser, Clone)]
pub struct SimulateArgs {
    /// Output offsets CSV.
    #[arg(long, value_name = "CSV")]
    pub output: PathBuf,

    /// Random seed for the noise and tidal ellipses.
    #[arg(long, default_value_t = 7)]
    pub seed: u64,

    /// Grid columns (longitude).
    #[arg(long, default_value_t = 3)]
    pub n_lon: usize,

    /// Grid rows (latitude).
    #[arg(long, default_value_t = 2)]
    pub n_lat: usize,

    /// Days covered by the acquisitions.
    #[arg(long, default_value_t = 36)]
    pub days: u32,

    /// Mean grounding level (m).
    #[arg(long, default_value_t = -0.5, allow_hyphen_values = true)]
    pub grounding_level: f64,

    /// Uniform per-point jitter of the grounding level (± m).
    #[arg(long, default_value_t = 0.0)]
    pub gl_spread: f64,

    /// Offset noise sigma (m).
    #[arg(long, default_value_t = 0.02)]
    pub noise: f64,
}
