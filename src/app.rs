//! Top-level application orchestration.
//!
//! `src/main.rs` is intentionally tiny; this module is the "real main" that:
//! - parses CLI arguments
//! - resolves the run configuration (file + CLI overrides)
//! - runs the search pipeline
//! - prints the terminal summary

use clap::Parser;
use log::info;

use crate::cli::{Command, EstimateArgs, ModeArg, SimulateArgs};
use crate::data::{SampleConfig, generate_sample, write_offsets_csv};
use crate::domain::{EstimateConfig, SearchMode, load_config};
use crate::error::AppError;

pub mod pipeline;

/// Entry point for the `gls` binary.
pub fn run() -> Result<(), AppError> {
    let cli = crate::cli::Cli::parse();

    match cli.command {
        Command::Estimate(args) => handle_estimate(args),
        Command::Simulate(args) => handle_simulate(args),
    }
}

fn handle_estimate(args: EstimateArgs) -> Result<(), AppError> {
    let config = config_from_args(&args)?;
    let run = pipeline::run_estimate(&config, &args.data)?;

    println!(
        "{}",
        crate::report::format_run_summary(Some(&run.ingest.stats), &run.output, &config)
    );
    println!("{}", crate::report::format_point_table(&run.output.points, args.top));

    if !run.ingest.row_errors.is_empty() {
        eprintln!("Skipped {} malformed row(s) in '{}':", run.ingest.row_errors.len(), args.data.display());
        for e in run.ingest.row_errors.iter().take(10) {
            eprintln!("  line {}: {}", e.line, e.message);
        }
    }
    for path in &run.written {
        info!("wrote {}", path.display());
    }

    Ok(())
}

fn handle_simulate(args: SimulateArgs) -> Result<(), AppError> {
    let config = SampleConfig {
        seed: args.seed,
        n_lon: args.n_lon,
        n_lat: args.n_lat,
        days: args.days,
        grounding_level: args.grounding_level,
        grounding_level_spread: args.gl_spread,
        noise_sigma: args.noise,
        ..SampleConfig::default()
    };
    let sample = generate_sample(&config)?;
    write_offsets_csv(&args.output, &sample.points)?;

    let n_offsets: usize = sample.points.iter().map(|p| p.offsets.len()).sum();
    println!(
        "Wrote {n_offsets} offsets for {} points to {}",
        sample.points.len(),
        args.output.display()
    );
    Ok(())
}

/// Load the configured run and apply CLI overrides.
pub fn config_from_args(args: &EstimateArgs) -> Result<EstimateConfig, AppError> {
    let mut config = match &args.config {
        Some(path) => load_config(path)?,
        None => EstimateConfig::default(),
    };

    if let Some(mode) = args.mode {
        config.mode = match mode {
            ModeArg::SimpleLinear => SearchMode::SimpleLinear,
            ModeArg::Auto => SearchMode::Auto,
            ModeArg::InvertOptimal => SearchMode::InvertOptimal,
        };
    }
    if let Some(value) = args.single_value {
        config.mode = SearchMode::SingleValue { value };
    }
    if let Some(run_mode) = args.run_mode {
        config.run_mode = run_mode;
    }
    if args.checkpoint.is_some() {
        config.checkpoint = args.checkpoint.clone();
    }
    if args.output.is_some() {
        config.output_dir = args.output.clone();
    }
    if args.max_rounds.is_some() {
        config.max_rounds = args.max_rounds;
    }

    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::Cli;
    use crate::domain::RunMode;

    fn estimate_args(argv: &[&str]) -> EstimateArgs {
        let cli = Cli::try_parse_from(argv).unwrap();
        match cli.command {
            Command::Estimate(args) => args,
            Command::Simulate(_) => panic!("expected estimate"),
        }
    }

    #[test]
    fn cli_overrides_config() {
        let args = estimate_args(&[
            "gls",
            "estimate",
            "--data",
            "offsets.csv",
            "--mode",
            "simple-linear",
            "--run-mode",
            "redo",
            "--max-rounds",
            "1",
        ]);
        let config = config_from_args(&args).unwrap();
        assert_eq!(config.mode, SearchMode::SimpleLinear);
        assert_eq!(config.run_mode, RunMode::Redo);
        assert_eq!(config.max_rounds, Some(1));
    }

    #[test]
    fn single_value_accepts_negative_levels() {
        let args = estimate_args(&["gls", "estimate", "--data", "x.csv", "--single-value=-1.5"]);
        let config = config_from_args(&args).unwrap();
        assert_eq!(config.mode, SearchMode::SingleValue { value: -1.5 });
    }

    #[test]
    fn missing_config_file_is_a_configuration_error() {
        let args = estimate_args(&["gls", "estimate", "--data", "x.csv", "--config", "/nonexistent/run.json"]);
        assert_eq!(config_from_args(&args).unwrap_err().exit_code(), 2);
    }
}
