//! Command-line parsing for the staged cascade calibrator.
//!
//! The goal of this module is to keep **argument parsing** and **command
//! dispatch** separate from the modeling/math code.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::domain::{GridRange, RunConfig};

/// Top-level CLI.
#[derive(Debug, Parser)]
#[command(name = "poolfit", version, about = "Staged grid-search calibration of chained decay pools")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the staged calibration, print the full report, and write exports.
    Fit(FitArgs),
    /// Print only the per-pool parameter ranges (useful for scripting).
    ///
    /// Runs the same pipeline as `poolfit fit`; with a warm cache directory
    /// every stage is a cache hit.
    Summary(FitArgs),
}

/// Common options for fitting and summarizing.
#[derive(Debug, Parser, Clone)]
pub struct FitArgs {
    /// Observation CSV (time, pool_1..pool_N, horizon_id, replicate_kind).
    #[arg(short = 'o', long)]
    pub obs: PathBuf,

    /// Directory for per-stage result caching and resumption.
    #[arg(long, default_value = ".poolfit-cache")]
    pub cache_dir: PathBuf,

    /// Minimum turnover time for the log-spaced sweep.
    #[arg(long, default_value_t = 1.0)]
    pub turnover_min: f64,

    /// Maximum turnover time for the log-spaced sweep.
    #[arg(long, default_value_t = 10_000.0)]
    pub turnover_max: f64,

    /// Turnover sweep steps per stage.
    #[arg(long, default_value_t = 25)]
    pub turnover_steps: usize,

    /// Minimum initial concentration (linear sweep).
    #[arg(long, default_value_t = 0.0)]
    pub initial_min: f64,

    /// Maximum initial concentration (linear sweep).
    #[arg(long, default_value_t = 200.0)]
    pub initial_max: f64,

    /// Initial-concentration sweep steps per stage.
    #[arg(long, default_value_t = 11)]
    pub initial_steps: usize,

    /// Minimum front-loaded input magnitude (linear sweep).
    #[arg(long, default_value_t = 0.0)]
    pub input_min: f64,

    /// Maximum front-loaded input magnitude (linear sweep).
    #[arg(long, default_value_t = 5.0)]
    pub input_max: f64,

    /// Input-magnitude sweep steps per stage.
    #[arg(long, default_value_t = 6)]
    pub input_steps: usize,

    /// Transfer-fraction grid size over [0, 1] (non-terminal stages).
    #[arg(long, default_value_t = 11)]
    pub transfer_steps: usize,

    /// Duration of the front-loaded input ramp (time units).
    #[arg(long, default_value_t = 50.0)]
    pub input_duration: f64,

    /// Candidates carried from each non-terminal stage into the next.
    #[arg(long, default_value_t = 50)]
    pub subsample: usize,

    /// Random seed for the reproducible stage subsamples.
    #[arg(long, default_value_t = 42)]
    pub seed: u64,

    /// Horizon of the best-fit projection grid.
    #[arg(long, default_value_t = 500.0)]
    pub project_to: f64,

    /// Number of points on the projection grid.
    #[arg(long, default_value_t = 101)]
    pub project_steps: usize,

    /// Write the projected best-fit trajectory to this CSV.
    #[arg(long)]
    pub export_sim: Option<PathBuf>,

    /// Write the per-pool parameter summary to this CSV.
    #[arg(long)]
    pub export_summary: Option<PathBuf>,
}

impl FitArgs {
    pub fn to_config(&self) -> RunConfig {
        RunConfig {
            obs_path: self.obs.clone(),
            cache_dir: self.cache_dir.clone(),
            turnover: GridRange {
                min: self.turnover_min,
                max: self.turnover_max,
                steps: self.turnover_steps,
            },
            initial: GridRange {
                min: self.initial_min,
                max: self.initial_max,
                steps: self.initial_steps,
            },
            input_magnitude: GridRange {
                min: self.input_min,
                max: self.input_max,
                steps: self.input_steps,
            },
            transfer_steps: self.transfer_steps,
            input_duration: self.input_duration,
            subsample: self.subsample,
            seed: self.seed,
            project_to: self.project_to,
            project_steps: self.project_steps,
            export_simulation: self.export_sim.clone(),
            export_summary: self.export_summary.clone(),
        }
    }
}
