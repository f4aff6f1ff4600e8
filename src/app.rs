//! Top-level application orchestration.
//!
//! `src/main.rs` is intentionally tiny; this module is the "real main" that:
//! - parses CLI arguments
//! - runs the staged calibration pipeline (with per-stage caching)
//! - prints reports
//! - writes optional exports

use clap::Parser;

use crate::cli::{Command, FitArgs};
use crate::error::AppError;

pub mod pipeline;

/// Entry point for the `poolfit` binary.
pub fn run() -> Result<(), AppError> {
    let cli = crate::cli::Cli::parse();

    match cli.command {
        Command::Fit(args) => handle_fit(args, OutputMode::Full),
        Command::Summary(args) => handle_fit(args, OutputMode::SummaryOnly),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputMode {
    Full,
    SummaryOnly,
}

fn handle_fit(args: FitArgs, mode: OutputMode) -> Result<(), AppError> {
    let config = args.to_config();
    let run = pipeline::run_fit(&config)?;

    match mode {
        OutputMode::Full => {
            println!(
                "{}",
                crate::report::format_run_summary(
                    &run.stats,
                    &run.tables,
                    &run.sources,
                    &run.selection,
                    &run.summaries,
                )
            );
        }
        OutputMode::SummaryOnly => {
            println!("{}", crate::report::format_ensemble(&run.summaries));
        }
    }

    if let Some(path) = &config.export_simulation {
        crate::io::write_simulation_csv(path, &run.projection)?;
        println!("Wrote projected trajectory to {}", path.display());
    }
    if let Some(path) = &config.export_summary {
        crate::io::write_summary_csv(path, &run.summaries)?;
        println!("Wrote parameter summary to {}", path.display());
    }

    Ok(())
}
