//! Flat CSV exports of the fit results.

use std::path::Path;

use crate::domain::PoolSummary;
use crate::error::AppError;
use crate::sim::Trajectory;

/// Write the projected best-fit trajectory: `time,pool_1,...,pool_N`.
pub fn write_simulation_csv(path: &Path, trajectory: &Trajectory) -> Result<(), AppError> {
    let mut writer = csv::Writer::from_path(path).map_err(|e| {
        AppError::new(2, format!("Failed to create '{}': {e}", path.display()))
    })?;

    let n_pools = trajectory.states.first().map_or(0, Vec::len);
    let mut header = vec!["time".to_string()];
    header.extend((1..=n_pools).map(|p| format!("pool_{p}")));
    write_record(&mut writer, &header, path)?;

    for (time, state) in trajectory.times.iter().zip(&trajectory.states) {
        let mut record = vec![format_value(*time)];
        record.extend(state.iter().map(|&v| format_value(v)));
        write_record(&mut writer, &record, path)?;
    }

    writer
        .flush()
        .map_err(|e| AppError::new(2, format!("Failed to flush '{}': {e}", path.display())))
}

/// Write the per-pool parameter summary in long form:
/// `pool,parameter,ensemble_min,ensemble_max,best_fit`.
///
/// Pool 1 has no incoming transfer edge, so it emits no `transfer_fraction`
/// row.
pub fn write_summary_csv(path: &Path, summaries: &[PoolSummary]) -> Result<(), AppError> {
    let mut writer = csv::Writer::from_path(path).map_err(|e| {
        AppError::new(2, format!("Failed to create '{}': {e}", path.display()))
    })?;

    write_record(
        &mut writer,
        &[
            "pool".to_string(),
            "parameter".to_string(),
            "ensemble_min".to_string(),
            "ensemble_max".to_string(),
            "best_fit".to_string(),
        ],
        path,
    )?;

    for summary in summaries {
        let mut rows = vec![
            ("turnover_time", summary.turnover),
            ("initial_concentration", summary.initial_concentration),
            ("input_magnitude", summary.input_magnitude),
        ];
        if let Some(transfer) = summary.transfer_fraction {
            rows.push(("transfer_fraction", transfer));
        }
        for (name, range) in rows {
            write_record(
                &mut writer,
                &[
                    summary.pool.to_string(),
                    name.to_string(),
                    format_value(range.min),
                    format_value(range.max),
                    format_value(range.best),
                ],
                path,
            )?;
        }
    }

    writer
        .flush()
        .map_err(|e| AppError::new(2, format!("Failed to flush '{}': {e}", path.display())))
}

fn write_record(
    writer: &mut csv::Writer<std::fs::File>,
    record: &[String],
    path: &Path,
) -> Result<(), AppError> {
    writer
        .write_record(record)
        .map_err(|e| AppError::new(2, format!("Failed to write '{}': {e}", path.display())))
}

fn format_value(v: f64) -> String {
    format!("{v:.6}")
}
