//! Formatted terminal output for a calibration run.
//!
//! Formatting is kept in one place so:
//! - the search/fitting code stays clean and testable
//! - output changes are localized (important for future snapshot tests)

use crate::domain::{PoolSummary, StageTable};
use crate::fit::Selection;
use crate::io::DatasetStats;

/// How a stage table was obtained during this run.
#[derive(Debug, Clone)]
pub enum StageSource {
    Computed,
    CacheHit,
    /// Reran because the cached file was unusable; carries the reason.
    Recomputed(String),
}

impl StageSource {
    fn label(&self) -> String {
        match self {
            StageSource::Computed => "computed".to_string(),
            StageSource::CacheHit => "cache hit".to_string(),
            StageSource::Recomputed(reason) => format!("recomputed, cache {reason}"),
        }
    }
}

/// Format the full run summary (dataset stats + stage funnels + best chain).
pub fn format_run_summary(
    stats: &DatasetStats,
    tables: &[StageTable],
    sources: &[StageSource],
    selection: &Selection,
    summaries: &[PoolSummary],
) -> String {
    let mut out = String::new();

    out.push_str("=== poolfit - staged cascade calibration ===\n");
    out.push_str(&format!(
        "Observations: n={} | pools={} | time=[{:.2}, {:.2}]\n",
        stats.rows, stats.n_pools, stats.time_min, stats.time_max
    ));

    out.push_str("\nStage funnels (evaluated > accepted > <=median > dedup > kept):\n");
    for (table, source) in tables.iter().zip(sources) {
        let s = &table.stats;
        out.push_str(&format!(
            "  stage {}: {} > {} > {} > {} > {}  [{}; {} integrator/scorer drops]\n",
            table.stage,
            s.evaluated,
            s.accepted,
            s.below_median,
            s.deduplicated,
            s.kept,
            source.label(),
            s.integration_failures,
        ));
    }

    let best = &selection.best;
    out.push_str(&format!(
        "\nBest chain (aggregate RMSE {:.4}",
        best.aggregate_rmse
    ));
    if selection.tied > 0 {
        out.push_str(&format!(
            "; WARNING: {} other chain(s) tie this score exactly",
            selection.tied
        ));
    }
    out.push_str("):\n");
    for (i, (params, rmse)) in best.params.iter().zip(&best.stage_rmse).enumerate() {
        out.push_str(&format!(
            "  pool {}: turnover={:.4} C0={:.4} input={:.4} transfer_out={:.4} (stage RMSE {:.4})\n",
            i + 1,
            params.turnover(),
            params.initial_concentration,
            params.input_magnitude,
            params.transfer_fraction,
            rmse,
        ));
    }

    out.push('\n');
    out.push_str(&format_ensemble(summaries));

    out
}

/// Format only the per-pool ensemble ranges (used by `poolfit summary`).
pub fn format_ensemble(summaries: &[PoolSummary]) -> String {
    let mut out = String::new();
    out.push_str("Ensemble ranges (min / max, best in brackets):\n");
    for summary in summaries {
        out.push_str(&format!("  pool {}:\n", summary.pool));
        out.push_str(&format_range_line("turnover", &summary.turnover));
        out.push_str(&format_range_line("initial C", &summary.initial_concentration));
        out.push_str(&format_range_line("input", &summary.input_magnitude));
        if let Some(transfer) = &summary.transfer_fraction {
            out.push_str(&format_range_line("transfer in", transfer));
        }
    }
    out
}

fn format_range_line(name: &str, range: &crate::domain::ValueRange) -> String {
    format!(
        "    {:<12} {:.4} / {:.4}  [{:.4}]\n",
        name, range.min, range.max, range.best
    )
}
