//! Shared domain types.
//!
//! These types are intentionally kept lightweight and serializable so they can be:
//!
//! - used in-memory during the staged grid search
//! - persisted to the stage cache as JSON
//! - reloaded later for summaries or resumed runs

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// Which replicate of a horizon an observation row represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplicateKind {
    Min,
    Mean,
    Max,
}

impl ReplicateKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "min" => Some(ReplicateKind::Min),
            "mean" => Some(ReplicateKind::Mean),
            "max" => Some(ReplicateKind::Max),
            _ => None,
        }
    }
}

/// Calibrated parameters of a single pool.
///
/// `transfer_fraction` is the share of this pool's decayed mass fed into the
/// next pool downstream; the terminal pool carries `0.0` (nothing below it).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PoolParams {
    /// First-order decay rate (1/turnover time), strictly positive.
    pub decay_rate: f64,
    /// Concentration at t = 0.
    pub initial_concentration: f64,
    /// Fraction of decayed mass transferred to the next pool, in [0, 1].
    pub transfer_fraction: f64,
    /// Peak of the front-loaded input forcing.
    pub input_magnitude: f64,
    /// Time after which the input forcing is identically zero.
    pub input_duration: f64,
}

impl PoolParams {
    /// Turnover time (reciprocal decay rate).
    pub fn turnover(&self) -> f64 {
        1.0 / self.decay_rate
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if !(self.decay_rate.is_finite() && self.decay_rate > 0.0) {
            return Err(AppError::new(2, "decay_rate must be finite and > 0."));
        }
        if !(self.initial_concentration.is_finite() && self.initial_concentration >= 0.0) {
            return Err(AppError::new(2, "initial_concentration must be finite and >= 0."));
        }
        if !(self.transfer_fraction.is_finite()
            && (0.0..=1.0).contains(&self.transfer_fraction))
        {
            return Err(AppError::new(2, "transfer_fraction must be in [0, 1]."));
        }
        if !(self.input_magnitude.is_finite() && self.input_magnitude >= 0.0) {
            return Err(AppError::new(2, "input_magnitude must be finite and >= 0."));
        }
        if !(self.input_duration.is_finite() && self.input_duration > 0.0) {
            return Err(AppError::new(2, "input_duration must be finite and > 0."));
        }
        Ok(())
    }
}

/// Regression diagnostic from OLS of observed on simulated.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FitDiagnostic {
    pub intercept: f64,
    pub intercept_se: f64,
    pub slope: f64,
    pub slope_se: f64,
}

impl FitDiagnostic {
    /// Structural acceptance rule: the simulated series must be an unbiased,
    /// unit-slope predictor of the observations. The one-standard-error
    /// interval of the intercept must contain 0 and that of the slope must
    /// contain 1.
    pub fn accepts(&self) -> bool {
        let intercept_ok = self.intercept - self.intercept_se <= 0.0
            && 0.0 <= self.intercept + self.intercept_se;
        let slope_ok =
            self.slope - self.slope_se <= 1.0 && 1.0 <= self.slope + self.slope_se;
        intercept_ok && slope_ok
    }
}

/// One surviving candidate in a stage table.
///
/// `index` is dense and unique within the stage; `parent` is a foreign key
/// into the previous stage's table (absent at stage 1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageEntry {
    pub index: usize,
    pub parent: Option<usize>,
    /// Own-pool parameters searched at this stage (upstream pools live in
    /// ancestor tables).
    pub params: PoolParams,
    /// RMSE of this pool's trajectory at the stage that introduced it.
    pub rmse: f64,
    pub diagnostic: FitDiagnostic,
}

/// Filter statistics for one stage, kept for diagnostics and cache provenance.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct StageStats {
    /// Grid combinations evaluated.
    pub evaluated: usize,
    /// Combinations dropped because the integrator failed.
    pub integration_failures: usize,
    /// Combinations passing the acceptance rule.
    pub accepted: usize,
    /// Acceptance-passers at or below the median RMSE.
    pub below_median: usize,
    /// Count after parameter-tuple deduplication.
    pub deduplicated: usize,
    /// Final table size (after subsampling, where applicable).
    pub kept: usize,
}

/// Cached artifact of one calibration stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageTable {
    /// 1-based pool index this stage introduced.
    pub stage: usize,
    /// Total pool count of the run that produced this table.
    pub n_pools: usize,
    pub entries: Vec<StageEntry>,
    pub stats: StageStats,
}

/// A complete parameter chain reconstructed by joining stage tables.
#[derive(Debug, Clone)]
pub struct Chain {
    /// Index of this chain's candidate in the terminal stage table.
    pub terminal_index: usize,
    /// Ordered parameters, pool 1 first.
    pub params: Vec<PoolParams>,
    /// Per-pool RMSE as frozen at the stage each pool was introduced.
    pub stage_rmse: Vec<f64>,
    /// Sum of `stage_rmse` (the greedy selection score).
    pub aggregate_rmse: f64,
}

/// Min/max across a stage's surviving ensemble plus the best-fit chain's value.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ValueRange {
    pub min: f64,
    pub max: f64,
    pub best: f64,
}

/// Per-pool parameter ranges over the surviving ensemble.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSummary {
    /// 1-based pool index.
    pub pool: usize,
    pub turnover: ValueRange,
    pub initial_concentration: ValueRange,
    pub input_magnitude: ValueRange,
    /// Fraction of upstream decay feeding this pool; `None` for pool 1, which
    /// has no incoming edge.
    pub transfer_fraction: Option<ValueRange>,
}

/// An inclusive numeric sweep specification.
#[derive(Debug, Clone, Copy)]
pub struct GridRange {
    pub min: f64,
    pub max: f64,
    pub steps: usize,
}

/// A full run's configuration as understood by the pipeline.
///
/// This is derived from CLI flags (plus defaults) and validated once.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub obs_path: PathBuf,
    pub cache_dir: PathBuf,

    /// Turnover-time sweep (log-spaced); decay rates are its reciprocals.
    pub turnover: GridRange,
    /// Initial-concentration sweep (linear).
    pub initial: GridRange,
    /// Input-magnitude sweep (linear).
    pub input_magnitude: GridRange,
    /// Transfer-fraction grid size over [0, 1] (linear, non-terminal pools).
    pub transfer_steps: usize,
    /// Input duration shared by all pools.
    pub input_duration: f64,

    /// Subsample size applied to non-terminal stages.
    pub subsample: usize,
    /// Seed for the reproducible stage subsamples.
    pub seed: u64,

    /// End of the best-fit reporting grid (projection, not calibration).
    pub project_to: f64,
    /// Number of points on the reporting grid.
    pub project_steps: usize,

    pub export_simulation: Option<PathBuf>,
    pub export_summary: Option<PathBuf>,
}

impl RunConfig {
    pub fn validate(&self) -> Result<(), AppError> {
        validate_range("turnover", &self.turnover, true)?;
        validate_range("initial-concentration", &self.initial, false)?;
        validate_range("input-magnitude", &self.input_magnitude, false)?;
        if self.transfer_steps < 2 {
            return Err(AppError::new(2, "Transfer-fraction steps must be >= 2."));
        }
        if !(self.input_duration.is_finite() && self.input_duration > 0.0) {
            return Err(AppError::new(2, "Input duration must be finite and > 0."));
        }
        if self.subsample == 0 {
            return Err(AppError::new(2, "Subsample size must be > 0."));
        }
        if !(self.project_to.is_finite() && self.project_to > 0.0) {
            return Err(AppError::new(2, "Projection horizon must be finite and > 0."));
        }
        if self.project_steps < 2 {
            return Err(AppError::new(2, "Projection steps must be >= 2."));
        }
        Ok(())
    }
}

fn validate_range(name: &str, range: &GridRange, strictly_positive: bool) -> Result<(), AppError> {
    let lo_ok = if strictly_positive {
        range.min > 0.0
    } else {
        range.min >= 0.0
    };
    if !(range.min.is_finite() && range.max.is_finite() && lo_ok && range.max >= range.min) {
        return Err(AppError::new(
            2,
            format!(
                "Invalid {name} range: min={}, max={} (must be finite and ordered).",
                range.min, range.max
            ),
        ));
    }
    if range.steps < 1 {
        return Err(AppError::new(2, format!("{name} steps must be >= 1.")));
    }
    Ok(())
}
