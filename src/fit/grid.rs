//! Per-stage parameter grid construction.
//!
//! Each stage sweeps its own pool's parameters:
//!
//! - decay rate, expressed as a log-spaced sweep over turnover time
//! - initial concentration (linear)
//! - input magnitude (linear)
//! - transfer fraction over [0, 1] (linear), swept only for non-terminal pools,
//!   where it governs the edge into the next stage's pool
//!
//! Input duration is a shared constant, not searched.

use crate::domain::RunConfig;
use crate::error::AppError;
use crate::math::{lin_space, log_space};

/// The own-pool sweep of one stage.
#[derive(Debug, Clone)]
pub struct StageGrid {
    pub decay_rates: Vec<f64>,
    pub initials: Vec<f64>,
    pub magnitudes: Vec<f64>,
    /// `[0.0]` at the terminal stage (no downstream edge to parameterize).
    pub transfers: Vec<f64>,
    pub input_duration: f64,
}

impl StageGrid {
    /// Build the grid for `stage` (1-based) of an `n_pools` run.
    pub fn from_config(config: &RunConfig, stage: usize, n_pools: usize) -> Result<Self, AppError> {
        let turnovers = log_space(
            config.turnover.min,
            config.turnover.max,
            config.turnover.steps,
        )?;
        let decay_rates = turnovers.iter().map(|tau| 1.0 / tau).collect();

        let initials = lin_space(config.initial.min, config.initial.max, config.initial.steps)?;
        let magnitudes = lin_space(
            config.input_magnitude.min,
            config.input_magnitude.max,
            config.input_magnitude.steps,
        )?;

        let transfers = if stage < n_pools {
            lin_space(0.0, 1.0, config.transfer_steps)?
        } else {
            vec![0.0]
        };

        Ok(Self {
            decay_rates,
            initials,
            magnitudes,
            transfers,
            input_duration: config.input_duration,
        })
    }

    /// Number of own-pool combinations (before crossing with parents).
    pub fn combo_count(&self) -> usize {
        self.decay_rates.len() * self.initials.len() * self.magnitudes.len() * self.transfers.len()
    }
}
