//! Candidate scoring: RMSE plus the regression acceptance diagnostic.
//!
//! Each candidate's simulated pool trajectory is compared to that pool's
//! observations at identical time points (all horizons and replicates
//! pooled). The RMSE ranks candidates; the OLS diagnostic of observed on
//! simulated decides whether a candidate is structurally valid at all,
//! independent of RMSE magnitude.

use crate::domain::FitDiagnostic;
use crate::math::ols_line;

/// RMSE and acceptance diagnostic for one candidate's pool trajectory.
#[derive(Debug, Clone, Copy)]
pub struct Score {
    pub rmse: f64,
    pub diagnostic: FitDiagnostic,
}

/// Score a simulated trajectory (indexed by fitting-grid position) against a
/// pool's observations.
///
/// Returns `None` when the diagnostic is not estimable: a flat or non-finite
/// simulated series, or too few observations. Such candidates cannot pass the
/// acceptance rule and are dropped by the caller.
pub fn score_pool(sim_grid: &[f64], observations: &[(usize, f64)]) -> Option<Score> {
    if observations.is_empty() {
        return None;
    }

    let mut sim = Vec::with_capacity(observations.len());
    let mut obs = Vec::with_capacity(observations.len());
    let mut sse = 0.0;
    for &(grid_idx, observed) in observations {
        let simulated = *sim_grid.get(grid_idx)?;
        if !simulated.is_finite() {
            return None;
        }
        let r = simulated - observed;
        sse += r * r;
        sim.push(simulated);
        obs.push(observed);
    }
    let rmse = (sse / observations.len() as f64).sqrt();

    let line = ols_line(&sim, &obs)?;
    Some(Score {
        rmse,
        diagnostic: FitDiagnostic {
            intercept: line.intercept,
            intercept_se: line.intercept_se,
            slope: line.slope,
            slope_se: line.slope_se,
        },
    })
}
