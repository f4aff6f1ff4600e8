//! Parameter sweep generation.
//!
//! The calibration is a deterministic grid search over per-pool parameters.
//!
//! Why grid search?
//! - It avoids local minima issues common in nonlinear optimization.
//! - It is deterministic given the same inputs/flags.
//! - Candidate evaluation is embarrassingly parallel, so modest grids stay fast.
//!
//! Turnover times span several orders of magnitude, so the turnover sweep is
//! log-spaced; concentration-like quantities use linear sweeps.

use crate::error::AppError;

/// Generate `steps` log-spaced points between `min` and `max` (inclusive).
pub fn log_space(min: f64, max: f64, steps: usize) -> Result<Vec<f64>, AppError> {
    if !(min.is_finite() && max.is_finite() && min > 0.0 && max > 0.0 && max >= min) {
        return Err(AppError::new(
            2,
            format!("Invalid log range: min={min}, max={max} (must be finite, >0, and ordered)."),
        ));
    }
    if steps == 1 || (max - min).abs() < f64::EPSILON {
        return Ok(vec![min]);
    }
    if steps < 2 {
        return Err(AppError::new(2, "Log-spaced sweep needs >= 1 step."));
    }

    let ln_min = min.ln();
    let ln_max = max.ln();
    let step = (ln_max - ln_min) / (steps as f64 - 1.0);

    let mut out = Vec::with_capacity(steps);
    for i in 0..steps {
        out.push((ln_min + step * i as f64).exp());
    }
    Ok(out)
}

/// Generate `steps` linearly spaced points between `min` and `max` (inclusive).
pub fn lin_space(min: f64, max: f64, steps: usize) -> Result<Vec<f64>, AppError> {
    if !(min.is_finite() && max.is_finite() && max >= min) {
        return Err(AppError::new(
            2,
            format!("Invalid linear range: min={min}, max={max} (must be finite and ordered)."),
        ));
    }
    if steps == 1 || (max - min).abs() < f64::EPSILON {
        return Ok(vec![min]);
    }
    if steps < 2 {
        return Err(AppError::new(2, "Linear sweep needs >= 1 step."));
    }

    let step = (max - min) / (steps as f64 - 1.0);
    let mut out = Vec::with_capacity(steps);
    for i in 0..steps {
        out.push(min + step * i as f64);
    }
    Ok(out)
}
