//! Simple-regression OLS with parameter standard errors.
//!
//! The fit scorer regresses observed concentrations on simulated ones:
//!
//! ```text
//! obs_i = intercept + slope * sim_i + e_i
//! ```
//!
//! and needs the standard errors of both coefficients for the structural
//! acceptance test. The problem is tiny (2 columns), so we solve it with SVD
//! for robustness against degenerate simulated series (e.g., a flat
//! trajectory makes the design matrix rank-1).

use nalgebra::{DMatrix, DVector};

/// A fitted regression line with coefficient standard errors.
#[derive(Debug, Clone, Copy)]
pub struct OlsLine {
    pub intercept: f64,
    pub slope: f64,
    pub intercept_se: f64,
    pub slope_se: f64,
}

/// Regress `y` on `x` and return coefficients with standard errors.
///
/// Returns `None` when the regression is not estimable: fewer than three
/// points (no residual degrees of freedom), non-finite inputs, or a design
/// matrix too ill-conditioned to invert (constant `x`).
pub fn ols_line(x: &[f64], y: &[f64]) -> Option<OlsLine> {
    let n = x.len();
    if n != y.len() || n < 3 {
        return None;
    }
    if x.iter().chain(y.iter()).any(|v| !v.is_finite()) {
        return None;
    }

    let mut design = DMatrix::<f64>::zeros(n, 2);
    for i in 0..n {
        design[(i, 0)] = 1.0;
        design[(i, 1)] = x[i];
    }
    let response = DVector::from_column_slice(y);

    let svd = design.clone().svd(true, true);
    let mut beta = None;
    for &tol in &[1e-10, 1e-8, 1e-6] {
        if let Ok(b) = svd.solve(&response, tol) {
            if b.iter().all(|v| v.is_finite()) {
                beta = Some(b);
                break;
            }
        }
    }
    let beta = beta?;

    // Residual variance with n-2 degrees of freedom.
    let fitted = &design * &beta;
    let mut ssr = 0.0;
    for i in 0..n {
        let r = y[i] - fitted[i];
        ssr += r * r;
    }
    let s2 = (ssr / (n as f64 - 2.0)).max(0.0);

    // Coefficient covariance: s^2 * (X'X)^-1.
    let xtx = design.transpose() * &design;
    let inv = xtx.try_inverse()?;
    let var_intercept = s2 * inv[(0, 0)];
    let var_slope = s2 * inv[(1, 1)];
    if !(var_intercept.is_finite() && var_slope.is_finite()) {
        return None;
    }

    Some(OlsLine {
        intercept: beta[0],
        slope: beta[1],
        intercept_se: var_intercept.max(0.0).sqrt(),
        slope_se: var_slope.max(0.0).sqrt(),
    })
}
