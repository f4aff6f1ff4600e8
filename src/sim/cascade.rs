//! Cascade system assembly.
//!
//! A chain of k pools follows the forced linear ODE
//!
//! ```text
//! dC/dt = f(t) + M C
//! ```
//!
//! where `M` is lower-bidiagonal: `M[i][i] = -k_i` (own decay) and
//! `M[i+1][i] = k_i * a_i` (the share of pool i's decay captured by pool
//! i+1). The forcing `f_i(t)` is front-loaded and piecewise linear: it starts
//! at `input_magnitude_i`, ramps to zero at `input_duration_i`, and stays
//! zero afterwards.

use nalgebra::{DMatrix, DVector};

use crate::domain::PoolParams;

/// Build the k x k cascade matrix for an ordered parameter chain.
pub fn cascade_matrix(chain: &[PoolParams]) -> DMatrix<f64> {
    let k = chain.len();
    let mut m = DMatrix::<f64>::zeros(k, k);
    for (i, p) in chain.iter().enumerate() {
        m[(i, i)] = -p.decay_rate;
        if i + 1 < k {
            m[(i + 1, i)] = p.decay_rate * p.transfer_fraction;
        }
    }
    m
}

/// A ready-to-integrate cascade: matrix plus forcing arrays.
#[derive(Debug, Clone)]
pub struct CascadeSystem {
    matrix: DMatrix<f64>,
    magnitudes: Vec<f64>,
    durations: Vec<f64>,
}

impl CascadeSystem {
    pub fn from_chain(chain: &[PoolParams]) -> Self {
        Self {
            matrix: cascade_matrix(chain),
            magnitudes: chain.iter().map(|p| p.input_magnitude).collect(),
            durations: chain.iter().map(|p| p.input_duration).collect(),
        }
    }

    pub fn dim(&self) -> usize {
        self.magnitudes.len()
    }

    /// The system is linear, so the Jacobian is the cascade matrix itself.
    pub fn jacobian(&self) -> &DMatrix<f64> {
        &self.matrix
    }

    /// Initial state: one concentration per pool.
    pub fn initial_state(chain: &[PoolParams]) -> DVector<f64> {
        DVector::from_iterator(chain.len(), chain.iter().map(|p| p.initial_concentration))
    }

    /// Front-loaded input forcing at time `t`.
    pub fn forcing(&self, t: f64, out: &mut DVector<f64>) {
        for i in 0..self.dim() {
            let d = self.durations[i];
            out[i] = if t < d {
                self.magnitudes[i] * (1.0 - t / d)
            } else {
                0.0
            };
        }
    }

    /// Evaluate `dC/dt = f(t) + M C` into `dydt`.
    pub fn rhs(&self, t: f64, y: &DVector<f64>, dydt: &mut DVector<f64>) {
        self.forcing(t, dydt);
        dydt.gemv(1.0, &self.matrix, y, 1.0);
    }
}
