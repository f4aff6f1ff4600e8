//! Mathematical utilities: grid generation and simple-regression OLS.

pub mod grid;
pub mod ols;

pub use grid::*;
pub use ols::*;
