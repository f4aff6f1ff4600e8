//! Staged grid-search calibration.
//!
//! Responsibilities:
//!
//! - score simulated trajectories against observations (`scorer`)
//! - build per-stage parameter grids (`grid`)
//! - run one calibration stage: evaluate, filter, subsample (`stage`)
//! - join stage tables into chains and pick the best fit (`chain`)

pub mod chain;
pub mod grid;
pub mod scorer;
pub mod stage;

pub use chain::*;
pub use grid::*;
pub use scorer::*;
pub use stage::*;
