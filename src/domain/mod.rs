//! Domain types used throughout the calibration pipeline.
//!
//! This module defines:
//!
//! - input configuration (`RunConfig`, `GridRange`)
//! - observation inputs (`ReplicateKind`)
//! - per-pool parameters and stage artifacts (`PoolParams`, `StageTable`)
//! - fit outputs (`FitDiagnostic`, `Chain`, `PoolSummary`)

pub mod types;

pub use types::*;
