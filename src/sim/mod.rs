//! Forced linear-cascade simulation.
//!
//! Responsibilities:
//!
//! - build the cascade matrix and forcing terms from a parameter chain
//! - integrate the stiff linear ODE on an arbitrary ascending time grid

pub mod cascade;
pub mod sdirk;

pub use cascade::*;
pub use sdirk::*;
