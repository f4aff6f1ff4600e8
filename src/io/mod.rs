//! File-based batch I/O: observation ingest and flat-text exports.

pub mod export;
pub mod ingest;

pub use export::*;
pub use ingest::*;
