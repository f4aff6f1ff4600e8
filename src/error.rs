//! Run-level error type.
//!
//! Every fallible pipeline step returns an [`AppError`], which pairs a
//! user-facing message with the exit code `main` reports:
//!
//! - 2: configuration or input problems (bad flags, CSV schema, cache paths)
//! - 3: data problems (too few observations, no surviving candidates,
//!   failed best-fit projection)
//! - 4: internal invariant violations (dangling parent keys, row width
//!   mismatches)
//!
//! Per-candidate integration failures are not this type. They live in
//! `sim::sdirk::IntegrationFailure` and drop only the failing candidate,
//! never the run.

#[derive(Debug, Clone)]
pub struct AppError {
    exit_code: u8,
    message: String,
}

impl AppError {
    pub fn new(exit_code: u8, message: impl Into<String>) -> Self {
        Self {
            exit_code,
            message: message.into(),
        }
    }

    pub fn exit_code(&self) -> u8 {
        self.exit_code
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for AppError {}
