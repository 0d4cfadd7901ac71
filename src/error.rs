//! Error types for the unfolding core.

use polars::prelude::PolarsError;
use thiserror::Error;

/// Unfolding error type.
#[derive(Error, Debug)]
pub enum UnfoldError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Table read/write error
    #[error("table error: {0}")]
    Polars(#[from] PolarsError),

    /// Fatal precondition violation, raised before any training starts.
    #[error("precondition violated: {0}")]
    Precondition(String),

    /// A requested variable is not present in a sample.
    #[error("sample '{sample}' has no variable '{variable}'")]
    MissingVariable { sample: String, variable: String },

    /// A name did not resolve against a closed set of choices.
    #[error("unknown {kind} '{name}' (expected one of: {expected})")]
    Unknown {
        kind: &'static str,
        name: String,
        expected: String,
    },

    /// Iteration lookup outside the recorded history.
    #[error("iteration {index} out of range: history holds {len} records")]
    IterationOutOfRange { index: usize, len: usize },

    /// Hard failure reported by a classifier.
    #[error("training failed: {0}")]
    Training(String),

    /// A weight vector picked up a NaN or infinity.
    #[error("non-finite weights in {0}")]
    NonFinite(String),

    /// A persisted weight array does not line up with its sample.
    #[error("persisted weights for sample '{sample}' have {found} entries, expected {expected}")]
    WeightMismatch {
        sample: String,
        expected: usize,
        found: usize,
    },

    /// Trials were requested but none of them finished.
    #[error("all {failed} bootstrap trials failed")]
    BootstrapFailed { failed: usize },

    /// Failure inside the iteration loop, tagged with where it happened.
    #[error("iteration {iteration}, step {step}: {cause}")]
    Step {
        iteration: usize,
        step: u8,
        cause: Box<UnfoldError>,
    },
}

impl UnfoldError {
    pub(crate) fn at_step(self, iteration: usize, step: u8) -> Self {
        UnfoldError::Step {
            iteration,
            step,
            cause: Box::new(self),
        }
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, UnfoldError>;
