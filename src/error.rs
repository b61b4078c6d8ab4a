//! Error types for the ATMIP sampler.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while configuring, running, or resuming a sampling run.
///
/// Proposal rejections caused by non-finite densities are not errors: the
/// chain stepper treats them as ordinary rejections.
#[derive(Error, Debug)]
pub enum AtmipError {
    /// Malformed run parameters, reported before any sampling starts.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A flat vector or point does not match the declared variable layout.
    #[error("Dimension mismatch in {context}: expected {expected}, found {found}")]
    DimensionMismatch {
        context: String,
        expected: usize,
        found: usize,
    },

    /// Covariance matrix unusable for a multivariate normal proposal.
    #[error("Invalid covariance: {0}")]
    InvalidCovariance(String),

    /// Ensemble statistics could not be computed.
    #[error("Numerical error: {0}")]
    Numerical(String),

    /// Failure to persist or load stage state or traces.
    #[error("Storage error at {path}: {source}")]
    Storage {
        path: PathBuf,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The run was interrupted while sampling the given stage.
    #[error("Sampling cancelled during stage {stage}")]
    Cancelled { stage: usize },
}

impl AtmipError {
    pub(crate) fn storage<E>(path: impl Into<PathBuf>, source: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        AtmipError::Storage {
            path: path.into(),
            source: source.into(),
        }
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, AtmipError>;
