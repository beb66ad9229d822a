use std::path::PathBuf;

use thiserror::Error;

/// Errors raised by the estimation workflow
///
/// Library functions return [eyre::Result]; these variants are wrapped in the report and can be
/// recovered with `report.downcast_ref::<TmaxError>()`.
#[derive(Debug, Error)]
pub enum TmaxError {
    /// Inconsistent input data or settings, always raised before any forward solve
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A file could not be opened, created or read
    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A file was readable but its contents were not what we expected
    #[error("Malformed data in {path:?}: {message}")]
    Format { path: PathBuf, message: String },

    /// A checkpoint does not contain the record for a timepoint
    #[error("Checkpoint {path:?} has no record named {name}")]
    MissingRecord { path: PathBuf, name: String },

    #[error("Invalid geometry: {0}")]
    InvalidGeometry(String),

    /// The nonlinear forward solve did not converge
    #[error(
        "Forward solve did not converge at timepoint {timepoint} after {iterations} iterations (residual: {residual:.3e})"
    )]
    Convergence {
        timepoint: usize,
        iterations: usize,
        residual: f64,
    },

    #[error("Optimizer error: {0}")]
    Optimizer(String),
}

impl TmaxError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        TmaxError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn format(path: impl Into<PathBuf>, message: impl ToString) -> Self {
        TmaxError::Format {
            path: path.into(),
            message: message.to_string(),
        }
    }
}
