use serde::{Deserialize, Serialize};

pub mod estimation;

pub use estimation::{validate, TmaxEstimation};

/// Represents the status of an estimation run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    /// Estimation is starting up
    Starting,
    /// The optimizer met its gradient or objective tolerance
    Converged,
    /// Stopped after the maximum number of optimizer iterations
    MaxIterations,
    /// The optimizer is still running
    InProgress,
    /// Stopped early, e.g. when the line search could not decrease the objective
    Stopped(String),
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Status::Starting => write!(f, "Starting"),
            Status::Converged => write!(f, "Converged"),
            Status::MaxIterations => write!(f, "Maximum iterations reached"),
            Status::InProgress => write!(f, "In progress"),
            Status::Stopped(msg) => write!(f, "Stopped: {}", msg),
        }
    }
}
