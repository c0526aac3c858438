use crate::{measurement::SensorKind, state::StateName};
use thiserror::Error;

/// Errors raised by the estimator and its collaborators.
///
/// Solver non-convergence is not an error: a degraded solve is
/// reported through [`crate::solver::SolveReport`] and the run continues.
#[derive(Debug, Error)]
pub enum Error {
    #[error("measurement source holds no measurements")]
    EmptySource,

    #[error("no {0} measurements available")]
    NoMeasurements(SensorKind),

    #[error("could not determine the {0} timestamp of the run")]
    NoTimestamp(&'static str),

    #[error("cannot resample an empty measurement sequence")]
    EmptyInput,

    #[error("state {name} already exists at t={timestamp}")]
    DuplicateState { name: StateName, timestamp: f64 },

    #[error("state {name} does not exist at t={timestamp}")]
    UnknownState { name: StateName, timestamp: f64 },

    #[error("dimension mismatch for {what}: expected {expected}, got {actual}")]
    DimensionMismatch {
        what: String,
        expected: usize,
        actual: usize,
    },

    #[error("non-finite value in {0}")]
    NonFinite(String),

    #[error("malformed factor: {0}")]
    MalformedFactor(String),

    #[error("covariance of {0} is not positive definite")]
    SingularCovariance(String),

    #[error("line {line}: {reason}")]
    Parse { line: usize, reason: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
