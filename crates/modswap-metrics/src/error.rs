//! Metrics error types.

use thiserror::Error;

/// Errors returned by a `MetricsSource`.
#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("metrics source unavailable: {0}")]
    Unavailable(String),

    #[error("no metrics reported for nodes: {0:?}")]
    NoSamples(Vec<String>),

    #[error("metrics request cancelled")]
    Cancelled,

    #[error("metrics request timed out")]
    Timeout,
}

pub type MetricsResult<T> = Result<T, MetricsError>;
