//! Pipeline error types.
//!
//! Request problems, lock timeouts and approval denials are reported as
//! a `DeploymentStatus` on the returned result. `PipelineError` covers
//! what is left: bad configuration and broken rollout invariants.

use thiserror::Error;

use modswap_fleet::{Environment, FleetError};
use modswap_rollout::RolloutError;

/// Result type alias for pipeline operations.
pub type PipelineResult<T> = Result<T, PipelineError>;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error(transparent)]
    Rollout(#[from] RolloutError),

    #[error(transparent)]
    Fleet(#[from] FleetError),
}

/// Why a request was refused before any lock was taken.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("module name is empty")]
    EmptyModuleName,

    #[error("module name {0:?} may only contain ASCII letters, digits, '.', '_' and '-'")]
    InvalidModuleName(String),

    #[error("target version {version:?} is not a semantic version: {reason}")]
    InvalidVersion { version: String, reason: String },

    #[error("no fleet registered for {0}")]
    UnknownFleet(Environment),

    #[error("fleet {0} has no nodes")]
    EmptyFleet(String),

    #[error("fleet {fleet} serves {actual}, request targets {requested}")]
    EnvironmentMismatch {
        fleet: String,
        actual: Environment,
        requested: Environment,
    },

    #[error("no strategy registered for {0}")]
    UnknownStrategy(String),
}
