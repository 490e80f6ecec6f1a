//! Rollout error types.
//!
//! Expected failures (a node refusing a deploy, a gate rejecting a wave)
//! never show up here; they become a `DeploymentResult` status. These
//! errors are for misconfiguration and broken internal invariants.

use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum RolloutError {
    #[error("invalid strategy configuration: {0}")]
    InvalidConfig(String),

    #[error("rollout invariant violated: {0}")]
    Invariant(String),

    #[error("deployment result {0} is already finalized")]
    Finalized(Uuid),
}

pub type RolloutResult<T> = Result<T, RolloutError>;
