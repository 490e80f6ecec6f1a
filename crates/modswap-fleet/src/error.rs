//! Fleet error types.

use thiserror::Error;

use crate::types::{Environment, NodeId};

/// Errors raised by fleet topology operations.
#[derive(Debug, Error)]
pub enum FleetError {
    #[error("fleet topology for {0} is locked by an active deployment")]
    TopologyLocked(Environment),

    #[error("node already in fleet: {0}")]
    DuplicateNode(NodeId),

    #[error("node not found: {0}")]
    NodeNotFound(NodeId),
}

pub type FleetResult<T> = Result<T, FleetError>;
