//! The `WorkerNode` contract.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::types::{ModuleDeploymentRequest, NodeDeploymentResult, NodeHealth, RollbackResult};

/// Shared handle to a worker node.
pub type NodeRef = Arc<dyn WorkerNode>;

/// A single deployable target.
///
/// Implementations suspend the caller during I/O and convert every
/// expected failure into a failed result object. A node is mutated only
/// by its own `deploy`/`rollback` calls.
#[async_trait]
pub trait WorkerNode: Send + Sync + fmt::Debug {
    /// Stable node identity.
    fn id(&self) -> &str;

    /// Current health as reported by the node.
    async fn health(&self) -> NodeHealth;

    /// Version of `module` currently installed, if any.
    async fn installed_version(&self, module: &str) -> Option<String>;

    /// Install `request.target_version` of `request.module_name`.
    async fn deploy(&self, request: &ModuleDeploymentRequest) -> NodeDeploymentResult;

    /// Revert `module` to the version installed before the last deploy.
    async fn rollback(&self, module: &str) -> RollbackResult;
}
