//! The `MetricsSource` contract.

use async_trait::async_trait;

use modswap_fleet::{Environment, NodeId};

use crate::error::MetricsResult;
use crate::types::{ClusterMetricsSnapshot, NodeMetrics};

/// Supplies point-in-time resource and error metrics.
///
/// Callers bound every call with their own cancellation token, so
/// implementations need not enforce a deadline themselves.
#[async_trait]
pub trait MetricsSource: Send + Sync {
    /// Cluster-wide averages for an environment.
    async fn snapshot(&self, environment: Environment) -> MetricsResult<ClusterMetricsSnapshot>;

    /// Per-node metrics for the given nodes. Nodes with no data are omitted.
    async fn node_metrics(&self, node_ids: &[NodeId]) -> MetricsResult<Vec<NodeMetrics>>;
}
