//! Fixtures shared by the strategy tests.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use modswap_fleet::{Environment, Fleet, ModuleDeploymentRequest, NodeRef, SimulatedNode};
use modswap_metrics::{ClusterMetricsSnapshot, InMemoryMetricsSource};

use crate::strategy::StrategyContext;

pub fn sim_nodes(count: usize) -> Vec<Arc<SimulatedNode>> {
    (1..=count)
        .map(|i| Arc::new(SimulatedNode::new(&format!("node-{i:02}")).with_version("payments", "1.0.0")))
        .collect()
}

pub fn refs(nodes: &[Arc<SimulatedNode>]) -> Vec<NodeRef> {
    nodes.iter().map(|n| n.clone() as NodeRef).collect()
}

pub fn fleet_of(nodes: &[Arc<SimulatedNode>], environment: Environment) -> Fleet {
    Fleet::new("test", environment, refs(nodes)).unwrap()
}

pub fn request(environment: Environment) -> ModuleDeploymentRequest {
    ModuleDeploymentRequest::new("payments", "2.0.0", environment)
}

pub fn baseline() -> ClusterMetricsSnapshot {
    ClusterMetricsSnapshot::new(40.0, 50.0, 100.0, 1.0)
}

/// A metrics source that reports the baseline everywhere.
pub fn steady_metrics() -> Arc<InMemoryMetricsSource> {
    Arc::new(InMemoryMetricsSource::uniform(baseline()))
}

pub fn context() -> StrategyContext {
    context_with(steady_metrics())
}

pub fn context_with(metrics: Arc<InMemoryMetricsSource>) -> StrategyContext {
    StrategyContext::new(Uuid::new_v4(), metrics, CancellationToken::new())
}
