//! Wave execution shared by every strategy.
//!
//! Node calls inside a wave fan out with `join_all` and are always joined
//! to completion, cancelled or not, so the recorded results match what
//! the nodes actually did.

use std::time::Duration;

use futures::future::join_all;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use modswap_fleet::{
    ModuleDeploymentRequest, NodeDeploymentResult, NodeHealth, NodeId, NodeRef, RollbackResult,
};

use crate::error::RolloutResult;
use crate::progress::ProgressEvent;
use crate::result::{DeploymentResult, DeploymentStatus};
use crate::strategy::StrategyContext;

/// What one wave did.
#[derive(Debug)]
pub struct WaveOutcome {
    /// Nodes whose deploy succeeded, in dispatch order.
    pub deployed: Vec<NodeRef>,
    /// Nodes whose deploy failed.
    pub failed: Vec<NodeId>,
    /// Every node result, in dispatch order.
    pub results: Vec<NodeDeploymentResult>,
}

/// Deploy `request` to every node in parallel and wait for all of them.
pub async fn run_wave(nodes: &[NodeRef], request: &ModuleDeploymentRequest) -> WaveOutcome {
    let results = join_all(nodes.iter().map(|node| node.deploy(request))).await;

    let mut deployed = Vec::new();
    let mut failed = Vec::new();
    for (node, result) in nodes.iter().zip(&results) {
        if result.success {
            deployed.push(node.clone());
        } else {
            warn!(node = %result.node_id, message = %result.message, "node deploy failed");
            failed.push(result.node_id.clone());
        }
    }

    WaveOutcome {
        deployed,
        failed,
        results,
    }
}

/// Roll `module` back on every node in parallel.
pub async fn rollback_nodes(nodes: &[NodeRef], module: &str) -> Vec<RollbackResult> {
    let results = join_all(nodes.iter().map(|node| node.rollback(module))).await;
    for r in results.iter().filter(|r| !r.success) {
        error!(node = %r.node_id, %module, message = %r.message, "node rollback failed");
    }
    results
}

/// Result of waiting for a node set to report healthy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthCheck {
    Healthy,
    Unhealthy(Vec<NodeId>),
    Cancelled,
}

/// Poll node health until every node is `Healthy` or `timeout` runs out.
///
/// A zero timeout checks exactly once.
pub async fn wait_healthy(
    nodes: &[NodeRef],
    timeout: Duration,
    poll_interval: Duration,
    cancel: &CancellationToken,
) -> HealthCheck {
    let deadline = Instant::now() + timeout;
    loop {
        let polled = tokio::select! {
            _ = cancel.cancelled() => return HealthCheck::Cancelled,
            res = tokio::time::timeout_at(
                deadline.max(Instant::now() + poll_interval),
                join_all(nodes.iter().map(|node| node.health())),
            ) => res,
        };

        let unhealthy: Vec<NodeId> = match polled {
            Ok(healths) => nodes
                .iter()
                .zip(healths)
                .filter(|(_, h)| *h != NodeHealth::Healthy)
                .map(|(node, _)| node.id().to_string())
                .collect(),
            Err(_) => nodes.iter().map(|node| node.id().to_string()).collect(),
        };
        if unhealthy.is_empty() {
            return HealthCheck::Healthy;
        }

        let next = Instant::now() + poll_interval;
        if next > deadline {
            return HealthCheck::Unhealthy(unhealthy);
        }
        debug!(unhealthy = unhealthy.len(), "waiting for nodes to report healthy");
        tokio::select! {
            _ = cancel.cancelled() => return HealthCheck::Cancelled,
            _ = tokio::time::sleep_until(next) => {}
        }
    }
}

/// Finalize a result and publish the terminal event.
pub(crate) fn finish(
    result: DeploymentResult,
    status: DeploymentStatus,
    message: impl Into<String>,
    ctx: &StrategyContext,
) -> RolloutResult<DeploymentResult> {
    let message = message.into();
    match status {
        DeploymentStatus::Succeeded => {
            info!(deployment = %ctx.deployment_id, %message, "deployment succeeded")
        }
        _ => warn!(deployment = %ctx.deployment_id, ?status, %message, "deployment did not succeed"),
    }
    ctx.emit(ProgressEvent::Finished { status });
    result.finalize(status, Some(message))
}

/// Roll back every node in `deployed` and finalize with the matching status.
///
/// Nothing deployed means nothing to revert: `Failed` (or `Cancelled`).
/// A clean rollback yields `RolledBack` (or `Cancelled`). Any node that
/// could not be reverted yields `RollbackFailed`.
pub(crate) async fn roll_back_and_finalize(
    mut result: DeploymentResult,
    deployed: &[NodeRef],
    request: &ModuleDeploymentRequest,
    ctx: &StrategyContext,
    reason: String,
    cancelled: bool,
) -> RolloutResult<DeploymentResult> {
    if deployed.is_empty() {
        let status = if cancelled {
            DeploymentStatus::Cancelled
        } else {
            DeploymentStatus::Failed
        };
        return finish(result, status, reason, ctx);
    }

    let ids: Vec<NodeId> = deployed.iter().map(|n| n.id().to_string()).collect();
    warn!(
        deployment = %ctx.deployment_id,
        nodes = ids.len(),
        %reason,
        "rolling back deployed nodes"
    );
    ctx.emit(ProgressEvent::RollbackStarted { nodes: ids });

    let results = rollback_nodes(deployed, &request.module_name).await;
    let stuck: Vec<NodeId> = results
        .iter()
        .filter(|r| !r.success)
        .map(|r| r.node_id.clone())
        .collect();
    let outcome = result.record_rollback(results)?;

    if !outcome.is_clean() {
        let message = format!("{reason}; rollback failed on {}", stuck.join(", "));
        return finish(result, DeploymentStatus::RollbackFailed, message, ctx);
    }
    let status = if cancelled {
        DeploymentStatus::Cancelled
    } else {
        DeploymentStatus::RolledBack
    };
    finish(result, status, reason, ctx)
}

pub(crate) fn node_ids(nodes: &[NodeRef]) -> Vec<NodeId> {
    nodes.iter().map(|n| n.id().to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use modswap_fleet::{Environment, SimulatedNode, StrategyKind, WorkerNode};
    use uuid::Uuid;

    use crate::testing::{context, refs, request, sim_nodes};

    #[tokio::test]
    async fn wave_collects_every_result() {
        let nodes = sim_nodes(3);
        nodes[1].set_deploy_failure(Some("refused")).await;

        let out = run_wave(&refs(&nodes), &request(Environment::Dev)).await;

        assert_eq!(out.results.len(), 3);
        assert_eq!(out.failed, vec!["node-02"]);
        assert_eq!(node_ids(&out.deployed), vec!["node-01", "node-03"]);
    }

    #[tokio::test(start_paused = true)]
    async fn wave_runs_nodes_in_parallel() {
        let nodes: Vec<Arc<SimulatedNode>> = (1..=4)
            .map(|i| Arc::new(SimulatedNode::new(&format!("n{i}")).with_latency(Duration::from_secs(2))))
            .collect();
        let start = Instant::now();
        let out = run_wave(&refs(&nodes), &request(Environment::Dev)).await;
        assert_eq!(out.deployed.len(), 4);
        assert_eq!(start.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn unhealthy_nodes_are_reported_after_timeout() {
        let nodes = sim_nodes(2);
        nodes[1].set_health(NodeHealth::Degraded).await;

        let check = wait_healthy(
            &refs(&nodes),
            Duration::from_secs(5),
            Duration::from_secs(1),
            &CancellationToken::new(),
        )
        .await;
        assert_eq!(check, HealthCheck::Unhealthy(vec!["node-02".to_string()]));
    }

    #[tokio::test(start_paused = true)]
    async fn health_recovering_within_timeout_passes() {
        let nodes = sim_nodes(1);
        nodes[0].set_health(NodeHealth::Unhealthy).await;
        let node = nodes[0].clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(2500)).await;
            node.set_health(NodeHealth::Healthy).await;
        });

        let check = wait_healthy(
            &refs(&nodes),
            Duration::from_secs(5),
            Duration::from_secs(1),
            &CancellationToken::new(),
        )
        .await;
        assert_eq!(check, HealthCheck::Healthy);
    }

    #[tokio::test]
    async fn rollback_failure_yields_rollback_failed() {
        let nodes = sim_nodes(2);
        nodes[0].set_rollback_failure(Some("disk full")).await;
        let req = request(Environment::Dev);
        let out = run_wave(&refs(&nodes), &req).await;

        let ctx = context();
        let mut result = DeploymentResult::begin(Uuid::new_v4(), &req, StrategyKind::Direct);
        result.record_wave(None, 2, out.results).unwrap();
        let result = roll_back_and_finalize(result, &out.deployed, &req, &ctx, "boom".into(), false)
            .await
            .unwrap();

        assert_eq!(result.status(), DeploymentStatus::RollbackFailed);
        assert_eq!(result.rolled_back_node_ids(), vec!["node-02"]);
        assert!(result.message().unwrap().contains("node-01"));
        assert_eq!(nodes[1].installed_version("payments").await.as_deref(), Some("1.0.0"));
    }

    #[tokio::test]
    async fn nothing_deployed_is_plain_failure() {
        let req = request(Environment::Dev);
        let result = DeploymentResult::begin(Uuid::new_v4(), &req, StrategyKind::Direct);
        let result = roll_back_and_finalize(result, &[], &req, &context(), "boom".into(), false)
            .await
            .unwrap();
        assert_eq!(result.status(), DeploymentStatus::Failed);
        assert!(!result.rolled_back());
    }
}
