//! Direct strategy: every node at once.

use async_trait::async_trait;
use tracing::info;

use modswap_fleet::{Fleet, ModuleDeploymentRequest, StrategyKind};

use crate::error::RolloutResult;
use crate::executor::{finish, node_ids, roll_back_and_finalize, run_wave, WaveOutcome};
use crate::progress::ProgressEvent;
use crate::result::{DeploymentResult, DeploymentStatus};
use crate::strategy::{DeploymentStrategy, StrategyContext};

/// Deploys to the whole fleet in parallel. Any node failure rolls back
/// every node that did deploy.
#[derive(Debug, Default, Clone)]
pub struct DirectStrategy;

impl DirectStrategy {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl DeploymentStrategy for DirectStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Direct
    }

    async fn execute(
        &self,
        request: &ModuleDeploymentRequest,
        fleet: &Fleet,
        ctx: &StrategyContext,
    ) -> RolloutResult<DeploymentResult> {
        let mut result = DeploymentResult::begin(ctx.deployment_id, request, self.kind());
        let nodes = fleet.nodes().await;
        ctx.emit(ProgressEvent::Started {
            strategy: self.kind(),
            nodes: nodes.len(),
        });

        if ctx.cancel.is_cancelled() {
            return finish(result, DeploymentStatus::Cancelled, "cancelled before dispatch", ctx);
        }

        info!(
            deployment = %ctx.deployment_id,
            module = %request.module_name,
            version = %request.target_version,
            nodes = nodes.len(),
            "direct deploy"
        );
        ctx.emit(ProgressEvent::WaveStarted {
            wave: 1,
            nodes: node_ids(&nodes),
            target_count: nodes.len(),
        });

        let WaveOutcome {
            deployed,
            failed,
            results,
        } = run_wave(&nodes, request).await;
        result.record_wave(None, nodes.len(), results)?;
        ctx.emit(ProgressEvent::WaveCompleted {
            wave: 1,
            succeeded: deployed.len(),
            failed: failed.len(),
        });

        if !failed.is_empty() {
            let reason = format!("deploy failed on {}", failed.join(", "));
            return roll_back_and_finalize(result, &deployed, request, ctx, reason, false).await;
        }
        if ctx.cancel.is_cancelled() {
            let reason = "cancelled after dispatch".to_string();
            return roll_back_and_finalize(result, &deployed, request, ctx, reason, true).await;
        }

        let message = format!("{} nodes on {}", deployed.len(), request.target_version);
        finish(result, DeploymentStatus::Succeeded, message, ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use modswap_fleet::{Environment, WorkerNode};

    use crate::result::RollbackOutcome;
    use crate::testing::{context, fleet_of, request, sim_nodes};

    #[tokio::test]
    async fn deploys_every_node() {
        let nodes = sim_nodes(3);
        let fleet = fleet_of(&nodes, Environment::Dev);

        let result = DirectStrategy::new()
            .execute(&request(Environment::Dev), &fleet, &context())
            .await
            .unwrap();

        assert_eq!(result.status(), DeploymentStatus::Succeeded);
        assert!(result.success());
        assert_eq!(result.deployed_node_ids().len(), 3);
        assert_eq!(result.rollback_outcome(), RollbackOutcome::NotNeeded);
        for node in &nodes {
            assert_eq!(node.installed_version("payments").await.as_deref(), Some("2.0.0"));
        }
    }

    #[tokio::test]
    async fn one_failure_rolls_back_the_rest() {
        let nodes = sim_nodes(3);
        nodes[2].set_deploy_failure(Some("out of memory")).await;
        let fleet = fleet_of(&nodes, Environment::Dev);

        let result = DirectStrategy::new()
            .execute(&request(Environment::Dev), &fleet, &context())
            .await
            .unwrap();

        assert_eq!(result.status(), DeploymentStatus::RolledBack);
        assert!(!result.success());
        assert_eq!(result.rolled_back_node_ids(), vec!["node-01", "node-02"]);
        assert_eq!(nodes[2].rollback_count(), 0);
        for node in &nodes {
            assert_eq!(node.installed_version("payments").await.as_deref(), Some("1.0.0"));
        }
    }

    #[tokio::test]
    async fn every_node_failing_is_a_plain_failure() {
        let nodes = sim_nodes(2);
        for node in &nodes {
            node.set_deploy_failure(Some("refused")).await;
        }
        let fleet = fleet_of(&nodes, Environment::Dev);

        let result = DirectStrategy::new()
            .execute(&request(Environment::Dev), &fleet, &context())
            .await
            .unwrap();

        assert_eq!(result.status(), DeploymentStatus::Failed);
        assert!(!result.rolled_back());
    }

    #[tokio::test]
    async fn cancelled_before_dispatch_touches_nothing() {
        let nodes = sim_nodes(2);
        let fleet = fleet_of(&nodes, Environment::Dev);
        let ctx = context();
        ctx.cancel.cancel();

        let result = DirectStrategy::new()
            .execute(&request(Environment::Dev), &fleet, &ctx)
            .await
            .unwrap();

        assert_eq!(result.status(), DeploymentStatus::Cancelled);
        assert_eq!(nodes[0].deploy_count(), 0);
    }
}
