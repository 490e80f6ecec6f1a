//! Blue-green strategy.
//!
//! The fleet is split in two halves by position: the first
//! `ceil(n / 2)` nodes form the blue slot, the rest the green slot. A
//! `TrafficRouter` holds, per environment and module, which slot is live.
//!
//! ```text
//!   live ──► [ blue: node-01 node-02 ]
//!            [ green: node-03 node-04 ] ◄── deploy, health check
//!
//!   switch:  live ──► green      revert: live ──► blue
//! ```
//!
//! Rollback is a pointer revert. Nodes in the idle slot keep whatever
//! they were given.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{info, warn};

use modswap_fleet::{Environment, Fleet, ModuleDeploymentRequest, NodeRef, StrategyKind};

use crate::error::RolloutResult;
use crate::executor::{finish, node_ids, run_wave, wait_healthy, HealthCheck, WaveOutcome};
use crate::progress::ProgressEvent;
use crate::result::{DeploymentResult, DeploymentStatus};
use crate::strategy::{BlueGreenConfig, DeploymentStrategy, StrategyContext};

/// One half of a blue-green fleet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Slot {
    Blue,
    Green,
}

impl Slot {
    pub fn other(self) -> Slot {
        match self {
            Slot::Blue => Slot::Green,
            Slot::Green => Slot::Blue,
        }
    }

    /// Nodes belonging to this slot, in fleet order.
    pub fn members(self, nodes: &[NodeRef]) -> Vec<NodeRef> {
        let split = nodes.len().div_ceil(2);
        match self {
            Slot::Blue => nodes[..split].to_vec(),
            Slot::Green => nodes[split..].to_vec(),
        }
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Slot::Blue => write!(f, "blue"),
            Slot::Green => write!(f, "green"),
        }
    }
}

/// Holds the live slot per `(environment, module)`.
///
/// Every switch bumps a generation counter, wrapping at `u64::MAX`.
#[derive(Debug, Default)]
pub struct TrafficRouter {
    live: RwLock<HashMap<(Environment, String), Slot>>,
    generation: AtomicU64,
}

impl TrafficRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Live slot for a module. Blue until the first switch.
    pub async fn live_slot(&self, environment: Environment, module: &str) -> Slot {
        self.live
            .read()
            .await
            .get(&(environment, module.to_string()))
            .copied()
            .unwrap_or(Slot::Blue)
    }

    /// Point traffic at `slot` and return the new generation.
    pub async fn switch_to(&self, environment: Environment, module: &str, slot: Slot) -> u64 {
        let mut live = self.live.write().await;
        live.insert((environment, module.to_string()), slot);
        let generation = self.bump();
        info!(%environment, %module, %slot, generation, "traffic switched");
        generation
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    fn bump(&self) -> u64 {
        let previous = self
            .generation
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |g| Some(g.wrapping_add(1)))
            .unwrap_or_else(|g| g);
        previous.wrapping_add(1)
    }
}

/// Deploys to the idle slot, checks it, then flips traffic.
#[derive(Debug, Clone)]
pub struct BlueGreenStrategy {
    config: BlueGreenConfig,
    router: Arc<TrafficRouter>,
}

impl BlueGreenStrategy {
    pub fn new(config: BlueGreenConfig, router: Arc<TrafficRouter>) -> Self {
        Self { config, router }
    }

    pub fn router(&self) -> &Arc<TrafficRouter> {
        &self.router
    }

    async fn revert(
        &self,
        mut result: DeploymentResult,
        request: &ModuleDeploymentRequest,
        live: Slot,
        ctx: &StrategyContext,
        reason: String,
        cancelled: bool,
    ) -> RolloutResult<DeploymentResult> {
        warn!(deployment = %ctx.deployment_id, to = %live, %reason, "reverting traffic");
        let generation = self
            .router
            .switch_to(request.environment, &request.module_name, live)
            .await;
        ctx.emit(ProgressEvent::TrafficSwitched { to: live, generation });
        result.record_pointer_revert()?;
        let status = if cancelled {
            DeploymentStatus::Cancelled
        } else {
            DeploymentStatus::RolledBack
        };
        finish(result, status, reason, ctx)
    }
}

#[async_trait]
impl DeploymentStrategy for BlueGreenStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::BlueGreen
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

        let live = self
            .router
            .live_slot(request.environment, &request.module_name)
            .await;
        let idle = live.other();
        let targets = idle.members(&nodes);
        if targets.is_empty() {
            return finish(
                result,
                DeploymentStatus::Failed,
                format!("{idle} slot is empty; blue-green needs at least two nodes"),
                ctx,
            );
        }
        if ctx.cancel.is_cancelled() {
            return finish(result, DeploymentStatus::Cancelled, "cancelled before dispatch", ctx);
        }

        info!(
            deployment = %ctx.deployment_id,
            %live,
            %idle,
            nodes = targets.len(),
            "deploying to idle slot"
        );
        ctx.emit(ProgressEvent::WaveStarted {
            wave: 1,
            nodes: node_ids(&targets),
            target_count: targets.len(),
        });

        let WaveOutcome {
            deployed,
            failed,
            results,
        } = run_wave(&targets, request).await;
        result.record_wave(None, targets.len(), results)?;
        ctx.emit(ProgressEvent::WaveCompleted {
            wave: 1,
            succeeded: deployed.len(),
            failed: failed.len(),
        });

        if !failed.is_empty() {
            let message = format!(
                "{idle} slot deploy failed on {}; traffic stays on {live}",
                failed.join(", ")
            );
            return finish(result, DeploymentStatus::Failed, message, ctx);
        }
        if ctx.cancel.is_cancelled() {
            let message = format!("cancelled before switch; traffic stays on {live}");
            return finish(result, DeploymentStatus::Cancelled, message, ctx);
        }

        match wait_healthy(
            &deployed,
            self.config.health_timeout,
            self.config.health_poll_interval,
            &ctx.cancel,
        )
        .await
        {
            HealthCheck::Healthy => {}
            HealthCheck::Unhealthy(ids) => {
                let message = format!(
                    "{idle} slot unhealthy: {}; traffic stays on {live}",
                    ids.join(", ")
                );
                return finish(result, DeploymentStatus::Failed, message, ctx);
            }
            HealthCheck::Cancelled => {
                let message = format!("cancelled before switch; traffic stays on {live}");
                return finish(result, DeploymentStatus::Cancelled, message, ctx);
            }
        }

        let generation = self
            .router
            .switch_to(request.environment, &request.module_name, idle)
            .await;
        ctx.emit(ProgressEvent::TrafficSwitched { to: idle, generation });

        if !self.config.soak.is_zero() {
            tokio::select! {
                _ = ctx.cancel.cancelled() => {
                    let reason = "cancelled during soak".to_string();
                    return self.revert(result, request, live, ctx, reason, true).await;
                }
                _ = tokio::time::sleep(self.config.soak) => {}
            }
        }

        match wait_healthy(
            &deployed,
            std::time::Duration::ZERO,
            self.config.health_poll_interval,
            &ctx.cancel,
        )
        .await
        {
            HealthCheck::Healthy => {}
            HealthCheck::Unhealthy(ids) => {
                let reason = format!("{idle} slot unhealthy after switch: {}", ids.join(", "));
                return self.revert(result, request, live, ctx, reason, false).await;
            }
            HealthCheck::Cancelled => {
                let reason = "cancelled after switch".to_string();
                return self.revert(result, request, live, ctx, reason, true).await;
            }
        }

        let message = format!("traffic on {idle} ({} nodes) at {}", deployed.len(), request.target_version);
        finish(result, DeploymentStatus::Succeeded, message, ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use modswap_fleet::{NodeHealth, WorkerNode};

    use crate::result::RollbackOutcome;
    use crate::testing::{context, fleet_of, refs, request, sim_nodes};

    fn config() -> BlueGreenConfig {
        BlueGreenConfig {
            health_timeout: Duration::from_secs(3),
            health_poll_interval: Duration::from_secs(1),
            soak: Duration::from_secs(5),
        }
    }

    #[test]
    fn slots_split_the_fleet_in_half() {
        let nodes = refs(&sim_nodes(5));
        let blue = node_ids(&Slot::Blue.members(&nodes));
        let green = node_ids(&Slot::Green.members(&nodes));
        assert_eq!(blue, vec!["node-01", "node-02", "node-03"]);
        assert_eq!(green, vec!["node-04", "node-05"]);
        assert_eq!(Slot::Blue.other(), Slot::Green);
    }

    #[tokio::test]
    async fn generation_counter_wraps() {
        let router = TrafficRouter {
            live: RwLock::default(),
            generation: AtomicU64::new(u64::MAX),
        };
        let generation = router.switch_to(Environment::Staging, "payments", Slot::Green).await;
        assert_eq!(generation, 0);
        assert_eq!(router.generation(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn deploys_idle_slot_and_switches() {
        let nodes = sim_nodes(4);
        let fleet = fleet_of(&nodes, Environment::Staging);
        let router = Arc::new(TrafficRouter::new());
        let strategy = BlueGreenStrategy::new(config(), router.clone());

        let result = strategy
            .execute(&request(Environment::Staging), &fleet, &context())
            .await
            .unwrap();

        assert_eq!(result.status(), DeploymentStatus::Succeeded);
        assert_eq!(result.deployed_node_ids(), vec!["node-03", "node-04"]);
        assert_eq!(router.live_slot(Environment::Staging, "payments").await, Slot::Green);
        assert_eq!(nodes[0].deploy_count(), 0);

        // The next release goes to blue.
        let mut next = request(Environment::Staging);
        next.target_version = "3.0.0".into();
        let result = strategy.execute(&next, &fleet, &context()).await.unwrap();
        assert_eq!(result.deployed_node_ids(), vec!["node-01", "node-02"]);
        assert_eq!(router.live_slot(Environment::Staging, "payments").await, Slot::Blue);
        assert_eq!(router.generation(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_idle_deploy_keeps_traffic() {
        let nodes = sim_nodes(4);
        nodes[3].set_deploy_failure(Some("refused")).await;
        let fleet = fleet_of(&nodes, Environment::Staging);
        let router = Arc::new(TrafficRouter::new());

        let result = BlueGreenStrategy::new(config(), router.clone())
            .execute(&request(Environment::Staging), &fleet, &context())
            .await
            .unwrap();

        assert_eq!(result.status(), DeploymentStatus::Failed);
        assert!(!result.rolled_back());
        assert_eq!(nodes[2].rollback_count(), 0);
        assert_eq!(router.live_slot(Environment::Staging, "payments").await, Slot::Blue);
        assert_eq!(router.generation(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unhealthy_after_switch_reverts_pointer() {
        let nodes = sim_nodes(4);
        let fleet = fleet_of(&nodes, Environment::Staging);
        let router = Arc::new(TrafficRouter::new());

        let degrade = nodes[2].clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            degrade.set_health(NodeHealth::Unhealthy).await;
        });

        let result = BlueGreenStrategy::new(config(), router.clone())
            .execute(&request(Environment::Staging), &fleet, &context())
            .await
            .unwrap();

        assert_eq!(result.status(), DeploymentStatus::RolledBack);
        assert_eq!(result.rollback_outcome(), RollbackOutcome::Complete);
        assert!(result.rollback_results().is_empty());
        assert_eq!(router.live_slot(Environment::Staging, "payments").await, Slot::Blue);
        assert_eq!(router.generation(), 2);
        // Pointer revert only: the idle nodes keep the new version.
        assert_eq!(nodes[2].installed_version("payments").await.as_deref(), Some("2.0.0"));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_during_soak_reverts() {
        let nodes = sim_nodes(2);
        let fleet = fleet_of(&nodes, Environment::Staging);
        let router = Arc::new(TrafficRouter::new());
        let ctx = context();
        let trigger = ctx.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let result = BlueGreenStrategy::new(config(), router.clone())
            .execute(&request(Environment::Staging), &fleet, &ctx)
            .await
            .unwrap();

        assert_eq!(result.status(), DeploymentStatus::Cancelled);
        assert!(result.rolled_back());
        assert_eq!(router.live_slot(Environment::Staging, "payments").await, Slot::Blue);
    }

    #[tokio::test]
    async fn single_node_fleet_is_rejected() {
        let nodes = sim_nodes(1);
        let fleet = fleet_of(&nodes, Environment::Staging);

        let result = BlueGreenStrategy::new(config(), Arc::new(TrafficRouter::new()))
            .execute(&request(Environment::Staging), &fleet, &context())
            .await
            .unwrap();

        assert_eq!(result.status(), DeploymentStatus::Failed);
        assert_eq!(nodes[0].deploy_count(), 0);
    }
}
