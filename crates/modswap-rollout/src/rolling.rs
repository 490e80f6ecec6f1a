//! Rolling strategy: fixed-size batches with a health gate between them.

use async_trait::async_trait;
use tracing::{debug, info};

use modswap_fleet::{batches, Fleet, ModuleDeploymentRequest, NodeRef, StrategyKind};

use crate::error::RolloutResult;
use crate::executor::{
    finish, node_ids, roll_back_and_finalize, run_wave, wait_healthy, HealthCheck, WaveOutcome,
};
use crate::progress::ProgressEvent;
use crate::result::{DeploymentResult, DeploymentStatus};
use crate::strategy::{DeploymentStrategy, RollingConfig, StrategyContext};

/// Updates the fleet one batch at a time.
///
/// Every node in a batch must deploy and then report `Healthy` before
/// the next batch starts. A failure anywhere rolls back every node
/// deployed so far, successful peers of the failing batch included.
#[derive(Debug, Default, Clone)]
pub struct RollingStrategy {
    config: RollingConfig,
}

impl RollingStrategy {
    pub fn new(config: RollingConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RollingConfig {
        &self.config
    }
}

#[async_trait]
impl DeploymentStrategy for RollingStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Rolling
    }

    async fn execute(
        &self,
        request: &ModuleDeploymentRequest,
        fleet: &Fleet,
        ctx: &StrategyContext,
    ) -> RolloutResult<DeploymentResult> {
        let mut result = DeploymentResult::begin(ctx.deployment_id, request, self.kind());
        let nodes = fleet.nodes().await;
        let plan = batches(&nodes, self.config.batch_size);
        let total = plan.len();
        ctx.emit(ProgressEvent::Started {
            strategy: self.kind(),
            nodes: nodes.len(),
        });

        let mut deployed: Vec<NodeRef> = Vec::new();
        let mut target = 0;

        for (i, batch) in plan.iter().enumerate() {
            let wave = i as u32 + 1;
            if ctx.cancel.is_cancelled() {
                let reason = format!("cancelled before batch {wave}/{total}");
                return roll_back_and_finalize(result, &deployed, request, ctx, reason, true).await;
            }

            target += batch.len();
            info!(
                deployment = %ctx.deployment_id,
                batch = wave,
                total,
                nodes = batch.len(),
                "deploying batch"
            );
            ctx.emit(ProgressEvent::WaveStarted {
                wave,
                nodes: node_ids(batch),
                target_count: target,
            });

            let WaveOutcome {
                deployed: ok,
                failed,
                results,
            } = run_wave(batch, request).await;
            result.record_wave(None, target, results)?;
            ctx.emit(ProgressEvent::WaveCompleted {
                wave,
                succeeded: ok.len(),
                failed: failed.len(),
            });
            deployed.extend(ok.iter().cloned());

            if !failed.is_empty() {
                let reason = format!("batch {wave} failed on {}", failed.join(", "));
                return roll_back_and_finalize(result, &deployed, request, ctx, reason, false).await;
            }
            if ctx.cancel.is_cancelled() {
                let reason = format!("cancelled after batch {wave}/{total}");
                return roll_back_and_finalize(result, &deployed, request, ctx, reason, true).await;
            }

            match wait_healthy(
                &ok,
                self.config.health_timeout,
                self.config.health_poll_interval,
                &ctx.cancel,
            )
            .await
            {
                HealthCheck::Healthy => debug!(deployment = %ctx.deployment_id, batch = wave, "batch healthy"),
                HealthCheck::Unhealthy(ids) => {
                    let reason = format!("batch {wave} unhealthy: {}", ids.join(", "));
                    return roll_back_and_finalize(result, &deployed, request, ctx, reason, false)
                        .await;
                }
                HealthCheck::Cancelled => {
                    let reason = format!("cancelled during batch {wave} health check");
                    return roll_back_and_finalize(result, &deployed, request, ctx, reason, true)
                        .await;
                }
            }

            if i + 1 < total && !self.config.batch_interval.is_zero() {
                tokio::select! {
                    _ = ctx.cancel.cancelled() => {
                        let reason = format!("cancelled after batch {wave}/{total}");
                        return roll_back_and_finalize(result, &deployed, request, ctx, reason, true).await;
                    }
                    _ = tokio::time::sleep(self.config.batch_interval) => {}
                }
            }
        }

        let message = format!("{} batches, {} nodes on {}", total, deployed.len(), request.target_version);
        finish(result, DeploymentStatus::Succeeded, message, ctx)
    }
}
