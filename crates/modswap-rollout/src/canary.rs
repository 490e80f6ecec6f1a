//! Canary strategy: percentage waves gated on metrics.
//!
//! ```text
//!   Init ─► BaselineCapture ─► WaveDeploy(1) ─► WaveGate(1) ─► WaveDeploy(2) ─► … ─► Complete
//!                                   │                │
//!                                   └──── failure ───┴──► RolledBack
//! ```
//!
//! Each wave brings the deployment to `ceil(n * pct / 100)` nodes. After
//! a wave that leaves nodes remaining, the deployed nodes must settle and
//! pass the gate against the baseline before the percentage grows. Any
//! node failure, gate rejection, stabilization timeout or metrics error
//! rolls back every node deployed in every wave so far.

use std::collections::HashSet;
use std::fmt;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info, warn};

use modswap_fleet::{Fleet, ModuleDeploymentRequest, NodeId, NodeRef, StrategyKind, select_wave};
use modswap_metrics::{ClusterMetricsSnapshot, StabilizationWaiter};

use crate::error::{RolloutError, RolloutResult};
use crate::executor::{finish, node_ids, roll_back_and_finalize, run_wave, WaveOutcome};
use crate::planner::plan_waves;
use crate::progress::ProgressEvent;
use crate::result::{DeploymentResult, DeploymentStatus};
use crate::strategy::{CanaryConfig, DeploymentStrategy, StabilizationMode, StrategyContext};

/// Where a canary run is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum CanaryPhase {
    Init,
    BaselineCapture,
    WaveDeploy { wave: u32 },
    WaveGate { wave: u32 },
    Complete,
    RolledBack { reason: String },
}

impl fmt::Display for CanaryPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CanaryPhase::Init => write!(f, "init"),
            CanaryPhase::BaselineCapture => write!(f, "baseline_capture"),
            CanaryPhase::WaveDeploy { wave } => write!(f, "wave_deploy({wave})"),
            CanaryPhase::WaveGate { wave } => write!(f, "wave_gate({wave})"),
            CanaryPhase::Complete => write!(f, "complete"),
            CanaryPhase::RolledBack { .. } => write!(f, "rolled_back"),
        }
    }
}

/// Outcome of the wait-then-gate step between waves.
enum Gate {
    Pass(String),
    Reject(String),
    Cancelled,
}

/// Percentage-driven rollout with a metrics gate between waves.
#[derive(Debug, Clone)]
pub struct CanaryStrategy {
    config: CanaryConfig,
}

impl CanaryStrategy {
    pub fn new(config: CanaryConfig) -> RolloutResult<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &CanaryConfig {
        &self.config
    }

    fn transition(&self, ctx: &StrategyContext, phase: &mut CanaryPhase, next: CanaryPhase) {
        debug!(deployment = %ctx.deployment_id, from = %phase, to = %next, "canary phase");
        *phase = next;
    }

    /// Wait for the deployed nodes to settle, then judge them.
    async fn gate(
        &self,
        deployed: &[NodeId],
        baseline: &ClusterMetricsSnapshot,
        ctx: &StrategyContext,
    ) -> Gate {
        match &self.config.stabilization {
            StabilizationMode::Adaptive(cfg) => {
                let waiter = StabilizationWaiter::new(ctx.metrics.clone(), self.config.thresholds.clone());
                let outcome = waiter.wait_for_stable(deployed, baseline, cfg, &ctx.cancel).await;
                if outcome.cancelled {
                    Gate::Cancelled
                } else if outcome.is_stable {
                    Gate::Pass(format!("stable after {} checks", outcome.total_checks))
                } else {
                    Gate::Reject(format!(
                        "stabilization timed out after {} checks ({:?})",
                        outcome.total_checks, outcome.elapsed
                    ))
                }
            }
            StabilizationMode::Fixed { wait } => {
                let samples = tokio::select! {
                    _ = ctx.cancel.cancelled() => return Gate::Cancelled,
                    samples = async {
                        tokio::time::sleep(*wait).await;
                        ctx.metrics.node_metrics(deployed).await
                    } => samples,
                };
                let samples = match samples {
                    Ok(samples) => samples,
                    Err(e) => return Gate::Reject(format!("metrics unavailable: {e}")),
                };
                let Some(current) = ClusterMetricsSnapshot::average(&samples) else {
                    return Gate::Reject("no metrics for deployed nodes".to_string());
                };
                let verdict = self.config.thresholds.evaluate(baseline, &current);
                if verdict.passed() {
                    Gate::Pass("within thresholds".to_string())
                } else {
                    Gate::Reject(format!("gate rejected: {}", verdict.describe()))
                }
            }
        }
    }
}

#[async_trait]
impl DeploymentStrategy for CanaryStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Canary
    }

    async fn execute(
        &self,
        request: &ModuleDeploymentRequest,
        fleet: &Fleet,
        ctx: &StrategyContext,
    ) -> RolloutResult<DeploymentResult> {
        let mut result = DeploymentResult::begin(ctx.deployment_id, request, self.kind());
        let mut phase = CanaryPhase::Init;
        let nodes = fleet.nodes().await;
        let total = nodes.len();
        let plan = plan_waves(total, self.config.initial_percentage, self.config.increment);
        ctx.emit(ProgressEvent::Started {
            strategy: self.kind(),
            nodes: total,
        });

        self.transition(ctx, &mut phase, CanaryPhase::BaselineCapture);
        let baseline = tokio::select! {
            _ = ctx.cancel.cancelled() => {
                return finish(result, DeploymentStatus::Cancelled, "cancelled during baseline capture", ctx);
            }
            snapshot = ctx.metrics.snapshot(request.environment) => snapshot,
        };
        let baseline = match baseline {
            Ok(b) => b,
            Err(e) => {
                return finish(
                    result,
                    DeploymentStatus::Failed,
                    format!("baseline capture failed: {e}"),
                    ctx,
                );
            }
        };
        info!(
            deployment = %ctx.deployment_id,
            cpu = baseline.cpu_percent,
            memory = baseline.memory_percent,
            latency_ms = baseline.latency_ms,
            error_rate = baseline.error_rate,
            waves = plan.len(),
            "canary baseline captured"
        );
        ctx.emit(ProgressEvent::BaselineCaptured {
            cpu_percent: baseline.cpu_percent,
            memory_percent: baseline.memory_percent,
            latency_ms: baseline.latency_ms,
            error_rate: baseline.error_rate,
        });

        let mut deployed: Vec<NodeRef> = Vec::new();
        let mut deployed_ids: HashSet<NodeId> = HashSet::new();

        for (i, step) in plan.iter().enumerate() {
            let wave = i as u32 + 1;
            if ctx.cancel.is_cancelled() {
                let reason = format!("cancelled before wave {wave}");
                self.transition(ctx, &mut phase, CanaryPhase::RolledBack { reason: reason.clone() });
                return roll_back_and_finalize(result, &deployed, request, ctx, reason, true).await;
            }

            self.transition(ctx, &mut phase, CanaryPhase::WaveDeploy { wave });
            let batch = select_wave(&nodes, &deployed_ids, step.target_count);
            info!(
                deployment = %ctx.deployment_id,
                wave,
                percentage = step.percentage,
                target = step.target_count,
                nodes = batch.len(),
                "canary wave"
            );
            ctx.emit(ProgressEvent::WaveStarted {
                wave,
                nodes: node_ids(&batch),
                target_count: step.target_count,
            });

            let WaveOutcome {
                deployed: ok,
                failed,
                results,
            } = run_wave(&batch, request).await;
            result.record_wave(Some(step.percentage), step.target_count, results)?;
            ctx.emit(ProgressEvent::WaveCompleted {
                wave,
                succeeded: ok.len(),
                failed: failed.len(),
            });
            for node in ok {
                deployed_ids.insert(node.id().to_string());
                deployed.push(node);
            }

            if !failed.is_empty() {
                let reason = format!("wave {wave} failed on {}", failed.join(", "));
                self.transition(ctx, &mut phase, CanaryPhase::RolledBack { reason: reason.clone() });
                return roll_back_and_finalize(result, &deployed, request, ctx, reason, false).await;
            }
            if ctx.cancel.is_cancelled() {
                let reason = format!("cancelled after wave {wave}");
                self.transition(ctx, &mut phase, CanaryPhase::RolledBack { reason: reason.clone() });
                return roll_back_and_finalize(result, &deployed, request, ctx, reason, true).await;
            }
            if deployed.len() >= total {
                break;
            }

            self.transition(ctx, &mut phase, CanaryPhase::WaveGate { wave });
            ctx.emit(ProgressEvent::Stabilizing { wave });
            match self.gate(&node_ids(&deployed), &baseline, ctx).await {
                Gate::Pass(detail) => {
                    info!(deployment = %ctx.deployment_id, wave, %detail, "canary gate passed");
                    ctx.emit(ProgressEvent::GateEvaluated {
                        wave,
                        passed: true,
                        detail,
                    });
                }
                Gate::Reject(detail) => {
                    warn!(deployment = %ctx.deployment_id, wave, %detail, "canary gate rejected");
                    ctx.emit(ProgressEvent::GateEvaluated {
                        wave,
                        passed: false,
                        detail: detail.clone(),
                    });
                    let reason = format!("wave {wave}: {detail}");
                    self.transition(ctx, &mut phase, CanaryPhase::RolledBack { reason: reason.clone() });
                    return roll_back_and_finalize(result, &deployed, request, ctx, reason, false)
                        .await;
                }
                Gate::Cancelled => {
                    let reason = format!("cancelled while stabilizing wave {wave}");
                    self.transition(ctx, &mut phase, CanaryPhase::RolledBack { reason: reason.clone() });
                    return roll_back_and_finalize(result, &deployed, request, ctx, reason, true)
                        .await;
                }
            }
        }

        if deployed.len() != total {
            return Err(RolloutError::Invariant(format!(
                "canary finished with {} of {} nodes deployed",
                deployed.len(),
                total
            )));
        }

        self.transition(ctx, &mut phase, CanaryPhase::Complete);
        let message = format!(
            "{} waves, {} nodes on {}",
            result.waves().len(),
            total,
            request.target_version
        );
        finish(result, DeploymentStatus::Succeeded, message, ctx)
    }
}
