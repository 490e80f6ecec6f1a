//! The strategy contract and per-strategy configuration.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use modswap_fleet::{Fleet, ModuleDeploymentRequest, StrategyKind};
use modswap_metrics::{GateThresholds, MetricsSource, StabilizationConfig};

use crate::error::{RolloutError, RolloutResult};
use crate::progress::ProgressEvent;
use crate::result::DeploymentResult;

/// A rollout algorithm.
///
/// Expected failures come back as a finalized `DeploymentResult` with a
/// non-success status. `Err` is reserved for broken invariants.
#[async_trait]
pub trait DeploymentStrategy: Send + Sync {
    fn kind(&self) -> StrategyKind;

    /// Tag used in logs and in the registry.
    fn name(&self) -> &'static str {
        self.kind().as_str()
    }

    async fn execute(
        &self,
        request: &ModuleDeploymentRequest,
        fleet: &Fleet,
        ctx: &StrategyContext,
    ) -> RolloutResult<DeploymentResult>;
}

/// Everything a strategy needs besides the request and the fleet.
#[derive(Clone)]
pub struct StrategyContext {
    pub deployment_id: Uuid,
    pub cancel: CancellationToken,
    pub metrics: Arc<dyn MetricsSource>,
    progress: Option<mpsc::Sender<ProgressEvent>>,
}

impl StrategyContext {
    pub fn new(deployment_id: Uuid, metrics: Arc<dyn MetricsSource>, cancel: CancellationToken) -> Self {
        Self {
            deployment_id,
            cancel,
            metrics,
            progress: None,
        }
    }

    pub fn with_progress(mut self, progress: mpsc::Sender<ProgressEvent>) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Publish a progress event. Never blocks: a full or closed channel
    /// drops the event.
    pub fn emit(&self, event: ProgressEvent) {
        if let Some(tx) = &self.progress {
            if let Err(e) = tx.try_send(event) {
                debug!(deployment = %self.deployment_id, error = %e, "progress event dropped");
            }
        }
    }
}

// ── Rolling ────────────────────────────────────────────────────────

/// Configuration for rolling updates.
#[derive(Debug, Clone, PartialEq)]
pub struct RollingConfig {
    /// Number of nodes to update per batch. Zero means one batch.
    pub batch_size: usize,
    /// Pause between batches.
    pub batch_interval: Duration,
    /// How long a batch may take to report healthy.
    pub health_timeout: Duration,
    /// Time between health polls.
    pub health_poll_interval: Duration,
}

impl Default for RollingConfig {
    fn default() -> Self {
        Self {
            batch_size: 1,
            batch_interval: Duration::from_secs(10),
            health_timeout: Duration::from_secs(30),
            health_poll_interval: Duration::from_secs(1),
        }
    }
}

// ── Blue-green ─────────────────────────────────────────────────────

/// Configuration for blue-green switches.
#[derive(Debug, Clone, PartialEq)]
pub struct BlueGreenConfig {
    /// How long the idle set may take to report healthy.
    pub health_timeout: Duration,
    pub health_poll_interval: Duration,
    /// Observation period after the switch before the final health check.
    pub soak: Duration,
}

impl Default for BlueGreenConfig {
    fn default() -> Self {
        Self {
            health_timeout: Duration::from_secs(30),
            health_poll_interval: Duration::from_secs(1),
            soak: Duration::from_secs(30),
        }
    }
}

// ── Canary ─────────────────────────────────────────────────────────

/// How the canary waits between waves.
#[derive(Debug, Clone, PartialEq)]
pub enum StabilizationMode {
    /// Poll until metrics settle, bounded by a timeout.
    Adaptive(StabilizationConfig),
    /// Sleep a fixed time, then take one sample.
    Fixed { wait: Duration },
}

impl Default for StabilizationMode {
    fn default() -> Self {
        Self::Adaptive(StabilizationConfig::default())
    }
}

/// Configuration for canary deployments.
#[derive(Debug, Clone, PartialEq)]
pub struct CanaryConfig {
    /// Percentage of the fleet in the first wave (1-100).
    pub initial_percentage: u32,
    /// Percentage added per promotion (≥ 1).
    pub increment: u32,
    pub stabilization: StabilizationMode,
    pub thresholds: GateThresholds,
}

impl Default for CanaryConfig {
    fn default() -> Self {
        Self {
            initial_percentage: 10,
            increment: 20,
            stabilization: StabilizationMode::default(),
            thresholds: GateThresholds::default(),
        }
    }
}

impl CanaryConfig {
    pub fn validate(&self) -> RolloutResult<()> {
        if self.initial_percentage == 0 || self.initial_percentage > 100 {
            return Err(RolloutError::InvalidConfig(format!(
                "initial_percentage must be within 1..=100, got {}",
                self.initial_percentage
            )));
        }
        if self.increment == 0 {
            return Err(RolloutError::InvalidConfig(
                "increment must be at least 1".to_string(),
            ));
        }
        if let StabilizationMode::Adaptive(cfg) = &self.stabilization {
            if cfg.interval.is_zero() {
                return Err(RolloutError::InvalidConfig(
                    "stabilization interval must be non-zero".to_string(),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_canary_is_valid() {
        let cfg = CanaryConfig::default();
        assert_eq!(cfg.initial_percentage, 10);
        assert_eq!(cfg.increment, 20);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn canary_rejects_zero_increment() {
        let cfg = CanaryConfig {
            increment: 0,
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(RolloutError::InvalidConfig(_))));
    }

    #[test]
    fn canary_rejects_out_of_range_initial_percentage() {
        for pct in [0, 101] {
            let cfg = CanaryConfig {
                initial_percentage: pct,
                ..Default::default()
            };
            assert!(cfg.validate().is_err());
        }
    }

    #[test]
    fn default_rolling() {
        let cfg = RollingConfig::default();
        assert_eq!(cfg.batch_size, 1);
        assert_eq!(cfg.health_timeout, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn emit_never_blocks_on_full_channel() {
        let (tx, mut rx) = mpsc::channel(1);
        let ctx = StrategyContext::new(
            Uuid::new_v4(),
            Arc::new(modswap_metrics::InMemoryMetricsSource::new()),
            CancellationToken::new(),
        )
        .with_progress(tx);

        ctx.emit(ProgressEvent::WaveStarted { wave: 1, nodes: vec![], target_count: 1 });
        ctx.emit(ProgressEvent::WaveStarted { wave: 2, nodes: vec![], target_count: 2 });

        assert!(matches!(rx.recv().await, Some(ProgressEvent::WaveStarted { wave: 1, .. })));
        assert!(rx.try_recv().is_err());
    }
}
