//! Audit sinks for finalized deployment results.

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{info, warn};

use modswap_rollout::DeploymentResult;

/// Receives every finalized deployment result.
///
/// The pipeline calls `record` from a spawned task bounded by a timeout,
/// so a slow sink never holds up a deployment.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, result: &DeploymentResult);
}

/// Writes each result as one structured `tracing` event on the
/// `modswap::audit` target.
#[derive(Debug, Default, Clone)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn record(&self, result: &DeploymentResult) {
        match serde_json::to_string(result) {
            Ok(json) => info!(
                target: "modswap::audit",
                deployment = %result.deployment_id(),
                status = ?result.status(),
                record = %json,
                "deployment audited"
            ),
            Err(e) => warn!(
                target: "modswap::audit",
                deployment = %result.deployment_id(),
                error = %e,
                "failed to serialize deployment result"
            ),
        }
    }
}

/// Keeps results in memory.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    records: Mutex<Vec<DeploymentResult>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn records(&self) -> Vec<DeploymentResult> {
        self.records.lock().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.lock().await.is_empty()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn record(&self, result: &DeploymentResult) {
        self.records.lock().await.push(result.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use modswap_fleet::{Environment, ModuleDeploymentRequest, StrategyKind};
    use modswap_rollout::DeploymentStatus;
    use uuid::Uuid;

    fn result() -> DeploymentResult {
        let request = ModuleDeploymentRequest::new("payments", "2.0.0", Environment::Dev);
        DeploymentResult::terminal(
            Uuid::new_v4(),
            &request,
            StrategyKind::Direct,
            DeploymentStatus::Rejected,
            "denied",
        )
        .unwrap()
    }

    #[tokio::test]
    async fn memory_sink_keeps_results() {
        let sink = MemoryAuditSink::new();
        let r = result();
        sink.record(&r).await;
        assert_eq!(sink.len().await, 1);
        assert_eq!(sink.records().await[0].deployment_id(), r.deployment_id());
    }

    #[tokio::test]
    async fn tracing_sink_accepts_results() {
        TracingAuditSink.record(&result()).await;
    }
}
