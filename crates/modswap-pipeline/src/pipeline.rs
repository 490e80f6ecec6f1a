//! The deployment pipeline.
//!
//! ```text
//!   validate ─► lock(env, module) ─► freeze topology ─► approval ─► strategy ─► audit
//!      │              │                                     │
//!      ▼              ▼                                     ▼
//!  InvalidRequest  LockTimeout                           Rejected
//! ```
//!
//! The lock handle and the topology guard live on the stack of `run`, so
//! both are released on every way out of it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{RwLock, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, info, info_span, warn};
use uuid::Uuid;

use modswap_fleet::{Environment, Fleet, ModuleDeploymentRequest, StrategyKind};
use modswap_metrics::MetricsSource;
use modswap_rollout::{
    DeploymentResult, DeploymentStatus, ProgressEvent, StrategyContext, TrafficRouter,
};

use crate::approval::{ApprovalDecision, ApprovalGate, AutoApprovalGate, ChannelApprovalGate, DecisionStore};
use crate::audit::{AuditSink, TracingAuditSink};
use crate::config::PipelineConfig;
use crate::error::PipelineResult;
use crate::lock::{InMemoryLockService, LockError, LockKey, LockService};
use crate::registry::StrategyRegistry;
use crate::validate::validate_request;

/// Sequences validation, locking, approval, strategy dispatch and audit
/// for every deployment.
pub struct DeploymentPipeline {
    fleets: RwLock<HashMap<Environment, Fleet>>,
    registry: StrategyRegistry,
    locks: Arc<dyn LockService>,
    approvals: Arc<dyn ApprovalGate>,
    audit: Arc<dyn AuditSink>,
    metrics: Arc<dyn MetricsSource>,
    lock_ttl: Duration,
    audit_timeout: Duration,
    shutdown: CancellationToken,
}

impl DeploymentPipeline {
    /// A pipeline with in-memory locks, policy approval for every
    /// environment, and tracing audit.
    pub fn new(registry: StrategyRegistry, metrics: Arc<dyn MetricsSource>) -> Self {
        Self {
            fleets: RwLock::new(HashMap::new()),
            registry,
            locks: Arc::new(InMemoryLockService::default()),
            approvals: Arc::new(AutoApprovalGate::approve_all()),
            audit: Arc::new(TracingAuditSink),
            metrics,
            lock_ttl: Duration::from_secs(15 * 60),
            audit_timeout: Duration::from_secs(5),
            shutdown: CancellationToken::new(),
        }
    }

    /// Build a pipeline from configuration.
    ///
    /// Environments outside `approval.auto_approve` wait on a
    /// `ChannelApprovalGate` for at most `approval.timeout`. Use
    /// `with_approval_gate` to reach its `decide` handle.
    pub fn from_config(config: &PipelineConfig, metrics: Arc<dyn MetricsSource>) -> PipelineResult<Self> {
        let mut registry = StrategyRegistry::with_configs(
            config.rolling_config()?,
            config.blue_green_config()?,
            config.canary_config()?,
            Arc::new(TrafficRouter::new()),
        )?;
        for (environment, kind) in config.environment_strategies() {
            registry.set_environment_strategy(environment, kind);
        }

        let store = Arc::new(DecisionStore::new(
            config.approval.decision_capacity,
            config.decision_retention()?,
        ));
        let approvals = ChannelApprovalGate::new(config.approval_timeout()?)
            .with_auto_approve(config.approval.auto_approve.iter().copied())
            .with_store(store);

        Ok(Self::new(registry, metrics)
            .with_lock_service(Arc::new(InMemoryLockService::new(config.lock_acquire_timeout()?)))
            .with_approval_gate(Arc::new(approvals))
            .with_lock_ttl(config.lock_ttl()?)
            .with_audit_timeout(config.audit_timeout()?))
    }

    pub fn with_lock_service(mut self, locks: Arc<dyn LockService>) -> Self {
        self.locks = locks;
        self
    }

    pub fn with_approval_gate(mut self, approvals: Arc<dyn ApprovalGate>) -> Self {
        self.approvals = approvals;
        self
    }

    pub fn with_audit_sink(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    pub fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }

    pub fn with_audit_timeout(mut self, timeout: Duration) -> Self {
        self.audit_timeout = timeout;
        self
    }

    /// Cancelling this token cancels every deployment started afterwards
    /// or still running.
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn registry(&self) -> &StrategyRegistry {
        &self.registry
    }

    /// Register the fleet for its environment, replacing any previous one.
    pub async fn register_fleet(&self, fleet: Fleet) -> Option<Fleet> {
        info!(fleet = %fleet.name(), environment = %fleet.environment(), "fleet registered");
        self.fleets.write().await.insert(fleet.environment(), fleet)
    }

    pub async fn fleet(&self, environment: Environment) -> Option<Fleet> {
        self.fleets.read().await.get(&environment).cloned()
    }

    /// Run one deployment to completion.
    ///
    /// Every expected outcome, including refusals before any node is
    /// touched, comes back as `Ok` with a terminal status. `Err` means a
    /// strategy broke one of its own invariants.
    pub async fn execute_deployment(&self, request: ModuleDeploymentRequest) -> PipelineResult<DeploymentResult> {
        self.execute(request, None).await
    }

    /// Like `execute_deployment`, publishing progress to `progress`.
    pub async fn execute_deployment_with_progress(
        &self,
        request: ModuleDeploymentRequest,
        progress: mpsc::Sender<ProgressEvent>,
    ) -> PipelineResult<DeploymentResult> {
        self.execute(request, Some(progress)).await
    }

    async fn execute(
        &self,
        request: ModuleDeploymentRequest,
        progress: Option<mpsc::Sender<ProgressEvent>>,
    ) -> PipelineResult<DeploymentResult> {
        let deployment_id = Uuid::new_v4();
        let span = info_span!(
            "deployment",
            deployment = %deployment_id,
            module = %request.module_name,
            version = %request.target_version,
            environment = %request.environment,
        );
        self.run(deployment_id, request, progress).instrument(span).await
    }

    async fn run(
        &self,
        deployment_id: Uuid,
        request: ModuleDeploymentRequest,
        progress: Option<mpsc::Sender<ProgressEvent>>,
    ) -> PipelineResult<DeploymentResult> {
        let kind = self.registry.kind_for(&request);
        let refuse = |status: DeploymentStatus, message: String| {
            self.refuse(deployment_id, &request, kind, status, message, progress.as_ref())
        };

        // ── Validate ──
        let registered = self.fleet(request.environment).await;
        let fleet = match validate_request(&request, registered.as_ref()).await {
            Ok(fleet) => fleet.clone(),
            Err(e) => return refuse(DeploymentStatus::InvalidRequest, e.to_string()),
        };
        let Some(strategy) = self.registry.resolve(&request) else {
            return refuse(
                DeploymentStatus::InvalidRequest,
                format!("no strategy registered for {kind}"),
            );
        };

        // ── Lock ──
        let cancel = self.shutdown.child_token();
        let key = LockKey::for_request(&request);
        let _lock = match self.locks.acquire(&key, self.lock_ttl, &cancel).await {
            Ok(handle) => handle,
            Err(e @ LockError::Timeout { .. }) => return refuse(DeploymentStatus::LockTimeout, e.to_string()),
            Err(e @ LockError::Cancelled(_)) => return refuse(DeploymentStatus::Cancelled, e.to_string()),
        };
        let _topology = fleet.freeze().await;

        // ── Approve ──
        if request.environment.requires_approval() {
            match self.approvals.request_approval(&request, deployment_id, &cancel).await {
                ApprovalDecision::Approved => info!("deployment approved"),
                ApprovalDecision::Rejected { reason } if cancel.is_cancelled() => {
                    return refuse(DeploymentStatus::Cancelled, reason);
                }
                ApprovalDecision::Rejected { reason } => {
                    return refuse(DeploymentStatus::Rejected, format!("approval rejected: {reason}"));
                }
                ApprovalDecision::TimedOut => {
                    return refuse(DeploymentStatus::Rejected, "approval timed out".to_string());
                }
            }
        }

        // ── Dispatch ──
        let nodes = fleet.len().await;
        info!(strategy = strategy.name(), nodes, "dispatching");
        let mut ctx = StrategyContext::new(deployment_id, self.metrics.clone(), cancel);
        if let Some(tx) = progress.clone() {
            ctx = ctx.with_progress(tx);
        }
        let result = strategy.execute(&request, &fleet, &ctx).await?;

        self.spawn_audit(&result);
        Ok(result)
    }

    /// Finalize a run that ended before any strategy was dispatched.
    fn refuse(
        &self,
        deployment_id: Uuid,
        request: &ModuleDeploymentRequest,
        kind: StrategyKind,
        status: DeploymentStatus,
        message: String,
        progress: Option<&mpsc::Sender<ProgressEvent>>,
    ) -> PipelineResult<DeploymentResult> {
        warn!(?status, %message, "deployment refused");
        let result = DeploymentResult::terminal(deployment_id, request, kind, status, message)?;
        if let Some(tx) = progress {
            let _ = tx.try_send(ProgressEvent::Finished { status });
        }
        self.spawn_audit(&result);
        Ok(result)
    }

    fn spawn_audit(&self, result: &DeploymentResult) {
        let sink = self.audit.clone();
        let record = result.clone();
        let timeout = self.audit_timeout;
        tokio::spawn(
            async move {
                if tokio::time::timeout(timeout, sink.record(&record)).await.is_err() {
                    warn!(timeout_ms = timeout.as_millis() as u64, "audit sink timed out");
                }
            }
            .in_current_span(),
        );
    }
}
