//! Approval gates for protected environments.
//!
//! Staging and production deployments need a decision before any node is
//! touched. Every decision a gate makes lands in its `DecisionStore`, a
//! bounded, time-ordered log that drops the oldest entries when full and
//! expires entries older than its retention window.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use modswap_fleet::{Environment, ModuleDeploymentRequest};

/// What an approver decided.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum ApprovalDecision {
    Approved,
    Rejected { reason: String },
    TimedOut,
}

impl ApprovalDecision {
    pub fn is_approved(&self) -> bool {
        matches!(self, ApprovalDecision::Approved)
    }
}

/// Decides whether a deployment may proceed.
#[async_trait]
pub trait ApprovalGate: Send + Sync {
    async fn request_approval(
        &self,
        request: &ModuleDeploymentRequest,
        deployment_id: Uuid,
        cancel: &CancellationToken,
    ) -> ApprovalDecision;
}

// ── Decision store ─────────────────────────────────────────────────

/// One recorded decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub deployment_id: Uuid,
    pub environment: Environment,
    pub module_name: String,
    pub target_version: String,
    pub decision: ApprovalDecision,
    pub decided_at: DateTime<Utc>,
}

impl DecisionRecord {
    pub fn new(request: &ModuleDeploymentRequest, deployment_id: Uuid, decision: ApprovalDecision) -> Self {
        Self {
            deployment_id,
            environment: request.environment,
            module_name: request.module_name.clone(),
            target_version: request.target_version.clone(),
            decision,
            decided_at: Utc::now(),
        }
    }
}

/// Bounded, time-indexed log of approval decisions.
#[derive(Debug)]
pub struct DecisionStore {
    records: Mutex<VecDeque<DecisionRecord>>,
    capacity: usize,
    retention: Duration,
}

impl DecisionStore {
    pub fn new(capacity: usize, retention: Duration) -> Self {
        Self {
            records: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
            retention,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append a decision, evicting the oldest entry when full.
    pub async fn record(&self, record: DecisionRecord) {
        let mut records = self.records.lock().await;
        while records.len() >= self.capacity {
            if let Some(evicted) = records.pop_front() {
                debug!(deployment = %evicted.deployment_id, "decision evicted for capacity");
            }
        }
        // Keep the log sorted by decision time.
        let at = records.partition_point(|r| r.decided_at <= record.decided_at);
        records.insert(at, record);
    }

    /// Drop every record decided before `cutoff`. Returns how many went.
    pub async fn evict_before(&self, cutoff: DateTime<Utc>) -> usize {
        let mut records = self.records.lock().await;
        let expired = records.partition_point(|r| r.decided_at < cutoff);
        records.drain(..expired);
        expired
    }

    /// Drop every record older than the retention window.
    pub async fn evict_expired(&self) -> usize {
        let Ok(retention) = chrono::Duration::from_std(self.retention) else {
            return 0;
        };
        let Some(cutoff) = Utc::now().checked_sub_signed(retention) else {
            return 0;
        };
        self.evict_before(cutoff).await
    }

    /// Latest decision for a deployment, if still retained.
    pub async fn find(&self, deployment_id: Uuid) -> Option<DecisionRecord> {
        self.records
            .lock()
            .await
            .iter()
            .rev()
            .find(|r| r.deployment_id == deployment_id)
            .cloned()
    }

    /// Records decided at or after `since`, oldest first.
    pub async fn since(&self, since: DateTime<Utc>) -> Vec<DecisionRecord> {
        let records = self.records.lock().await;
        let start = records.partition_point(|r| r.decided_at < since);
        records.range(start..).cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.lock().await.is_empty()
    }

    /// Run `evict_expired` every `interval` until `shutdown` fires.
    pub fn spawn_eviction(self: Arc<Self>, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!("decision eviction stopped");
                        return;
                    }
                    _ = ticker.tick() => {
                        let evicted = self.evict_expired().await;
                        if evicted > 0 {
                            debug!(evicted, "expired approval decisions dropped");
                        }
                    }
                }
            }
        })
    }
}

impl Default for DecisionStore {
    fn default() -> Self {
        Self::new(1024, Duration::from_secs(24 * 60 * 60))
    }
}

// ── Auto approval ──────────────────────────────────────────────────

/// Approves requests for a fixed set of environments and rejects the rest.
pub struct AutoApprovalGate {
    approved: HashSet<Environment>,
    store: Arc<DecisionStore>,
}

impl AutoApprovalGate {
    pub fn new(approved: impl IntoIterator<Item = Environment>) -> Self {
        Self {
            approved: approved.into_iter().collect(),
            store: Arc::new(DecisionStore::default()),
        }
    }

    /// Approve everything.
    pub fn approve_all() -> Self {
        Self::new(Environment::ALL)
    }

    pub fn with_store(mut self, store: Arc<DecisionStore>) -> Self {
        self.store = store;
        self
    }

    pub fn store(&self) -> &Arc<DecisionStore> {
        &self.store
    }
}

#[async_trait]
impl ApprovalGate for AutoApprovalGate {
    async fn request_approval(
        &self,
        request: &ModuleDeploymentRequest,
        deployment_id: Uuid,
        _cancel: &CancellationToken,
    ) -> ApprovalDecision {
        let decision = if self.approved.contains(&request.environment) {
            ApprovalDecision::Approved
        } else {
            ApprovalDecision::Rejected {
                reason: format!("{} deployments are not auto-approved", request.environment),
            }
        };
        info!(deployment = %deployment_id, ?decision, "approval decided by policy");
        self.store
            .record(DecisionRecord::new(request, deployment_id, decision.clone()))
            .await;
        decision
    }
}

// ── Operator approval ──────────────────────────────────────────────

/// A request waiting on an operator.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApprovalTicket {
    pub deployment_id: Uuid,
    pub environment: Environment,
    pub module_name: String,
    pub target_version: String,
}

/// Waits for an operator to call `decide`, up to a timeout.
///
/// Environments listed with `with_auto_approve` are approved at once
/// without a ticket.
pub struct ChannelApprovalGate {
    pending: Mutex<HashMap<Uuid, oneshot::Sender<ApprovalDecision>>>,
    timeout: Duration,
    auto_approve: HashSet<Environment>,
    store: Arc<DecisionStore>,
    notify: Option<mpsc::Sender<ApprovalTicket>>,
}

impl ChannelApprovalGate {
    pub fn new(timeout: Duration) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            timeout,
            auto_approve: HashSet::new(),
            store: Arc::new(DecisionStore::default()),
            notify: None,
        }
    }

    pub fn with_auto_approve(mut self, environments: impl IntoIterator<Item = Environment>) -> Self {
        self.auto_approve = environments.into_iter().collect();
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn with_store(mut self, store: Arc<DecisionStore>) -> Self {
        self.store = store;
        self
    }

    /// Publish a ticket for every request that starts waiting.
    pub fn with_notifications(mut self, notify: mpsc::Sender<ApprovalTicket>) -> Self {
        self.notify = Some(notify);
        self
    }

    pub fn store(&self) -> &Arc<DecisionStore> {
        &self.store
    }

    /// Deployments currently waiting on a decision.
    pub async fn pending(&self) -> Vec<Uuid> {
        self.pending.lock().await.keys().copied().collect()
    }

    /// Deliver an operator decision. Returns `false` if nothing was waiting.
    pub async fn decide(&self, deployment_id: Uuid, decision: ApprovalDecision) -> bool {
        match self.pending.lock().await.remove(&deployment_id) {
            Some(tx) => tx.send(decision).is_ok(),
            None => false,
        }
    }
}

#[async_trait]
impl ApprovalGate for ChannelApprovalGate {
    async fn request_approval(
        &self,
        request: &ModuleDeploymentRequest,
        deployment_id: Uuid,
        cancel: &CancellationToken,
    ) -> ApprovalDecision {
        if self.auto_approve.contains(&request.environment) {
            info!(deployment = %deployment_id, environment = %request.environment, "approval decided by policy");
            self.store
                .record(DecisionRecord::new(request, deployment_id, ApprovalDecision::Approved))
                .await;
            return ApprovalDecision::Approved;
        }

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(deployment_id, tx);

        // Ticket delivery counts against the same deadline as the decision.
        let wait = async {
            if let Some(notify) = &self.notify {
                let ticket = ApprovalTicket {
                    deployment_id,
                    environment: request.environment,
                    module_name: request.module_name.clone(),
                    target_version: request.target_version.clone(),
                };
                if notify.send(ticket).await.is_err() {
                    debug!(deployment = %deployment_id, "approval notification receiver gone");
                }
            }
            info!(deployment = %deployment_id, timeout_ms = self.timeout.as_millis() as u64, "awaiting approval");
            match rx.await {
                Ok(decision) => decision,
                Err(_) => ApprovalDecision::Rejected {
                    reason: "approval request dropped".to_string(),
                },
            }
        };

        let decision = tokio::select! {
            _ = cancel.cancelled() => ApprovalDecision::Rejected {
                reason: "cancelled while awaiting approval".to_string(),
            },
            res = tokio::time::timeout(self.timeout, wait) => res.unwrap_or(ApprovalDecision::TimedOut),
        };
        self.pending.lock().await.remove(&deployment_id);

        if !decision.is_approved() {
            warn!(deployment = %deployment_id, ?decision, "approval not granted");
        }
        self.store
            .record(DecisionRecord::new(request, deployment_id, decision.clone()))
            .await;
        decision
    }
}
