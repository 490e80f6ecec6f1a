//! In-memory worker node with injectable failures.
//!
//! Keeps a per-module version history so `rollback` restores whatever
//! was installed before the last successful deploy. Deploy and rollback
//! failures, post-deploy health, and I/O latency can all be scripted,
//! which makes it the node of choice for strategy tests and for
//! `modswapd`'s dry runs.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::node::WorkerNode;
use crate::types::{ModuleDeploymentRequest, NodeDeploymentResult, NodeHealth, RollbackResult};

#[derive(Debug, Default)]
struct SimState {
    /// module → installed versions, oldest first. The last entry is live.
    history: HashMap<String, Vec<String>>,
    /// Modules whose last deploy found the target already live.
    unchanged: HashSet<String>,
    fail_deploy: Option<String>,
    fail_rollback: Option<String>,
    health_after_deploy: Option<NodeHealth>,
    health: Option<NodeHealth>,
}

/// A `WorkerNode` that lives entirely in memory.
#[derive(Debug)]
pub struct SimulatedNode {
    id: String,
    latency: Duration,
    state: Mutex<SimState>,
    deploy_calls: AtomicU32,
    rollback_calls: AtomicU32,
}

impl SimulatedNode {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            latency: Duration::ZERO,
            state: Mutex::new(SimState::default()),
            deploy_calls: AtomicU32::new(0),
            rollback_calls: AtomicU32::new(0),
        }
    }

    /// Pre-install a module version.
    pub fn with_version(mut self, module: &str, version: &str) -> Self {
        self.state
            .get_mut()
            .history
            .entry(module.to_string())
            .or_default()
            .push(version.to_string());
        self
    }

    /// Simulated I/O time for every deploy and rollback.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Every deploy fails with the given message.
    pub fn failing_deploy(mut self, message: &str) -> Self {
        self.state.get_mut().fail_deploy = Some(message.to_string());
        self
    }

    /// Every rollback fails with the given message.
    pub fn failing_rollback(mut self, message: &str) -> Self {
        self.state.get_mut().fail_rollback = Some(message.to_string());
        self
    }

    /// Report `Unhealthy` after a successful deploy, until rolled back.
    pub fn unhealthy_after_deploy(mut self) -> Self {
        self.state.get_mut().health_after_deploy = Some(NodeHealth::Unhealthy);
        self
    }

    pub async fn set_deploy_failure(&self, message: Option<&str>) {
        self.state.lock().await.fail_deploy = message.map(str::to_string);
    }

    pub async fn set_rollback_failure(&self, message: Option<&str>) {
        self.state.lock().await.fail_rollback = message.map(str::to_string);
    }

    pub async fn set_health(&self, health: NodeHealth) {
        self.state.lock().await.health = Some(health);
    }

    /// Full install history for a module, oldest first.
    pub async fn history(&self, module: &str) -> Vec<String> {
        self.state
            .lock()
            .await
            .history
            .get(module)
            .cloned()
            .unwrap_or_default()
    }

    pub fn deploy_count(&self) -> u32 {
        self.deploy_calls.load(Ordering::SeqCst)
    }

    pub fn rollback_count(&self) -> u32 {
        self.rollback_calls.load(Ordering::SeqCst)
    }

    async fn simulate_io(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }
}

#[async_trait]
impl WorkerNode for SimulatedNode {
    fn id(&self) -> &str {
        &self.id
    }

    async fn health(&self) -> NodeHealth {
        self.state.lock().await.health.unwrap_or(NodeHealth::Healthy)
    }

    async fn installed_version(&self, module: &str) -> Option<String> {
        self.state
            .lock()
            .await
            .history
            .get(module)
            .and_then(|h| h.last().cloned())
    }

    async fn deploy(&self, request: &ModuleDeploymentRequest) -> NodeDeploymentResult {
        self.deploy_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_io().await;

        let mut state = self.state.lock().await;
        let previous = state
            .history
            .get(&request.module_name)
            .and_then(|h| h.last().cloned());

        if let Some(reason) = state.fail_deploy.clone() {
            warn!(node = %self.id, module = %request.module_name, %reason, "simulated deploy failure");
            return NodeDeploymentResult::failed(&self.id, previous, reason);
        }

        if previous.as_deref() == Some(request.target_version.as_str()) {
            debug!(node = %self.id, module = %request.module_name, "version already installed");
            state.unchanged.insert(request.module_name.clone());
            let mut result =
                NodeDeploymentResult::succeeded(&self.id, previous, &request.target_version);
            result.message = format!("{} already installed", request.target_version);
            return result;
        }

        state.unchanged.remove(&request.module_name);
        state
            .history
            .entry(request.module_name.clone())
            .or_default()
            .push(request.target_version.clone());
        if let Some(health) = state.health_after_deploy {
            state.health = Some(health);
        }

        debug!(node = %self.id, module = %request.module_name, version = %request.target_version, "deployed");
        NodeDeploymentResult::succeeded(&self.id, previous, &request.target_version)
    }

    async fn rollback(&self, module: &str) -> RollbackResult {
        self.rollback_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_io().await;

        let mut state = self.state.lock().await;
        if let Some(reason) = state.fail_rollback.clone() {
            warn!(node = %self.id, %module, %reason, "simulated rollback failure");
            return RollbackResult::failed(&self.id, reason);
        }

        if state.unchanged.remove(module) {
            let live = state.history.get(module).and_then(|h| h.last().cloned());
            debug!(node = %self.id, %module, "last deploy changed nothing, rollback keeps live version");
            return RollbackResult::succeeded(&self.id, live);
        }

        let Some(history) = state.history.get_mut(module) else {
            return RollbackResult::failed(&self.id, format!("{module} is not installed"));
        };
        history.pop();
        let restored = history.last().cloned();
        if history.is_empty() {
            state.history.remove(module);
        }
        state.health = None;

        debug!(node = %self.id, %module, restored = ?restored, "rolled back");
        RollbackResult::succeeded(&self.id, restored)
    }
}
