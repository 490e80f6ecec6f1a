//! Deployment results: what happened, node by node and wave by wave.
//!
//! A `DeploymentResult` is created when a run starts, filled in as waves
//! and rollbacks complete, and frozen by `finalize`. Every mutator
//! checks the freeze and fails with `RolloutError::Finalized` afterwards.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use modswap_fleet::{
    Environment, ModuleDeploymentRequest, NodeDeploymentResult, NodeId, RollbackResult,
    StrategyKind,
};

use crate::error::{RolloutError, RolloutResult};

/// Terminal (or in-progress) status of a deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    /// Not finalized yet.
    InProgress,
    /// Every node runs the target version.
    Succeeded,
    /// Failed with nothing to roll back.
    Failed,
    /// Failed and every deployed node was reverted.
    RolledBack,
    /// Failed and at least one node could not be reverted. Needs an operator.
    RollbackFailed,
    /// Aborted by cancellation; partial state was reverted.
    Cancelled,
    /// Approval was denied or timed out.
    Rejected,
    /// The deployment lock could not be acquired in time. Retryable.
    LockTimeout,
    /// The request was malformed. Nothing was touched.
    InvalidRequest,
}

impl DeploymentStatus {
    pub fn is_terminal(self) -> bool {
        self != DeploymentStatus::InProgress
    }
}

/// Aggregate outcome of a rollback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackOutcome {
    NotNeeded,
    Complete,
    Partial,
    Failed,
}

impl RollbackOutcome {
    pub fn from_results(results: &[RollbackResult]) -> Self {
        if results.is_empty() {
            return RollbackOutcome::NotNeeded;
        }
        let ok = results.iter().filter(|r| r.success).count();
        if ok == results.len() {
            RollbackOutcome::Complete
        } else if ok == 0 {
            RollbackOutcome::Failed
        } else {
            RollbackOutcome::Partial
        }
    }

    /// Whether every node that needed reverting was reverted.
    pub fn is_clean(self) -> bool {
        matches!(self, RollbackOutcome::NotNeeded | RollbackOutcome::Complete)
    }
}

/// One wave (or batch) of a deployment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaveRecord {
    /// 1-based wave number.
    pub index: u32,
    /// Canary percentage for this wave, if the strategy is percentage-driven.
    pub percentage: Option<u32>,
    /// Cumulative node count this wave aimed for.
    pub target_count: usize,
    /// Nodes dispatched in this wave, in fleet order.
    pub node_ids: Vec<NodeId>,
    pub succeeded: usize,
    pub failed: usize,
}

/// Full record of one deployment run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentResult {
    deployment_id: Uuid,
    strategy: StrategyKind,
    environment: Environment,
    module_name: String,
    target_version: String,
    status: DeploymentStatus,
    success: bool,
    node_results: Vec<NodeDeploymentResult>,
    rolled_back: bool,
    rollback_outcome: RollbackOutcome,
    rollback_results: Vec<RollbackResult>,
    waves: Vec<WaveRecord>,
    message: Option<String>,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
}

impl DeploymentResult {
    /// Start a result for a run.
    pub fn begin(deployment_id: Uuid, request: &ModuleDeploymentRequest, strategy: StrategyKind) -> Self {
        Self {
            deployment_id,
            strategy,
            environment: request.environment,
            module_name: request.module_name.clone(),
            target_version: request.target_version.clone(),
            status: DeploymentStatus::InProgress,
            success: false,
            node_results: Vec::new(),
            rolled_back: false,
            rollback_outcome: RollbackOutcome::NotNeeded,
            rollback_results: Vec::new(),
            waves: Vec::new(),
            message: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    /// A result that ended before any strategy ran.
    pub fn terminal(
        deployment_id: Uuid,
        request: &ModuleDeploymentRequest,
        strategy: StrategyKind,
        status: DeploymentStatus,
        message: impl Into<String>,
    ) -> RolloutResult<Self> {
        Self::begin(deployment_id, request, strategy).finalize(status, Some(message.into()))
    }

    pub fn deployment_id(&self) -> Uuid {
        self.deployment_id
    }

    pub fn strategy(&self) -> StrategyKind {
        self.strategy
    }

    pub fn environment(&self) -> Environment {
        self.environment
    }

    pub fn module_name(&self) -> &str {
        &self.module_name
    }

    pub fn target_version(&self) -> &str {
        &self.target_version
    }

    pub fn status(&self) -> DeploymentStatus {
        self.status
    }

    pub fn success(&self) -> bool {
        self.success
    }

    pub fn node_results(&self) -> &[NodeDeploymentResult] {
        &self.node_results
    }

    pub fn rolled_back(&self) -> bool {
        self.rolled_back
    }

    pub fn rollback_outcome(&self) -> RollbackOutcome {
        self.rollback_outcome
    }

    pub fn rollback_results(&self) -> &[RollbackResult] {
        &self.rollback_results
    }

    pub fn waves(&self) -> &[WaveRecord] {
        &self.waves
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    pub fn is_finalized(&self) -> bool {
        self.finished_at.is_some()
    }

    /// Nodes whose deploy succeeded, in the order they were deployed.
    pub fn deployed_node_ids(&self) -> Vec<NodeId> {
        self.node_results
            .iter()
            .filter(|r| r.success)
            .map(|r| r.node_id.clone())
            .collect()
    }

    /// Node ids that were rolled back successfully.
    pub fn rolled_back_node_ids(&self) -> Vec<NodeId> {
        self.rollback_results
            .iter()
            .filter(|r| r.success)
            .map(|r| r.node_id.clone())
            .collect()
    }

    /// Record the results of a wave.
    ///
    /// Fails with `Invariant` if a node that already deployed successfully
    /// is dispatched again.
    pub fn record_wave(
        &mut self,
        percentage: Option<u32>,
        target_count: usize,
        results: Vec<NodeDeploymentResult>,
    ) -> RolloutResult<&WaveRecord> {
        self.ensure_open()?;

        let already: HashSet<&str> = self
            .node_results
            .iter()
            .filter(|r| r.success)
            .map(|r| r.node_id.as_str())
            .collect();
        if let Some(dup) = results.iter().find(|r| already.contains(r.node_id.as_str())) {
            return Err(RolloutError::Invariant(format!(
                "node {} dispatched in more than one wave",
                dup.node_id
            )));
        }

        let succeeded = results.iter().filter(|r| r.success).count();
        let record = WaveRecord {
            index: self.waves.len() as u32 + 1,
            percentage,
            target_count,
            node_ids: results.iter().map(|r| r.node_id.clone()).collect(),
            succeeded,
            failed: results.len() - succeeded,
        };
        self.node_results.extend(results);
        self.waves.push(record);
        Ok(&self.waves[self.waves.len() - 1])
    }

    /// Record node-level rollback results and return the aggregate outcome.
    pub fn record_rollback(&mut self, results: Vec<RollbackResult>) -> RolloutResult<RollbackOutcome> {
        self.ensure_open()?;
        if !results.is_empty() {
            self.rolled_back = true;
        }
        self.rollback_results.extend(results);
        self.rollback_outcome = RollbackOutcome::from_results(&self.rollback_results);
        Ok(self.rollback_outcome)
    }

    /// Record a rollback that reverted a traffic pointer instead of nodes.
    pub fn record_pointer_revert(&mut self) -> RolloutResult<()> {
        self.ensure_open()?;
        self.rolled_back = true;
        self.rollback_outcome = RollbackOutcome::Complete;
        Ok(())
    }

    /// Freeze the result with its terminal status.
    pub fn finalize(mut self, status: DeploymentStatus, message: Option<String>) -> RolloutResult<Self> {
        self.ensure_open()?;
        if !status.is_terminal() {
            return Err(RolloutError::Invariant(
                "cannot finalize a deployment as in-progress".to_string(),
            ));
        }
        self.status = status;
        self.success = status == DeploymentStatus::Succeeded;
        self.message = message;
        self.finished_at = Some(Utc::now());
        Ok(self)
    }

    fn ensure_open(&self) -> RolloutResult<()> {
        if self.is_finalized() {
            return Err(RolloutError::Finalized(self.deployment_id));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> ModuleDeploymentRequest {
        ModuleDeploymentRequest::new("payments", "2.0.0", Environment::Production)
    }

    fn ok(id: &str) -> NodeDeploymentResult {
        NodeDeploymentResult::succeeded(id, Some("1.0.0".into()), "2.0.0")
    }

    fn failed(id: &str) -> NodeDeploymentResult {
        NodeDeploymentResult::failed(id, Some("1.0.0".into()), "refused")
    }

    #[test]
    fn rollback_outcome_classification() {
        assert_eq!(RollbackOutcome::from_results(&[]), RollbackOutcome::NotNeeded);
        assert_eq!(
            RollbackOutcome::from_results(&[RollbackResult::succeeded("a", None)]),
            RollbackOutcome::Complete
        );
        assert_eq!(
            RollbackOutcome::from_results(&[
                RollbackResult::succeeded("a", None),
                RollbackResult::failed("b", "x"),
            ]),
            RollbackOutcome::Partial
        );
        assert_eq!(
            RollbackOutcome::from_results(&[RollbackResult::failed("b", "x")]),
            RollbackOutcome::Failed
        );
    }

    #[test]
    fn waves_are_numbered_and_counted() {
        let mut result = DeploymentResult::begin(Uuid::new_v4(), &request(), StrategyKind::Canary);
        result.record_wave(Some(10), 1, vec![ok("a")]).unwrap();
        let wave = result
            .record_wave(Some(30), 3, vec![ok("b"), failed("c")])
            .unwrap()
            .clone();

        assert_eq!(wave.index, 2);
        assert_eq!(wave.succeeded, 1);
        assert_eq!(wave.failed, 1);
        assert_eq!(result.deployed_node_ids(), vec!["a", "b"]);
    }

    #[test]
    fn redeploying_a_node_in_a_later_wave_is_an_invariant_violation() {
        let mut result = DeploymentResult::begin(Uuid::new_v4(), &request(), StrategyKind::Canary);
        result.record_wave(Some(10), 1, vec![ok("a")]).unwrap();
        let err = result.record_wave(Some(30), 2, vec![ok("a")]).unwrap_err();
        assert!(matches!(err, RolloutError::Invariant(_)));
    }

    #[test]
    fn finalized_result_is_frozen() {
        let result = DeploymentResult::begin(Uuid::new_v4(), &request(), StrategyKind::Direct);
        let mut result = result.finalize(DeploymentStatus::Succeeded, None).unwrap();
        assert!(result.success());
        assert!(result.finished_at().is_some());

        assert!(matches!(
            result.record_wave(None, 1, vec![ok("a")]),
            Err(RolloutError::Finalized(_))
        ));
        assert!(result.record_rollback(vec![]).is_err());
        assert!(result.clone().finalize(DeploymentStatus::Failed, None).is_err());
    }

    #[test]
    fn cannot_finalize_as_in_progress() {
        let result = DeploymentResult::begin(Uuid::new_v4(), &request(), StrategyKind::Direct);
        assert!(result.finalize(DeploymentStatus::InProgress, None).is_err());
    }

    #[test]
    fn partial_rollback_is_recorded() {
        let mut result = DeploymentResult::begin(Uuid::new_v4(), &request(), StrategyKind::Rolling);
        let outcome = result
            .record_rollback(vec![
                RollbackResult::succeeded("a", Some("1.0.0".into())),
                RollbackResult::failed("b", "disk full"),
            ])
            .unwrap();
        assert_eq!(outcome, RollbackOutcome::Partial);
        assert!(result.rolled_back());
        assert_eq!(result.rolled_back_node_ids(), vec!["a"]);
    }

    #[test]
    fn serializes_with_snake_case_status() {
        let result = DeploymentResult::terminal(
            Uuid::new_v4(),
            &request(),
            StrategyKind::BlueGreen,
            DeploymentStatus::RollbackFailed,
            "node b stuck",
        )
        .unwrap();
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["status"], "rollback_failed");
        assert_eq!(json["strategy"], "blue_green");
        assert_eq!(json["success"], false);
    }
}
