//! Progress notifications for in-flight deployments.

use serde::Serialize;

use modswap_fleet::{NodeId, StrategyKind};

use crate::blue_green::Slot;
use crate::result::DeploymentStatus;

/// An update published while a deployment runs.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    Started {
        strategy: StrategyKind,
        nodes: usize,
    },
    BaselineCaptured {
        cpu_percent: f64,
        memory_percent: f64,
        latency_ms: f64,
        error_rate: f64,
    },
    WaveStarted {
        wave: u32,
        nodes: Vec<NodeId>,
        target_count: usize,
    },
    WaveCompleted {
        wave: u32,
        succeeded: usize,
        failed: usize,
    },
    Stabilizing {
        wave: u32,
    },
    GateEvaluated {
        wave: u32,
        passed: bool,
        detail: String,
    },
    TrafficSwitched {
        to: Slot,
        generation: u64,
    },
    RollbackStarted {
        nodes: Vec<NodeId>,
    },
    Finished {
        status: DeploymentStatus,
    },
}
