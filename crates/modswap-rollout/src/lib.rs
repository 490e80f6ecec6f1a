//! modswap-rollout: the deployment-wave state machines.
//!
//! Every strategy implements one flat contract, `DeploymentStrategy`,
//! and is looked up by its `StrategyKind` tag. Strategies deploy waves
//! of nodes in parallel, collect every result before moving on, and roll
//! back exactly the nodes they deployed when something goes wrong.
//!
//! # Components
//!
//! - **`strategy`**: the contract, per-run context, strategy configs
//! - **`result`**: `DeploymentResult`, terminal status, rollback outcome
//! - **`planner`**: canary wave targets
//! - **`executor`**: parallel wave fan-out, rollback fan-out, health waits
//! - **`direct`**, **`rolling`**, **`blue_green`**, **`canary`**: the strategies
//! - **`progress`**: in-flight events for callers that want them

pub mod blue_green;
pub mod canary;
pub mod direct;
pub mod error;
pub mod executor;
pub mod planner;
pub mod progress;
pub mod result;
pub mod rolling;
pub mod strategy;

#[cfg(test)]
mod testing;

pub use blue_green::{BlueGreenStrategy, Slot, TrafficRouter};
pub use canary::{CanaryPhase, CanaryStrategy};
pub use direct::DirectStrategy;
pub use error::{RolloutError, RolloutResult};
pub use planner::{WavePlan, plan_waves, target_count};
pub use progress::ProgressEvent;
pub use result::{DeploymentResult, DeploymentStatus, RollbackOutcome, WaveRecord};
pub use rolling::RollingStrategy;
pub use strategy::{
    BlueGreenConfig, CanaryConfig, DeploymentStrategy, RollingConfig, StabilizationMode,
    StrategyContext,
};
