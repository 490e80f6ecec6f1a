//! modswap-metrics: metric inputs for canary promotion.
//!
//! Supplies the `MetricsSource` contract the rollout engine reads from,
//! the relative-increase gate that decides whether a canary wave may be
//! promoted, and the `StabilizationWaiter` that polls until metrics
//! settle near a baseline.
//!
//! # Architecture
//!
//! ```text
//! MetricsSource (trait)
//!   ├── snapshot(environment) → ClusterMetricsSnapshot (baseline)
//!   └── node_metrics(node_ids) → Vec<NodeMetrics>
//!
//! GateThresholds::evaluate(baseline, current) → GateVerdict
//!
//! StabilizationWaiter
//!   └── wait_for_stable() → poll every interval until K consecutive
//!       in-bounds samples, timeout, or cancellation
//! ```

pub mod error;
pub mod gate;
pub mod memory;
pub mod source;
pub mod stabilization;
pub mod types;

pub use error::{MetricsError, MetricsResult};
pub use gate::{GateThresholds, GateVerdict, GateViolation, MetricKind, relative_increase};
pub use memory::InMemoryMetricsSource;
pub use source::MetricsSource;
pub use stabilization::{StabilizationConfig, StabilizationResult, StabilizationWaiter};
pub use types::{ClusterMetricsSnapshot, NodeMetrics};
