//! Stabilization waiter: poll node metrics until they settle.
//!
//! After a canary wave succeeds, the deployed nodes must report metrics
//! within the gate thresholds for `required_consecutive_stable_checks`
//! polls in a row before the next wave may start. A single out-of-bounds
//! or failed poll resets the streak. The wait is bounded by `timeout`
//! and aborts immediately when the cancellation token fires.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use modswap_fleet::NodeId;

use crate::gate::GateThresholds;
use crate::source::MetricsSource;
use crate::types::ClusterMetricsSnapshot;

/// Polling parameters for a stabilization wait.
#[derive(Debug, Clone, PartialEq)]
pub struct StabilizationConfig {
    /// Time between polls.
    pub interval: Duration,
    /// Hard upper bound on the whole wait.
    pub timeout: Duration,
    /// In-bounds polls needed in a row.
    pub required_consecutive_stable_checks: u32,
}

impl Default for StabilizationConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            timeout: Duration::from_secs(300),
            required_consecutive_stable_checks: 3,
        }
    }
}

/// Outcome of a stabilization wait.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StabilizationResult {
    pub is_stable: bool,
    pub timeout_reached: bool,
    pub cancelled: bool,
    pub elapsed: Duration,
    pub total_checks: u32,
    pub consecutive_stable_checks: u32,
}

/// Polls a `MetricsSource` until a node set is stable against a baseline.
pub struct StabilizationWaiter {
    source: Arc<dyn MetricsSource>,
    thresholds: GateThresholds,
}

impl StabilizationWaiter {
    pub fn new(source: Arc<dyn MetricsSource>, thresholds: GateThresholds) -> Self {
        Self { source, thresholds }
    }

    /// Wait until `node_ids` report in-bounds metrics for the configured
    /// number of consecutive polls.
    pub async fn wait_for_stable(
        &self,
        node_ids: &[NodeId],
        baseline: &ClusterMetricsSnapshot,
        config: &StabilizationConfig,
        cancel: &CancellationToken,
    ) -> StabilizationResult {
        let start = Instant::now();
        let deadline = start + config.timeout;
        let mut total_checks = 0u32;
        let mut consecutive = 0u32;

        let finish = |stable: bool, timed_out: bool, cancelled: bool, total: u32, streak: u32| {
            StabilizationResult {
                is_stable: stable,
                timeout_reached: timed_out,
                cancelled,
                elapsed: start.elapsed(),
                total_checks: total,
                consecutive_stable_checks: streak,
            }
        };

        debug!(
            nodes = node_ids.len(),
            interval_ms = config.interval.as_millis() as u64,
            timeout_ms = config.timeout.as_millis() as u64,
            required = config.required_consecutive_stable_checks,
            "stabilization wait starting"
        );

        loop {
            if consecutive >= config.required_consecutive_stable_checks {
                info!(checks = total_checks, "metrics stabilized");
                return finish(true, false, false, total_checks, consecutive);
            }

            let next_poll = Instant::now() + config.interval;
            if next_poll > deadline {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        warn!(checks = total_checks, "stabilization wait cancelled");
                        return finish(false, false, true, total_checks, consecutive);
                    }
                    _ = tokio::time::sleep_until(deadline) => {}
                }
                warn!(checks = total_checks, streak = consecutive, "stabilization timed out");
                return finish(false, true, false, total_checks, consecutive);
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    warn!(checks = total_checks, "stabilization wait cancelled");
                    return finish(false, false, true, total_checks, consecutive);
                }
                _ = tokio::time::sleep_until(next_poll) => {}
            }

            let sample = tokio::select! {
                _ = cancel.cancelled() => {
                    warn!(checks = total_checks, "stabilization wait cancelled");
                    return finish(false, false, true, total_checks, consecutive);
                }
                res = tokio::time::timeout_at(deadline, self.source.node_metrics(node_ids)) => res,
            };
            total_checks += 1;

            let stable = match sample {
                Ok(Ok(samples)) => match ClusterMetricsSnapshot::average(&samples) {
                    Some(current) => {
                        let verdict = self.thresholds.evaluate(baseline, &current);
                        if !verdict.passed() {
                            debug!(check = total_checks, violations = %verdict.describe(), "metrics out of bounds");
                        }
                        verdict.passed()
                    }
                    None => {
                        debug!(check = total_checks, "no samples returned");
                        false
                    }
                },
                Ok(Err(e)) => {
                    warn!(check = total_checks, error = %e, "metrics poll failed");
                    false
                }
                Err(_) => {
                    warn!(check = total_checks, "metrics poll hit the stabilization deadline");
                    return finish(false, true, false, total_checks, 0);
                }
            };

            consecutive = if stable { consecutive + 1 } else { 0 };
        }
    }
}
