//! Promotion gate: relative-increase thresholds against a baseline.
//!
//! A canary wave is rejected when any metric on the deployed nodes rose
//! by more than its allowed percentage over the baseline. Comparisons
//! are strict: an increase of exactly the limit passes.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::ClusterMetricsSnapshot;

/// Which metric a gate decision refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    ErrorRate,
    Latency,
    Cpu,
    Memory,
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MetricKind::ErrorRate => "error_rate",
            MetricKind::Latency => "latency",
            MetricKind::Cpu => "cpu",
            MetricKind::Memory => "memory",
        };
        f.write_str(s)
    }
}

/// Maximum allowed relative increase per metric, in percent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateThresholds {
    pub max_error_rate_increase_pct: f64,
    pub max_latency_increase_pct: f64,
    pub max_cpu_increase_pct: f64,
    pub max_memory_increase_pct: f64,
}

impl Default for GateThresholds {
    fn default() -> Self {
        Self {
            max_error_rate_increase_pct: 50.0,
            max_latency_increase_pct: 100.0,
            max_cpu_increase_pct: 30.0,
            max_memory_increase_pct: 30.0,
        }
    }
}

/// One metric that exceeded its limit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateViolation {
    pub metric: MetricKind,
    pub baseline: f64,
    pub current: f64,
    pub increase_pct: f64,
    pub limit_pct: f64,
}

impl fmt::Display for GateViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} rose {:.1}% (limit {:.1}%): {:.3} → {:.3}",
            self.metric, self.increase_pct, self.limit_pct, self.baseline, self.current
        )
    }
}

/// Result of comparing a sample to the baseline.
#[derive(Debug, Clone, PartialEq)]
pub enum GateVerdict {
    Pass,
    Reject(Vec<GateViolation>),
}

impl GateVerdict {
    pub fn passed(&self) -> bool {
        matches!(self, GateVerdict::Pass)
    }

    /// Human-readable summary of the violations, empty on pass.
    pub fn describe(&self) -> String {
        match self {
            GateVerdict::Pass => String::new(),
            GateVerdict::Reject(v) => v
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; "),
        }
    }
}

impl GateThresholds {
    /// Compare `current` against `baseline`.
    pub fn evaluate(
        &self,
        baseline: &ClusterMetricsSnapshot,
        current: &ClusterMetricsSnapshot,
    ) -> GateVerdict {
        let checks = [
            (
                MetricKind::ErrorRate,
                baseline.error_rate,
                current.error_rate,
                self.max_error_rate_increase_pct,
            ),
            (
                MetricKind::Latency,
                baseline.latency_ms,
                current.latency_ms,
                self.max_latency_increase_pct,
            ),
            (
                MetricKind::Cpu,
                baseline.cpu_percent,
                current.cpu_percent,
                self.max_cpu_increase_pct,
            ),
            (
                MetricKind::Memory,
                baseline.memory_percent,
                current.memory_percent,
                self.max_memory_increase_pct,
            ),
        ];

        let violations: Vec<GateViolation> = checks
            .into_iter()
            .filter_map(|(metric, base, cur, limit)| {
                let increase_pct = relative_increase(base, cur);
                exceeds(increase_pct, limit).then_some(GateViolation {
                    metric,
                    baseline: base,
                    current: cur,
                    increase_pct,
                    limit_pct: limit,
                })
            })
            .collect();

        if violations.is_empty() {
            GateVerdict::Pass
        } else {
            GateVerdict::Reject(violations)
        }
    }

    /// Shorthand for `evaluate(..).passed()`.
    pub fn within(&self, baseline: &ClusterMetricsSnapshot, current: &ClusterMetricsSnapshot) -> bool {
        self.evaluate(baseline, current).passed()
    }
}

/// Strict `>` against `limit` with a relative tolerance, so an increase
/// of exactly `limit` from decimal inputs (0.9 to 1.35) passes. NaN
/// always violates.
fn exceeds(increase_pct: f64, limit: f64) -> bool {
    if increase_pct.is_nan() {
        return true;
    }
    increase_pct > limit + LIMIT_TOLERANCE * limit.abs().max(1.0)
}

const LIMIT_TOLERANCE: f64 = 1e-9;

/// Relative increase of `current` over `baseline`, in percent.
///
/// A zero baseline yields `0.0` when `current` is also zero, and
/// `f64::INFINITY` when it is not, so any finite limit rejects it.
/// Decreases come back negative.
pub fn relative_increase(baseline: f64, current: f64) -> f64 {
    if baseline == 0.0 {
        if current <= 0.0 {
            return 0.0;
        }
        return f64::INFINITY;
    }
    (current - baseline) * 100.0 / baseline
}
