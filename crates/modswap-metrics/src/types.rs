//! Metric sample types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use modswap_fleet::NodeId;

/// Point-in-time averages across a cluster or a node set.
///
/// Captured once before the first wave as the baseline, and again after
/// each wave from the deployed nodes for comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterMetricsSnapshot {
    /// Average CPU utilisation, 0-100.
    pub cpu_percent: f64,
    /// Average memory utilisation, 0-100.
    pub memory_percent: f64,
    /// Average request latency in milliseconds.
    pub latency_ms: f64,
    /// Errors per request, as a percentage.
    pub error_rate: f64,
    pub captured_at: DateTime<Utc>,
}

impl ClusterMetricsSnapshot {
    pub fn new(cpu_percent: f64, memory_percent: f64, latency_ms: f64, error_rate: f64) -> Self {
        Self {
            cpu_percent,
            memory_percent,
            latency_ms,
            error_rate,
            captured_at: Utc::now(),
        }
    }

    /// Average a set of node samples. Returns `None` for an empty set.
    pub fn average(samples: &[NodeMetrics]) -> Option<Self> {
        if samples.is_empty() {
            return None;
        }
        let n = samples.len() as f64;
        let sum = |f: fn(&NodeMetrics) -> f64| samples.iter().map(f).sum::<f64>() / n;
        Some(Self::new(
            sum(|m| m.cpu_percent),
            sum(|m| m.memory_percent),
            sum(|m| m.latency_ms),
            sum(|m| m.error_rate),
        ))
    }
}

/// Metrics reported by a single node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeMetrics {
    pub node_id: NodeId,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub latency_ms: f64,
    pub error_rate: f64,
}

impl NodeMetrics {
    pub fn new(
        node_id: &str,
        cpu_percent: f64,
        memory_percent: f64,
        latency_ms: f64,
        error_rate: f64,
    ) -> Self {
        Self {
            node_id: node_id.to_string(),
            cpu_percent,
            memory_percent,
            latency_ms,
            error_rate,
        }
    }

    /// A node sample with the same values as a cluster snapshot.
    pub fn matching(node_id: &str, snapshot: &ClusterMetricsSnapshot) -> Self {
        Self::new(
            node_id,
            snapshot.cpu_percent,
            snapshot.memory_percent,
            snapshot.latency_ms,
            snapshot.error_rate,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn average_of_empty_is_none() {
        assert!(ClusterMetricsSnapshot::average(&[]).is_none());
    }

    #[test]
    fn average_of_samples() {
        let samples = vec![
            NodeMetrics::new("a", 10.0, 40.0, 100.0, 1.0),
            NodeMetrics::new("b", 30.0, 60.0, 200.0, 3.0),
        ];
        let avg = ClusterMetricsSnapshot::average(&samples).unwrap();
        assert_eq!(avg.cpu_percent, 20.0);
        assert_eq!(avg.memory_percent, 50.0);
        assert_eq!(avg.latency_ms, 150.0);
        assert_eq!(avg.error_rate, 2.0);
    }
}
