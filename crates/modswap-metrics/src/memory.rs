//! In-memory `MetricsSource` with scriptable samples.
//!
//! Each node can be given a script of samples; every `node_metrics` call
//! consumes one, and the last sample sticks. Nodes without a script
//! report the default sample if one is set.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use modswap_fleet::{Environment, NodeId};

use crate::error::{MetricsError, MetricsResult};
use crate::source::MetricsSource;
use crate::types::{ClusterMetricsSnapshot, NodeMetrics};

#[derive(Default)]
struct Inner {
    clusters: HashMap<Environment, ClusterMetricsSnapshot>,
    scripts: HashMap<NodeId, VecDeque<NodeMetrics>>,
    default_sample: Option<ClusterMetricsSnapshot>,
    unavailable: Option<String>,
}

/// Settable metrics for tests and dry runs.
#[derive(Default)]
pub struct InMemoryMetricsSource {
    inner: Mutex<Inner>,
    snapshot_calls: AtomicU64,
    node_calls: AtomicU64,
}

impl InMemoryMetricsSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every environment and every node reports `sample`.
    pub fn uniform(sample: ClusterMetricsSnapshot) -> Self {
        let mut source = Self::new();
        source.inner.get_mut().default_sample = Some(sample);
        source
    }

    pub async fn set_cluster(&self, environment: Environment, snapshot: ClusterMetricsSnapshot) {
        self.inner.lock().await.clusters.insert(environment, snapshot);
    }

    /// Fixed metrics for one node.
    pub async fn set_node(&self, metrics: NodeMetrics) {
        let id = metrics.node_id.clone();
        self.inner
            .lock()
            .await
            .scripts
            .insert(id, VecDeque::from([metrics]));
    }

    /// A sequence of samples for one node, consumed one per poll.
    pub async fn script_node(&self, node_id: &str, samples: Vec<NodeMetrics>) {
        self.inner
            .lock()
            .await
            .scripts
            .insert(node_id.to_string(), samples.into());
    }

    /// Sample reported for environments and nodes with no explicit data.
    pub async fn set_default(&self, sample: ClusterMetricsSnapshot) {
        self.inner.lock().await.default_sample = Some(sample);
    }

    /// Make every call fail with `MetricsError::Unavailable`.
    pub async fn set_unavailable(&self, reason: Option<&str>) {
        self.inner.lock().await.unavailable = reason.map(str::to_string);
    }

    pub fn snapshot_calls(&self) -> u64 {
        self.snapshot_calls.load(Ordering::Relaxed)
    }

    pub fn node_metrics_calls(&self) -> u64 {
        self.node_calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl MetricsSource for InMemoryMetricsSource {
    async fn snapshot(&self, environment: Environment) -> MetricsResult<ClusterMetricsSnapshot> {
        self.snapshot_calls.fetch_add(1, Ordering::Relaxed);
        let inner = self.inner.lock().await;
        if let Some(reason) = &inner.unavailable {
            return Err(MetricsError::Unavailable(reason.clone()));
        }
        inner
            .clusters
            .get(&environment)
            .or(inner.default_sample.as_ref())
            .cloned()
            .ok_or_else(|| MetricsError::Unavailable(format!("no cluster metrics for {environment}")))
    }

    async fn node_metrics(&self, node_ids: &[NodeId]) -> MetricsResult<Vec<NodeMetrics>> {
        self.node_calls.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock().await;
        if let Some(reason) = &inner.unavailable {
            return Err(MetricsError::Unavailable(reason.clone()));
        }

        let default_sample = inner.default_sample.clone();
        let mut samples = Vec::with_capacity(node_ids.len());
        for id in node_ids {
            match inner.scripts.get_mut(id) {
                Some(script) if script.len() > 1 => samples.extend(script.pop_front()),
                Some(script) => samples.extend(script.front().cloned()),
                None => {
                    if let Some(sample) = &default_sample {
                        samples.push(NodeMetrics::matching(id, sample));
                    }
                }
            }
        }

        debug!(requested = node_ids.len(), returned = samples.len(), "node metrics served");
        Ok(samples)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn script_advances_then_sticks() {
        let source = InMemoryMetricsSource::new();
        source
            .script_node(
                "n1",
                vec![
                    NodeMetrics::new("n1", 90.0, 0.0, 0.0, 0.0),
                    NodeMetrics::new("n1", 10.0, 0.0, 0.0, 0.0),
                ],
            )
            .await;

        let ids = vec!["n1".to_string()];
        assert_eq!(source.node_metrics(&ids).await.unwrap()[0].cpu_percent, 90.0);
        assert_eq!(source.node_metrics(&ids).await.unwrap()[0].cpu_percent, 10.0);
        assert_eq!(source.node_metrics(&ids).await.unwrap()[0].cpu_percent, 10.0);
        assert_eq!(source.node_metrics_calls(), 3);
    }

    #[tokio::test]
    async fn uniform_source_serves_every_node_and_environment() {
        let source = InMemoryMetricsSource::uniform(ClusterMetricsSnapshot::new(20.0, 30.0, 50.0, 1.0));
        let snap = source.snapshot(Environment::Production).await.unwrap();
        assert_eq!(snap.latency_ms, 50.0);

        let samples = source
            .node_metrics(&["a".to_string(), "b".to_string()])
            .await
            .unwrap();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[1].node_id, "b");
    }

    #[tokio::test]
    async fn missing_cluster_metrics_is_unavailable() {
        let source = InMemoryMetricsSource::new();
        let err = source.snapshot(Environment::Dev).await.unwrap_err();
        assert!(matches!(err, MetricsError::Unavailable(_)));
        assert!(source.node_metrics(&["x".to_string()]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unavailable_source_fails_every_call() {
        let source = InMemoryMetricsSource::uniform(ClusterMetricsSnapshot::new(1.0, 1.0, 1.0, 0.0));
        source.set_unavailable(Some("scrape failed")).await;
        assert!(source.snapshot(Environment::Qa).await.is_err());
        assert!(source.node_metrics(&["a".to_string()]).await.is_err());
    }
}
