//! Fleet: an ordered, named set of worker nodes for one environment.
//!
//! Node membership may only change while no deployment holds the fleet.
//! The pipeline takes a `TopologyGuard` for the lifetime of a run; any
//! `add_node`/`remove_node` attempted while a guard is alive fails with
//! `FleetError::TopologyLocked`.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::{FleetError, FleetResult};
use crate::node::NodeRef;
use crate::types::{Environment, NodeId};

struct FleetInner {
    name: String,
    environment: Environment,
    nodes: RwLock<Vec<NodeRef>>,
    /// Number of live `TopologyGuard`s.
    freezes: AtomicUsize,
}

/// Cheaply cloneable handle to a fleet.
#[derive(Clone)]
pub struct Fleet {
    inner: Arc<FleetInner>,
}

impl std::fmt::Debug for Fleet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fleet")
            .field("name", &self.inner.name)
            .field("environment", &self.inner.environment)
            .field("frozen", &self.is_frozen())
            .finish()
    }
}

impl Fleet {
    /// Create a fleet from an ordered list of nodes. Node ids must be unique.
    pub fn new(name: &str, environment: Environment, nodes: Vec<NodeRef>) -> FleetResult<Self> {
        let mut seen = HashSet::new();
        for node in &nodes {
            if !seen.insert(node.id().to_string()) {
                return Err(FleetError::DuplicateNode(node.id().to_string()));
            }
        }

        info!(fleet = %name, %environment, nodes = nodes.len(), "fleet created");
        Ok(Self {
            inner: Arc::new(FleetInner {
                name: name.to_string(),
                environment,
                nodes: RwLock::new(nodes),
                freezes: AtomicUsize::new(0),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn environment(&self) -> Environment {
        self.inner.environment
    }

    /// Snapshot of the nodes in fleet order.
    pub async fn nodes(&self) -> Vec<NodeRef> {
        self.inner.nodes.read().await.clone()
    }

    pub async fn node_ids(&self) -> Vec<NodeId> {
        self.inner
            .nodes
            .read()
            .await
            .iter()
            .map(|n| n.id().to_string())
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.nodes.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Freeze node membership until the returned guard is dropped.
    ///
    /// Several guards may be held at once (deployments of different
    /// modules to the same fleet); membership is unlocked when the last
    /// one drops.
    pub async fn freeze(&self) -> TopologyGuard {
        // Taking the read lock orders this increment against any
        // in-progress membership change.
        let _nodes = self.inner.nodes.read().await;
        let holders = self.inner.freezes.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(fleet = %self.inner.name, holders, "fleet topology frozen");
        TopologyGuard {
            inner: self.inner.clone(),
        }
    }

    /// Whether any deployment currently holds the topology.
    pub fn is_frozen(&self) -> bool {
        self.inner.freezes.load(Ordering::SeqCst) > 0
    }

    /// Append a node to the fleet.
    pub async fn add_node(&self, node: NodeRef) -> FleetResult<()> {
        let mut nodes = self.inner.nodes.write().await;
        self.ensure_unfrozen()?;
        if nodes.iter().any(|n| n.id() == node.id()) {
            return Err(FleetError::DuplicateNode(node.id().to_string()));
        }
        info!(fleet = %self.inner.name, node = %node.id(), "node added");
        nodes.push(node);
        Ok(())
    }

    /// Remove a node from the fleet, returning it.
    pub async fn remove_node(&self, node_id: &str) -> FleetResult<NodeRef> {
        let mut nodes = self.inner.nodes.write().await;
        self.ensure_unfrozen()?;
        let idx = nodes
            .iter()
            .position(|n| n.id() == node_id)
            .ok_or_else(|| FleetError::NodeNotFound(node_id.to_string()))?;
        info!(fleet = %self.inner.name, node = %node_id, "node removed");
        Ok(nodes.remove(idx))
    }

    fn ensure_unfrozen(&self) -> FleetResult<()> {
        if self.is_frozen() {
            return Err(FleetError::TopologyLocked(self.inner.environment));
        }
        Ok(())
    }
}

/// Keeps a fleet's membership frozen while alive.
pub struct TopologyGuard {
    inner: Arc<FleetInner>,
}

impl Drop for TopologyGuard {
    fn drop(&mut self) {
        let remaining = self.inner.freezes.fetch_sub(1, Ordering::SeqCst) - 1;
        debug!(fleet = %self.inner.name, remaining, "fleet topology guard released");
    }
}

/// Select the next wave: nodes in fleet order that are not yet deployed,
/// enough of them to bring the deployed count up to `target_count`.
///
/// The result depends only on the inputs, so re-running selection with
/// the same deployed set and target yields the same wave.
pub fn select_wave(
    nodes: &[NodeRef],
    already_deployed: &HashSet<NodeId>,
    target_count: usize,
) -> Vec<NodeRef> {
    let target = target_count.min(nodes.len());
    let needed = target.saturating_sub(already_deployed.len());
    nodes
        .iter()
        .filter(|n| !already_deployed.contains(n.id()))
        .take(needed)
        .cloned()
        .collect()
}

/// Split nodes into contiguous batches of `batch_size`. A batch size of
/// zero puts every node in a single batch.
pub fn batches(nodes: &[NodeRef], batch_size: usize) -> Vec<Vec<NodeRef>> {
    if nodes.is_empty() {
        return Vec::new();
    }
    let size = if batch_size == 0 { nodes.len() } else { batch_size };
    nodes.chunks(size).map(|c| c.to_vec()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulated::SimulatedNode;
    use proptest::prelude::*;

    fn nodes(n: usize) -> Vec<NodeRef> {
        (0..n)
            .map(|i| Arc::new(SimulatedNode::new(&format!("node-{i}"))) as NodeRef)
            .collect()
    }

    fn ids(nodes: &[NodeRef]) -> Vec<String> {
        nodes.iter().map(|n| n.id().to_string()).collect()
    }

    #[test]
    fn duplicate_node_ids_rejected() {
        let mut list = nodes(2);
        list.push(Arc::new(SimulatedNode::new("node-0")));
        let err = Fleet::new("prod", Environment::Production, list).unwrap_err();
        assert!(matches!(err, FleetError::DuplicateNode(id) if id == "node-0"));
    }

    #[test]
    fn select_wave_takes_remaining_in_order() {
        let fleet = nodes(5);
        let mut deployed = HashSet::new();

        let wave = select_wave(&fleet, &deployed, 2);
        assert_eq!(ids(&wave), vec!["node-0", "node-1"]);
        deployed.extend(ids(&wave));

        let wave = select_wave(&fleet, &deployed, 4);
        assert_eq!(ids(&wave), vec!["node-2", "node-3"]);
    }

    #[test]
    fn select_wave_is_deterministic() {
        let fleet = nodes(10);
        let deployed: HashSet<String> = ["node-0".to_string(), "node-3".to_string()].into();
        let a = ids(&select_wave(&fleet, &deployed, 5));
        let b = ids(&select_wave(&fleet, &deployed, 5));
        assert_eq!(a, b);
        assert_eq!(a, vec!["node-1", "node-2", "node-4"]);
    }

    #[test]
    fn select_wave_clamps_to_fleet_size() {
        let fleet = nodes(3);
        let wave = select_wave(&fleet, &HashSet::new(), 10);
        assert_eq!(wave.len(), 3);
    }

    #[test]
    fn select_wave_empty_when_target_already_met() {
        let fleet = nodes(3);
        let deployed: HashSet<String> = ["node-0".to_string(), "node-1".to_string()].into();
        assert!(select_wave(&fleet, &deployed, 2).is_empty());
    }

    #[test]
    fn batches_split_contiguously() {
        let fleet = nodes(5);
        let b = batches(&fleet, 2);
        assert_eq!(b.len(), 3);
        assert_eq!(ids(&b[2]), vec!["node-4"]);
    }

    #[test]
    fn zero_batch_size_is_one_batch() {
        let fleet = nodes(4);
        let b = batches(&fleet, 0);
        assert_eq!(b.len(), 1);
        assert_eq!(b[0].len(), 4);
        assert!(batches(&[], 3).is_empty());
    }

    #[tokio::test]
    async fn topology_locked_while_guard_held() {
        let fleet = Fleet::new("qa", Environment::Qa, nodes(2)).unwrap();

        let guard = fleet.freeze().await;
        assert!(fleet.is_frozen());
        let err = fleet
            .add_node(Arc::new(SimulatedNode::new("node-9")))
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::TopologyLocked(Environment::Qa)));
        assert!(fleet.remove_node("node-0").await.is_err());

        drop(guard);
        assert!(!fleet.is_frozen());
        fleet
            .add_node(Arc::new(SimulatedNode::new("node-9")))
            .await
            .unwrap();
        assert_eq!(fleet.len().await, 3);
        fleet.remove_node("node-0").await.unwrap();
        assert_eq!(fleet.node_ids().await, vec!["node-1", "node-9"]);
    }

    #[tokio::test]
    async fn topology_stays_locked_until_last_guard_drops() {
        let fleet = Fleet::new("qa", Environment::Qa, nodes(1)).unwrap();
        let a = fleet.freeze().await;
        let b = fleet.freeze().await;
        drop(a);
        assert!(fleet.is_frozen());
        drop(b);
        assert!(!fleet.is_frozen());
    }

    proptest! {
        #[test]
        fn repeated_selection_never_double_counts(
            size in 1usize..60,
            targets in proptest::collection::vec(0usize..80, 1..12),
        ) {
            let fleet = nodes(size);
            let mut deployed: HashSet<String> = HashSet::new();
            let mut sorted = targets.clone();
            sorted.sort_unstable();

            for target in sorted {
                let wave = select_wave(&fleet, &deployed, target);
                for node in &wave {
                    prop_assert!(deployed.insert(node.id().to_string()));
                }
                prop_assert!(deployed.len() <= size);
                prop_assert!(deployed.len() >= target.min(size));
            }
        }
    }
}
