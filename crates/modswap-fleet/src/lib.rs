//! modswap-fleet: the deployable-target model for modswap.
//!
//! A `Fleet` is an ordered, named set of `WorkerNode`s for one
//! environment. Rollout strategies select nodes from it wave by wave;
//! the pipeline freezes its topology while a deployment is running.
//!
//! # Architecture
//!
//! ```text
//! Fleet (environment + ordered nodes)
//!   ├── TopologyGuard (membership frozen while held)
//!   ├── select_wave() → deterministic next-wave membership
//!   └── Arc<dyn WorkerNode>
//!       ├── deploy(request) → NodeDeploymentResult
//!       └── rollback(module) → RollbackResult
//! ```
//!
//! `SimulatedNode` is an in-memory `WorkerNode` with injectable failures
//! and latency, used by tests and the demo daemon.

pub mod error;
pub mod fleet;
pub mod node;
pub mod simulated;
pub mod types;

pub use error::{FleetError, FleetResult};
pub use fleet::{Fleet, TopologyGuard, batches, select_wave};
pub use node::{NodeRef, WorkerNode};
pub use simulated::SimulatedNode;
pub use types::*;
