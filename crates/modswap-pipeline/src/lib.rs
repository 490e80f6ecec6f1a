//! modswap-pipeline: the entry point for deployments.
//!
//! `DeploymentPipeline::execute_deployment` takes a
//! `ModuleDeploymentRequest` through every stage in order and always
//! hands back a finalized `DeploymentResult`.
//!
//! # Architecture
//!
//! ```text
//! DeploymentPipeline
//!   ├── validate      → module name, semver target, registered fleet
//!   ├── LockService   → one deployment per (environment, module)
//!   ├── Fleet::freeze → node membership fixed for the run
//!   ├── ApprovalGate  → staging and production only
//!   ├── StrategyRegistry
//!   │     ├── direct      (dev)
//!   │     ├── rolling     (qa)
//!   │     ├── blue_green  (staging)
//!   │     └── canary      (production)
//!   └── AuditSink     → every finalized result, bounded by a timeout
//! ```

pub mod approval;
pub mod audit;
pub mod config;
pub mod error;
pub mod lock;
pub mod pipeline;
pub mod registry;
pub mod validate;

pub use approval::{
    ApprovalDecision, ApprovalGate, ApprovalTicket, AutoApprovalGate, ChannelApprovalGate,
    DecisionRecord, DecisionStore,
};
pub use audit::{AuditSink, MemoryAuditSink, TracingAuditSink};
pub use config::{PipelineConfig, parse_duration};
pub use error::{PipelineError, PipelineResult, ValidationError};
pub use lock::{InMemoryLockService, LockError, LockHandle, LockKey, LockService};
pub use pipeline::DeploymentPipeline;
pub use registry::StrategyRegistry;
pub use validate::{validate_module_name, validate_request, validate_version};
