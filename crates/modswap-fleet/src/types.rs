//! Domain types shared by every modswap crate.
//!
//! Requests flow in from callers, node results flow back out of
//! `WorkerNode` calls. All types serialize to JSON so the pipeline can
//! hand finalized results to an audit sink unchanged.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Unique identifier for a worker node.
pub type NodeId = String;

// ── Environment ────────────────────────────────────────────────────

/// Deployment environment a fleet belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    Dev,
    Qa,
    Staging,
    Production,
}

impl Environment {
    pub const ALL: [Environment; 4] = [
        Environment::Dev,
        Environment::Qa,
        Environment::Staging,
        Environment::Production,
    ];

    /// Whether deployments to this environment need an approval decision.
    pub fn requires_approval(self) -> bool {
        matches!(self, Environment::Staging | Environment::Production)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Environment::Dev => "dev",
            Environment::Qa => "qa",
            Environment::Staging => "staging",
            Environment::Production => "production",
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "dev" | "development" => Ok(Environment::Dev),
            "qa" => Ok(Environment::Qa),
            "staging" => Ok(Environment::Staging),
            "prod" | "production" => Ok(Environment::Production),
            other => Err(format!("unknown environment: {other}")),
        }
    }
}

// ── Strategy tag ───────────────────────────────────────────────────

/// Rollout strategy selector. Strategies are looked up by this tag in
/// the pipeline's registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    /// Every node at once.
    Direct,
    /// Fixed-size batches with health checks in between.
    Rolling,
    /// Deploy to the idle set, then flip the traffic pointer.
    BlueGreen,
    /// Percentage waves gated on metrics.
    Canary,
}

impl StrategyKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StrategyKind::Direct => "direct",
            StrategyKind::Rolling => "rolling",
            StrategyKind::BlueGreen => "blue_green",
            StrategyKind::Canary => "canary",
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StrategyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "direct" => Ok(StrategyKind::Direct),
            "rolling" => Ok(StrategyKind::Rolling),
            "blue_green" | "bluegreen" => Ok(StrategyKind::BlueGreen),
            "canary" => Ok(StrategyKind::Canary),
            other => Err(format!("unknown strategy: {other}")),
        }
    }
}

// ── Request ────────────────────────────────────────────────────────

/// A request to install `target_version` of `module_name` across the
/// fleet of `environment`. Built once by a caller and consumed once by
/// the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleDeploymentRequest {
    pub module_name: String,
    pub target_version: String,
    pub environment: Environment,
    /// Arbitrary module configuration passed through to nodes.
    #[serde(default)]
    pub config: HashMap<String, String>,
    /// Use this strategy instead of the environment's default.
    #[serde(default)]
    pub strategy_override: Option<StrategyKind>,
}

impl ModuleDeploymentRequest {
    pub fn new(module_name: &str, target_version: &str, environment: Environment) -> Self {
        Self {
            module_name: module_name.to_string(),
            target_version: target_version.to_string(),
            environment,
            config: HashMap::new(),
            strategy_override: None,
        }
    }

    pub fn with_config(mut self, key: &str, value: &str) -> Self {
        self.config.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_strategy(mut self, strategy: StrategyKind) -> Self {
        self.strategy_override = Some(strategy);
        self
    }
}

// ── Node status and results ────────────────────────────────────────

/// Health reported by a worker node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeHealth {
    Healthy,
    Degraded,
    Unhealthy,
    Unknown,
}

/// Outcome of deploying a module to one node.
///
/// Expected failures (network, validation) are carried here with
/// `success == false`; they are never raised as errors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDeploymentResult {
    pub node_id: NodeId,
    pub success: bool,
    pub message: String,
    /// Version installed before this deploy, if any.
    pub previous_version: Option<String>,
    /// Version installed after this deploy.
    pub installed_version: Option<String>,
}

impl NodeDeploymentResult {
    pub fn succeeded(node_id: &str, previous: Option<String>, installed: &str) -> Self {
        Self {
            node_id: node_id.to_string(),
            success: true,
            message: format!("installed {installed}"),
            previous_version: previous,
            installed_version: Some(installed.to_string()),
        }
    }

    pub fn failed(node_id: &str, previous: Option<String>, message: impl Into<String>) -> Self {
        Self {
            node_id: node_id.to_string(),
            success: false,
            message: message.into(),
            installed_version: previous.clone(),
            previous_version: previous,
        }
    }
}

/// Outcome of rolling a module back on one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackResult {
    pub node_id: NodeId,
    pub success: bool,
    pub message: String,
    /// Version active after the rollback.
    pub restored_version: Option<String>,
}

impl RollbackResult {
    pub fn succeeded(node_id: &str, restored: Option<String>) -> Self {
        let message = match &restored {
            Some(v) => format!("restored {v}"),
            None => "module removed".to_string(),
        };
        Self {
            node_id: node_id.to_string(),
            success: true,
            message,
            restored_version: restored,
        }
    }

    pub fn failed(node_id: &str, message: impl Into<String>) -> Self {
        Self {
            node_id: node_id.to_string(),
            success: false,
            message: message.into(),
            restored_version: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn approval_required_for_staging_and_production() {
        assert!(!Environment::Dev.requires_approval());
        assert!(!Environment::Qa.requires_approval());
        assert!(Environment::Staging.requires_approval());
        assert!(Environment::Production.requires_approval());
    }

    #[test]
    fn environment_parses_aliases() {
        assert_eq!("prod".parse::<Environment>().unwrap(), Environment::Production);
        assert_eq!(" QA ".parse::<Environment>().unwrap(), Environment::Qa);
        assert!("moon".parse::<Environment>().is_err());
    }

    #[test]
    fn strategy_kind_parses_dashed_form() {
        assert_eq!("blue-green".parse::<StrategyKind>().unwrap(), StrategyKind::BlueGreen);
        assert_eq!("Canary".parse::<StrategyKind>().unwrap(), StrategyKind::Canary);
    }

    #[test]
    fn request_deserializes_without_optional_fields() {
        let json = r#"{"module_name":"payments","target_version":"1.2.0","environment":"production"}"#;
        let req: ModuleDeploymentRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.environment, Environment::Production);
        assert!(req.config.is_empty());
        assert!(req.strategy_override.is_none());
    }

    #[test]
    fn failed_node_result_keeps_previous_version_installed() {
        let r = NodeDeploymentResult::failed("n1", Some("1.0.0".into()), "connection reset");
        assert!(!r.success);
        assert_eq!(r.installed_version.as_deref(), Some("1.0.0"));
    }
}
