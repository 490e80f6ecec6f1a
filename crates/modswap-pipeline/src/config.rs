//! modswap.toml configuration.
//!
//! Every section is optional and falls back to its defaults. Durations
//! are strings such as `"500ms"`, `"10s"`, `"5m"` or `"24h"`.
//!
//! ```toml
//! [lock]
//! ttl = "15m"
//! acquire_timeout = "30s"
//!
//! [strategies]
//! qa = "canary"
//!
//! [canary]
//! initial_percentage = 10
//! increment = 20
//! mode = "adaptive"
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use modswap_fleet::{Environment, StrategyKind};
use modswap_metrics::{GateThresholds, StabilizationConfig};
use modswap_rollout::{BlueGreenConfig, CanaryConfig, RollingConfig, StabilizationMode};

use crate::error::{PipelineError, PipelineResult};

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub lock: LockSection,
    pub approval: ApprovalSection,
    pub audit: AuditSection,
    pub strategies: StrategiesSection,
    pub rolling: RollingSection,
    pub blue_green: BlueGreenSection,
    pub canary: CanarySection,
    pub stabilization: StabilizationSection,
    pub thresholds: GateThresholds,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockSection {
    pub ttl: String,
    pub acquire_timeout: String,
}

impl Default for LockSection {
    fn default() -> Self {
        Self {
            ttl: "15m".to_string(),
            acquire_timeout: "30s".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApprovalSection {
    /// How long an operator has to decide.
    pub timeout: String,
    /// Maximum decisions kept in the decision store.
    pub decision_capacity: usize,
    /// How long decisions are kept.
    pub decision_retention: String,
    /// Environments approved without an operator.
    pub auto_approve: Vec<Environment>,
}

impl Default for ApprovalSection {
    fn default() -> Self {
        Self {
            timeout: "15m".to_string(),
            decision_capacity: 1024,
            decision_retention: "24h".to_string(),
            auto_approve: vec![Environment::Dev, Environment::Qa],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditSection {
    pub timeout: String,
}

impl Default for AuditSection {
    fn default() -> Self {
        Self {
            timeout: "5s".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategiesSection {
    pub dev: StrategyKind,
    pub qa: StrategyKind,
    pub staging: StrategyKind,
    pub production: StrategyKind,
}

impl Default for StrategiesSection {
    fn default() -> Self {
        Self {
            dev: StrategyKind::Direct,
            qa: StrategyKind::Rolling,
            staging: StrategyKind::BlueGreen,
            production: StrategyKind::Canary,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RollingSection {
    pub batch_size: usize,
    pub batch_interval: String,
    pub health_timeout: String,
    pub health_poll_interval: String,
}

impl Default for RollingSection {
    fn default() -> Self {
        Self {
            batch_size: 1,
            batch_interval: "10s".to_string(),
            health_timeout: "30s".to_string(),
            health_poll_interval: "1s".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlueGreenSection {
    pub health_timeout: String,
    pub health_poll_interval: String,
    pub soak: String,
}

impl Default for BlueGreenSection {
    fn default() -> Self {
        Self {
            health_timeout: "30s".to_string(),
            health_poll_interval: "1s".to_string(),
            soak: "30s".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StabilizationKind {
    Adaptive,
    Fixed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CanarySection {
    pub initial_percentage: u32,
    pub increment: u32,
    pub mode: StabilizationKind,
    /// Wait per wave when `mode = "fixed"`.
    pub fixed_wait: String,
}

impl Default for CanarySection {
    fn default() -> Self {
        Self {
            initial_percentage: 10,
            increment: 20,
            mode: StabilizationKind::Adaptive,
            fixed_wait: "60s".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StabilizationSection {
    pub interval: String,
    pub timeout: String,
    pub required_consecutive_stable_checks: u32,
}

impl Default for StabilizationSection {
    fn default() -> Self {
        Self {
            interval: "10s".to_string(),
            timeout: "5m".to_string(),
            required_consecutive_stable_checks: 3,
        }
    }
}

impl PipelineConfig {
    pub fn from_file(path: &Path) -> PipelineResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> PipelineResult<Self> {
        let config: PipelineConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> PipelineResult<String> {
        toml::to_string_pretty(self).map_err(|e| PipelineError::Config(e.to_string()))
    }

    /// Check that every duration parses and every strategy config is sound.
    pub fn validate(&self) -> PipelineResult<()> {
        self.lock_ttl()?;
        self.lock_acquire_timeout()?;
        self.approval_timeout()?;
        self.decision_retention()?;
        self.audit_timeout()?;
        self.rolling_config()?;
        self.blue_green_config()?;
        self.canary_config()?
            .validate()
            .map_err(|e| PipelineError::Config(e.to_string()))?;
        Ok(())
    }

    pub fn lock_ttl(&self) -> PipelineResult<Duration> {
        parse_duration(&self.lock.ttl)
    }

    pub fn lock_acquire_timeout(&self) -> PipelineResult<Duration> {
        parse_duration(&self.lock.acquire_timeout)
    }

    pub fn approval_timeout(&self) -> PipelineResult<Duration> {
        parse_duration(&self.approval.timeout)
    }

    pub fn decision_retention(&self) -> PipelineResult<Duration> {
        parse_duration(&self.approval.decision_retention)
    }

    pub fn audit_timeout(&self) -> PipelineResult<Duration> {
        parse_duration(&self.audit.timeout)
    }

    pub fn environment_strategies(&self) -> [(Environment, StrategyKind); 4] {
        [
            (Environment::Dev, self.strategies.dev),
            (Environment::Qa, self.strategies.qa),
            (Environment::Staging, self.strategies.staging),
            (Environment::Production, self.strategies.production),
        ]
    }

    pub fn rolling_config(&self) -> PipelineResult<RollingConfig> {
        Ok(RollingConfig {
            batch_size: self.rolling.batch_size,
            batch_interval: parse_duration(&self.rolling.batch_interval)?,
            health_timeout: parse_duration(&self.rolling.health_timeout)?,
            health_poll_interval: parse_duration(&self.rolling.health_poll_interval)?,
        })
    }

    pub fn blue_green_config(&self) -> PipelineResult<BlueGreenConfig> {
        Ok(BlueGreenConfig {
            health_timeout: parse_duration(&self.blue_green.health_timeout)?,
            health_poll_interval: parse_duration(&self.blue_green.health_poll_interval)?,
            soak: parse_duration(&self.blue_green.soak)?,
        })
    }

    pub fn stabilization_config(&self) -> PipelineResult<StabilizationConfig> {
        Ok(StabilizationConfig {
            interval: parse_duration(&self.stabilization.interval)?,
            timeout: parse_duration(&self.stabilization.timeout)?,
            required_consecutive_stable_checks: self.stabilization.required_consecutive_stable_checks,
        })
    }

    pub fn canary_config(&self) -> PipelineResult<CanaryConfig> {
        let stabilization = match self.canary.mode {
            StabilizationKind::Adaptive => StabilizationMode::Adaptive(self.stabilization_config()?),
            StabilizationKind::Fixed => StabilizationMode::Fixed {
                wait: parse_duration(&self.canary.fixed_wait)?,
            },
        };
        Ok(CanaryConfig {
            initial_percentage: self.canary.initial_percentage,
            increment: self.canary.increment,
            stabilization,
            thresholds: self.thresholds.clone(),
        })
    }
}

/// Parse `"500ms"`, `"10s"`, `"5m"`, `"2h"`, or a bare number of seconds.
pub fn parse_duration(s: &str) -> PipelineResult<Duration> {
    let s = s.trim();
    let parsed = if let Some(secs) = s.strip_suffix('s') {
        if let Some(ms) = secs.strip_suffix('m') {
            ms.parse::<u64>().ok().map(Duration::from_millis)
        } else {
            secs.parse::<u64>().ok().map(Duration::from_secs)
        }
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.parse::<u64>().ok().and_then(|m| m.checked_mul(60)).map(Duration::from_secs)
    } else if let Some(hours) = s.strip_suffix('h') {
        hours.parse::<u64>().ok().and_then(|h| h.checked_mul(3600)).map(Duration::from_secs)
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    };
    parsed.ok_or_else(|| PipelineError::Config(format!("invalid duration: {s:?}")))
}
