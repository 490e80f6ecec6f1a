//! Strategy registry: strategies by tag, defaults by environment.

use std::collections::HashMap;
use std::sync::Arc;

use modswap_fleet::{Environment, ModuleDeploymentRequest, StrategyKind};
use modswap_rollout::{
    BlueGreenConfig, BlueGreenStrategy, CanaryConfig, CanaryStrategy, DeploymentStrategy,
    DirectStrategy, RollingConfig, RollingStrategy, RolloutResult, TrafficRouter,
};

/// Maps strategy tags to implementations and environments to tags.
///
/// | environment | default strategy |
/// |---|---|
/// | dev | direct |
/// | qa | rolling |
/// | staging | blue_green |
/// | production | canary |
pub struct StrategyRegistry {
    strategies: HashMap<StrategyKind, Arc<dyn DeploymentStrategy>>,
    by_environment: HashMap<Environment, StrategyKind>,
}

impl StrategyRegistry {
    /// A registry with the default environment mapping and no strategies.
    pub fn empty() -> Self {
        let by_environment = Environment::ALL
            .iter()
            .map(|&env| (env, default_strategy(env)))
            .collect();
        Self {
            strategies: HashMap::new(),
            by_environment,
        }
    }

    /// A registry with all four strategies on their default settings.
    pub fn with_defaults(router: Arc<TrafficRouter>) -> RolloutResult<Self> {
        Self::with_configs(
            RollingConfig::default(),
            BlueGreenConfig::default(),
            CanaryConfig::default(),
            router,
        )
    }

    pub fn with_configs(
        rolling: RollingConfig,
        blue_green: BlueGreenConfig,
        canary: CanaryConfig,
        router: Arc<TrafficRouter>,
    ) -> RolloutResult<Self> {
        let mut registry = Self::empty();
        registry.register(Arc::new(DirectStrategy::new()));
        registry.register(Arc::new(RollingStrategy::new(rolling)));
        registry.register(Arc::new(BlueGreenStrategy::new(blue_green, router)));
        registry.register(Arc::new(CanaryStrategy::new(canary)?));
        Ok(registry)
    }

    /// Register a strategy under its own tag, replacing any previous one.
    pub fn register(&mut self, strategy: Arc<dyn DeploymentStrategy>) -> Option<Arc<dyn DeploymentStrategy>> {
        self.strategies.insert(strategy.kind(), strategy)
    }

    pub fn set_environment_strategy(&mut self, environment: Environment, kind: StrategyKind) {
        self.by_environment.insert(environment, kind);
    }

    pub fn strategy_for_environment(&self, environment: Environment) -> StrategyKind {
        self.by_environment
            .get(&environment)
            .copied()
            .unwrap_or_else(|| default_strategy(environment))
    }

    /// The tag a request will run under: its override, else its
    /// environment's strategy.
    pub fn kind_for(&self, request: &ModuleDeploymentRequest) -> StrategyKind {
        request
            .strategy_override
            .unwrap_or_else(|| self.strategy_for_environment(request.environment))
    }

    pub fn get(&self, kind: StrategyKind) -> Option<Arc<dyn DeploymentStrategy>> {
        self.strategies.get(&kind).cloned()
    }

    pub fn resolve(&self, request: &ModuleDeploymentRequest) -> Option<Arc<dyn DeploymentStrategy>> {
        self.get(self.kind_for(request))
    }

    pub fn kinds(&self) -> Vec<StrategyKind> {
        let mut kinds: Vec<StrategyKind> = self.strategies.keys().copied().collect();
        kinds.sort_by_key(|k| k.as_str());
        kinds
    }
}

fn default_strategy(environment: Environment) -> StrategyKind {
    match environment {
        Environment::Dev => StrategyKind::Direct,
        Environment::Qa => StrategyKind::Rolling,
        Environment::Staging => StrategyKind::BlueGreen,
        Environment::Production => StrategyKind::Canary,
    }
}
