//! Coordinator configuration

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::CoordinatorError;
use crate::protocol::Capability;

/// Tunables for an [`AgentCoordinator`](crate::coordinator::AgentCoordinator)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Upper bound on a single agent invocation
    pub stage_timeout_ms: u64,
    /// Upper bound on a single health probe
    pub health_timeout_ms: u64,
    /// Stages that fail the session when no agent is available
    pub mandatory_stages: Vec<Capability>,
    /// Fallback attempts per stage, 0 or 1
    pub fallback_retries: u8,
    /// Probe agents before building the pipeline
    pub verify_before_dispatch: bool,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            stage_timeout_ms: 30_000,
            health_timeout_ms: 5_000,
            mandatory_stages: vec![Capability::CodeGeneration],
            fallback_retries: 1,
            verify_before_dispatch: true,
        }
    }
}

impl CoordinatorConfig {
    /// Parse from TOML and validate
    pub fn from_toml_str(s: &str) -> Result<Self, CoordinatorError> {
        let config: Self =
            toml::from_str(s).map_err(|e| CoordinatorError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, CoordinatorError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| CoordinatorError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&contents)
    }

    pub fn validate(&self) -> Result<(), CoordinatorError> {
        if self.stage_timeout_ms == 0 {
            return Err(CoordinatorError::Config("stage_timeout_ms must be positive".into()));
        }
        if self.health_timeout_ms == 0 {
            return Err(CoordinatorError::Config("health_timeout_ms must be positive".into()));
        }
        if self.fallback_retries > 1 {
            return Err(CoordinatorError::Config(
                "fallback_retries allows at most one retry per stage".into(),
            ));
        }
        Ok(())
    }

    pub fn stage_timeout(&self) -> Duration {
        Duration::from_millis(self.stage_timeout_ms)
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_millis(self.health_timeout_ms)
    }

    pub fn is_mandatory(&self, capability: Capability) -> bool {
        self.mandatory_stages.contains(&capability)
    }

    pub fn with_stage_timeout(mut self, timeout: Duration) -> Self {
        self.stage_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_health_timeout(mut self, timeout: Duration) -> Self {
        self.health_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_mandatory_stages(mut self, stages: impl IntoIterator<Item = Capability>) -> Self {
        self.mandatory_stages = stages.into_iter().collect();
        self
    }
}
