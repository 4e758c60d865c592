//! Configuration system for tripwire.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::automation::{ProgressPolicy, TriggerType};
use crate::error::{AutomationError, AutomationResult};
use crate::events::DEFAULT_CAPACITY;

/// Value of `TRIPWIRE_DB_PATH` selecting an in-memory store.
pub const IN_MEMORY: &str = ":memory:";

/// Default location of the automation database (`~/.tripwire/automation.db`).
pub fn default_db_path() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".tripwire"))
        .unwrap_or_else(|| PathBuf::from(".tripwire"))
        .join("automation.db")
}

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Path to the automation database; `None` keeps everything in memory.
    pub db_path: Option<PathBuf>,
    /// Capacity of the event bus.
    pub event_bus_capacity: usize,
    /// Progress policy per trigger type; unlisted types reset.
    pub progress_policies: HashMap<TriggerType, ProgressPolicy>,
    /// Start with event processing paused.
    pub start_paused: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            db_path: Some(default_db_path()),
            event_bus_capacity: DEFAULT_CAPACITY,
            progress_policies: HashMap::new(),
            start_paused: false,
        }
    }
}

impl EngineConfig {
    /// Load configuration from a file (TOML, JSON, or YAML).
    pub fn from_file(path: impl AsRef<Path>) -> AutomationResult<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let ext = path.as_ref().extension().and_then(|e| e.to_str());

        match ext {
            Some("toml") => {
                toml::from_str(&content).map_err(|e| AutomationError::Configuration(e.to_string()))
            }
            Some("json") => serde_json::from_str(&content)
                .map_err(|e| AutomationError::Configuration(e.to_string())),
            Some("yaml" | "yml") => serde_yaml::from_str(&content)
                .map_err(|e| AutomationError::Configuration(e.to_string())),
            _ => Err(AutomationError::Configuration(
                "Unsupported config file format. Use .toml, .json, or .yaml".to_string(),
            )),
        }
    }

    /// Load configuration from environment variables.
    pub fn from_env() -> AutomationResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> AutomationResult<Self> {
        let mut config = Self::default();

        if let Some(path) = lookup("TRIPWIRE_DB_PATH") {
            config.db_path = if path == IN_MEMORY {
                None
            } else {
                Some(PathBuf::from(path))
            };
        }

        if let Some(capacity) = lookup("TRIPWIRE_BUS_CAPACITY") {
            config.event_bus_capacity = capacity.parse().map_err(|_| {
                AutomationError::Configuration(format!(
                    "TRIPWIRE_BUS_CAPACITY must be a positive integer, got '{}'",
                    capacity
                ))
            })?;
        }

        if let Some(paused) = lookup("TRIPWIRE_START_PAUSED") {
            config.start_paused = matches!(paused.to_lowercase().as_str(), "1" | "true" | "yes");
        }

        // Comma-separated trigger types that keep progress past the goal
        if let Some(types) = lookup("TRIPWIRE_CARRY_OVER") {
            for name in types.split(',').map(str::trim).filter(|s| !s.is_empty()) {
                let trigger_type = TriggerType::from_str(name).map_err(|_| {
                    AutomationError::Configuration(format!("unknown trigger type '{}'", name))
                })?;
                config
                    .progress_policies
                    .insert(trigger_type, ProgressPolicy::CarryOver);
            }
        }

        Ok(config)
    }

    /// Progress policy for a trigger type.
    pub fn policy_for(&self, trigger_type: TriggerType) -> ProgressPolicy {
        self.progress_policies
            .get(&trigger_type)
            .copied()
            .unwrap_or_default()
    }

    /// Build configuration using builder pattern.
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::default()
    }
}

/// Builder for EngineConfig.
#[derive(Default)]
pub struct EngineConfigBuilder {
    config: EngineConfig,
}

impl EngineConfigBuilder {
    /// Set database path.
    pub fn db_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.db_path = Some(path.into());
        self
    }

    /// Keep the store in memory.
    pub fn in_memory(mut self) -> Self {
        self.config.db_path = None;
        self
    }

    /// Set event bus capacity.
    pub fn event_bus_capacity(mut self, capacity: usize) -> Self {
        self.config.event_bus_capacity = capacity;
        self
    }

    /// Set the progress policy of a trigger type.
    pub fn progress_policy(mut self, trigger_type: TriggerType, policy: ProgressPolicy) -> Self {
        self.config.progress_policies.insert(trigger_type, policy);
        self
    }

    /// Start with event processing paused.
    pub fn start_paused(mut self, paused: bool) -> Self {
        self.config.start_paused = paused;
        self
    }

    /// Build the configuration.
    pub fn build(self) -> EngineConfig {
        self.config
    }
}
