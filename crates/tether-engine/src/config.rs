//! Bridge configuration (tether.toml)
//!
//! All settings have working defaults, so a missing file or a missing
//! `[bridge]` table is not an error.
//!
//! ```toml
//! [bridge]
//! max_call_depth = 128
//! tick_budget_ms = 4
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur while loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse TOML
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value is present but unusable
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Runtime limits for one VM instance and its bridge.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BridgeOptions {
    /// Maximum number of value slots on the script stack
    pub max_stack_slots: usize,

    /// Maximum nesting of script/host calls
    pub max_call_depth: usize,

    /// Capacity of the owner-thread task queue
    pub task_queue_capacity: usize,

    /// Time slice spent draining the task queue per tick, in milliseconds
    pub tick_budget_ms: u64,

    /// Maximum instructions a single host IL invocation may execute
    pub il_step_limit: u64,
}

impl Default for BridgeOptions {
    fn default() -> Self {
        Self {
            max_stack_slots: 64 * 1024,
            max_call_depth: 200,
            task_queue_capacity: 1024,
            tick_budget_ms: 2,
            il_step_limit: 1_000_000,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    bridge: BridgeOptions,
}

impl BridgeOptions {
    /// Parse options from a TOML document with an optional `[bridge]` table
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile = toml::from_str(source)?;
        file.bridge.validate()?;
        Ok(file.bridge)
    }

    /// Load options from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let source = std::fs::read_to_string(path)?;
        Self::from_toml_str(&source)
    }

    /// Time slice for one task-queue drain
    pub fn tick_budget(&self) -> Duration {
        Duration::from_millis(self.tick_budget_ms)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_call_depth == 0 {
            return Err(ConfigError::Invalid("max_call_depth must be > 0".to_string()));
        }
        if self.task_queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "task_queue_capacity must be > 0".to_string(),
            ));
        }
        if self.max_stack_slots < 16 {
            return Err(ConfigError::Invalid(
                "max_stack_slots must be at least 16".to_string(),
            ));
        }
        Ok(())
    }
}
