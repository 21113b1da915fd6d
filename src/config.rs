//! Configuration management for Gatekeeper.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::info;

use crate::error::{GatekeeperError, Result};
use crate::ratelimit::{RateLimitConfig, DEFAULT_IDLE_WINDOWS};
use crate::throttle::ThrottleConfig;

/// Prefix for environment overrides, e.g. `GATEKEEPER__EVICTION__IDLE_WINDOWS=4`.
pub const ENV_PREFIX: &str = "GATEKEEPER";

/// Main configuration: every rule the process starts with.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatekeeperConfig {
    /// Rate limit rules by name
    #[serde(default)]
    pub rate_limits: HashMap<String, RateLimitConfig>,

    /// Throttle rules by key
    #[serde(default)]
    pub throttles: HashMap<String, ThrottleConfig>,

    /// Idle bucket eviction
    #[serde(default)]
    pub eviction: EvictionConfig,
}

/// Idle bucket eviction configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvictionConfig {
    /// Windows a bucket may sit unused before it is dropped
    #[serde(default = "default_idle_windows")]
    pub idle_windows: u64,

    /// How often the sweeper runs, in seconds
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for EvictionConfig {
    fn default() -> Self {
        Self {
            idle_windows: default_idle_windows(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

/// Settings that `GATEKEEPER__*` environment variables may override.
#[derive(Debug, Default, Deserialize)]
struct EnvOverrides {
    #[serde(default)]
    eviction: EvictionOverrides,
}

#[derive(Debug, Default, Deserialize)]
struct EvictionOverrides {
    idle_windows: Option<u64>,
    sweep_interval_secs: Option<u64>,
}

fn default_idle_windows() -> u64 {
    DEFAULT_IDLE_WINDOWS
}

fn default_sweep_interval() -> u64 {
    60
}

impl GatekeeperConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading gatekeeper configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: GatekeeperConfig = serde_yaml::from_str(yaml)
            .map_err(|e| GatekeeperError::Config(format!("Failed to parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a YAML configuration file, then apply `GATEKEEPER__*`
    /// environment overrides to the eviction settings.
    ///
    /// Rule maps always come from the file, so rule names and camelCase
    /// field aliases keep their case.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut config = Self::from_file(path)?;

        let overrides: EnvOverrides = ::config::Config::builder()
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|env| env.try_deserialize())
            .map_err(|e| GatekeeperError::Config(format!("Invalid environment override: {}", e)))?;

        if let Some(idle_windows) = overrides.eviction.idle_windows {
            info!(idle_windows = idle_windows, "Eviction idle windows overridden from environment");
            config.eviction.idle_windows = idle_windows;
        }
        if let Some(secs) = overrides.eviction.sweep_interval_secs {
            info!(sweep_interval_secs = secs, "Eviction sweep interval overridden from environment");
            config.eviction.sweep_interval_secs = secs;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate every rule, naming the first one that fails.
    pub fn validate(&self) -> Result<()> {
        for (name, rule) in &self.rate_limits {
            rule.validate()
                .map_err(|e| GatekeeperError::Config(format!("rate limit '{}': {}", name, e)))?;
        }
        for (key, rule) in &self.throttles {
            rule.validate()
                .map_err(|e| GatekeeperError::Config(format!("throttle '{}': {}", key, e)))?;
        }
        if self.eviction.sweep_interval_secs == 0 {
            return Err(GatekeeperError::Config(
                "eviction.sweep_interval_secs must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
