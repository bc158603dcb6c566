//! Configuration types for the target engine.
//!
//! Configuration is loaded with the following precedence (later overrides earlier):
//! 1. Built-in defaults
//! 2. `target-engine.yaml` in current directory (if exists)
//! 3. File from `path` argument (if provided)
//! 4. File from `TARGET_ENGINE_CONFIG` environment variable (if set)
//! 5. Environment variables with `TARGET_ENGINE` prefix, `__` separated

mod device;

pub use device::{
    DeviceConfig, RetryConfig, DEFAULT_BLOCK_SIZE, DEFAULT_MAX_SECTORS,
    DEFAULT_MAX_TASKS_PER_COMMAND, DEFAULT_RETRY_MAX_DELAY_MS, DEFAULT_RETRY_MIN_DELAY_MS,
};

use serde::Deserialize;

// ============================================================================
// Environment Variable Names
// ============================================================================

/// Environment variable for config file path.
pub const CONFIG_ENV_VAR: &str = "TARGET_ENGINE_CONFIG";

/// Environment variable prefix for config overrides.
pub const CONFIG_ENV_PREFIX: &str = "TARGET_ENGINE";

/// Environment variable holding the tracing filter.
pub const LOG_ENV_VAR: &str = "TARGET_ENGINE_LOG";

/// Default config file name.
pub const DEFAULT_CONFIG_FILE: &str = "target-engine.yaml";

/// Result type for configuration operations.
pub type Result<T> = std::result::Result<T, ConfigError>;

/// Errors raised while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("Invalid device '{name}': {reason}")]
    InvalidDevice { name: String, reason: String },

    #[error("Duplicate device name '{0}'")]
    DuplicateDevice(String),
}

/// Engine configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Devices attached at startup.
    pub devices: Vec<DeviceConfig>,
    /// Queue-full retry pacing.
    pub retry: RetryConfig,
}

impl EngineConfig {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `target-engine.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
    pub fn load(path: Option<&str>) -> Result<Self> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: EngineConfig = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a YAML document directly, without file or environment layering.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: EngineConfig = serde_yaml::from_str(yaml).map_err(|e| {
            ConfigError::Load(::config::ConfigError::Message(e.to_string()))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for device in &self.devices {
            device.validate()?;
            if !seen.insert(device.name.as_str()) {
                return Err(ConfigError::DuplicateDevice(device.name.clone()));
            }
        }
        Ok(())
    }

    /// Create config for testing.
    pub fn for_test() -> Self {
        Self::default()
    }
}
