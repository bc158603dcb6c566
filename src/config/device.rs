//! Per-device limits and queue-full retry pacing.

use std::time::Duration;

use backon::ExponentialBuilder;
use serde::Deserialize;

use super::{ConfigError, Result};

/// Default logical block size in bytes.
pub const DEFAULT_BLOCK_SIZE: u32 = 512;

/// Default maximum logical blocks per task.
pub const DEFAULT_MAX_SECTORS: u32 = 1024;

/// Default cap on tasks built for a single command. Splits needing more fail
/// as resource exhaustion.
pub const DEFAULT_MAX_TASKS_PER_COMMAND: usize = 4096;

/// Default first queue-full retry delay.
pub const DEFAULT_RETRY_MIN_DELAY_MS: u64 = 1;

/// Default ceiling for queue-full retry delay.
pub const DEFAULT_RETRY_MAX_DELAY_MS: u64 = 100;

/// One logical device and its execution limits.
///
/// ```yaml
/// devices:
///   - name: disk0
///     block_size: 4096
///     max_sectors: 256
///     emulate_task_attr: true
/// ```
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DeviceConfig {
    pub name: String,
    pub block_size: u32,
    /// Maximum logical blocks per task.
    pub max_sectors: u32,
    /// Honor SIMPLE/ORDERED/HEAD OF QUEUE. When off every command is
    /// admitted at once in arrival order.
    pub emulate_task_attr: bool,
    /// Writes complete with GOOD without reaching the backend.
    pub write_protect: bool,
    pub max_tasks_per_command: usize,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            name: "disk0".to_string(),
            block_size: DEFAULT_BLOCK_SIZE,
            max_sectors: DEFAULT_MAX_SECTORS,
            emulate_task_attr: true,
            write_protect: false,
            max_tasks_per_command: DEFAULT_MAX_TASKS_PER_COMMAND,
        }
    }
}

impl DeviceConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: &str| ConfigError::InvalidDevice {
            name: self.name.clone(),
            reason: reason.to_string(),
        };
        if self.name.is_empty() {
            return Err(invalid("name must not be empty"));
        }
        if self.block_size == 0 {
            return Err(invalid("block_size must be greater than zero"));
        }
        if self.max_sectors == 0 {
            return Err(invalid("max_sectors must be greater than zero"));
        }
        if self.max_tasks_per_command == 0 {
            return Err(invalid("max_tasks_per_command must be greater than zero"));
        }
        Ok(())
    }
}

/// Pacing for redelivery after a frontend reports a full queue.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetryConfig {
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            min_delay_ms: DEFAULT_RETRY_MIN_DELAY_MS,
            max_delay_ms: DEFAULT_RETRY_MAX_DELAY_MS,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Unbounded exponential backoff between `min_delay_ms` and `max_delay_ms`.
    /// Queue-full redelivery never gives up.
    pub fn backoff(&self) -> ExponentialBuilder {
        let builder = ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(self.min_delay_ms))
            .with_max_delay(Duration::from_millis(self.max_delay_ms.max(self.min_delay_ms)))
            .with_max_times(usize::MAX);
        if self.jitter {
            builder.with_jitter()
        } else {
            builder
        }
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms.max(self.min_delay_ms))
    }
}
