//! Configuration types for the background task scheduler.

use crate::error::{Result, SchedulerError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration for [`TaskScheduler`](crate::scheduler::TaskScheduler).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskSchedulerConfig {
    /// Maximum number of tasks allowed in the running state at once.
    pub max_concurrent: usize,
    /// Interval between scheduler ticks in milliseconds.
    pub tick_interval_ms: u64,
    /// How long `stop()` waits for running tasks before abandoning them.
    pub shutdown_grace_ms: u64,
    /// Retention policy for finished tasks.
    pub retention: RetentionConfig,
}

impl Default for TaskSchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 5,
            tick_interval_ms: 100,
            shutdown_grace_ms: 5_000,
            retention: RetentionConfig::default(),
        }
    }
}

/// How long finished tasks stay inspectable in the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    /// Maximum number of terminal tasks kept; oldest are evicted first.
    pub max_terminal_tasks: usize,
    /// Age in seconds after which terminal tasks are evicted (0 = no TTL).
    pub terminal_ttl_secs: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            max_terminal_tasks: 400,
            terminal_ttl_secs: 0,
        }
    }
}

impl RetentionConfig {
    /// TTL as a [`Duration`], or `None` when disabled.
    pub fn terminal_ttl(&self) -> Option<Duration> {
        (self.terminal_ttl_secs > 0).then(|| Duration::from_secs(self.terminal_ttl_secs))
    }
}

impl TaskSchedulerConfig {
    /// Scheduler tick interval.
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    /// Grace period granted to running tasks on shutdown.
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Check that the values are usable.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Config`] when a value is out of range.
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent == 0 {
            return Err(SchedulerError::Config(
                "max_concurrent must be at least 1".to_owned(),
            ));
        }
        if self.tick_interval_ms == 0 {
            return Err(SchedulerError::Config(
                "tick_interval_ms must be at least 1".to_owned(),
            ));
        }
        Ok(())
    }

    /// Load configuration from a TOML file, falling back to defaults for missing fields.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self =
            toml::from_str(&content).map_err(|e| SchedulerError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written or the config cannot be serialized.
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| SchedulerError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Returns the default config file path: `~/.config/fae/tasks.toml`.
    pub fn default_config_path() -> PathBuf {
        if let Some(config) = std::env::var_os("XDG_CONFIG_HOME") {
            PathBuf::from(config).join("fae").join("tasks.toml")
        } else if let Some(home) = std::env::var_os("HOME") {
            PathBuf::from(home)
                .join(".config")
                .join("fae")
                .join("tasks.toml")
        } else {
            PathBuf::from("/tmp/fae-config/tasks.toml")
        }
    }
}
