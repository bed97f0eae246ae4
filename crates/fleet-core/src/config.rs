//! fleetd.toml configuration parser.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::time::{DurationError, parse_duration};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    pub store: StoreConfig,
    pub scheduler: SchedulerConfig,
    pub rollout: RolloutConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// redb file. Defaults to `<data-dir>/fleetgrid.redb`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Cadence of the rollout advancement pass.
    pub tick_interval: String,
    /// Cadence of the auto-assignment pass.
    pub auto_assign_interval: String,
    /// Actions without a terminal report after this long are failed.
    pub action_timeout: String,
    /// Rollouts advanced concurrently within one tick.
    pub max_parallel_rollouts: usize,
    /// Page size used when walking large target sets.
    pub page_size: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: "10s".to_string(),
            auto_assign_interval: "60s".to_string(),
            action_timeout: "24h".to_string(),
            max_parallel_rollouts: 8,
            page_size: 500,
        }
    }
}

impl SchedulerConfig {
    pub fn tick_interval(&self) -> Result<Duration, DurationError> {
        parse_duration(&self.tick_interval)
    }

    pub fn auto_assign_interval(&self) -> Result<Duration, DurationError> {
        parse_duration(&self.auto_assign_interval)
    }

    pub fn action_timeout(&self) -> Result<Duration, DurationError> {
        parse_duration(&self.action_timeout)
    }
}

/// How leftover devices are distributed when group shares don't divide evenly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundingSetting {
    #[default]
    LargestRemainder,
    CarryToLast,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RolloutConfig {
    pub max_groups: u32,
    pub rounding: RoundingSetting,
}

impl Default for RolloutConfig {
    fn default() -> Self {
        Self {
            max_groups: 500,
            rounding: RoundingSetting::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive, used when `RUST_LOG` is unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
    /// Emit JSON lines instead of the human-readable format.
    pub json: bool,
}

impl FleetConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: FleetConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Reject values that would only fail later, deep inside a loop.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.scheduler.tick_interval()?.is_zero() {
            anyhow::bail!("scheduler.tick_interval must be greater than zero");
        }
        if self.scheduler.auto_assign_interval()?.is_zero() {
            anyhow::bail!("scheduler.auto_assign_interval must be greater than zero");
        }
        // Action timestamps have second resolution.
        if self.scheduler.action_timeout()? < Duration::from_secs(1) {
            anyhow::bail!("scheduler.action_timeout must be at least 1s");
        }
        if self.scheduler.max_parallel_rollouts == 0 {
            anyhow::bail!("scheduler.max_parallel_rollouts must be at least 1");
        }
        if self.scheduler.page_size == 0 {
            anyhow::bail!("scheduler.page_size must be at least 1");
        }
        if self.rollout.max_groups == 0 {
            anyhow::bail!("rollout.max_groups must be at least 1");
        }
        Ok(())
    }

    /// Store location, falling back to a file inside `data_dir`.
    pub fn store_path(&self, data_dir: &Path) -> PathBuf {
        self.store
            .path
            .clone()
            .unwrap_or_else(|| data_dir.join("fleetgrid.redb"))
    }
}
