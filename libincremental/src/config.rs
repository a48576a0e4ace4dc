use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::READ_LOGS_MAX_INTERVAL;
use crate::error::Result;

/// Runtime tunables of the service, loadable from a YAML file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Emit timing logs for the expensive operations.
    pub perf_logging: bool,
    /// Keep read timeouts on for the system data loader during loading.
    pub always_enable_read_timeouts_for_system_dataloaders: bool,
    /// Turn read timeouts back on once the installation completes.
    pub enable_read_timeouts_after_install: bool,
    pub enforce_readlogs_max_interval_for_system_dataloaders: bool,
    pub readlogs_max_interval_sec: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            perf_logging: false,
            always_enable_read_timeouts_for_system_dataloaders: true,
            enable_read_timeouts_after_install: true,
            enforce_readlogs_max_interval_for_system_dataloaders: false,
            readlogs_max_interval_sec: READ_LOGS_MAX_INTERVAL.as_secs(),
        }
    }
}

impl ServiceConfig {
    /// Read logs may never stay enabled for longer than the built-in maximum.
    pub fn read_logs_max_interval(&self) -> Duration {
        Duration::from_secs(self.readlogs_max_interval_sec).min(READ_LOGS_MAX_INTERVAL)
    }
}

pub fn load_config(path: impl AsRef<Path>) -> Result<ServiceConfig> {
    let content = fs::read_to_string(path)?;
    let config = serde_yaml::from_str(&content)?;
    Ok(config)
}
