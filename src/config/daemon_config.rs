use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::core::bluetooth::{
    Timeouts, CONNECT_TIMEOUT_MS, DEFAULT_CYCLE_INTERVAL_SECS, DEFAULT_OPERATION_TIMEOUT_MS,
    DEFAULT_SCAN_DURATION_SECS, DISCONNECT_TIMEOUT_MS,
};
use crate::utils::ensure_directory_exists;

const CONFIG_DIR_NAME: &str = "pineconnect";
const CONFIG_FILE_NAME: &str = "config.json";

/// `<config dir>/pineconnect/config.json`, if the platform has a config dir
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
}

/// Where a loaded config came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    File(PathBuf),
    /// Nothing at this path, defaults were used
    Defaults(PathBuf),
}

impl ConfigSource {
    pub fn log(&self) {
        match self {
            Self::File(path) => info!("Config loaded from {:?}", path),
            Self::Defaults(path) => warn!("Config file not found at {:?}, using default.", path),
        }
    }
}

/// Which services the daemon runs each cycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServicesConfig {
    pub current_time: bool,
    pub alert_notification: bool,
}

impl Default for ServicesConfig {
    fn default() -> Self {
        Self {
            current_time: true,
            alert_notification: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Adapter name, used for object paths in log lines
    pub adapter: String,

    /// Addresses of the devices whose connections are maintained
    pub managed_devices: Vec<String>,

    /// How long one discovery pass lasts
    pub scan_window_secs: u64,

    /// Idle time between two cycles
    pub cycle_interval_secs: u64,

    pub connect_timeout_ms: u64,
    pub disconnect_timeout_ms: u64,

    /// Timeout of every transport call other than connect and disconnect
    pub operation_timeout_ms: u64,

    /// One of error, warn, info, debug, trace
    pub log_level: String,

    pub services: ServicesConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        DaemonConfig {
            adapter: "hci0".to_string(),
            managed_devices: Vec::new(),
            scan_window_secs: DEFAULT_SCAN_DURATION_SECS,
            cycle_interval_secs: DEFAULT_CYCLE_INTERVAL_SECS,
            connect_timeout_ms: CONNECT_TIMEOUT_MS,
            disconnect_timeout_ms: DISCONNECT_TIMEOUT_MS,
            operation_timeout_ms: DEFAULT_OPERATION_TIMEOUT_MS,
            log_level: "info".to_string(),
            services: ServicesConfig::default(),
        }
    }
}

impl DaemonConfig {
    /// Loads the config from `file_path`, falling back to defaults when the file is missing.
    pub async fn load_config(file_path: &Path) -> Result<Self> {
        let (config, source) = Self::read_config(file_path).await?;
        source.log();
        Ok(config)
    }

    /// Like `load_config`, but leaves reporting the outcome to the caller, for
    /// use before a logger is installed.
    pub async fn read_config(file_path: &Path) -> Result<(Self, ConfigSource)> {
        if !file_path.exists() {
            return Ok((Self::default(), ConfigSource::Defaults(file_path.to_path_buf())));
        }

        let config_json = fs::read_to_string(file_path)
            .await
            .with_context(|| format!("Failed to read config file {:?}", file_path))?;
        let config: Self = serde_json::from_str(&config_json)
            .with_context(|| format!("Failed to parse config file {:?}", file_path))?;

        Ok((config, ConfigSource::File(file_path.to_path_buf())))
    }

    /// Saves the config to `file_path`, creating its directory if needed.
    pub async fn save_config(&self, file_path: &Path) -> Result<()> {
        if let Some(config_dir) = file_path.parent() {
            ensure_directory_exists(config_dir).await?;
        }

        let config_json = match serde_json::to_string_pretty(&self) {
            Ok(json) => json,
            Err(e) => {
                error!("Failed to serialize daemon config to JSON: {}", e);
                return Err(e.into());
            }
        };

        fs::write(file_path, config_json).await?;

        info!("Daemon config saved to {:?}.", file_path);
        Ok(())
    }

    pub fn timeouts(&self) -> Timeouts {
        Timeouts {
            connect: Duration::from_millis(self.connect_timeout_ms),
            disconnect: Duration::from_millis(self.disconnect_timeout_ms),
            operation: Duration::from_millis(self.operation_timeout_ms),
        }
    }

    pub fn scan_window(&self) -> Duration {
        Duration::from_secs(self.scan_window_secs)
    }

    pub fn cycle_interval(&self) -> Duration {
        Duration::from_secs(self.cycle_interval_secs)
    }
}
