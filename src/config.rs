use std::path::PathBuf;
use std::time::Duration;

use config::{Config, ConfigError, Environment, File as ConfigFile};
use serde::{Deserialize, Serialize};

use crate::transport::SimulatedDeviceConfig;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    /// Fetch each captured file right after the trigger round. Off by default
    /// so USB transfers can't interfere with other devices still capturing.
    #[serde(default)]
    pub download_after_capture: bool,
    #[serde(default = "default_true")]
    pub sync_device_clock: bool,
    #[serde(default = "default_capture_timeout_ms")]
    pub capture_timeout_ms: u64,
    #[serde(default = "default_retrieval_timeout_ms")]
    pub retrieval_timeout_ms: u64,
    #[serde(default = "default_download_root")]
    pub download_root: String,
    #[serde(default)]
    pub parallel_open: bool,
    /// Config widgets tried, in order, when looking for a serial number.
    #[serde(default = "default_serial_keys")]
    pub serial_keys: Vec<String>,
    #[serde(default = "default_clock_key")]
    pub clock_key: String,
    #[serde(default)]
    pub simulated_devices: Vec<SimulatedDeviceConfig>,
    /// Run log, appended to across runs. `LOG_FILE_PATH` takes precedence.
    #[serde(default = "default_log_file")]
    pub log_file: String,
}

fn default_log_file() -> String {
    "./logs/sync-shutter.log".to_string()
}

fn default_true() -> bool {
    true
}

fn default_capture_timeout_ms() -> u64 {
    10_000
}

fn default_retrieval_timeout_ms() -> u64 {
    60_000
}

fn default_download_root() -> String {
    "captures".to_string()
}

fn default_serial_keys() -> Vec<String> {
    vec!["serialnumber".to_string(), "eosserialnumber".to_string()]
}

fn default_clock_key() -> String {
    "datetime".to_string()
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            download_after_capture: false,
            sync_device_clock: true,
            capture_timeout_ms: default_capture_timeout_ms(),
            retrieval_timeout_ms: default_retrieval_timeout_ms(),
            download_root: default_download_root(),
            parallel_open: false,
            serial_keys: default_serial_keys(),
            clock_key: default_clock_key(),
            simulated_devices: Vec::new(),
            log_file: default_log_file(),
        }
    }
}

impl AppConfig {
    pub fn capture_timeout(&self) -> Duration {
        Duration::from_millis(self.capture_timeout_ms)
    }

    pub fn retrieval_timeout(&self) -> Duration {
        Duration::from_millis(self.retrieval_timeout_ms)
    }

    pub fn download_root(&self) -> PathBuf {
        PathBuf::from(&self.download_root)
    }
}

/// Reads `Config.toml` (optional) overlaid with `SYNC_SHUTTER_*` environment variables.
pub fn load_configuration() -> Result<AppConfig, ConfigError> {
    let builder = Config::builder()
        .add_source(ConfigFile::with_name("Config").required(false))
        .add_source(
            Environment::with_prefix("SYNC_SHUTTER")
                .prefix_separator("_")
                .try_parsing(true),
        )
        .build()?;
    builder.try_deserialize::<AppConfig>()
}
