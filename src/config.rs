use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_http_enabled")]
    pub http_enabled: bool,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub scan: ScanConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MonitorConfig {
    #[serde(default = "default_temp_alert_threshold_celsius")]
    pub temp_alert_threshold_celsius: f64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ScanConfig {
    /// Passed messages at or above this length are shown as "OK".
    #[serde(default = "default_message_max_len")]
    pub ok_message_max_len: usize,
    /// Truncation length for unexpected check errors.
    #[serde(default = "default_message_max_len")]
    pub error_message_max_len: usize,
    #[serde(default = "default_report_dir")]
    pub report_dir: PathBuf,
    #[serde(default = "default_system_volume")]
    pub system_volume: String,
    #[serde(default = "default_energy_trace_secs")]
    pub energy_trace_secs: u64,
    /// Daemon mode: run one non-interactive pass at startup.
    #[serde(default)]
    pub run_on_start: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            interval_secs: default_interval_secs(),
            http_enabled: default_http_enabled(),
            monitor: MonitorConfig::default(),
            scan: ScanConfig::default(),
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            temp_alert_threshold_celsius: default_temp_alert_threshold_celsius(),
        }
    }
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            ok_message_max_len: default_message_max_len(),
            error_message_max_len: default_message_max_len(),
            report_dir: default_report_dir(),
            system_volume: default_system_volume(),
            energy_trace_secs: default_energy_trace_secs(),
            run_on_start: false,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse YAML in {path}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },
    #[error("config validation failed: {0}")]
    Validation(String),
}

impl Config {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        let path_display = path_ref.display().to_string();
        let text = fs::read_to_string(path_ref).map_err(|source| ConfigError::Read {
            path: path_display.clone(),
            source,
        })?;

        Self::from_yaml(&text, path_display)
    }

    pub fn from_yaml(text: &str, origin: impl Into<String>) -> Result<Self, ConfigError> {
        let cfg: Config = serde_yaml::from_str(text).map_err(|source| ConfigError::Parse {
            path: origin.into(),
            source,
        })?;

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.http_enabled {
            if self.listen.trim().is_empty() {
                return Err(ConfigError::Validation(
                    "listen is required when http_enabled is true".to_string(),
                ));
            }
            if SocketAddr::from_str(&self.listen).is_err() {
                return Err(ConfigError::Validation(
                    "listen must be a valid host:port address".to_string(),
                ));
            }
        }
        if self.interval_secs < 1 {
            return Err(ConfigError::Validation(
                "interval_secs must be >= 1".to_string(),
            ));
        }

        validate_monitor(&self.monitor)?;
        validate_scan(&self.scan)?;

        Ok(())
    }

    pub fn example_yaml() -> &'static str {
        include_str!("../config.yaml.example")
    }
}

fn validate_monitor(cfg: &MonitorConfig) -> Result<(), ConfigError> {
    if !cfg.temp_alert_threshold_celsius.is_finite() || cfg.temp_alert_threshold_celsius <= 0.0 {
        return Err(ConfigError::Validation(
            "monitor.temp_alert_threshold_celsius must be > 0".to_string(),
        ));
    }
    Ok(())
}

fn validate_scan(cfg: &ScanConfig) -> Result<(), ConfigError> {
    if cfg.ok_message_max_len < 1 {
        return Err(ConfigError::Validation(
            "scan.ok_message_max_len must be >= 1".to_string(),
        ));
    }
    if cfg.error_message_max_len < 1 {
        return Err(ConfigError::Validation(
            "scan.error_message_max_len must be >= 1".to_string(),
        ));
    }
    if cfg.system_volume.trim().is_empty() {
        return Err(ConfigError::Validation(
            "scan.system_volume must not be empty".to_string(),
        ));
    }
    if cfg.energy_trace_secs < 1 {
        return Err(ConfigError::Validation(
            "scan.energy_trace_secs must be >= 1".to_string(),
        ));
    }
    Ok(())
}

fn default_listen() -> String {
    "127.0.0.1:9120".to_string()
}

const fn default_interval_secs() -> u64 {
    2
}

const fn default_http_enabled() -> bool {
    true
}

const fn default_temp_alert_threshold_celsius() -> f64 {
    90.0
}

const fn default_message_max_len() -> usize {
    50
}

fn default_report_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_system_volume() -> String {
    "C:".to_string()
}

const fn default_energy_trace_secs() -> u64 {
    15
}
