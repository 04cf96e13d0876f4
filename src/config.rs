use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::dispatch::DispatchSettings;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,

    #[serde(default)]
    pub dispatch: DispatchConfig,

    #[serde(default)]
    pub classify: ClassifyConfig,

    #[serde(default)]
    pub sni: SniConfig,

    #[serde(default)]
    pub warehouse: WarehouseConfig,
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.as_ref().display()))?;

        Ok(config)
    }

    /// Load config from default locations or create default
    pub fn load_or_default() -> Result<Self> {
        let paths = [
            PathBuf::from("/etc/flowsentry/config.toml"),
            dirs_next::config_dir()
                .map(|p| p.join("flowsentry/config.toml"))
                .unwrap_or_default(),
            PathBuf::from("config.toml"),
        ];

        for path in &paths {
            if path.exists() {
                return Self::load(path);
            }
        }

        Ok(Self::default())
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(&path, content)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Skip writing classification results to the dictionary
    #[serde(default)]
    pub disable_dict: bool,

    /// Ignore live traffic (no queue binding)
    #[serde(default)]
    pub bypass: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            disable_dict: false,
            bypass: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Netfilter queue number to bind in live mode
    #[serde(default = "default_queue_num")]
    pub queue_num: u16,

    /// Seconds of idle time before a table entry is swept
    #[serde(default = "default_session_timeout")]
    pub session_timeout_secs: u64,

    /// Seconds between expiry sweeps
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            queue_num: default_queue_num(),
            session_timeout_secs: default_session_timeout(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl DispatchConfig {
    /// Convert to the dispatch core's settings
    pub fn settings(&self) -> DispatchSettings {
        DispatchSettings {
            session_timeout: Duration::from_secs(self.session_timeout_secs),
            sweep_interval: Duration::from_secs(self.sweep_interval_secs),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifyConfig {
    /// Whether the classifier plugin runs
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// host:port of the categorisation daemon
    #[serde(default = "default_classd_host_port")]
    pub host_port: String,

    /// Daemon binary to supervise; None expects an externally managed daemon
    #[serde(default)]
    pub daemon_binary: Option<String>,

    /// Application metadata CSV
    #[serde(default = "default_application_table")]
    pub application_table: String,
}

impl Default for ClassifyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host_port: default_classd_host_port(),
            daemon_binary: None,
            application_table: default_application_table(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SniConfig {
    /// Whether the SNI plugin runs
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for SniConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WarehouseConfig {
    /// Capture or playback file
    #[serde(default)]
    pub file: Option<String>,

    /// Playback speed percentage (100 = recorded timing)
    #[serde(default = "default_playback_speed")]
    pub speed: u32,
}

impl Default for WarehouseConfig {
    fn default() -> Self {
        Self {
            file: None,
            speed: default_playback_speed(),
        }
    }
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_queue_num() -> u16 {
    1818
}

fn default_session_timeout() -> u64 {
    600
}

fn default_sweep_interval() -> u64 {
    60
}

fn default_classd_host_port() -> String {
    "127.0.0.1:8123".to_string()
}

fn default_application_table() -> String {
    "/usr/share/flowsentry/protolist.csv".to_string()
}

fn default_playback_speed() -> u32 {
    100
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.classify.host_port, "127.0.0.1:8123");
        assert_eq!(config.dispatch.session_timeout_secs, 600);
        assert!(config.sni.enabled);
        assert_eq!(config.warehouse.speed, 100);
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.classify.host_port, config.classify.host_port);
        assert_eq!(parsed.dispatch.queue_num, config.dispatch.queue_num);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let parsed: Config = toml::from_str("[classify]\nhost_port = \"10.0.0.2:9000\"\n").unwrap();
        assert_eq!(parsed.classify.host_port, "10.0.0.2:9000");
        assert_eq!(parsed.dispatch.sweep_interval_secs, 60);
    }

    #[test]
    fn test_dispatch_settings_conversion() {
        let settings = DispatchConfig::default().settings();
        assert_eq!(settings.session_timeout, Duration::from_secs(600));
        assert_eq!(settings.sweep_interval, Duration::from_secs(60));
    }
}
