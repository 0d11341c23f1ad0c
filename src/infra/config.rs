//! Configuration loading from TOML files
//!
//! Config file is selected via the --config command line argument
//! (default: config/dev.toml). A missing or unparseable file falls back
//! to built-in defaults with a warning.

use crate::domain::{AccuracyTier, SubscribeConfig};
use anyhow::Context;
use serde::Deserialize;
use std::fs;
use std::path::Path;

/// Which location backend feeds the monitor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    #[default]
    Nmea,
    Replay,
}

impl SourceKind {
    pub fn as_str(&self) -> &str {
        match self {
            SourceKind::Nmea => "nmea",
            SourceKind::Replay => "replay",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct UnitConfig {
    /// Identifier for this monitor unit (e.g., "van-3")
    #[serde(default = "default_unit_id")]
    pub id: String,
}

fn default_unit_id() -> String {
    "speedwatch".to_string()
}

impl Default for UnitConfig {
    fn default() -> Self {
        Self { id: default_unit_id() }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    #[serde(default)]
    pub kind: SourceKind,
    /// Serial device of the GPS receiver
    #[serde(default = "default_source_device")]
    pub device: String,
    #[serde(default = "default_source_baud")]
    pub baud: u32,
    /// Sample file for the replay source (JSONL)
    #[serde(default = "default_replay_file")]
    pub replay_file: String,
    /// Restart the replay file from the top when it ends
    #[serde(default)]
    pub replay_loop: bool,
}

fn default_source_device() -> String {
    "/dev/ttyUSB0".to_string()
}

fn default_source_baud() -> u32 {
    9600
}

fn default_replay_file() -> String {
    "data/demo_drive.jsonl".to_string()
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            kind: SourceKind::Nmea,
            device: default_source_device(),
            baud: default_source_baud(),
            replay_file: default_replay_file(),
            replay_loop: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionConfig {
    #[serde(default)]
    pub accuracy: AccuracyTier,
    /// Minimum movement between delivered samples (0.0 = every update)
    #[serde(default)]
    pub min_distance_m: f64,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self { accuracy: AccuracyTier::Best, min_distance_m: 0.0 }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LimitConfig {
    /// Speed limit selected at startup (km/h)
    #[serde(default = "default_limit_kmh")]
    pub default_kmh: f64,
}

fn default_limit_kmh() -> f64 {
    50.0
}

impl Default for LimitConfig {
    fn default() -> Self {
        Self { default_kmh: default_limit_kmh() }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_interval")]
    pub interval_secs: u64,
    /// Prometheus metrics HTTP port (0 to disable)
    #[serde(default = "default_prometheus_port")]
    pub prometheus_port: u16,
}

fn default_metrics_interval() -> u64 {
    10
}

fn default_prometheus_port() -> u16 {
    9090
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { interval_secs: default_metrics_interval(), prometheus_port: default_prometheus_port() }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub unit: UnitConfig,
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub subscription: SubscriptionConfig,
    #[serde(default)]
    pub limit: LimitConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    unit_id: String,
    source_kind: SourceKind,
    source_device: String,
    source_baud: u32,
    replay_file: String,
    replay_loop: bool,
    accuracy: AccuracyTier,
    min_distance_m: f64,
    default_limit_kmh: f64,
    metrics_interval_secs: u64,
    prometheus_port: u16,
    config_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            unit_id: default_unit_id(),
            source_kind: SourceKind::Nmea,
            source_device: default_source_device(),
            source_baud: default_source_baud(),
            replay_file: default_replay_file(),
            replay_loop: false,
            accuracy: AccuracyTier::Best,
            min_distance_m: 0.0,
            default_limit_kmh: default_limit_kmh(),
            metrics_interval_secs: default_metrics_interval(),
            prometheus_port: default_prometheus_port(),
            config_file: "default".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let toml_config: TomlConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        Ok(Self {
            unit_id: toml_config.unit.id,
            source_kind: toml_config.source.kind,
            source_device: toml_config.source.device,
            source_baud: toml_config.source.baud,
            replay_file: toml_config.source.replay_file,
            replay_loop: toml_config.source.replay_loop,
            accuracy: toml_config.subscription.accuracy,
            min_distance_m: toml_config.subscription.min_distance_m,
            default_limit_kmh: toml_config.limit.default_kmh,
            metrics_interval_secs: toml_config.metrics.interval_secs,
            prometheus_port: toml_config.metrics.prometheus_port,
            config_file: path.display().to_string(),
        })
    }

    /// Load configuration - tries the TOML file first, falls back to defaults
    pub fn load_from_path(path: &str) -> Self {
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Warning: {}. Using defaults.", e);
                Self::default()
            }
        }
    }

    /// Subscription options for the position stream
    pub fn subscribe_config(&self) -> SubscribeConfig {
        SubscribeConfig { accuracy: self.accuracy, min_distance_m: self.min_distance_m }
    }

    // Getters for all config fields
    pub fn unit_id(&self) -> &str {
        &self.unit_id
    }

    pub fn source_kind(&self) -> SourceKind {
        self.source_kind
    }

    pub fn source_device(&self) -> &str {
        &self.source_device
    }

    pub fn source_baud(&self) -> u32 {
        self.source_baud
    }

    pub fn replay_file(&self) -> &str {
        &self.replay_file
    }

    pub fn replay_loop(&self) -> bool {
        self.replay_loop
    }

    pub fn accuracy(&self) -> AccuracyTier {
        self.accuracy
    }

    pub fn min_distance_m(&self) -> f64 {
        self.min_distance_m
    }

    pub fn default_limit_kmh(&self) -> f64 {
        self.default_limit_kmh
    }

    pub fn metrics_interval_secs(&self) -> u64 {
        self.metrics_interval_secs
    }

    pub fn prometheus_port(&self) -> u16 {
        self.prometheus_port
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }

    /// Builder method for tests to set the startup limit
    #[cfg(test)]
    pub fn with_default_limit_kmh(mut self, kmh: f64) -> Self {
        self.default_limit_kmh = kmh;
        self
    }

    /// Builder method for tests to select the source backend
    #[cfg(test)]
    pub fn with_source_kind(mut self, kind: SourceKind) -> Self {
        self.source_kind = kind;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.unit_id(), "speedwatch");
        assert_eq!(config.source_kind(), SourceKind::Nmea);
        assert_eq!(config.source_device(), "/dev/ttyUSB0");
        assert_eq!(config.source_baud(), 9600);
        assert_eq!(config.default_limit_kmh(), 50.0);
        assert_eq!(config.metrics_interval_secs(), 10);
        assert_eq!(config.prometheus_port(), 9090);
        assert!(!config.replay_loop());
    }

    #[test]
    fn test_source_kind_parses_lowercase() {
        let toml_config: TomlConfig = toml::from_str("[source]\nkind = \"replay\"").unwrap();
        assert_eq!(toml_config.source.kind, SourceKind::Replay);
    }

    #[test]
    fn test_empty_file_equals_defaults() {
        let toml_config: TomlConfig = toml::from_str("").unwrap();
        assert_eq!(toml_config.limit.default_kmh, 50.0);
        assert_eq!(toml_config.source.baud, 9600);
        assert_eq!(toml_config.subscription.accuracy, AccuracyTier::Best);
        assert_eq!(toml_config.subscription.min_distance_m, 0.0);
    }

    #[test]
    fn test_subscribe_config_mapping() {
        let toml = "[subscription]\naccuracy = \"high\"\nmin_distance_m = 2.5";
        let toml_config: TomlConfig = toml::from_str(toml).unwrap();
        assert_eq!(toml_config.subscription.accuracy, AccuracyTier::High);
        assert_eq!(toml_config.subscription.min_distance_m, 2.5);
    }

    #[test]
    fn test_builder_overrides() {
        let config = Config::default()
            .with_default_limit_kmh(80.0)
            .with_source_kind(SourceKind::Replay);
        assert_eq!(config.default_limit_kmh(), 80.0);
        assert_eq!(config.source_kind(), SourceKind::Replay);
    }
}
