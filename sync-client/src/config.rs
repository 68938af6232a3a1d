//! Configuration loading for the sync engine.
//!
//! Configuration is loaded from a TOML file (default: `linkwise.toml`).
//! Every section and field is optional; missing values use the defaults.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use linkwise_sync_core::tracker::MAX_ATTEMPTS_LIMIT;
use linkwise_sync_core::{
    DeliveryTimeouts, HysteresisThresholds, LevelMultipliers, SchedulerConfig,
};
use linkwise_sync_types::Namespace;

/// Root configuration for the sync engine.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Queue configuration.
    pub queue: QueueConfig,
    /// Delivery configuration.
    pub delivery: DeliveryConfig,
    /// Compression configuration.
    pub compression: CompressionConfig,
    /// Power scheduler configuration.
    pub power: PowerConfig,
    /// Full sync configuration.
    pub sync: FullSyncConfig,
}

/// Queue configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// Maximum queued operations (default: 512).
    #[serde(default = "default_queue_capacity")]
    pub capacity: usize,
    /// Maximum envelopes awaiting ack at once (default: 4).
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
}

/// Delivery configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DeliveryConfig {
    /// Ack deadline for critical envelopes in seconds (default: 5).
    #[serde(default = "default_critical_timeout")]
    pub critical_timeout_secs: u64,
    /// Ack deadline for high envelopes in seconds (default: 10).
    #[serde(default = "default_high_timeout")]
    pub high_timeout_secs: u64,
    /// Ack deadline for normal envelopes in seconds (default: 15).
    #[serde(default = "default_normal_timeout")]
    pub normal_timeout_secs: u64,
    /// Ack deadline for low envelopes in seconds (default: 30).
    #[serde(default = "default_low_timeout")]
    pub low_timeout_secs: u64,
    /// Attempts before an operation fails permanently (default: 3).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Latency samples kept for quality classification (default: 50).
    /// Clamped to 10..=100.
    #[serde(default = "default_latency_window")]
    pub latency_window: usize,
}

/// Compression configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CompressionConfig {
    /// Payloads above this size are compressed (default: 1024).
    #[serde(default = "default_threshold_bytes")]
    pub threshold_bytes: usize,
    /// Cached compression results (default: 50).
    #[serde(default = "default_cache_entries")]
    pub cache_entries: usize,
    /// Zstd level (default: 3).
    #[serde(default = "default_compression_level")]
    pub level: i32,
}

/// Power scheduler configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct PowerConfig {
    /// Battery/thermal sampling interval in seconds (default: 30).
    #[serde(default = "default_sample_interval")]
    pub sample_interval_secs: u64,
    /// Enter aggressive below this battery level (default: 0.15).
    #[serde(default = "default_aggressive_enter")]
    pub aggressive_enter_battery: f32,
    /// Leave aggressive above this battery level (default: 0.25).
    #[serde(default = "default_aggressive_exit")]
    pub aggressive_exit_battery: f32,
    /// Enter conservative below this battery level (default: 0.35).
    #[serde(default = "default_conservative_enter")]
    pub conservative_enter_battery: f32,
    /// Leave conservative above this battery level (default: 0.45).
    #[serde(default = "default_conservative_exit")]
    pub conservative_exit_battery: f32,
    /// Interval multiplier under conservative (default: 2.0).
    #[serde(default = "default_conservative_multiplier")]
    pub conservative_multiplier: f64,
    /// Interval multiplier under aggressive (default: 4.0).
    #[serde(default = "default_aggressive_multiplier")]
    pub aggressive_multiplier: f64,
}

/// Full sync configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct FullSyncConfig {
    /// Minimum spacing between full syncs in seconds (default: 300).
    #[serde(default = "default_full_sync_cooldown")]
    pub full_sync_cooldown_secs: u64,
    /// Namespace active at start (default: "default").
    #[serde(default = "default_namespace")]
    pub namespace: String,
}

// Default value functions
fn default_queue_capacity() -> usize {
    512
}

fn default_max_in_flight() -> usize {
    4
}

fn default_critical_timeout() -> u64 {
    5
}

fn default_high_timeout() -> u64 {
    10
}

fn default_normal_timeout() -> u64 {
    15
}

fn default_low_timeout() -> u64 {
    30
}

fn default_max_attempts() -> u32 {
    3
}

fn default_latency_window() -> usize {
    50
}

fn default_threshold_bytes() -> usize {
    1024
}

fn default_cache_entries() -> usize {
    50
}

fn default_compression_level() -> i32 {
    3
}

fn default_sample_interval() -> u64 {
    30
}

fn default_aggressive_enter() -> f32 {
    0.15
}

fn default_aggressive_exit() -> f32 {
    0.25
}

fn default_conservative_enter() -> f32 {
    0.35
}

fn default_conservative_exit() -> f32 {
    0.45
}

fn default_conservative_multiplier() -> f64 {
    2.0
}

fn default_aggressive_multiplier() -> f64 {
    4.0
}

fn default_full_sync_cooldown() -> u64 {
    300 // 5 minutes
}

fn default_namespace() -> String {
    "default".to_string()
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: default_queue_capacity(),
            max_in_flight: default_max_in_flight(),
        }
    }
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            critical_timeout_secs: default_critical_timeout(),
            high_timeout_secs: default_high_timeout(),
            normal_timeout_secs: default_normal_timeout(),
            low_timeout_secs: default_low_timeout(),
            max_attempts: default_max_attempts(),
            latency_window: default_latency_window(),
        }
    }
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            threshold_bytes: default_threshold_bytes(),
            cache_entries: default_cache_entries(),
            level: default_compression_level(),
        }
    }
}

impl Default for PowerConfig {
    fn default() -> Self {
        Self {
            sample_interval_secs: default_sample_interval(),
            aggressive_enter_battery: default_aggressive_enter(),
            aggressive_exit_battery: default_aggressive_exit(),
            conservative_enter_battery: default_conservative_enter(),
            conservative_exit_battery: default_conservative_exit(),
            conservative_multiplier: default_conservative_multiplier(),
            aggressive_multiplier: default_aggressive_multiplier(),
        }
    }
}

impl Default for FullSyncConfig {
    fn default() -> Self {
        Self {
            full_sync_cooldown_secs: default_full_sync_cooldown(),
            namespace: default_namespace(),
        }
    }
}

impl DeliveryConfig {
    /// Ack deadlines per priority.
    pub fn timeouts(&self) -> DeliveryTimeouts {
        DeliveryTimeouts {
            critical: Duration::from_secs(self.critical_timeout_secs),
            high: Duration::from_secs(self.high_timeout_secs),
            normal: Duration::from_secs(self.normal_timeout_secs),
            low: Duration::from_secs(self.low_timeout_secs),
        }
    }
}

impl PowerConfig {
    /// Scheduler tuning with default baselines.
    pub fn scheduler(&self) -> SchedulerConfig {
        SchedulerConfig {
            thresholds: HysteresisThresholds {
                aggressive_enter: self.aggressive_enter_battery,
                aggressive_exit: self.aggressive_exit_battery,
                conservative_enter: self.conservative_enter_battery,
                conservative_exit: self.conservative_exit_battery,
            },
            multipliers: LevelMultipliers {
                conservative: self.conservative_multiplier,
                aggressive: self.aggressive_multiplier,
            },
            ..SchedulerConfig::default()
        }
    }

    /// Sampling interval.
    pub fn sample_interval(&self) -> Duration {
        Duration::from_secs(self.sample_interval_secs.max(1))
    }
}

impl FullSyncConfig {
    /// Full sync cool-down.
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.full_sync_cooldown_secs)
    }

    /// Initial namespace.
    pub fn initial_namespace(&self) -> Namespace {
        Namespace::new(self.namespace.clone())
    }
}

impl SyncConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or holds
    /// inconsistent values.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.power.scheduler().thresholds.is_valid() {
            return Err(ConfigError::Invalid {
                reason: "power thresholds must satisfy enter < exit and aggressive <= conservative"
                    .into(),
            });
        }
        if self.queue.max_in_flight == 0 {
            return Err(ConfigError::Invalid {
                reason: "queue.max_in_flight must be at least 1".into(),
            });
        }
        if !(1..=MAX_ATTEMPTS_LIMIT).contains(&self.delivery.max_attempts) {
            return Err(ConfigError::Invalid {
                reason: format!("delivery.max_attempts must be between 1 and {MAX_ATTEMPTS_LIMIT}"),
            });
        }
        if !LevelMultipliers::CONSERVATIVE_RANGE.contains(&self.power.conservative_multiplier) {
            return Err(ConfigError::Invalid {
                reason: "power.conservative_multiplier must be between 1.5 and 3.0".into(),
            });
        }
        if !LevelMultipliers::AGGRESSIVE_RANGE.contains(&self.power.aggressive_multiplier) {
            return Err(ConfigError::Invalid {
                reason: "power.aggressive_multiplier must be between 3.0 and 6.0".into(),
            });
        }
        Ok(())
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// Failed to parse configuration file.
    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying TOML parse error.
        source: toml::de::Error,
    },
    /// Values parsed but are inconsistent.
    #[error("invalid configuration: {reason}")]
    Invalid {
        /// What is wrong.
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = SyncConfig::default();
        assert_eq!(config.queue.capacity, 512);
        assert_eq!(config.delivery.max_attempts, 3);
        assert_eq!(config.compression.threshold_bytes, 1024);
        assert_eq!(config.sync.full_sync_cooldown_secs, 300);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn config_from_toml_string() {
        let toml = r#"
[queue]
capacity = 64

[delivery]
high_timeout_secs = 20
latency_window = 25

[compression]
level = 9

[power]
aggressive_enter_battery = 0.10

[sync]
namespace = "watch-7"
"#;

        let config: SyncConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.queue.capacity, 64);
        assert_eq!(config.queue.max_in_flight, 4);
        assert_eq!(config.delivery.timeouts().high, Duration::from_secs(20));
        assert_eq!(config.delivery.latency_window, 25);
        assert_eq!(config.compression.level, 9);
        assert_eq!(config.power.scheduler().thresholds.aggressive_enter, 0.10);
        assert_eq!(config.sync.initial_namespace(), Namespace::new("watch-7"));
    }

    #[test]
    fn empty_file_uses_defaults() {
        let config: SyncConfig = toml::from_str("").unwrap();
        assert_eq!(config.delivery.timeouts(), DeliveryTimeouts::default());
        assert_eq!(config.power.sample_interval(), Duration::from_secs(30));
        assert_eq!(config.sync.namespace, "default");
    }

    #[test]
    fn inverted_thresholds_are_rejected() {
        let toml = r#"
[power]
aggressive_enter_battery = 0.30
aggressive_exit_battery = 0.20
"#;
        let config: SyncConfig = toml::from_str(toml).unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { .. })
        ));
    }

    #[test]
    fn attempt_bound_is_enforced() {
        for attempts in [0, 5, 100] {
            let mut config = SyncConfig::default();
            config.delivery.max_attempts = attempts;
            assert!(
                matches!(config.validate(), Err(ConfigError::Invalid { .. })),
                "max_attempts = {attempts}"
            );
        }

        let mut config = SyncConfig::default();
        config.delivery.max_attempts = 4;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn multipliers_out_of_range_are_rejected() {
        let toml = r#"
[power]
conservative_multiplier = 1.0
"#;
        let config: SyncConfig = toml::from_str(toml).unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("conservative_multiplier"));

        let toml = r#"
[power]
aggressive_multiplier = 10.0
"#;
        let config: SyncConfig = toml::from_str(toml).unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("aggressive_multiplier"));

        let toml = r#"
[power]
conservative_multiplier = 3.0
aggressive_multiplier = 3.0
"#;
        let config: SyncConfig = toml::from_str(toml).unwrap();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn from_file_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("linkwise.toml");

        let err = SyncConfig::from_file(&path).unwrap_err();
        assert!(matches!(err, ConfigError::ReadError { .. }));

        std::fs::write(&path, "[queue]\ncapacity = \"lots\"\n").unwrap();
        let err = SyncConfig::from_file(&path).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { .. }));
        assert!(err.to_string().contains("linkwise.toml"));

        std::fs::write(&path, "[queue]\ncapacity = 8\n").unwrap();
        assert_eq!(SyncConfig::from_file(&path).unwrap().queue.capacity, 8);
    }
}
