//! Client configuration
//!
//! All heuristics that were tuned empirically (EOSE decay, flapping backoff,
//! system-wide disconnect detection) are plain config values with defaults.

use crate::error::{ClientError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// What to do with malformed filters passed to `subscribe`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterValidationMode {
    /// Reject with an error listing every issue
    #[default]
    Validate,
    /// Strip invalid entries
    Fix,
    /// Pass filters through unchanged
    Ignore,
}

/// End-of-stream decay heuristic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EoseConfig {
    pub base_wait_ms: u64,
    /// Relays that must have sent EOSE before the timer engages
    pub min_relays: usize,
    /// Fraction of connected relays that must have sent EOSE
    pub min_fraction: f64,
    /// Re-arm the timer if an event arrived within this window
    pub streaming_guard_ms: u64,
}

impl Default for EoseConfig {
    fn default() -> Self {
        Self {
            base_wait_ms: 1000,
            min_relays: 2,
            min_fraction: 0.5,
            streaming_guard_ms: 20,
        }
    }
}

/// Reconnection and flapping backoff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FlappingConfig {
    pub base_backoff_ms: u64,
    /// Share of flapping relays that resets every backoff
    pub mass_flapping_ratio: f64,
    pub reconnect_window_ms: u64,
    pub reconnect_base_delay_ms: u64,
    pub max_reconnect_attempts: u32,
    pub stddev_threshold_ms: f64,
}

impl Default for FlappingConfig {
    fn default() -> Self {
        Self {
            base_backoff_ms: 5000,
            mass_flapping_ratio: 0.8,
            reconnect_window_ms: 60_000,
            reconnect_base_delay_ms: 5000,
            max_reconnect_attempts: 5,
            stddev_threshold_ms: 1000.0,
        }
    }
}

/// Detection of many relays dropping at once (network change, sleep).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SystemDisconnectConfig {
    pub window_ms: u64,
    pub retention_ms: u64,
    pub cooldown_ms: u64,
}

impl Default for SystemDisconnectConfig {
    fn default() -> Self {
        Self {
            window_ms: 5000,
            retention_ms: 10_000,
            cooldown_ms: 10_000,
        }
    }
}

/// Top-level client configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientConfig {
    pub explicit_relay_urls: Vec<String>,
    pub blacklist_relay_urls: Vec<String>,
    pub auto_connect_user_relays: bool,
    pub enable_outbox_model: bool,
    pub eose: EoseConfig,
    pub flapping: FlappingConfig,
    pub system_disconnect: SystemDisconnectConfig,
    pub temporary_relay_ttl_ms: u64,
    pub publish_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    /// Events further than this in the future are dropped
    pub future_timestamp_grace_secs: Option<u64>,
    pub filter_validation_mode: FilterValidationMode,
    pub initial_validation_ratio: f64,
    pub lowest_validation_ratio: f64,
    pub validation_stats_interval_ms: Option<u64>,
    pub evict_on_invalid_signature: bool,
    pub groupable_delay_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            explicit_relay_urls: Vec::new(),
            blacklist_relay_urls: Vec::new(),
            auto_connect_user_relays: true,
            enable_outbox_model: true,
            eose: EoseConfig::default(),
            flapping: FlappingConfig::default(),
            system_disconnect: SystemDisconnectConfig::default(),
            temporary_relay_ttl_ms: 30_000,
            publish_timeout_ms: 2500,
            connect_timeout_ms: 5000,
            future_timestamp_grace_secs: None,
            filter_validation_mode: FilterValidationMode::Validate,
            initial_validation_ratio: 1.0,
            lowest_validation_ratio: 0.1,
            validation_stats_interval_ms: None,
            evict_on_invalid_signature: false,
            groupable_delay_ms: 10,
        }
    }
}

impl ClientConfig {
    /// Load from a JSON file. Missing fields take their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json(&contents)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        for (name, ratio) in [
            ("initialValidationRatio", self.initial_validation_ratio),
            ("lowestValidationRatio", self.lowest_validation_ratio),
            ("flapping.massFlappingRatio", self.flapping.mass_flapping_ratio),
            ("eose.minFraction", self.eose.min_fraction),
        ] {
            if !(0.0..=1.0).contains(&ratio) {
                return Err(ClientError::Config(format!(
                    "{} must be between 0 and 1, got {}",
                    name, ratio
                )));
            }
        }
        Ok(())
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn temporary_relay_ttl(&self) -> Duration {
        Duration::from_millis(self.temporary_relay_ttl_ms)
    }

    pub fn groupable_delay(&self) -> Duration {
        Duration::from_millis(self.groupable_delay_ms)
    }
}
