//! Runtime configuration

use crate::constants::{hrv, timing};
use crate::error::BiosensorError;
use crate::hrv::TimeframeConfig;
use crate::protocol::{FramedCodec, ScheduleTiming};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Sizing of one HRV timeframe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowSettings {
    pub capacity: usize,
    pub min_intervals: usize,
    pub throttle_ms: u64,
}

impl From<WindowSettings> for TimeframeConfig {
    fn from(settings: WindowSettings) -> Self {
        TimeframeConfig {
            capacity: settings.capacity,
            min_intervals: settings.min_intervals,
            throttle: Duration::from_millis(settings.throttle_ms),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Peripheral polling interval while scanning
    pub scan_interval_ms: u64,
    /// Ignore advertisements weaker than this (dBm)
    pub min_rssi: Option<i16>,
    pub connection_timeout_secs: u64,
    /// Grace period after an unexpected disconnect during a session
    pub recovery_window_secs: u64,
    /// Delay between reconnect attempts while recovering
    pub reconnect_interval_ms: u64,
    /// Radio teardown debounce after the last reference is released
    pub teardown_debounce_ms: u64,
    /// Lifetime of the single-byte streaming accumulator
    pub stream_buffer_window_ms: u64,
    /// Reject framed responses whose trailing CRC-8 does not match
    pub verify_response_checksum: bool,
    pub command_grace_ms: u64,
    pub command_step_delay_ms: u64,
    pub poll_interval_ms: u64,
    pub quick_window: WindowSettings,
    pub real_window: WindowSettings,
    pub verbose_logging: bool,
}

impl Default for Config {
    fn default() -> Self {
        let schedule = ScheduleTiming::default();
        Self {
            scan_interval_ms: timing::SCAN_INTERVAL.as_millis() as u64,
            min_rssi: None,
            connection_timeout_secs: timing::CONNECTION_TIMEOUT.as_secs(),
            recovery_window_secs: timing::RECOVERY_WINDOW.as_secs(),
            reconnect_interval_ms: 3000,
            teardown_debounce_ms: timing::TEARDOWN_DEBOUNCE.as_millis() as u64,
            stream_buffer_window_ms: timing::STREAM_BUFFER_WINDOW.as_millis() as u64,
            verify_response_checksum: true,
            command_grace_ms: schedule.grace.as_millis() as u64,
            command_step_delay_ms: schedule.step_delay.as_millis() as u64,
            poll_interval_ms: schedule.poll_interval.as_millis() as u64,
            quick_window: WindowSettings {
                capacity: hrv::QUICK_CAPACITY,
                min_intervals: hrv::QUICK_MIN_INTERVALS,
                throttle_ms: hrv::QUICK_THROTTLE.as_millis() as u64,
            },
            real_window: WindowSettings {
                capacity: hrv::REAL_CAPACITY,
                min_intervals: hrv::REAL_MIN_INTERVALS,
                throttle_ms: hrv::REAL_THROTTLE.as_millis() as u64,
            },
            verbose_logging: false,
        }
    }
}

impl Config {
    /// `<config dir>/pulsewire/config.json`
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("pulsewire")
            .join("config.json")
    }

    /// Load from JSON, or TOML when the extension is `.toml`
    pub fn load_from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => toml::from_str(&content)?,
            _ => serde_json::from_str(&content)?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn save_to_file(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Set the recovery grace period
    pub fn with_recovery_window(mut self, window: Duration) -> Self {
        self.recovery_window_secs = window.as_secs();
        self
    }

    /// Set the teardown debounce
    pub fn with_teardown_debounce(mut self, debounce: Duration) -> Self {
        self.teardown_debounce_ms = debounce.as_millis() as u64;
        self
    }

    /// Enable or disable incoming checksum verification
    pub fn with_checksum_verification(mut self, enabled: bool) -> Self {
        self.verify_response_checksum = enabled;
        self
    }

    /// Only surface devices at or above this signal strength
    pub fn with_min_rssi(mut self, rssi: i16) -> Self {
        self.min_rssi = Some(rssi);
        self
    }

    /// Enable verbose logging
    pub fn with_verbose_logging(mut self) -> Self {
        self.verbose_logging = true;
        self
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.scan_interval_ms)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    pub fn recovery_window(&self) -> Duration {
        Duration::from_secs(self.recovery_window_secs)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    pub fn teardown_debounce(&self) -> Duration {
        Duration::from_millis(self.teardown_debounce_ms)
    }

    pub fn schedule_timing(&self) -> ScheduleTiming {
        ScheduleTiming {
            grace: Duration::from_millis(self.command_grace_ms),
            step_delay: Duration::from_millis(self.command_step_delay_ms),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
        }
    }

    pub fn framed_codec(&self) -> FramedCodec {
        FramedCodec::new(
            self.verify_response_checksum,
            Duration::from_millis(self.stream_buffer_window_ms),
        )
    }

    pub fn quick_timeframe(&self) -> TimeframeConfig {
        self.quick_window.into()
    }

    pub fn real_timeframe(&self) -> TimeframeConfig {
        self.real_window.into()
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), BiosensorError> {
        let invalid = |msg: &str| Err(BiosensorError::InvalidConfig(msg.to_string()));

        if self.scan_interval_ms == 0 {
            return invalid("scan interval must be greater than 0");
        }
        if self.connection_timeout_secs == 0 {
            return invalid("connection timeout must be greater than 0");
        }
        if self.recovery_window_secs == 0 {
            return invalid("recovery window must be greater than 0");
        }
        if self.poll_interval_ms == 0 {
            return invalid("poll interval must be greater than 0");
        }
        for (name, window) in [("quick", &self.quick_window), ("real", &self.real_window)] {
            if window.capacity < 2 {
                return Err(BiosensorError::InvalidConfig(format!(
                    "{} window capacity must hold at least 2 intervals",
                    name
                )));
            }
            if window.min_intervals < 2 || window.min_intervals > window.capacity {
                return Err(BiosensorError::InvalidConfig(format!(
                    "{} window minimum must be between 2 and its capacity",
                    name
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_protocol_constants() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.recovery_window(), Duration::from_secs(30));
        assert_eq!(config.teardown_debounce(), Duration::from_millis(500));
        assert_eq!(config.quick_timeframe(), TimeframeConfig::QUICK);
        assert_eq!(config.real_timeframe(), TimeframeConfig::REAL);
        assert!(config.verify_response_checksum);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: Config = serde_json::from_str(r#"{"recovery_window_secs": 45}"#).unwrap();
        assert_eq!(config.recovery_window(), Duration::from_secs(45));
        assert_eq!(config.poll_interval_ms, 1000);
    }

    #[test]
    fn test_toml_config() {
        let config: Config = toml::from_str(
            r#"
            verify_response_checksum = false
            [quick_window]
            capacity = 30
            min_intervals = 5
            throttle_ms = 1000
            "#,
        )
        .unwrap();
        assert!(!config.verify_response_checksum);
        assert_eq!(config.quick_window.capacity, 30);
        assert_eq!(config.real_window.capacity, 300);
    }

    #[test]
    fn test_validation_errors() {
        let mut config = Config::default();
        config.quick_window.min_intervals = 100;
        assert!(config.validate().is_err());

        let config = Config {
            recovery_window_secs: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = std::env::temp_dir().join(format!("pulsewire-config-{}", uuid::Uuid::new_v4()));
        let path = dir.join("config.json");
        let config = Config::default().with_min_rssi(-80).with_checksum_verification(false);

        config.save_to_file(&path).unwrap();
        let loaded = Config::load_from_file(&path).unwrap();
        assert_eq!(loaded.min_rssi, Some(-80));
        assert!(!loaded.verify_response_checksum);

        std::fs::remove_dir_all(dir).ok();
    }
}
