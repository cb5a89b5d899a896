//! Fan bank configuration

use crate::errors::{FanError, Result};
use crate::frequency::MIN_SAMPLE_TIME;
use crate::hardware::{EdgeMode, PinId};
use log::warn;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_CONTROL_PINS: [u16; 8] = [32, 33, 25, 26, 27, 14, 12, 13];
const DEFAULT_FEEDBACK_PINS: [u16; 8] = [19, 18, 5, 17, 16, 4, 2, 15];

/// Static description of the fan bank, fixed for the life of the process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FanBankConfig {
    pub fan_count: usize,
    pub control_pins: Vec<PinId>,
    pub feedback_pins: Vec<PinId>,
    pub pwm_frequency_hz: u32,
    /// Number of steps of the PWM compare register (1023 for 10 bit)
    pub pwm_resolution: u16,
    /// Edges registered per revolution under `edge_mode`
    pub pulses_per_revolution: u32,
    pub edge_mode: EdgeMode,
    pub default_speed: u8,
    pub min_speed: u8,
    pub max_speed: u8,
    pub measurement_window_ms: u64,
    pub poll_interval_ms: u64,
    /// Consecutive in-tolerance samples needed before a wait converges
    pub stable_samples: u32,
    pub health_threshold_rpm: f64,
    pub emergency_stop_retries: u32,
    /// Build the bank even if a feedback input cannot be attached
    pub ignore_missing_feedback: bool,
    /// Build the bank even if a PWM output cannot be configured
    pub ignore_missing_control: bool,
}

impl Default for FanBankConfig {
    fn default() -> Self {
        Self {
            fan_count: DEFAULT_CONTROL_PINS.len(),
            control_pins: DEFAULT_CONTROL_PINS.iter().copied().map(PinId).collect(),
            feedback_pins: DEFAULT_FEEDBACK_PINS.iter().copied().map(PinId).collect(),
            pwm_frequency_hz: 25_000,
            pwm_resolution: 1023,
            pulses_per_revolution: 2,
            edge_mode: EdgeMode::Both,
            default_speed: 50,
            min_speed: 0,
            max_speed: 100,
            measurement_window_ms: 500,
            poll_interval_ms: 500,
            stable_samples: 1,
            health_threshold_rpm: 500.0,
            emergency_stop_retries: 3,
            ignore_missing_feedback: true,
            ignore_missing_control: true,
        }
    }
}

impl FanBankConfig {
    /// Config for `fan_count` fans with sequential pin numbers, mainly for tests
    pub fn with_fan_count(fan_count: usize) -> Self {
        let fan_count_u16 = fan_count as u16;
        Self {
            fan_count,
            control_pins: (0..fan_count_u16).map(PinId).collect(),
            feedback_pins: (0..fan_count_u16).map(|i| PinId(100 + i)).collect(),
            ..Self::default()
        }
    }

    pub fn measurement_window(&self) -> Duration {
        Duration::from_millis(self.measurement_window_ms)
    }

    /// Polling period of a stabilization wait: never shorter than a window
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms).max(self.measurement_window())
    }

    /// Check the configuration for internal consistency
    pub fn validate(&self) -> Result<()> {
        if self.fan_count == 0 {
            return Err(FanError::Config("fan_count must be at least 1".to_string()));
        }
        if self.control_pins.len() != self.fan_count {
            return Err(FanError::Config(format!(
                "{} control pins configured for {} fans",
                self.control_pins.len(),
                self.fan_count
            )));
        }
        if self.feedback_pins.len() != self.fan_count {
            return Err(FanError::Config(format!(
                "{} feedback pins configured for {} fans",
                self.feedback_pins.len(),
                self.fan_count
            )));
        }

        let mut seen = HashSet::new();
        for pin in self.control_pins.iter().chain(self.feedback_pins.iter()) {
            if !seen.insert(*pin) {
                return Err(FanError::Config(format!("{} is assigned more than once", pin)));
            }
        }

        if self.min_speed > self.max_speed || self.max_speed > 100 {
            return Err(FanError::Config(format!(
                "Invalid speed range {}-{}%",
                self.min_speed, self.max_speed
            )));
        }
        if !(self.min_speed..=self.max_speed).contains(&self.default_speed) {
            return Err(FanError::Config(format!(
                "Default speed {}% outside {}-{}%",
                self.default_speed, self.min_speed, self.max_speed
            )));
        }
        if !(1_000..=50_000).contains(&self.pwm_frequency_hz) {
            return Err(FanError::Config(format!(
                "PWM frequency {} Hz outside 1000-50000 Hz",
                self.pwm_frequency_hz
            )));
        }
        if self.pwm_resolution == 0 {
            return Err(FanError::Config("pwm_resolution must be non-zero".to_string()));
        }
        if self.measurement_window() < MIN_SAMPLE_TIME {
            return Err(FanError::Config(format!(
                "Measurement window must be at least {} ms",
                MIN_SAMPLE_TIME.as_millis()
            )));
        }
        if self.poll_interval_ms == 0 {
            return Err(FanError::Config("poll_interval_ms must be non-zero".to_string()));
        }
        if self.stable_samples == 0 {
            return Err(FanError::Config("stable_samples must be at least 1".to_string()));
        }
        if !self.health_threshold_rpm.is_finite() || self.health_threshold_rpm < 0.0 {
            return Err(FanError::Config(format!(
                "Invalid health threshold {} RPM",
                self.health_threshold_rpm
            )));
        }

        // Not fatal: readings report UndefinedConversion until corrected
        if self.pulses_per_revolution == 0 {
            warn!("pulses_per_revolution is 0; RPM readings will be undefined");
        }

        Ok(())
    }

    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        let json = fs::read_to_string(path)?;
        let config: FanBankConfig = serde_json::from_str(&json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path` if it exists, otherwise fall back to defaults
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load_from_file(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn config_path() -> PathBuf {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
        PathBuf::from(home)
            .join(".fg_fan_control")
            .join("config.json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_matches_board() {
        let config = FanBankConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.fan_count, 8);
        assert_eq!(config.control_pins[0], PinId(32));
        assert_eq!(config.feedback_pins[7], PinId(15));
        assert_eq!(config.poll_interval(), Duration::from_millis(500));
    }

    #[test]
    fn test_poll_interval_never_below_window() {
        let config = FanBankConfig {
            measurement_window_ms: 800,
            poll_interval_ms: 100,
            ..FanBankConfig::default()
        };
        assert_eq!(config.poll_interval(), Duration::from_millis(800));
    }

    #[test]
    fn test_rejects_shared_pins() {
        let mut config = FanBankConfig::with_fan_count(2);
        config.feedback_pins[1] = config.feedback_pins[0];
        assert!(matches!(config.validate(), Err(FanError::Config(_))));

        let mut config = FanBankConfig::with_fan_count(2);
        config.feedback_pins[0] = config.control_pins[1];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_bad_ranges() {
        let bad = [
            FanBankConfig {
                min_speed: 60,
                max_speed: 40,
                ..FanBankConfig::default()
            },
            FanBankConfig {
                max_speed: 120,
                ..FanBankConfig::default()
            },
            FanBankConfig {
                default_speed: 10,
                min_speed: 20,
                ..FanBankConfig::default()
            },
            FanBankConfig {
                measurement_window_ms: 2,
                ..FanBankConfig::default()
            },
            FanBankConfig {
                pwm_frequency_hz: 100,
                ..FanBankConfig::default()
            },
            FanBankConfig {
                stable_samples: 0,
                ..FanBankConfig::default()
            },
            FanBankConfig {
                health_threshold_rpm: -5.0,
                ..FanBankConfig::default()
            },
            FanBankConfig {
                fan_count: 3,
                ..FanBankConfig::default()
            },
        ];
        for config in bad {
            assert!(config.validate().is_err(), "accepted {:?}", config);
        }
    }

    #[test]
    fn test_zero_pulses_is_not_a_load_error() {
        let config = FanBankConfig {
            pulses_per_revolution: 0,
            ..FanBankConfig::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let config = FanBankConfig {
            pulses_per_revolution: 4,
            stable_samples: 3,
            ..FanBankConfig::default()
        };
        config.save_to_file(&path).unwrap();

        let loaded = FanBankConfig::load_from_file(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{ "pulses_per_revolution": 4, "edge_mode": "rising" }"#).unwrap();

        let loaded = FanBankConfig::load_from_file(&path).unwrap();
        assert_eq!(loaded.pulses_per_revolution, 4);
        assert_eq!(loaded.edge_mode, EdgeMode::Rising);
        assert_eq!(loaded.fan_count, 8);
        assert!(loaded.ignore_missing_control);
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = FanBankConfig::load_or_default(&dir.path().join("absent.json")).unwrap();
        assert_eq!(loaded, FanBankConfig::default());
    }
}
