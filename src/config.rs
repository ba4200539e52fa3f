use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::{
    error::{ErgZoneError, Result},
    types::{HrSource, ZoneBounds},
};

/// Tuning of the zone controller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Number of samples averaged into the smoothed heart rate
    pub smoothing_window: usize,
    /// No adjustments before this much session time has elapsed
    pub warm_up_secs: u64,
    /// Size of one power adjustment in watts
    pub step_watts: u16,
    /// Maximum distance of the adjusted power from the configured target
    pub max_drift_watts: u16,
    /// Absolute lower bound on commanded power
    pub floor_watts: u16,
    /// Minimum time after an increase before the next adjustment
    pub increase_cooldown_secs: u64,
    /// Minimum time after a decrease before the next adjustment
    pub decrease_cooldown_secs: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            smoothing_window: 10,
            warm_up_secs: 120,
            step_watts: 5,
            max_drift_watts: 50,
            floor_watts: 50,
            increase_cooldown_secs: 30,
            decrease_cooldown_secs: 60,
        }
    }
}

impl ControllerConfig {
    /// Warm-up grace period
    #[must_use]
    pub const fn warm_up(&self) -> Duration {
        Duration::from_secs(self.warm_up_secs)
    }

    /// Cooldown after an increase
    #[must_use]
    pub const fn increase_cooldown(&self) -> Duration {
        Duration::from_secs(self.increase_cooldown_secs)
    }

    /// Cooldown after a decrease
    #[must_use]
    pub const fn decrease_cooldown(&self) -> Duration {
        Duration::from_secs(self.decrease_cooldown_secs)
    }
}

/// Deadlines used by the heart-rate source arbitrator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArbiterConfig {
    /// How long a switch to the mirrored source may take before reverting
    pub switch_timeout_ms: u64,
    /// Delay between losing the mirrored link and the single relaunch
    pub relaunch_settle_ms: u64,
    /// How long the relaunched link may take to come back
    pub relaunch_timeout_ms: u64,
}

impl Default for ArbiterConfig {
    fn default() -> Self {
        Self {
            switch_timeout_ms: 15_000,
            relaunch_settle_ms: 3_000,
            relaunch_timeout_ms: 15_000,
        }
    }
}

impl ArbiterConfig {
    /// Switchover deadline
    #[must_use]
    pub const fn switch_timeout(&self) -> Duration {
        Duration::from_millis(self.switch_timeout_ms)
    }

    /// Settle delay before relaunch
    #[must_use]
    pub const fn relaunch_settle(&self) -> Duration {
        Duration::from_millis(self.relaunch_settle_ms)
    }

    /// Relaunch deadline
    #[must_use]
    pub const fn relaunch_timeout(&self) -> Duration {
        Duration::from_millis(self.relaunch_timeout_ms)
    }
}

/// Radio timeouts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Link establishment timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Link establishment timeout while a workout is running or paused
    pub reconnect_timeout_ms: u64,
    /// Default scan window in milliseconds
    pub scan_timeout_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 30_000,
            reconnect_timeout_ms: 5_000,
            scan_timeout_ms: 10_000,
        }
    }
}

impl TimeoutConfig {
    /// Link establishment timeout
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Link establishment timeout mid-workout
    #[must_use]
    pub const fn reconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.reconnect_timeout_ms)
    }

    /// Scan window
    #[must_use]
    pub const fn scan_timeout(&self) -> Duration {
        Duration::from_millis(self.scan_timeout_ms)
    }
}

/// Everything a workout session reads at start
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// ERG target power in watts
    pub target_power: u16,
    /// Workout length in seconds
    pub target_duration_secs: u64,
    /// Heart-rate zone
    pub zone: ZoneBounds,
    /// Heart-rate source selected at start
    pub hr_source: HrSource,
    /// Length of one progress chunk in seconds
    pub chunk_duration_secs: u64,
    /// Sampling cadence in milliseconds
    pub sample_interval_ms: u64,
    /// Controller tuning
    pub controller: ControllerConfig,
    /// Arbitrator deadlines
    pub arbiter: ArbiterConfig,
    /// Radio timeouts
    pub timeouts: TimeoutConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            target_power: 150,
            target_duration_secs: 3_600,
            zone: ZoneBounds::default(),
            hr_source: HrSource::Direct,
            chunk_duration_secs: 300,
            sample_interval_ms: 1_000,
            controller: ControllerConfig::default(),
            arbiter: ArbiterConfig::default(),
            timeouts: TimeoutConfig::default(),
        }
    }
}

impl SessionConfig {
    /// Parse a settings document
    ///
    /// Missing keys fall back to their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ErgZoneError::Settings`] for malformed JSON and
    /// [`ErgZoneError::InvalidParameters`] if the values fail validation.
    pub fn from_json_str(document: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(document)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the configuration invariants
    ///
    /// # Errors
    ///
    /// Returns [`ErgZoneError::InvalidParameters`] describing the first violated rule.
    pub fn validate(&self) -> Result<()> {
        self.zone.validate()?;
        if self.target_power == 0 || self.target_power > i16::MAX.unsigned_abs() {
            return Err(ErgZoneError::InvalidParameters(format!(
                "target power {} W is out of range",
                self.target_power
            )));
        }
        if self.target_duration_secs == 0 {
            return Err(ErgZoneError::InvalidParameters(
                "target duration must be positive".to_string(),
            ));
        }
        if self.controller.smoothing_window == 0 {
            return Err(ErgZoneError::InvalidParameters(
                "smoothing window must hold at least one sample".to_string(),
            ));
        }
        if self.sample_interval_ms == 0 || self.chunk_duration_secs == 0 {
            return Err(ErgZoneError::InvalidParameters(
                "sample interval and chunk duration must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Workout length
    #[must_use]
    pub const fn target_duration(&self) -> Duration {
        Duration::from_secs(self.target_duration_secs)
    }

    /// Progress chunk length
    #[must_use]
    pub const fn chunk_duration(&self) -> Duration {
        Duration::from_secs(self.chunk_duration_secs)
    }

    /// Sampling cadence
    #[must_use]
    pub const fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }
}

/// Read-only source of rider settings, consulted once per session
pub trait SettingsStore {
    /// Load the configuration for the next session
    ///
    /// # Errors
    ///
    /// Returns an error if the settings cannot be read or are invalid.
    fn load_session_config(&self) -> Result<SessionConfig>;
}

/// Settings held as a JSON document
#[derive(Debug, Clone)]
pub struct JsonSettings {
    document: String,
}

impl JsonSettings {
    /// Wrap a JSON document
    #[must_use]
    pub fn new(document: impl Into<String>) -> Self {
        Self {
            document: document.into(),
        }
    }
}

impl SettingsStore for JsonSettings {
    fn load_session_config(&self) -> Result<SessionConfig> {
        SessionConfig::from_json_str(&self.document)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_config_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.target_power, 150);
        assert_eq!(config.zone, ZoneBounds::default());
        assert_eq!(config.hr_source, HrSource::Direct);
        assert_eq!(config.controller.step_watts, 5);
        assert!(config.controller.decrease_cooldown() > config.controller.increase_cooldown());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_settings_document() {
        let settings = JsonSettings::new(
            r#"{ "target_power": 180, "zone": { "min_bpm": 130, "max_bpm": 145 }, "hr_source": "mirrored" }"#,
        );
        let config = settings.load_session_config().unwrap();
        assert_eq!(config.target_power, 180);
        assert_eq!(config.zone.min_bpm, 130);
        assert_eq!(config.hr_source, HrSource::Mirrored);
        assert_eq!(config.target_duration_secs, 3_600);
        assert_eq!(config.arbiter, ArbiterConfig::default());
    }

    #[test]
    fn test_settings_validation() {
        let inverted = r#"{ "zone": { "min_bpm": 150, "max_bpm": 140 } }"#;
        assert!(matches!(
            SessionConfig::from_json_str(inverted),
            Err(ErgZoneError::InvalidParameters(_))
        ));

        assert!(matches!(
            SessionConfig::from_json_str("{ not json"),
            Err(ErgZoneError::Settings(_))
        ));

        let config = SessionConfig {
            controller: ControllerConfig {
                smoothing_window: 0,
                ..ControllerConfig::default()
            },
            ..SessionConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
