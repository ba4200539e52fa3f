use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::{
    error::{ErgZoneError, Result},
    FTMS_SERVICE_UUID, HEART_RATE_SERVICE_UUID,
};

/// Stable identity of a remote device as reported by the radio
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(pub String);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Capability class of a discovered device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceClass {
    /// Smart trainer exposing the fitness machine service
    Trainer,
    /// Heart-rate strap exposing the heart rate service
    HeartRateMonitor,
}

impl DeviceClass {
    /// Primary service advertised by devices of this class
    #[must_use]
    pub const fn service_uuid(self) -> Uuid {
        match self {
            Self::Trainer => FTMS_SERVICE_UUID,
            Self::HeartRateMonitor => HEART_RATE_SERVICE_UUID,
        }
    }

    /// Classify a device by the services it advertises
    #[must_use]
    pub fn from_services(services: &[Uuid]) -> Option<Self> {
        if services.contains(&FTMS_SERVICE_UUID) {
            Some(Self::Trainer)
        } else if services.contains(&HEART_RATE_SERVICE_UUID) {
            Some(Self::HeartRateMonitor)
        } else {
            None
        }
    }
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Trainer => write!(f, "trainer"),
            Self::HeartRateMonitor => write!(f, "heart-rate monitor"),
        }
    }
}

/// A device seen during a scan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    /// Stable identity
    pub id: DeviceId,
    /// Human-readable name
    pub name: String,
    /// Capability class
    pub class: DeviceClass,
}

impl Device {
    /// Create a new device description
    #[must_use]
    pub fn new(id: impl Into<DeviceId>, name: impl Into<String>, class: DeviceClass) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            class,
        }
    }
}

impl From<String> for DeviceId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Connection state of one device-class state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// No link
    Disconnected,
    /// Link establishment in progress
    Connecting,
    /// Looking for the profile service
    DiscoveringServices,
    /// Looking for the profile characteristics
    DiscoveringCharacteristics,
    /// Notifications enabled, telemetry flowing
    Ready,
    /// Trainer only: request-control written, waiting for the response
    ControlRequested,
    /// Trainer only: control granted and training started
    Controlling,
}

impl ConnectionState {
    /// Telemetry notifications are only meaningful from `Ready` onwards
    #[must_use]
    pub const fn is_ready(self) -> bool {
        matches!(self, Self::Ready | Self::ControlRequested | Self::Controlling)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::DiscoveringServices => write!(f, "discovering services"),
            Self::DiscoveringCharacteristics => write!(f, "discovering characteristics"),
            Self::Ready => write!(f, "ready"),
            Self::ControlRequested => write!(f, "control requested"),
            Self::Controlling => write!(f, "controlling"),
        }
    }
}

/// Target heart-rate band in beats per minute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoneBounds {
    /// Lower bound (inclusive)
    pub min_bpm: u16,
    /// Upper bound (inclusive)
    pub max_bpm: u16,
}

impl ZoneBounds {
    /// Create zone bounds, rejecting an empty or inverted band
    ///
    /// # Errors
    ///
    /// Returns [`ErgZoneError::InvalidParameters`] unless `min_bpm < max_bpm`.
    pub fn new(min_bpm: u16, max_bpm: u16) -> Result<Self> {
        let zone = Self { min_bpm, max_bpm };
        zone.validate()?;
        Ok(zone)
    }

    /// Check the `min < max` invariant
    ///
    /// # Errors
    ///
    /// Returns [`ErgZoneError::InvalidParameters`] if the band is empty or inverted.
    pub fn validate(&self) -> Result<()> {
        if self.min_bpm >= self.max_bpm {
            return Err(ErgZoneError::InvalidParameters(format!(
                "zone minimum {} must be below maximum {}",
                self.min_bpm, self.max_bpm
            )));
        }
        Ok(())
    }

    /// Where a (smoothed) heart rate sits relative to the band
    #[must_use]
    pub fn classify(&self, bpm: f64) -> ZonePosition {
        if bpm < f64::from(self.min_bpm) {
            ZonePosition::Below
        } else if bpm > f64::from(self.max_bpm) {
            ZonePosition::Above
        } else {
            ZonePosition::Inside
        }
    }
}

impl Default for ZoneBounds {
    fn default() -> Self {
        Self {
            min_bpm: 120,
            max_bpm: 140,
        }
    }
}

/// Position of a heart rate relative to the zone
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZonePosition {
    /// Under the lower bound
    Below,
    /// Within the band
    Inside,
    /// Over the upper bound
    Above,
}

/// Heart-rate feed selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HrSource {
    /// Strap connected directly over the radio
    Direct,
    /// Value mirrored from a companion-device session
    Mirrored,
}

impl fmt::Display for HrSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Direct => write!(f, "direct"),
            Self::Mirrored => write!(f, "mirrored"),
        }
    }
}

/// Workout lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkoutState {
    /// Not started yet
    Idle,
    /// Sampling and controlling
    Running,
    /// Suspended by the rider
    Paused,
    /// Finished, terminal
    Completed,
}

impl From<u8> for WorkoutState {
    fn from(value: u8) -> Self {
        match value {
            1 => Self::Running,
            2 => Self::Paused,
            3 => Self::Completed,
            _ => Self::Idle,
        }
    }
}

impl From<WorkoutState> for u8 {
    fn from(value: WorkoutState) -> Self {
        match value {
            WorkoutState::Idle => 0,
            WorkoutState::Running => 1,
            WorkoutState::Paused => 2,
            WorkoutState::Completed => 3,
        }
    }
}

impl fmt::Display for WorkoutState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
            Self::Completed => write!(f, "completed"),
        }
    }
}

/// Characteristic properties relevant to the two profiles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CharacteristicProps {
    /// Supports notifications
    pub notify: bool,
    /// Supports indications (control point responses on most trainers)
    pub indicate: bool,
    /// Supports write with response
    pub write: bool,
}

/// A characteristic found during discovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicInfo {
    /// Characteristic UUID, used as its handle
    pub uuid: Uuid,
    /// Properties
    pub props: CharacteristicProps,
}

/// Write mode for a characteristic write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    /// Wait for the link-layer acknowledgement
    WithResponse,
    /// Fire and forget
    WithoutResponse,
}

/// A value notification from a remote characteristic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// Source characteristic
    pub characteristic: Uuid,
    /// Raw bytes
    pub value: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zone_bounds_invariant() {
        assert!(ZoneBounds::new(120, 140).is_ok());
        assert!(ZoneBounds::new(140, 140).is_err());
        assert!(ZoneBounds::new(150, 140).is_err());
    }

    #[test]
    fn test_zone_classification() {
        let zone = ZoneBounds::new(120, 140).unwrap();
        assert_eq!(zone.classify(119.9), ZonePosition::Below);
        assert_eq!(zone.classify(120.0), ZonePosition::Inside);
        assert_eq!(zone.classify(140.0), ZonePosition::Inside);
        assert_eq!(zone.classify(140.1), ZonePosition::Above);
    }

    #[test]
    fn test_device_class_from_services() {
        assert_eq!(
            DeviceClass::from_services(&[HEART_RATE_SERVICE_UUID, FTMS_SERVICE_UUID]),
            Some(DeviceClass::Trainer)
        );
        assert_eq!(
            DeviceClass::from_services(&[HEART_RATE_SERVICE_UUID]),
            Some(DeviceClass::HeartRateMonitor)
        );
        assert_eq!(DeviceClass::from_services(&[Uuid::nil()]), None);
    }

    #[test]
    fn test_workout_state_byte_mapping() {
        for state in [
            WorkoutState::Idle,
            WorkoutState::Running,
            WorkoutState::Paused,
            WorkoutState::Completed,
        ] {
            assert_eq!(WorkoutState::from(u8::from(state)), state);
        }
        assert_eq!(WorkoutState::from(99), WorkoutState::Idle);
    }

    #[test]
    fn test_connection_state_readiness() {
        assert!(!ConnectionState::DiscoveringCharacteristics.is_ready());
        assert!(ConnectionState::Ready.is_ready());
        assert!(ConnectionState::Controlling.is_ready());
    }
}
