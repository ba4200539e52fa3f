use bytes::Buf;
use std::{sync::Arc, time::Duration};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    config::TimeoutConfig,
    error::{ErgZoneError, Result},
    event::{CoreEvent, EventSink},
    transport::{open_profile, Transport},
    types::{ConnectionState, Device, DeviceClass, Notification},
    HEART_RATE_MEASUREMENT_UUID, HEART_RATE_SERVICE_UUID,
};

const FLAG_VALUE_U16: u8 = 0x01;
const FLAG_CONTACT_DETECTED: u8 = 0x02;
const FLAG_CONTACT_SUPPORTED: u8 = 0x04;

/// Skin-contact status reported by the strap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorContact {
    /// The strap does not report contact
    NotSupported,
    /// Contact is reported and present
    Detected,
    /// Contact is reported and lost (the value is usually unreliable)
    Lost,
}

/// One decoded heart rate measurement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartRateMeasurement {
    /// Beats per minute
    pub bpm: u16,
    /// Contact status
    pub contact: SensorContact,
}

/// Decode a Heart Rate Measurement notification
///
/// Flag bit 0 selects a `u8` or little-endian `u16` value at offset 1. Frames
/// too short for the selected format yield `None`.
#[must_use]
pub fn decode_heart_rate(data: &[u8]) -> Option<HeartRateMeasurement> {
    let mut buf = data;
    if !buf.has_remaining() {
        return None;
    }
    let flags = buf.get_u8();

    let bpm = if flags & FLAG_VALUE_U16 == 0 {
        if buf.remaining() < 1 {
            return None;
        }
        u16::from(buf.get_u8())
    } else {
        if buf.remaining() < 2 {
            return None;
        }
        buf.get_u16_le()
    };

    let contact = match (
        flags & FLAG_CONTACT_SUPPORTED != 0,
        flags & FLAG_CONTACT_DETECTED != 0,
    ) {
        (false, _) => SensorContact::NotSupported,
        (true, true) => SensorContact::Detected,
        (true, false) => SensorContact::Lost,
    };

    Some(HeartRateMeasurement { bpm, contact })
}

/// Direct link to a heart-rate strap
///
/// Same connection walk as the trainer, ending in `ready`; there is no
/// control phase.
pub struct HeartRateSensor {
    transport: Arc<dyn Transport>,
    events: EventSink,
    timeouts: TimeoutConfig,
    device: Option<Device>,
    state: ConnectionState,
    measurement: Option<Uuid>,
}

impl HeartRateSensor {
    /// Create a disconnected sensor link
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, events: EventSink, timeouts: TimeoutConfig) -> Self {
        Self {
            transport,
            events,
            timeouts,
            device: None,
            state: ConnectionState::Disconnected,
            measurement: None,
        }
    }

    /// Current connection state
    #[must_use]
    pub const fn state(&self) -> ConnectionState {
        self.state
    }

    /// Whether measurements are flowing
    #[must_use]
    pub const fn is_connected(&self) -> bool {
        self.state.is_ready()
    }

    /// Connected strap
    #[must_use]
    pub const fn device(&self) -> Option<&Device> {
        self.device.as_ref()
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state == state {
            return;
        }
        info!("Heart-rate monitor: {} -> {}", self.state, state);
        self.state = state;
        self.events.emit(CoreEvent::ConnectionChanged {
            class: DeviceClass::HeartRateMonitor,
            state,
        });
    }

    /// Connect to a strap and subscribe to measurements
    ///
    /// # Errors
    ///
    /// Returns [`ErgZoneError::InvalidParameters`] for a non-strap device,
    /// [`ErgZoneError::InvalidState`] if a link is already up, or the transport
    /// error that aborted the sequence.
    pub async fn connect(&mut self, device: Device) -> Result<()> {
        let connect_timeout = self.timeouts.connect_timeout();
        self.connect_within(device, connect_timeout).await
    }

    /// Connect with an explicit link timeout
    ///
    /// # Errors
    ///
    /// Same as [`HeartRateSensor::connect`].
    pub async fn connect_within(&mut self, device: Device, connect_timeout: Duration) -> Result<()> {
        if device.class != DeviceClass::HeartRateMonitor {
            return Err(ErgZoneError::InvalidParameters(format!(
                "{} is a {}, not a heart-rate monitor",
                device.name, device.class
            )));
        }
        if self.state != ConnectionState::Disconnected {
            return Err(ErgZoneError::InvalidState {
                state: self.state.to_string(),
            });
        }

        self.device = Some(device.clone());
        let transport = self.transport.clone();

        let result = open_profile(
            transport.as_ref(),
            &device,
            HEART_RATE_SERVICE_UUID,
            &[HEART_RATE_MEASUREMENT_UUID],
            &[HEART_RATE_MEASUREMENT_UUID],
            connect_timeout,
            |state| self.set_state(state),
        )
        .await;

        match result {
            Ok(profile) => {
                self.measurement = profile.characteristics.first().copied();
                self.set_state(ConnectionState::Ready);
                Ok(())
            }
            Err(e) => {
                warn!("Heart-rate monitor failure: {}", e);
                self.events.emit(CoreEvent::TransportFailure {
                    class: DeviceClass::HeartRateMonitor,
                    reason: e.to_string(),
                });
                self.reset_link();
                Err(e)
            }
        }
    }

    /// Disconnect from the strap
    ///
    /// # Errors
    ///
    /// Returns the transport error from the disconnect request; the link is
    /// reset either way.
    pub async fn disconnect(&mut self) -> Result<()> {
        let result = match self.device.clone() {
            Some(device) => self.transport.disconnect(&device).await,
            None => Ok(()),
        };
        self.reset_link();
        result
    }

    /// React to an unsolicited link loss
    pub fn handle_disconnect(&mut self) {
        if self.state == ConnectionState::Disconnected {
            return;
        }
        warn!("Heart-rate monitor link lost");
        self.events.emit(CoreEvent::TransportFailure {
            class: DeviceClass::HeartRateMonitor,
            reason: "link lost".to_string(),
        });
        self.reset_link();
    }

    /// Decode a measurement notification
    ///
    /// Returns `None` for other characteristics, malformed frames, or before
    /// the link is ready.
    #[must_use]
    pub fn handle_notification(&self, notification: &Notification) -> Option<HeartRateMeasurement> {
        if !self.state.is_ready() || Some(notification.characteristic) != self.measurement {
            return None;
        }
        let measurement = decode_heart_rate(&notification.value);
        if measurement.is_none() {
            debug!("Dropping malformed heart rate frame: {:02X?}", notification.value);
        }
        measurement
    }

    fn reset_link(&mut self) {
        self.measurement = None;
        self.device = None;
        self.set_state(ConnectionState::Disconnected);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        event::{drain, test_sink},
        transport::mock::MockTransport,
    };
    use tokio_test::assert_ok;

    #[test]
    fn test_decode_formats() {
        assert_eq!(decode_heart_rate(&[0x00, 72]).map(|m| m.bpm), Some(72));
        assert_eq!(decode_heart_rate(&[0x01, 0x2C, 0x01]).map(|m| m.bpm), Some(300));
        // Trailing energy-expended and RR fields are ignored
        assert_eq!(
            decode_heart_rate(&[0x10, 140, 0x00, 0x04]).map(|m| m.bpm),
            Some(140)
        );
    }

    #[test]
    fn test_decode_drops_short_frames() {
        assert_eq!(decode_heart_rate(&[]), None);
        assert_eq!(decode_heart_rate(&[0x00]), None);
        assert_eq!(decode_heart_rate(&[0x01, 0x2C]), None);
    }

    #[test]
    fn test_decode_contact_bits() {
        let contact = |flags| decode_heart_rate(&[flags, 90]).map(|m| m.contact);
        assert_eq!(contact(0x00), Some(SensorContact::NotSupported));
        assert_eq!(contact(0x02), Some(SensorContact::NotSupported));
        assert_eq!(contact(0x04), Some(SensorContact::Lost));
        assert_eq!(contact(0x06), Some(SensorContact::Detected));
    }

    #[tokio::test]
    async fn test_sensor_link_lifecycle() {
        let transport = Arc::new(MockTransport::with_profile(
            HEART_RATE_SERVICE_UUID,
            &[HEART_RATE_MEASUREMENT_UUID],
        ));
        let (sink, mut rx) = test_sink();
        let mut sensor = HeartRateSensor::new(transport, sink, TimeoutConfig::default());
        let strap = Device::new("CC:DD", "TICKR", DeviceClass::HeartRateMonitor);

        let frame = Notification {
            characteristic: HEART_RATE_MEASUREMENT_UUID,
            value: vec![0x00, 128],
        };
        assert_eq!(sensor.handle_notification(&frame), None);

        assert_ok!(sensor.connect(strap).await);
        assert!(sensor.is_connected());
        assert_eq!(sensor.handle_notification(&frame).map(|m| m.bpm), Some(128));

        sensor.handle_disconnect();
        assert_eq!(sensor.state(), ConnectionState::Disconnected);
        assert_eq!(sensor.handle_notification(&frame), None);

        let states: Vec<ConnectionState> = drain(&mut rx)
            .into_iter()
            .filter_map(|e| match e {
                CoreEvent::ConnectionChanged { state, .. } => Some(state),
                _ => None,
            })
            .collect();
        assert_eq!(states.first(), Some(&ConnectionState::Connecting));
        assert_eq!(states.last(), Some(&ConnectionState::Disconnected));
    }
}
