use std::{sync::Arc, time::Duration};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    config::TimeoutConfig,
    error::{ErgZoneError, Result},
    event::{CoreEvent, EventSink},
    protocol::{parse_telemetry, ControlCommand, ControlOpcode, ControlResponse, StopKind},
    transport::{open_profile, Transport},
    types::{ConnectionState, Device, DeviceClass, Notification, WriteKind},
    FTMS_CONTROL_POINT_UUID, FTMS_SERVICE_UUID, INDOOR_BIKE_DATA_UUID,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TrainerHandles {
    control_point: Uuid,
    telemetry: Uuid,
}

/// Connection and control state machine for one FTMS trainer
///
/// `TrainerEngine` walks a trainer through
/// `disconnected → connecting → discoveringServices → discoveringCharacteristics → ready`
/// and, once a workout starts, `ready → controlRequested → controlling`.
///
/// # Control sequencing
///
/// Entering `ready` does not take control. [`TrainerEngine::start_workout`] writes
/// request-control; only a success response to that opcode makes the engine
/// write start-or-resume and enter `controlling`. A target power set before
/// that point is held as a pending intent and written exactly once right after
/// control is granted.
///
/// # Failure handling
///
/// Any transport failure resets the engine to `disconnected`, clears the
/// characteristic handles and drops the pending intent. Rejected commands are
/// reported as [`CoreEvent::CommandFailed`] and never retried here.
///
/// All methods take `&mut self`; the engine is meant to be owned by a single
/// serialized context and fed radio events in wire order.
pub struct TrainerEngine {
    transport: Arc<dyn Transport>,
    events: EventSink,
    timeouts: TimeoutConfig,
    device: Option<Device>,
    state: ConnectionState,
    handles: Option<TrainerHandles>,
    pending_power: Option<i16>,
    last_power: Option<i16>,
}

impl TrainerEngine {
    /// Create a disconnected engine
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, events: EventSink, timeouts: TimeoutConfig) -> Self {
        Self {
            transport,
            events,
            timeouts,
            device: None,
            state: ConnectionState::Disconnected,
            handles: None,
            pending_power: None,
            last_power: None,
        }
    }

    /// Current connection state
    #[must_use]
    pub const fn state(&self) -> ConnectionState {
        self.state
    }

    /// Connected (or connecting) trainer
    #[must_use]
    pub const fn device(&self) -> Option<&Device> {
        self.device.as_ref()
    }

    /// Target power waiting for control to be granted
    #[must_use]
    pub const fn pending_power(&self) -> Option<i16> {
        self.pending_power
    }

    /// Last instantaneous power reported by the trainer
    #[must_use]
    pub const fn last_power(&self) -> Option<i16> {
        self.last_power
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state == state {
            return;
        }
        info!("Trainer: {} -> {}", self.state, state);
        self.state = state;
        self.events.emit(CoreEvent::ConnectionChanged {
            class: DeviceClass::Trainer,
            state,
        });
    }

    /// Connect to a trainer and subscribe to telemetry and control-point responses
    ///
    /// # Errors
    ///
    /// Returns [`ErgZoneError::InvalidParameters`] for a non-trainer device,
    /// [`ErgZoneError::InvalidState`] if a link is already up, or the transport
    /// error that aborted the sequence (the engine is then `disconnected`).
    pub async fn connect(&mut self, device: Device) -> Result<()> {
        let connect_timeout = self.timeouts.connect_timeout();
        self.connect_within(device, connect_timeout).await
    }

    /// Connect with an explicit link timeout
    ///
    /// # Errors
    ///
    /// Same as [`TrainerEngine::connect`].
    pub async fn connect_within(&mut self, device: Device, connect_timeout: Duration) -> Result<()> {
        if device.class != DeviceClass::Trainer {
            return Err(ErgZoneError::InvalidParameters(format!(
                "{} is a {}, not a trainer",
                device.name, device.class
            )));
        }
        if self.state != ConnectionState::Disconnected {
            return Err(ErgZoneError::InvalidState {
                state: self.state.to_string(),
            });
        }

        info!("Connecting to trainer: {}", device.name);
        self.device = Some(device.clone());
        let transport = self.transport.clone();

        let result = open_profile(
            transport.as_ref(),
            &device,
            FTMS_SERVICE_UUID,
            &[FTMS_CONTROL_POINT_UUID, INDOOR_BIKE_DATA_UUID],
            &[FTMS_CONTROL_POINT_UUID, INDOOR_BIKE_DATA_UUID],
            connect_timeout,
            |state| self.set_state(state),
        )
        .await;

        match result {
            Ok(profile) => {
                self.handles = Some(TrainerHandles {
                    control_point: profile.characteristics[0],
                    telemetry: profile.characteristics[1],
                });
                self.set_state(ConnectionState::Ready);
                info!("Trainer {} ready", device.name);
                Ok(())
            }
            Err(e) => {
                self.fail(&e);
                Err(e)
            }
        }
    }

    /// Disconnect from the trainer
    ///
    /// The engine is reset even if the transport reports an error.
    ///
    /// # Errors
    ///
    /// Returns the transport error from the disconnect request.
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
        warn!("Trainer link lost");
        self.events.emit(CoreEvent::TransportFailure {
            class: DeviceClass::Trainer,
            reason: "link lost".to_string(),
        });
        self.reset_link();
    }

    /// Ask for control; training starts once the trainer grants it
    ///
    /// Calling this again while control is requested or held is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`ErgZoneError::NotReady`] unless the trainer is `ready`, or the
    /// transport error from the write.
    pub async fn start_workout(&mut self) -> Result<()> {
        match self.state {
            ConnectionState::Ready => {
                self.send(ControlCommand::RequestControl).await?;
                self.set_state(ConnectionState::ControlRequested);
                Ok(())
            }
            ConnectionState::ControlRequested | ConnectionState::Controlling => {
                debug!("Control already requested");
                Ok(())
            }
            state => Err(ErgZoneError::NotReady {
                reason: format!("trainer is {state}"),
            }),
        }
    }

    /// Set the ERG target power
    ///
    /// Written immediately while `controlling`, otherwise stored and written once
    /// control is granted. No rate limiting happens here.
    ///
    /// # Errors
    ///
    /// Returns the transport error from the write.
    pub async fn set_target_power(&mut self, watts: i16) -> Result<()> {
        if self.state == ConnectionState::Controlling {
            debug!("Setting target power to {} W", watts);
            self.send(ControlCommand::SetTargetPower(watts)).await
        } else {
            debug!("Trainer is {}, holding {} W until control is granted", self.state, watts);
            self.pending_power = Some(watts);
            Ok(())
        }
    }

    /// Stop training
    ///
    /// The engine returns to `ready` as soon as the command is sent; the
    /// response is not awaited.
    ///
    /// # Errors
    ///
    /// Returns [`ErgZoneError::NotReady`] if no link is up, or the transport error.
    pub async fn stop_workout(&mut self) -> Result<()> {
        self.stop(StopKind::Stop).await
    }

    /// Pause training (same optimistic transition as [`TrainerEngine::stop_workout`])
    ///
    /// # Errors
    ///
    /// Returns [`ErgZoneError::NotReady`] if no link is up, or the transport error.
    pub async fn pause_workout(&mut self) -> Result<()> {
        self.stop(StopKind::Pause).await
    }

    async fn stop(&mut self, kind: StopKind) -> Result<()> {
        if !self.state.is_ready() {
            return Err(ErgZoneError::NotReady {
                reason: format!("trainer is {}", self.state),
            });
        }
        info!("Stopping trainer ({:?})", kind);
        self.set_state(ConnectionState::Ready);
        self.send(ControlCommand::StopOrPause(kind)).await
    }

    /// Reset the trainer's control state; control must be requested again afterwards
    ///
    /// # Errors
    ///
    /// Returns [`ErgZoneError::NotReady`] if no link is up, or the transport error.
    pub async fn reset(&mut self) -> Result<()> {
        if !self.state.is_ready() {
            return Err(ErgZoneError::NotReady {
                reason: format!("trainer is {}", self.state),
            });
        }
        self.set_state(ConnectionState::Ready);
        self.send(ControlCommand::Reset).await
    }

    /// Handle a notification from the trainer
    ///
    /// Telemetry updates the last reported power; control-point responses drive
    /// the control sequence. Malformed frames are dropped silently.
    pub async fn handle_notification(&mut self, notification: &Notification) {
        let Some(handles) = self.handles else {
            return;
        };

        if notification.characteristic == handles.telemetry {
            self.handle_telemetry(&notification.value);
        } else if notification.characteristic == handles.control_point {
            self.handle_response(&notification.value).await;
        }
    }

    fn handle_telemetry(&mut self, data: &[u8]) {
        if !self.state.is_ready() {
            return;
        }
        match parse_telemetry(data) {
            Some(frame) if !frame.truncated => {
                if frame.power.is_some() {
                    self.last_power = frame.power;
                }
                self.events.emit(CoreEvent::Telemetry(frame));
            }
            _ => debug!("Dropping malformed telemetry frame: {:02X?}", data),
        }
    }

    async fn handle_response(&mut self, data: &[u8]) {
        let response = match ControlResponse::from_bytes(data) {
            Ok(response) => response,
            Err(e) => {
                debug!("Ignoring control-point frame: {}", e);
                return;
            }
        };
        let opcode = response.request_opcode();

        if let Err(e) = response.check() {
            warn!("{} ({})", e, response.result());
            self.events.emit(CoreEvent::CommandFailed {
                opcode: response.opcode,
                result_code: response.result_code,
            });
            if opcode == Some(ControlOpcode::RequestControl)
                && self.state == ConnectionState::ControlRequested
            {
                self.set_state(ConnectionState::Ready);
            }
            return;
        }

        match opcode {
            Some(ControlOpcode::RequestControl)
                if self.state == ConnectionState::ControlRequested =>
            {
                info!("Control granted");
                if self.send(ControlCommand::StartOrResume).await.is_err() {
                    return;
                }
                self.set_state(ConnectionState::Controlling);
                if let Some(watts) = self.pending_power.take() {
                    info!("Applying pending target power {} W", watts);
                    if let Err(e) = self.send(ControlCommand::SetTargetPower(watts)).await {
                        warn!("Pending target power {} W not applied: {}", watts, e);
                    }
                }
            }
            Some(opcode) => debug!("Trainer acknowledged {}", opcode),
            None => debug!("Trainer acknowledged unknown opcode {:02X}", response.opcode),
        }
    }

    async fn send(&mut self, command: ControlCommand) -> Result<()> {
        let (Some(handles), Some(device)) = (self.handles, self.device.clone()) else {
            return Err(ErgZoneError::NotReady {
                reason: "trainer characteristics not resolved".to_string(),
            });
        };

        let data = command.to_bytes();
        debug!("Sending command: {:02X?}", &data[..]);
        let result = self
            .transport
            .write(&device, handles.control_point, &data, WriteKind::WithResponse)
            .await;

        if let Err(e) = &result {
            self.fail(e);
        }
        result
    }

    fn fail(&mut self, error: &ErgZoneError) {
        warn!("Trainer failure: {}", error);
        self.events.emit(CoreEvent::TransportFailure {
            class: DeviceClass::Trainer,
            reason: error.to_string(),
        });
        self.reset_link();
    }

    fn reset_link(&mut self) {
        self.handles = None;
        self.pending_power = None;
        self.last_power = None;
        self.device = None;
        self.set_state(ConnectionState::Disconnected);
    }
}
