use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::trace;

use crate::{
    controller::Adjustment,
    protocol::TelemetryFrame,
    session::{Session, WorkoutSnapshot},
    types::{ConnectionState, DeviceClass, HrSource, WorkoutState},
};

/// Notifications from the control core to the presentation layer
#[derive(Debug, Clone, PartialEq)]
pub enum CoreEvent {
    /// A device-class state machine changed state
    ConnectionChanged {
        /// Which link
        class: DeviceClass,
        /// New state
        state: ConnectionState,
    },
    /// Scan, connect, write or discovery failed; the link was reset
    TransportFailure {
        /// Which link
        class: DeviceClass,
        /// Human-readable cause
        reason: String,
    },
    /// The trainer rejected a control-point command
    CommandFailed {
        /// Echoed opcode
        opcode: u8,
        /// Raw result code
        result_code: u8,
    },
    /// Decoded trainer telemetry
    Telemetry(TelemetryFrame),
    /// The live heart-rate feed changed
    SourceChanged(HrSource),
    /// Waiting for the rider to pick a direct sensor
    SelectingDevice,
    /// Advisory: a heart-rate source could not be brought up; the workout continues
    SourceUnavailable {
        /// Source that failed
        source: HrSource,
        /// Human-readable cause
        reason: String,
    },
    /// The mirrored link dropped (`true`) or came back (`false`)
    MirrorLink {
        /// Disconnected flag for the presentation layer
        disconnected: bool,
    },
    /// The zone controller moved the target power
    PowerAdjusted(Adjustment),
    /// Workout state transition
    StateChanged(WorkoutState),
    /// Per-tick live view
    Snapshot(WorkoutSnapshot),
    /// Finished session, immutable
    SessionCompleted(Arc<Session>),
}

/// Cloneable handle for emitting [`CoreEvent`]s
///
/// Emitting never fails: once the receiver is gone events are dropped.
#[derive(Debug, Clone)]
pub struct EventSink {
    sender: mpsc::UnboundedSender<CoreEvent>,
}

impl EventSink {
    /// Wrap a channel sender
    #[must_use]
    pub const fn new(sender: mpsc::UnboundedSender<CoreEvent>) -> Self {
        Self { sender }
    }

    /// Emit an event
    pub fn emit(&self, event: CoreEvent) {
        if self.sender.send(event).is_err() {
            trace!("Event receiver closed, dropping event");
        }
    }
}

impl From<mpsc::UnboundedSender<CoreEvent>> for EventSink {
    fn from(sender: mpsc::UnboundedSender<CoreEvent>) -> Self {
        Self::new(sender)
    }
}

#[cfg(test)]
pub(crate) fn test_sink() -> (EventSink, mpsc::UnboundedReceiver<CoreEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventSink::new(tx), rx)
}

#[cfg(test)]
pub(crate) fn drain(rx: &mut mpsc::UnboundedReceiver<CoreEvent>) -> Vec<CoreEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_after_receiver_dropped_is_silent() {
        let (sink, rx) = test_sink();
        drop(rx);
        sink.emit(CoreEvent::StateChanged(WorkoutState::Running));
    }

    #[test]
    fn test_events_arrive_in_order() {
        let (sink, mut rx) = test_sink();
        sink.emit(CoreEvent::StateChanged(WorkoutState::Running));
        sink.emit(CoreEvent::MirrorLink { disconnected: true });
        assert_eq!(
            drain(&mut rx),
            vec![
                CoreEvent::StateChanged(WorkoutState::Running),
                CoreEvent::MirrorLink { disconnected: true },
            ]
        );
    }
}
