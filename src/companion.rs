//! Companion-device message protocol and the collaborator seams the
//! orchestrator drives.
//!
//! The companion peer (a wrist-worn device running a mirrored workout
//! session) is external. The core only exchanges [`CompanionMessage`]s and
//! [`MirroredPayload`]s with it and calls the lifecycle methods of
//! [`CompanionSession`] and [`LifecycleHooks`].

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    error::{ErgZoneError, Result},
    session::WorkoutSnapshot,
    types::WorkoutState,
};

/// Tagged messages exchanged with the companion peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum CompanionMessage {
    /// Live workout figures
    #[serde(rename_all = "camelCase")]
    WorkoutUpdate {
        /// Beats per minute, 0 when no data
        heart_rate: u16,
        /// Instantaneous trainer power in watts
        power: u16,
        /// Active time in seconds
        elapsed_time: u64,
        /// Seconds left in the current chunk
        chunk_remaining: u64,
        /// One-based chunk index
        current_chunk: u32,
        /// Chunk count
        total_chunks: u32,
        /// Workout state
        state: WorkoutState,
    },
    /// The workout finished
    WorkoutEnded,
    /// Start the workout
    StartWorkout,
    /// Stop the workout
    StopWorkout,
    /// Pause the workout
    PauseWorkout,
    /// Resume the workout
    ResumeWorkout,
}

impl CompanionMessage {
    /// Build a live update from a snapshot
    #[must_use]
    pub fn update(snapshot: &WorkoutSnapshot) -> Self {
        Self::WorkoutUpdate {
            heart_rate: snapshot.heart_rate.unwrap_or(0),
            power: snapshot
                .power
                .map_or(0, |p| u16::try_from(p).unwrap_or(0)),
            elapsed_time: snapshot.elapsed.as_secs(),
            chunk_remaining: snapshot.progress.chunk_remaining.as_secs(),
            current_chunk: snapshot.progress.current_chunk,
            total_chunks: snapshot.progress.total_chunks,
            state: snapshot.state,
        }
    }

    /// Commands and the end marker must reach the peer; updates may be lost
    #[must_use]
    pub const fn requires_delivery(&self) -> bool {
        !matches!(self, Self::WorkoutUpdate { .. })
    }

    /// Encode as JSON
    ///
    /// # Errors
    ///
    /// Returns [`ErgZoneError::Settings`] if serialization fails.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode from JSON
    ///
    /// # Errors
    ///
    /// Returns [`ErgZoneError::Settings`] for malformed or unknown messages.
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Size of an encoded [`MirroredPayload`]
pub const MIRRORED_PAYLOAD_SIZE: usize = 19;

/// Binary state shared through a mirrored workout session
///
/// Layout, little-endian: power `u16`, elapsed seconds `u32`, chunk remaining
/// seconds `u32`, current chunk `u16`, total chunks `u16`, adjusted power
/// `u16`, target power `u16`, state `u8`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MirroredPayload {
    /// Instantaneous trainer power in watts
    pub power: u16,
    /// Active time in seconds
    pub elapsed_time: u32,
    /// Seconds left in the current chunk
    pub chunk_remaining: u32,
    /// One-based chunk index
    pub current_chunk: u16,
    /// Chunk count
    pub total_chunks: u16,
    /// Power the controller commands
    pub adjusted_power: u16,
    /// Configured target power
    pub target_power: u16,
    /// Workout state
    pub state: WorkoutState,
}

impl MirroredPayload {
    /// Build a payload from a snapshot
    #[must_use]
    pub fn from_snapshot(snapshot: &WorkoutSnapshot) -> Self {
        let secs = |d: std::time::Duration| u32::try_from(d.as_secs()).unwrap_or(u32::MAX);
        let small = |n: u32| u16::try_from(n).unwrap_or(u16::MAX);
        Self {
            power: snapshot
                .power
                .map_or(0, |p| u16::try_from(p).unwrap_or(0)),
            elapsed_time: secs(snapshot.elapsed),
            chunk_remaining: secs(snapshot.progress.chunk_remaining),
            current_chunk: small(snapshot.progress.current_chunk),
            total_chunks: small(snapshot.progress.total_chunks),
            adjusted_power: snapshot.adjusted_power,
            target_power: snapshot.target_power,
            state: snapshot.state,
        }
    }

    /// Serialize to the wire layout
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(MIRRORED_PAYLOAD_SIZE);
        buf.put_u16_le(self.power);
        buf.put_u32_le(self.elapsed_time);
        buf.put_u32_le(self.chunk_remaining);
        buf.put_u16_le(self.current_chunk);
        buf.put_u16_le(self.total_chunks);
        buf.put_u16_le(self.adjusted_power);
        buf.put_u16_le(self.target_power);
        buf.put_u8(self.state.into());
        buf.freeze()
    }

    /// Parse the wire layout
    ///
    /// # Errors
    ///
    /// Returns [`ErgZoneError::ParseError`] if the payload is shorter than
    /// [`MIRRORED_PAYLOAD_SIZE`].
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < MIRRORED_PAYLOAD_SIZE {
            return Err(ErgZoneError::ParseError(format!(
                "mirrored payload too short: {} bytes",
                data.len()
            )));
        }
        let mut buf = data;
        Ok(Self {
            power: buf.get_u16_le(),
            elapsed_time: buf.get_u32_le(),
            chunk_remaining: buf.get_u32_le(),
            current_chunk: buf.get_u16_le(),
            total_chunks: buf.get_u16_le(),
            adjusted_power: buf.get_u16_le(),
            target_power: buf.get_u16_le(),
            state: WorkoutState::from(buf.get_u8()),
        })
    }
}

/// Kind of health/workout session backing the heart-rate feed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    /// No backing session
    None,
    /// A session running only on this device
    Standalone,
    /// A session mirrored with the companion peer
    Mirrored,
}

/// Message link to the companion peer
pub trait CompanionChannel: Send {
    /// Whether the peer can take live messages right now
    fn is_reachable(&self) -> bool;

    /// Send a message immediately
    ///
    /// # Errors
    ///
    /// Returns an error if the message was not delivered.
    fn send_live(&mut self, message: &CompanionMessage) -> Result<()>;

    /// Hand a message to the platform's guaranteed-delivery queue
    fn enqueue(&mut self, message: CompanionMessage);

    /// Push the binary mirrored-session state
    ///
    /// # Errors
    ///
    /// Returns an error if the mirrored session is not running.
    fn send_mirrored(&mut self, payload: &MirroredPayload) -> Result<()>;
}

/// How [`deliver`] handled a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Sent on the live link
    Live,
    /// Placed on the guaranteed-delivery queue
    Queued,
    /// Best-effort message lost
    Dropped,
}

/// Send a message with the outbox policy
///
/// Live updates are fire-and-forget. Commands and the end marker fall back to
/// the queue when the live send is not possible.
pub fn deliver(channel: &mut dyn CompanionChannel, message: CompanionMessage) -> Delivery {
    if channel.is_reachable() {
        match channel.send_live(&message) {
            Ok(()) => return Delivery::Live,
            Err(e) => debug!("Live companion send failed: {}", e),
        }
    }
    if message.requires_delivery() {
        channel.enqueue(message);
        Delivery::Queued
    } else {
        Delivery::Dropped
    }
}

/// Backing session of the heart-rate feed and the companion launch control
pub trait CompanionSession: Send {
    /// Kind of the current backing session
    fn kind(&self) -> SessionKind;

    /// Whether the rider granted the health-data access a backing session needs
    fn is_authorized(&self) -> bool {
        true
    }

    /// Start the backing session
    ///
    /// # Errors
    ///
    /// Returns an error if the session could not be started.
    fn start(&mut self) -> Result<()> {
        Ok(())
    }

    /// Suspend the backing session
    fn pause(&mut self) {}

    /// Resume the backing session
    fn resume(&mut self) {}

    /// Terminate the backing session
    fn end(&mut self) {}

    /// End a standalone local session before handing over to the companion
    fn end_local(&mut self) {}

    /// Ask the companion peer to launch its mirrored session
    ///
    /// # Errors
    ///
    /// Returns an error if the launch request could not be issued.
    fn request_launch(&mut self) -> Result<()> {
        Err(ErgZoneError::Other("no companion available".to_string()))
    }

    /// Message link to the peer, if there is one
    fn channel(&mut self) -> Option<&mut dyn CompanionChannel> {
        None
    }
}

/// Keep-alive and on-screen live status surface
pub trait LifecycleHooks: Send {
    /// Keep the process running while a workout is active
    fn keep_alive_start(&mut self) {}
    /// Release the keep-alive
    fn keep_alive_end(&mut self) {}
    /// Show the live status surface
    fn live_status_start(&mut self, _snapshot: &WorkoutSnapshot) {}
    /// Refresh the live status surface
    fn live_status_update(&mut self, _snapshot: &WorkoutSnapshot) {}
    /// Remove the live status surface
    fn live_status_end(&mut self) {}
}

/// No companion device and no backing session
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCompanion;

impl CompanionSession for NoCompanion {
    fn kind(&self) -> SessionKind {
        SessionKind::None
    }
}

/// Hooks that do nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct NoHooks;

impl LifecycleHooks for NoHooks {}

/// Input from the companion side, marshaled onto the session context
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MirrorEvent {
    /// The mirrored link became active
    LinkActive,
    /// The mirrored link dropped
    LinkLost,
    /// Heart rate pushed through the mirrored session
    HeartRate(u16),
    /// Message from the peer
    Message(CompanionMessage),
}

impl MirrorEvent {
    /// Parse a JSON message received from the peer
    ///
    /// Malformed or unknown messages are logged and ignored.
    #[must_use]
    pub fn from_peer_json(text: &str) -> Option<Self> {
        match CompanionMessage::from_json(text) {
            Ok(message) => Some(Self::Message(message)),
            Err(e) => {
                warn!("Ignoring companion message: {}", e);
                None
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod mock {
    //! Recording companion for tests

    use super::*;
    use std::sync::{Arc, Mutex};

    /// Everything the recorder saw, shared with the test
    #[derive(Debug, Default)]
    pub struct Record {
        pub calls: Vec<&'static str>,
        pub live: Vec<CompanionMessage>,
        pub queued: Vec<CompanionMessage>,
        pub mirrored: Vec<MirroredPayload>,
    }

    pub struct RecordingCompanion {
        pub kind: SessionKind,
        pub authorized: bool,
        pub reachable: bool,
        pub record: Arc<Mutex<Record>>,
    }

    impl RecordingCompanion {
        pub fn new(kind: SessionKind) -> (Self, Arc<Mutex<Record>>) {
            let record = Arc::new(Mutex::new(Record::default()));
            (
                Self {
                    kind,
                    authorized: true,
                    reachable: true,
                    record: record.clone(),
                },
                record,
            )
        }

        fn call(&self, name: &'static str) {
            self.record.lock().unwrap().calls.push(name);
        }
    }

    impl CompanionChannel for RecordingCompanion {
        fn is_reachable(&self) -> bool {
            self.reachable
        }

        fn send_live(&mut self, message: &CompanionMessage) -> Result<()> {
            self.record.lock().unwrap().live.push(message.clone());
            Ok(())
        }

        fn enqueue(&mut self, message: CompanionMessage) {
            self.record.lock().unwrap().queued.push(message);
        }

        fn send_mirrored(&mut self, payload: &MirroredPayload) -> Result<()> {
            self.record.lock().unwrap().mirrored.push(*payload);
            Ok(())
        }
    }

    impl CompanionSession for RecordingCompanion {
        fn kind(&self) -> SessionKind {
            self.kind
        }

        fn is_authorized(&self) -> bool {
            self.authorized
        }

        fn start(&mut self) -> Result<()> {
            self.call("start");
            Ok(())
        }

        fn pause(&mut self) {
            self.call("pause");
        }

        fn resume(&mut self) {
            self.call("resume");
        }

        fn end(&mut self) {
            self.call("end");
        }

        fn end_local(&mut self) {
            self.call("end_local");
        }

        fn request_launch(&mut self) -> Result<()> {
            self.call("request_launch");
            Ok(())
        }

        fn channel(&mut self) -> Option<&mut dyn CompanionChannel> {
            Some(self)
        }
    }
}
