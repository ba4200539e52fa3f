#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

//! # ergzone
//!
//! Heart-rate zone training for Bluetooth smart trainers.
//!
//! The crate is the real-time control core of a home-trainer workout app. It
//! connects to a smart trainer over the Fitness Machine Service (FTMS), reads a
//! heart-rate feed from either a chest strap or a mirrored companion-device
//! session, and nudges the trainer's ERG target power so the rider stays inside
//! a configured heart-rate zone.
//!
//! ## Layers
//!
//! - [`transport`]: radio abstraction (scan, connect, discover, notify, write)
//!   with a btleplug backend in [`ble`]
//! - [`protocol`] / [`trainer`]: FTMS control-point framing and the trainer
//!   connection/control state machine
//! - [`heart_rate`]: heart rate measurement decoding and the direct strap link
//! - [`arbiter`]: picks the live heart-rate feed and handles failover
//! - [`controller`]: the hysteretic zone controller
//! - [`orchestrator`]: the workout state machine and its serialized run loop
//!
//! ## Safety
//!
//! The controller only ever moves power in small steps inside a bounded window
//! around the configured target, and never below an absolute floor. A lost
//! heart-rate feed reads as "no data" and freezes adjustments; it never stops
//! the workout.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::{sync::Arc, time::Duration};
//! use ergzone::{
//!     ble::BtleTransport,
//!     companion::NoCompanion,
//!     orchestrator::{SessionCommand, WorkoutSession},
//!     transport::scan_for,
//!     CoreEvent, DeviceClass, SessionConfig,
//! };
//! use tokio::sync::mpsc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let transport = Arc::new(BtleTransport::new().await?);
//!     let found = scan_for(
//!         transport.as_ref(),
//!         &[DeviceClass::Trainer],
//!         Duration::from_secs(10),
//!     )
//!     .await?;
//!     let Some(trainer) = found.of_class(DeviceClass::Trainer).into_iter().next() else {
//!         return Ok(());
//!     };
//!
//!     let (events_tx, _events_rx) = mpsc::unbounded_channel::<CoreEvent>();
//!     let session = WorkoutSession::new(
//!         SessionConfig::default(),
//!         transport,
//!         Box::new(NoCompanion),
//!         events_tx,
//!     )?;
//!
//!     let (commands_tx, commands_rx) = mpsc::unbounded_channel();
//!     let (_mirror_tx, mirror_rx) = mpsc::unbounded_channel();
//!     commands_tx.send(SessionCommand::ConnectTrainer(trainer))?;
//!     commands_tx.send(SessionCommand::Start)?;
//!
//!     let record = session.run(commands_rx, mirror_rx).await?;
//!     println!("Recorded {} samples", record.samples.len());
//!     Ok(())
//! }
//! ```

/// Heart-rate source arbitration (direct strap or mirrored companion)
pub mod arbiter;
/// btleplug backend for the transport layer
pub mod ble;
/// Companion-device message protocol and session collaborator seams
pub mod companion;
/// Session configuration and settings loading
pub mod config;
/// Heart-rate zone controller
pub mod controller;
/// Error types and handling
pub mod error;
/// Events emitted to the presentation layer
pub mod event;
/// Heart rate measurement decoding and the direct strap link
pub mod heart_rate;
/// Workout state machine and run loop
pub mod orchestrator;
/// FTMS wire codec
pub mod protocol;
/// Session record and samples
pub mod session;
/// Trainer connection and control state machine
pub mod trainer;
/// Radio abstraction
pub mod transport;
/// Shared data model
pub mod types;

pub use config::{ArbiterConfig, ControllerConfig, SessionConfig, TimeoutConfig};
pub use error::{ErgZoneError, Result};
pub use event::CoreEvent;
pub use orchestrator::WorkoutSession;
pub use types::{
    ConnectionState, Device, DeviceClass, DeviceId, HrSource, Notification, WorkoutState,
    ZoneBounds,
};

use uuid::Uuid;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Fitness Machine Service (0x1826)
pub const FTMS_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000_1826_0000_1000_8000_0080_5f9b_34fb);

/// Indoor Bike Data characteristic (0x2AD2), notify-only telemetry
pub const INDOOR_BIKE_DATA_UUID: Uuid =
    Uuid::from_u128(0x0000_2ad2_0000_1000_8000_0080_5f9b_34fb);

/// Fitness Machine Control Point characteristic (0x2AD9)
///
/// Written with response; the trainer answers every command with a
/// `[0x80, opcode, result]` frame on the same characteristic.
pub const FTMS_CONTROL_POINT_UUID: Uuid =
    Uuid::from_u128(0x0000_2ad9_0000_1000_8000_0080_5f9b_34fb);

/// Heart Rate Service (0x180D)
pub const HEART_RATE_SERVICE_UUID: Uuid =
    Uuid::from_u128(0x0000_180d_0000_1000_8000_0080_5f9b_34fb);

/// Heart Rate Measurement characteristic (0x2A37)
pub const HEART_RATE_MEASUREMENT_UUID: Uuid =
    Uuid::from_u128(0x0000_2a37_0000_1000_8000_0080_5f9b_34fb);
