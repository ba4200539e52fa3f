use std::fmt;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::{
    companion::{CompanionSession, SessionKind},
    config::ArbiterConfig,
    error::{ErgZoneError, Result},
    event::{CoreEvent, EventSink},
    types::HrSource,
};

/// Progress of the single automatic relaunch after a mirrored-link loss
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// Waiting for the settle delay before relaunching
    Settling {
        /// When the relaunch is issued
        relaunch_at: Instant,
    },
    /// Relaunch issued, waiting for the link
    Awaiting {
        /// When the attempt is abandoned
        deadline: Instant,
    },
}

/// Arbitration state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArbiterState {
    /// Heart rate comes from the directly connected strap
    Direct,
    /// Companion launch requested; the direct feed stays live until the link is up
    SwitchingToMirrored {
        /// When the switch is abandoned
        deadline: Instant,
    },
    /// Heart rate comes from the mirrored session
    Mirrored,
    /// The mirrored link dropped; one relaunch is in progress
    MirrorRecovering(Recovery),
    /// The relaunch failed; waits for the rider to retry or switch
    MirrorLost,
    /// Waiting for the rider to pick a direct strap
    SelectingDevice,
}

impl fmt::Display for ArbiterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Direct => write!(f, "direct"),
            Self::SwitchingToMirrored { .. } => write!(f, "switching to mirrored"),
            Self::Mirrored => write!(f, "mirrored"),
            Self::MirrorRecovering(_) => write!(f, "recovering mirrored link"),
            Self::MirrorLost => write!(f, "mirrored link lost"),
            Self::SelectingDevice => write!(f, "selecting device"),
        }
    }
}

/// Picks the live heart-rate feed
///
/// Exactly one provider feeds [`HrArbitrator::current_heart_rate`] at a time.
/// Deadlines are computed up front and checked by [`HrArbitrator::poll`], which
/// the session calls on every tick; nothing here sleeps or cancels I/O.
///
/// A lost or not-yet-active feed reads as `None`, never as the last value.
pub struct HrArbitrator {
    config: ArbiterConfig,
    events: EventSink,
    preferred: HrSource,
    state: ArbiterState,
    heart_rate: Option<u16>,
    direct_connected: bool,
    mirror_disconnected: bool,
}

impl HrArbitrator {
    /// Create an arbitrator that will use `preferred` once [`HrArbitrator::begin`] runs
    #[must_use]
    pub const fn new(config: ArbiterConfig, preferred: HrSource, events: EventSink) -> Self {
        Self {
            config,
            events,
            preferred,
            state: ArbiterState::Direct,
            heart_rate: None,
            direct_connected: false,
            mirror_disconnected: false,
        }
    }

    /// Arbitration state
    #[must_use]
    pub const fn state(&self) -> ArbiterState {
        self.state
    }

    /// The feed currently selected
    #[must_use]
    pub const fn source(&self) -> HrSource {
        match self.state {
            ArbiterState::Direct
            | ArbiterState::SwitchingToMirrored { .. }
            | ArbiterState::SelectingDevice => HrSource::Direct,
            ArbiterState::Mirrored
            | ArbiterState::MirrorRecovering(_)
            | ArbiterState::MirrorLost => HrSource::Mirrored,
        }
    }

    /// Live heart rate, `None` when the selected feed has no data
    #[must_use]
    pub const fn current_heart_rate(&self) -> Option<u16> {
        self.heart_rate
    }

    /// Whether a switch to the mirrored source is pending
    #[must_use]
    pub const fn is_switching(&self) -> bool {
        matches!(self.state, ArbiterState::SwitchingToMirrored { .. })
    }

    /// The mirrored link dropped and has not come back
    #[must_use]
    pub const fn mirror_disconnected(&self) -> bool {
        self.mirror_disconnected
    }

    /// Whether a direct strap is connected
    #[must_use]
    pub const fn direct_connected(&self) -> bool {
        self.direct_connected
    }

    fn enter(&mut self, state: ArbiterState) {
        if self.state == state {
            return;
        }
        let before = self.source();
        info!("HR source: {} -> {}", self.state, state);
        self.state = state;
        self.heart_rate = None;

        match state {
            ArbiterState::SelectingDevice => self.events.emit(CoreEvent::SelectingDevice),
            _ if self.source() != before => self.events.emit(CoreEvent::SourceChanged(self.source())),
            _ => {}
        }
    }

    fn unavailable(&self, source: HrSource, reason: &str) {
        warn!("{} heart rate unavailable: {}", source, reason);
        self.events.emit(CoreEvent::SourceUnavailable {
            source,
            reason: reason.to_string(),
        });
    }

    fn set_mirror_disconnected(&mut self, disconnected: bool) {
        if self.mirror_disconnected != disconnected {
            self.mirror_disconnected = disconnected;
            self.events.emit(CoreEvent::MirrorLink { disconnected });
        }
    }

    /// Bring up the preferred feed at workout start
    pub fn begin(&mut self, now: Instant, companion: &mut dyn CompanionSession) {
        if self.preferred == HrSource::Mirrored && self.state == ArbiterState::Direct {
            let _ = self.request_switch(HrSource::Mirrored, now, companion);
        }
    }

    /// Switch the live feed
    ///
    /// Switching to the mirrored source ends a standalone local session,
    /// asks the companion to launch and waits up to the switch timeout.
    /// Switching to the direct source is immediate when a strap is connected,
    /// otherwise the arbitrator waits in [`ArbiterState::SelectingDevice`].
    ///
    /// # Errors
    ///
    /// Returns [`ErgZoneError::SwitchInProgress`] while another switch is
    /// pending; nothing changes in that case.
    pub fn request_switch(
        &mut self,
        target: HrSource,
        now: Instant,
        companion: &mut dyn CompanionSession,
    ) -> Result<()> {
        if self.is_switching() {
            debug!("Ignoring switch to {}: switch already pending", target);
            return Err(ErgZoneError::SwitchInProgress);
        }
        self.preferred = target;

        match target {
            HrSource::Mirrored => {
                if matches!(
                    self.state,
                    ArbiterState::Mirrored | ArbiterState::MirrorRecovering(_)
                ) {
                    return Ok(());
                }
                if companion.kind() == SessionKind::Standalone {
                    companion.end_local();
                }
                if let Err(e) = companion.request_launch() {
                    self.unavailable(HrSource::Mirrored, &e.to_string());
                    return Ok(());
                }
                let deadline = now + self.config.switch_timeout();
                // Keep the direct reading flowing while the link comes up
                let heart_rate = self.heart_rate;
                self.enter(ArbiterState::SwitchingToMirrored { deadline });
                if self.direct_connected {
                    self.heart_rate = heart_rate;
                }
            }
            HrSource::Direct => {
                if self.direct_connected {
                    self.enter(ArbiterState::Direct);
                } else {
                    self.enter(ArbiterState::SelectingDevice);
                }
                self.set_mirror_disconnected(false);
            }
        }
        Ok(())
    }

    /// Check the pending deadlines
    pub fn poll(&mut self, now: Instant, companion: &mut dyn CompanionSession) {
        match self.state {
            ArbiterState::SwitchingToMirrored { deadline } if now >= deadline => {
                self.unavailable(HrSource::Mirrored, "mirrored link did not come up");
                self.preferred = HrSource::Direct;
                if self.direct_connected {
                    self.enter(ArbiterState::Direct);
                } else {
                    self.enter(ArbiterState::SelectingDevice);
                }
                self.set_mirror_disconnected(false);
            }
            ArbiterState::MirrorRecovering(Recovery::Settling { relaunch_at })
                if now >= relaunch_at =>
            {
                info!("Relaunching companion session");
                match companion.request_launch() {
                    Ok(()) => {
                        self.state = ArbiterState::MirrorRecovering(Recovery::Awaiting {
                            deadline: now + self.config.relaunch_timeout(),
                        });
                    }
                    Err(e) => {
                        self.unavailable(HrSource::Mirrored, &e.to_string());
                        self.state = ArbiterState::MirrorLost;
                    }
                }
            }
            ArbiterState::MirrorRecovering(Recovery::Awaiting { deadline }) if now >= deadline => {
                self.unavailable(HrSource::Mirrored, "relaunch did not restore the mirrored link");
                self.state = ArbiterState::MirrorLost;
            }
            _ => {}
        }
    }

    /// Relaunch the companion after the automatic attempt gave up
    ///
    /// # Errors
    ///
    /// Returns [`ErgZoneError::InvalidState`] unless the link is lost, or the
    /// companion's launch error.
    pub fn retry_mirror(&mut self, now: Instant, companion: &mut dyn CompanionSession) -> Result<()> {
        if self.state != ArbiterState::MirrorLost {
            return Err(ErgZoneError::InvalidState {
                state: self.state.to_string(),
            });
        }
        companion.request_launch()?;
        info!("Manual companion relaunch");
        self.state = ArbiterState::MirrorRecovering(Recovery::Awaiting {
            deadline: now + self.config.relaunch_timeout(),
        });
        Ok(())
    }

    /// A direct strap finished connecting
    pub fn on_direct_connected(&mut self) {
        self.direct_connected = true;
        if self.state == ArbiterState::SelectingDevice {
            self.enter(ArbiterState::Direct);
        }
    }

    /// The direct strap link dropped
    pub fn on_direct_disconnected(&mut self) {
        self.direct_connected = false;
        if self.source() == HrSource::Direct {
            self.heart_rate = None;
            self.unavailable(HrSource::Direct, "sensor link lost");
        }
    }

    /// Heart rate decoded from the direct strap
    pub fn on_direct_sample(&mut self, bpm: u16) {
        if matches!(
            self.state,
            ArbiterState::Direct | ArbiterState::SwitchingToMirrored { .. }
        ) {
            self.heart_rate = Some(bpm);
        }
    }

    /// The mirrored link became active
    pub fn on_mirror_active(&mut self) {
        match self.state {
            ArbiterState::SwitchingToMirrored { .. }
            | ArbiterState::MirrorRecovering(_)
            | ArbiterState::MirrorLost => {
                self.enter(ArbiterState::Mirrored);
                self.heart_rate = None;
                self.set_mirror_disconnected(false);
            }
            _ => debug!("Mirrored link active while {}", self.state),
        }
    }

    /// Heart rate pushed through the mirrored session
    pub fn on_mirror_sample(&mut self, bpm: u16) {
        if self.state == ArbiterState::Mirrored {
            self.heart_rate = Some(bpm);
        }
    }

    /// The mirrored link dropped without being asked to
    ///
    /// The heart rate reads as no data immediately and one relaunch is
    /// scheduled after the settle delay.
    pub fn on_mirror_lost(&mut self, now: Instant) {
        if self.state != ArbiterState::Mirrored {
            return;
        }
        warn!("Mirrored link lost");
        self.heart_rate = None;
        self.set_mirror_disconnected(true);
        self.state = ArbiterState::MirrorRecovering(Recovery::Settling {
            relaunch_at: now + self.config.relaunch_settle(),
        });
    }
}
