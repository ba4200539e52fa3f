use std::{sync::Arc, time::Duration};
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{interval, Instant, MissedTickBehavior},
};
use tracing::{debug, info, warn};

use crate::{
    arbiter::HrArbitrator,
    companion::{
        deliver, CompanionMessage, CompanionSession, LifecycleHooks, MirrorEvent, MirroredPayload,
        NoHooks, SessionKind,
    },
    config::{SessionConfig, SettingsStore},
    controller::ZoneController,
    error::{ErgZoneError, Result},
    event::{CoreEvent, EventSink},
    heart_rate::HeartRateSensor,
    session::{ChunkProgress, Sample, Session, WorkoutClock, WorkoutSnapshot},
    trainer::TrainerEngine,
    transport::{forward_notifications, LinkId, RadioEvent, Transport},
    types::{ConnectionState, Device, DeviceClass, HrSource, WorkoutState},
};

/// Requests accepted by [`WorkoutSession::run`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCommand {
    /// Connect the trainer
    ConnectTrainer(Device),
    /// Connect a direct heart-rate strap
    ConnectHeartRate(Device),
    /// `idle → running`
    Start,
    /// `running → paused`
    Pause,
    /// `paused → running`
    Resume,
    /// `running/paused → completed`
    Finish,
    /// Change the heart-rate feed
    SwitchSource(HrSource),
    /// Relaunch the companion after the mirrored link was given up
    RetryMirror,
}

/// One rider's workout: the top-level state machine
///
/// `WorkoutSession` owns the trainer engine, the strap link, the heart-rate
/// arbitrator and the zone controller, and mutates them only from its own
/// methods. Radio notifications are forwarded into an internal channel and
/// applied by [`WorkoutSession::run`] (or [`WorkoutSession::process_radio_events`]
/// when the host drives the session by hand), so all state lives on one
/// serialized context.
///
/// ```text
/// idle → running ⇄ paused → completed
/// ```
///
/// Failures of the heart-rate feed or the companion never stop the workout;
/// they surface as [`CoreEvent`]s.
pub struct WorkoutSession {
    config: SessionConfig,
    transport: Arc<dyn Transport>,
    companion: Box<dyn CompanionSession>,
    hooks: Box<dyn LifecycleHooks>,
    events: EventSink,
    trainer: TrainerEngine,
    sensor: HeartRateSensor,
    arbiter: HrArbitrator,
    controller: ZoneController,
    state: WorkoutState,
    clock: WorkoutClock,
    session: Option<Session>,
    completed: Option<Arc<Session>>,
    radio_tx: mpsc::UnboundedSender<RadioEvent>,
    radio_rx: mpsc::UnboundedReceiver<RadioEvent>,
    trainer_link: Option<LinkForwarder>,
    sensor_link: Option<LinkForwarder>,
    next_link: LinkId,
}

/// Notification forwarder of one device link; dropping it stops the task
struct LinkForwarder {
    id: LinkId,
    task: JoinHandle<()>,
}

impl Drop for LinkForwarder {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn as_watts(power: u16) -> i16 {
    i16::try_from(power).unwrap_or(i16::MAX)
}

impl WorkoutSession {
    /// Create an idle session
    ///
    /// # Errors
    ///
    /// Returns [`ErgZoneError::InvalidParameters`] if the configuration is invalid.
    pub fn new(
        config: SessionConfig,
        transport: Arc<dyn Transport>,
        companion: Box<dyn CompanionSession>,
        events: impl Into<EventSink>,
    ) -> Result<Self> {
        config.validate()?;
        let events = events.into();
        let (radio_tx, radio_rx) = mpsc::unbounded_channel();

        Ok(Self {
            trainer: TrainerEngine::new(transport.clone(), events.clone(), config.timeouts.clone()),
            sensor: HeartRateSensor::new(transport.clone(), events.clone(), config.timeouts.clone()),
            arbiter: HrArbitrator::new(config.arbiter.clone(), config.hr_source, events.clone()),
            controller: ZoneController::new(
                config.controller.clone(),
                config.zone,
                config.target_power,
            ),
            config,
            transport,
            companion,
            hooks: Box::new(NoHooks),
            events,
            state: WorkoutState::Idle,
            clock: WorkoutClock::default(),
            session: None,
            completed: None,
            radio_tx,
            radio_rx,
            trainer_link: None,
            sensor_link: None,
            next_link: 0,
        })
    }

    /// Create an idle session from the rider's stored settings
    ///
    /// # Errors
    ///
    /// Returns the settings error, or [`ErgZoneError::InvalidParameters`].
    pub fn from_settings(
        settings: &dyn SettingsStore,
        transport: Arc<dyn Transport>,
        companion: Box<dyn CompanionSession>,
        events: impl Into<EventSink>,
    ) -> Result<Self> {
        Self::new(settings.load_session_config()?, transport, companion, events)
    }

    /// Attach keep-alive and live-status hooks
    #[must_use]
    pub fn with_hooks(mut self, hooks: Box<dyn LifecycleHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    /// Workout state
    #[must_use]
    pub const fn state(&self) -> WorkoutState {
        self.state
    }

    /// Configuration read at creation
    #[must_use]
    pub const fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Active workout time at `now`
    #[must_use]
    pub fn elapsed(&self, now: Instant) -> Duration {
        self.clock.elapsed(now)
    }

    /// Session being recorded
    #[must_use]
    pub const fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    /// Finished session record
    #[must_use]
    pub fn completed_session(&self) -> Option<Arc<Session>> {
        self.completed.clone()
    }

    /// Trainer engine
    #[must_use]
    pub const fn trainer(&self) -> &TrainerEngine {
        &self.trainer
    }

    /// Heart-rate arbitrator
    #[must_use]
    pub const fn arbiter(&self) -> &HrArbitrator {
        &self.arbiter
    }

    /// Zone controller
    #[must_use]
    pub const fn controller(&self) -> &ZoneController {
        &self.controller
    }

    fn set_state(&mut self, state: WorkoutState) {
        info!("Workout: {} -> {}", self.state, state);
        self.state = state;
        self.events.emit(CoreEvent::StateChanged(state));
    }

    fn tell_peer(&mut self, message: CompanionMessage) {
        if let Some(channel) = self.companion.channel() {
            let delivery = deliver(channel, message);
            debug!("Companion message {:?}", delivery);
        }
    }

    /// Live view at `now`
    #[must_use]
    pub fn snapshot(&self, now: Instant) -> WorkoutSnapshot {
        let elapsed = self.clock.elapsed(now);
        WorkoutSnapshot {
            state: self.state,
            elapsed,
            heart_rate: self.arbiter.current_heart_rate(),
            power: self.trainer.last_power(),
            target_power: self.config.target_power,
            adjusted_power: self.controller.adjusted_power(),
            source: self.arbiter.source(),
            mirror_disconnected: self.arbiter.mirror_disconnected(),
            progress: ChunkProgress::at(
                elapsed,
                self.config.target_duration(),
                self.config.chunk_duration(),
            ),
        }
    }

    /// Connect the trainer and start forwarding its notifications
    ///
    /// Reconnecting mid-workout uses the shorter reconnect timeout, then
    /// re-applies the controller's commanded power and requests control again.
    ///
    /// # Errors
    ///
    /// Returns the trainer's connection error.
    pub async fn connect_trainer(&mut self, device: Device) -> Result<()> {
        if self.trainer.state() == ConnectionState::Disconnected {
            self.trainer_link = None;
        }
        let connect_timeout = self.connect_timeout();
        self.trainer.connect_within(device.clone(), connect_timeout).await?;
        match self.forward(&device).await {
            Ok(link) => self.trainer_link = Some(link),
            Err(e) => {
                let _ = self.trainer.disconnect().await;
                return Err(e);
            }
        }

        if self.state == WorkoutState::Running {
            info!("Trainer back mid-workout, restoring control");
            self.trainer
                .set_target_power(as_watts(self.controller.adjusted_power()))
                .await?;
            self.trainer.start_workout().await?;
        }
        Ok(())
    }

    /// Connect a direct heart-rate strap and start forwarding its measurements
    ///
    /// # Errors
    ///
    /// Returns the strap's connection error.
    pub async fn connect_heart_rate(&mut self, device: Device) -> Result<()> {
        if self.sensor.state() == ConnectionState::Disconnected {
            self.sensor_link = None;
        }
        let connect_timeout = self.connect_timeout();
        self.sensor.connect_within(device.clone(), connect_timeout).await?;
        match self.forward(&device).await {
            Ok(link) => self.sensor_link = Some(link),
            Err(e) => {
                let _ = self.sensor.disconnect().await;
                return Err(e);
            }
        }
        self.arbiter.on_direct_connected();
        Ok(())
    }

    /// Link timeout for the next connect; shorter while the clock is live
    fn connect_timeout(&self) -> Duration {
        if matches!(self.state, WorkoutState::Running | WorkoutState::Paused) {
            self.config.timeouts.reconnect_timeout()
        } else {
            self.config.timeouts.connect_timeout()
        }
    }

    async fn forward(&mut self, device: &Device) -> Result<LinkForwarder> {
        self.next_link += 1;
        let id = self.next_link;
        let task =
            forward_notifications(self.transport.clone(), device, id, self.radio_tx.clone()).await?;
        Ok(LinkForwarder { id, task })
    }

    /// Stop forwarders whose engine already reset its link
    fn reap_links(&mut self) {
        if self.trainer.state() == ConnectionState::Disconnected {
            self.trainer_link = None;
        }
        if self.sensor.state() == ConnectionState::Disconnected {
            self.sensor_link = None;
        }
    }

    /// `idle → running`
    ///
    /// # Errors
    ///
    /// Returns [`ErgZoneError::InvalidState`] unless idle,
    /// [`ErgZoneError::NotAuthorized`] if a backing session is needed but not
    /// authorized, or [`ErgZoneError::NotReady`] if the trainer is not connected.
    /// The state is unchanged on error.
    pub async fn start(&mut self, now: Instant) -> Result<()> {
        self.start_inner(now, true).await
    }

    async fn start_inner(&mut self, now: Instant, notify_peer: bool) -> Result<()> {
        if self.state != WorkoutState::Idle {
            return Err(ErgZoneError::InvalidState {
                state: self.state.to_string(),
            });
        }
        let needs_backing =
            self.config.hr_source == HrSource::Mirrored || self.companion.kind() != SessionKind::None;
        if needs_backing && !self.companion.is_authorized() {
            return Err(ErgZoneError::NotAuthorized(
                "health data access was not granted".to_string(),
            ));
        }
        if !self.trainer.state().is_ready() {
            return Err(ErgZoneError::NotReady {
                reason: format!("trainer is {}", self.trainer.state()),
            });
        }

        self.trainer
            .set_target_power(as_watts(self.controller.adjusted_power()))
            .await?;
        self.trainer.start_workout().await?;

        if needs_backing {
            if let Err(e) = self.companion.start() {
                warn!("Backing session did not start: {}", e);
                self.events.emit(CoreEvent::SourceUnavailable {
                    source: self.config.hr_source,
                    reason: e.to_string(),
                });
            }
        }
        self.arbiter.begin(now, self.companion.as_mut());

        self.clock.resume(now);
        self.session = Some(Session::new(
            self.config.target_power,
            self.config.target_duration(),
        ));
        self.set_state(WorkoutState::Running);

        self.hooks.keep_alive_start();
        let snapshot = self.snapshot(now);
        self.hooks.live_status_start(&snapshot);
        if notify_peer {
            self.tell_peer(CompanionMessage::StartWorkout);
        }
        Ok(())
    }

    /// `running → paused`
    ///
    /// # Errors
    ///
    /// Returns [`ErgZoneError::InvalidState`] unless running.
    pub async fn pause(&mut self, now: Instant) -> Result<()> {
        self.pause_inner(now, true).await
    }

    async fn pause_inner(&mut self, now: Instant, notify_peer: bool) -> Result<()> {
        if self.state != WorkoutState::Running {
            return Err(ErgZoneError::InvalidState {
                state: self.state.to_string(),
            });
        }
        self.clock.pause(now);
        if let Err(e) = self.trainer.stop_workout().await {
            warn!("Trainer stop on pause failed: {}", e);
        }
        self.companion.pause();
        self.set_state(WorkoutState::Paused);
        if notify_peer {
            self.tell_peer(CompanionMessage::PauseWorkout);
        }
        Ok(())
    }

    /// `paused → running`, restarting the trainer at the controller's commanded power
    ///
    /// # Errors
    ///
    /// Returns [`ErgZoneError::InvalidState`] unless paused.
    pub async fn resume(&mut self, now: Instant) -> Result<()> {
        self.resume_inner(now, true).await
    }

    async fn resume_inner(&mut self, now: Instant, notify_peer: bool) -> Result<()> {
        if self.state != WorkoutState::Paused {
            return Err(ErgZoneError::InvalidState {
                state: self.state.to_string(),
            });
        }

        let power = as_watts(self.controller.adjusted_power());
        if let Err(e) = self.trainer.set_target_power(power).await {
            warn!("Could not queue {} W for resume: {}", power, e);
        }
        if let Err(e) = self.trainer.start_workout().await {
            warn!("Trainer restart on resume failed: {}", e);
        }

        self.companion.resume();
        self.clock.resume(now);
        self.set_state(WorkoutState::Running);
        if notify_peer {
            self.tell_peer(CompanionMessage::ResumeWorkout);
        }
        Ok(())
    }

    /// `running/paused → completed`
    ///
    /// # Errors
    ///
    /// Returns [`ErgZoneError::InvalidState`] unless running or paused.
    pub async fn finish(&mut self, now: Instant) -> Result<Arc<Session>> {
        self.finish_inner(now, true).await
    }

    async fn finish_inner(&mut self, now: Instant, notify_peer: bool) -> Result<Arc<Session>> {
        if !matches!(self.state, WorkoutState::Running | WorkoutState::Paused) {
            return Err(ErgZoneError::InvalidState {
                state: self.state.to_string(),
            });
        }

        self.clock.pause(now);
        if self.trainer.state().is_ready() {
            if let Err(e) = self.trainer.stop_workout().await {
                warn!("Trainer stop on finish failed: {}", e);
            }
        }
        self.companion.end();

        let mut session = self.session.take().unwrap_or_else(|| {
            Session::new(self.config.target_power, self.config.target_duration())
        });
        session.finalize();
        let session = Arc::new(session);
        self.completed = Some(session.clone());

        self.set_state(WorkoutState::Completed);
        self.events.emit(CoreEvent::SessionCompleted(session.clone()));
        self.hooks.live_status_end();
        self.hooks.keep_alive_end();
        if notify_peer {
            self.tell_peer(CompanionMessage::StopWorkout);
        }
        self.tell_peer(CompanionMessage::WorkoutEnded);

        info!(
            "Workout completed: {} samples over {}s",
            session.samples.len(),
            self.clock.elapsed(now).as_secs()
        );
        Ok(session)
    }

    /// One sampling tick
    ///
    /// Records a sample, runs the controller and completes the workout on the
    /// same tick once the target duration is reached. Does nothing unless running.
    pub async fn tick(&mut self, now: Instant) {
        self.reap_links();
        if matches!(self.state, WorkoutState::Running | WorkoutState::Paused) {
            self.arbiter.poll(now, self.companion.as_mut());
        }
        if self.state != WorkoutState::Running {
            return;
        }

        let elapsed = self.clock.elapsed(now);
        let heart_rate = self.arbiter.current_heart_rate();
        if let Some(session) = self.session.as_mut() {
            session.record(Sample {
                elapsed,
                heart_rate,
                power: self.trainer.last_power(),
            });
        }

        if let Some(adjustment) = self.controller.evaluate(heart_rate, elapsed) {
            self.events.emit(CoreEvent::PowerAdjusted(adjustment));
            if let Err(e) = self.trainer.set_target_power(as_watts(adjustment.to)).await {
                warn!("Could not apply {} W: {}", adjustment.to, e);
            }
        }

        let snapshot = self.snapshot(now);
        self.events.emit(CoreEvent::Snapshot(snapshot));
        self.hooks.live_status_update(&snapshot);
        let mirrored = snapshot.source == HrSource::Mirrored;
        if let Some(channel) = self.companion.channel() {
            deliver(channel, CompanionMessage::update(&snapshot));
            if mirrored {
                if let Err(e) = channel.send_mirrored(&MirroredPayload::from_snapshot(&snapshot)) {
                    debug!("Mirrored payload not sent: {}", e);
                }
            }
        }

        if elapsed >= self.config.target_duration() {
            info!("Target duration reached");
            if let Err(e) = self.finish_inner(now, true).await {
                warn!("Automatic completion failed: {}", e);
            }
        }
    }

    /// Apply one radio event
    ///
    /// Events from a link other than the device's current one are dropped.
    pub async fn handle_radio_event(&mut self, event: RadioEvent) {
        let current = match event.class() {
            DeviceClass::Trainer => self.trainer_link.as_ref(),
            DeviceClass::HeartRateMonitor => self.sensor_link.as_ref(),
        }
        .map(|link| link.id);
        if current != Some(event.link()) {
            debug!("Ignoring {} event from stale link {}", event.class(), event.link());
            return;
        }

        match event {
            RadioEvent::Notification {
                class: DeviceClass::Trainer,
                notification,
                ..
            } => self.trainer.handle_notification(&notification).await,
            RadioEvent::Notification {
                class: DeviceClass::HeartRateMonitor,
                notification,
                ..
            } => {
                if let Some(measurement) = self.sensor.handle_notification(&notification) {
                    self.arbiter.on_direct_sample(measurement.bpm);
                }
            }
            RadioEvent::Disconnected {
                class: DeviceClass::Trainer,
                ..
            } => {
                self.trainer_link = None;
                self.trainer.handle_disconnect();
            }
            RadioEvent::Disconnected {
                class: DeviceClass::HeartRateMonitor,
                ..
            } => {
                self.sensor_link = None;
                self.sensor.handle_disconnect();
                self.arbiter.on_direct_disconnected();
            }
        }
    }

    /// Apply every radio event already forwarded
    pub async fn process_radio_events(&mut self) {
        while let Ok(event) = self.radio_rx.try_recv() {
            self.handle_radio_event(event).await;
        }
    }

    /// Apply one event from the companion side
    pub async fn handle_mirror_event(&mut self, event: MirrorEvent, now: Instant) {
        match event {
            MirrorEvent::LinkActive => self.arbiter.on_mirror_active(),
            MirrorEvent::LinkLost => self.arbiter.on_mirror_lost(now),
            MirrorEvent::HeartRate(bpm) => self.arbiter.on_mirror_sample(bpm),
            MirrorEvent::Message(message) => {
                let result = match message {
                    CompanionMessage::StartWorkout => self.start_inner(now, false).await,
                    CompanionMessage::PauseWorkout => self.pause_inner(now, false).await,
                    CompanionMessage::ResumeWorkout => self.resume_inner(now, false).await,
                    CompanionMessage::StopWorkout => self.finish_inner(now, false).await.map(|_| ()),
                    other => {
                        debug!("Ignoring companion message {:?}", other);
                        Ok(())
                    }
                };
                if let Err(e) = result {
                    warn!("Companion command rejected: {}", e);
                }
            }
        }
    }

    /// Change the heart-rate feed
    ///
    /// # Errors
    ///
    /// Returns [`ErgZoneError::SwitchInProgress`] while a switch is pending.
    pub fn switch_source(&mut self, target: HrSource, now: Instant) -> Result<()> {
        self.arbiter
            .request_switch(target, now, self.companion.as_mut())
    }

    /// Relaunch the companion after the automatic attempt gave up
    ///
    /// # Errors
    ///
    /// Returns [`ErgZoneError::InvalidState`] unless the mirrored link was lost.
    pub fn retry_mirror(&mut self, now: Instant) -> Result<()> {
        self.arbiter.retry_mirror(now, self.companion.as_mut())
    }

    /// Execute one command
    ///
    /// # Errors
    ///
    /// Returns the error of the underlying operation.
    pub async fn handle_command(&mut self, command: SessionCommand, now: Instant) -> Result<()> {
        debug!("Command: {:?}", command);
        match command {
            SessionCommand::ConnectTrainer(device) => self.connect_trainer(device).await,
            SessionCommand::ConnectHeartRate(device) => self.connect_heart_rate(device).await,
            SessionCommand::Start => self.start(now).await,
            SessionCommand::Pause => self.pause(now).await,
            SessionCommand::Resume => self.resume(now).await,
            SessionCommand::Finish => self.finish(now).await.map(|_| ()),
            SessionCommand::SwitchSource(target) => self.switch_source(target, now),
            SessionCommand::RetryMirror => self.retry_mirror(now),
        }
    }

    /// Drive the session until it completes
    ///
    /// Commands, radio events, companion events and the sampling interval are
    /// handled one at a time on this task. Missed ticks are skipped; elapsed
    /// time comes from the clock, not from the tick count. Closing either input
    /// channel only stops that input.
    ///
    /// # Errors
    ///
    /// Returns [`ErgZoneError::Other`] if the loop ends without a completed session.
    pub async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<SessionCommand>,
        mut mirror: mpsc::UnboundedReceiver<MirrorEvent>,
    ) -> Result<Arc<Session>> {
        let mut ticker = interval(self.config.sample_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        while self.state != WorkoutState::Completed {
            tokio::select! {
                Some(command) = commands.recv() => {
                    if let Err(e) = self.handle_command(command, Instant::now()).await {
                        warn!("Command failed: {}", e);
                    }
                }
                Some(event) = self.radio_rx.recv() => self.handle_radio_event(event).await,
                Some(event) = mirror.recv() => self.handle_mirror_event(event, Instant::now()).await,
                _ = ticker.tick() => self.tick(Instant::now()).await,
            }
        }

        self.completed
            .clone()
            .ok_or_else(|| ErgZoneError::Other("session ended without a record".to_string()))
    }

    /// Tear both device links down
    ///
    /// # Errors
    ///
    /// Returns the first disconnect error; both links are reset regardless.
    pub async fn disconnect_all(&mut self) -> Result<()> {
        let trainer = self.trainer.disconnect().await;
        let sensor = if self.sensor.state() == ConnectionState::Disconnected {
            Ok(())
        } else {
            self.sensor.disconnect().await
        };
        self.arbiter.on_direct_disconnected();
        self.trainer_link = None;
        self.sensor_link = None;
        trainer.and(sensor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        companion::{mock::RecordingCompanion, NoCompanion},
        config::{ControllerConfig, JsonSettings, TimeoutConfig},
        event::{drain, test_sink},
        transport::mock::MockTransport,
        types::{CharacteristicInfo, CharacteristicProps, Notification},
        FTMS_CONTROL_POINT_UUID, FTMS_SERVICE_UUID, HEART_RATE_MEASUREMENT_UUID,
        HEART_RATE_SERVICE_UUID, INDOOR_BIKE_DATA_UUID,
    };
    use tokio_test::{assert_err, assert_ok};

    fn transport() -> Arc<MockTransport> {
        let props = CharacteristicProps {
            notify: true,
            indicate: true,
            write: true,
        };
        let transport = MockTransport {
            services: vec![FTMS_SERVICE_UUID, HEART_RATE_SERVICE_UUID],
            characteristics: [
                FTMS_CONTROL_POINT_UUID,
                INDOOR_BIKE_DATA_UUID,
                HEART_RATE_MEASUREMENT_UUID,
            ]
            .into_iter()
            .map(|uuid| CharacteristicInfo { uuid, props })
            .collect(),
            ..MockTransport::default()
        };
        Arc::new(transport)
    }

    fn feed(transport: &MockTransport) -> mpsc::UnboundedSender<Notification> {
        let (tx, rx) = mpsc::unbounded_channel();
        *transport.notification_feed.lock().unwrap() = Some(rx);
        tx
    }

    fn trainer() -> Device {
        Device::new("AA:BB", "KICKR", DeviceClass::Trainer)
    }

    fn trainer_link(session: &WorkoutSession) -> LinkId {
        session.trainer_link.as_ref().map_or(0, |link| link.id)
    }

    fn grant(session: &WorkoutSession) -> RadioEvent {
        RadioEvent::Notification {
            class: DeviceClass::Trainer,
            link: trainer_link(session),
            notification: Notification {
                characteristic: FTMS_CONTROL_POINT_UUID,
                value: vec![0x80, 0x00, 0x01],
            },
        }
    }

    fn config() -> SessionConfig {
        SessionConfig {
            target_duration_secs: 600,
            hr_source: HrSource::Mirrored,
            controller: ControllerConfig {
                smoothing_window: 1,
                warm_up_secs: 0,
                ..ControllerConfig::default()
            },
            ..SessionConfig::default()
        }
    }

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    struct Rig {
        session: WorkoutSession,
        transport: Arc<MockTransport>,
        events: mpsc::UnboundedReceiver<CoreEvent>,
        record: Arc<std::sync::Mutex<crate::companion::mock::Record>>,
        _feed: mpsc::UnboundedSender<Notification>,
    }

    async fn running_rig(config: SessionConfig, t0: Instant) -> Rig {
        let transport = transport();
        let feed = feed(&transport);
        let (companion, record) = RecordingCompanion::new(SessionKind::Mirrored);
        let (sink, events) = test_sink();
        let mut session =
            WorkoutSession::new(config, transport.clone(), Box::new(companion), sink).unwrap();

        assert_ok!(session.connect_trainer(trainer()).await);
        assert_ok!(session.start(t0).await);
        let granted = grant(&session);
        session.handle_radio_event(granted).await;
        session.handle_mirror_event(MirrorEvent::LinkActive, t0).await;

        Rig {
            session,
            transport,
            events,
            record,
            _feed: feed,
        }
    }

    #[tokio::test]
    async fn test_start_requires_ready_trainer() {
        let (sink, _events) = test_sink();
        let mut session =
            WorkoutSession::new(SessionConfig::default(), transport(), Box::new(NoCompanion), sink)
                .unwrap();
        let error = assert_err!(session.start(Instant::now()).await);
        assert!(matches!(error, ErgZoneError::NotReady { .. }));
        assert_eq!(session.state(), WorkoutState::Idle);
    }

    #[tokio::test]
    async fn test_start_without_authorization_is_rejected() {
        let transport = transport();
        let _feed = feed(&transport);
        let (mut companion, record) = RecordingCompanion::new(SessionKind::Mirrored);
        companion.authorized = false;
        let (sink, _events) = test_sink();
        let mut session =
            WorkoutSession::new(config(), transport.clone(), Box::new(companion), sink).unwrap();
        assert_ok!(session.connect_trainer(trainer()).await);

        let error = assert_err!(session.start(Instant::now()).await);
        assert!(matches!(error, ErgZoneError::NotAuthorized(_)));
        assert_eq!(session.state(), WorkoutState::Idle);
        assert!(transport.written().is_empty());
        assert!(record.lock().unwrap().calls.is_empty());
    }

    #[tokio::test]
    async fn test_start_commits_power_and_requests_control() {
        let t0 = Instant::now();
        let rig = running_rig(config(), t0).await;

        assert_eq!(rig.session.state(), WorkoutState::Running);
        assert_eq!(rig.session.trainer().state(), ConnectionState::Controlling);
        assert_eq!(
            rig.transport.written(),
            vec![vec![0x00], vec![0x07], vec![0x05, 0x96, 0x00]]
        );
        assert_eq!(rig.session.arbiter().source(), HrSource::Mirrored);

        let record = rig.record.lock().unwrap();
        assert_eq!(record.calls, vec!["start", "request_launch"]);
        assert_eq!(record.live, vec![CompanionMessage::StartWorkout]);
    }

    #[tokio::test]
    async fn test_settings_drive_session() {
        let settings = JsonSettings::new(r#"{ "target_power": 200, "target_duration_secs": 1200 }"#);
        let (sink, _events) = test_sink();
        let session = WorkoutSession::from_settings(
            &settings,
            transport(),
            Box::new(NoCompanion),
            sink,
        )
        .unwrap();
        assert_eq!(session.controller().adjusted_power(), 200);
        assert_eq!(session.config().target_duration(), secs(1200));
    }

    #[tokio::test]
    async fn test_mirror_loss_keeps_clock_and_samples() {
        let t0 = Instant::now();
        let mut rig = running_rig(config(), t0).await;

        rig.session
            .handle_mirror_event(MirrorEvent::HeartRate(130), t0)
            .await;
        rig.session.tick(t0 + secs(1)).await;
        rig.session.tick(t0 + secs(2)).await;
        rig.session
            .handle_mirror_event(MirrorEvent::LinkLost, t0 + secs(2))
            .await;
        rig.session.tick(t0 + secs(3)).await;
        rig.session.tick(t0 + secs(4)).await;

        let samples = &rig.session.session().unwrap().samples;
        assert_eq!(samples.len(), 4);
        assert_eq!(
            samples.iter().map(|s| s.elapsed).collect::<Vec<_>>(),
            vec![secs(1), secs(2), secs(3), secs(4)]
        );
        assert_eq!(samples[1].heart_rate, Some(130));
        assert_eq!(samples[2].heart_rate, None);
        assert_eq!(rig.session.state(), WorkoutState::Running);

        let snapshot = rig.session.snapshot(t0 + secs(4));
        assert!(snapshot.mirror_disconnected);
        assert_eq!(snapshot.heart_rate, None);
        assert!(drain(&mut rig.events).contains(&CoreEvent::MirrorLink { disconnected: true }));
    }

    #[tokio::test]
    async fn test_completes_on_the_tick_that_reaches_duration() {
        let t0 = Instant::now();
        let config = SessionConfig {
            target_duration_secs: 3,
            ..config()
        };
        let mut rig = running_rig(config, t0).await;

        rig.session.tick(t0 + secs(1)).await;
        rig.session.tick(t0 + secs(2)).await;
        assert_eq!(rig.session.state(), WorkoutState::Running);
        rig.session.tick(t0 + secs(3)).await;

        assert_eq!(rig.session.state(), WorkoutState::Completed);
        let finished = rig.session.completed_session().unwrap();
        assert_eq!(finished.samples.len(), 3);
        assert!(finished.is_finalized());
        assert_eq!(rig.transport.written().last(), Some(&vec![0x08, 0x01]));
        assert_eq!(rig.session.trainer().state(), ConnectionState::Ready);

        let events = drain(&mut rig.events);
        assert!(events.contains(&CoreEvent::StateChanged(WorkoutState::Completed)));
        assert!(events
            .iter()
            .any(|e| matches!(e, CoreEvent::SessionCompleted(s) if s.samples.len() == 3)));

        let record = rig.record.lock().unwrap();
        assert!(record.calls.contains(&"end"));
        assert_eq!(record.live.last(), Some(&CompanionMessage::WorkoutEnded));
    }

    #[tokio::test]
    async fn test_resume_uses_adjusted_power() {
        let t0 = Instant::now();
        let mut rig = running_rig(config(), t0).await;

        rig.session
            .handle_mirror_event(MirrorEvent::HeartRate(170), t0)
            .await;
        rig.session.tick(t0 + secs(1)).await;
        assert_eq!(rig.session.controller().adjusted_power(), 145);

        assert_ok!(rig.session.pause(t0 + secs(5)).await);
        assert_eq!(rig.session.trainer().state(), ConnectionState::Ready);
        rig.session.tick(t0 + secs(6)).await;
        assert_eq!(rig.session.session().unwrap().samples.len(), 1);

        rig.transport.clear_writes();
        assert_ok!(rig.session.resume(t0 + secs(65)).await);
        assert_eq!(rig.session.elapsed(t0 + secs(65)), secs(5));
        let granted = grant(&rig.session);
        rig.session.handle_radio_event(granted).await;

        assert_eq!(
            rig.transport.written(),
            vec![vec![0x00], vec![0x07], vec![0x05, 0x91, 0x00]]
        );
        let record = rig.record.lock().unwrap();
        assert!(record.calls.contains(&"pause"));
        assert!(record.calls.contains(&"resume"));
    }

    #[tokio::test]
    async fn test_peer_commands_drive_state() {
        let t0 = Instant::now();
        let mut rig = running_rig(config(), t0).await;

        rig.session
            .handle_mirror_event(MirrorEvent::Message(CompanionMessage::PauseWorkout), t0 + secs(1))
            .await;
        assert_eq!(rig.session.state(), WorkoutState::Paused);

        rig.session
            .handle_mirror_event(MirrorEvent::Message(CompanionMessage::StopWorkout), t0 + secs(2))
            .await;
        assert_eq!(rig.session.state(), WorkoutState::Completed);

        let record = rig.record.lock().unwrap();
        assert!(!record.live.contains(&CompanionMessage::PauseWorkout));
        assert!(!record.live.contains(&CompanionMessage::StopWorkout));
        assert!(record.live.contains(&CompanionMessage::WorkoutEnded));
    }

    #[tokio::test]
    async fn test_trainer_link_loss_does_not_stop_workout() {
        let t0 = Instant::now();
        let mut rig = running_rig(config(), t0).await;

        let link = trainer_link(&rig.session);
        rig.session
            .handle_radio_event(RadioEvent::Disconnected {
                class: DeviceClass::Trainer,
                link,
            })
            .await;
        rig.session.tick(t0 + secs(1)).await;

        assert_eq!(rig.session.state(), WorkoutState::Running);
        assert_eq!(rig.session.trainer().state(), ConnectionState::Disconnected);

        let _feed = feed(&rig.transport);
        rig.transport.clear_writes();
        assert_ok!(rig.session.connect_trainer(trainer()).await);
        let granted = grant(&rig.session);
        rig.session.handle_radio_event(granted).await;
        assert_eq!(
            rig.transport.written(),
            vec![vec![0x00], vec![0x07], vec![0x05, 0x96, 0x00]]
        );
    }

    #[tokio::test]
    async fn test_mid_workout_reconnect_uses_short_timeout() {
        let config = SessionConfig {
            timeouts: TimeoutConfig {
                reconnect_timeout_ms: 50,
                ..TimeoutConfig::default()
            },
            ..config()
        };
        let t0 = Instant::now();
        let mut rig = running_rig(config, t0).await;
        let link = trainer_link(&rig.session);
        rig.session
            .handle_radio_event(RadioEvent::Disconnected {
                class: DeviceClass::Trainer,
                link,
            })
            .await;

        *rig.transport.connect_delay.lock().unwrap() = Some(secs(10));
        let error = assert_err!(rig.session.connect_trainer(trainer()).await);
        assert!(matches!(error, ErgZoneError::Timeout { timeout_ms: 50 }));
        assert_eq!(rig.session.trainer().state(), ConnectionState::Disconnected);
        assert_eq!(rig.session.state(), WorkoutState::Running);
    }

    #[tokio::test]
    async fn test_stale_link_end_keeps_reconnected_trainer() {
        let transport = transport();
        let old_feed = feed(&transport);
        let (sink, _events) = test_sink();
        let mut session = WorkoutSession::new(
            SessionConfig::default(),
            transport.clone(),
            Box::new(NoCompanion),
            sink,
        )
        .unwrap();
        assert_ok!(session.connect_trainer(trainer()).await);
        let stale = trainer_link(&session);

        session.trainer.handle_disconnect();
        session.tick(Instant::now()).await;
        assert!(session.trainer_link.is_none());

        let _new_feed = feed(&transport);
        assert_ok!(session.connect_trainer(trainer()).await);
        assert_ne!(trainer_link(&session), stale);

        drop(old_feed);
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        session.process_radio_events().await;
        session
            .handle_radio_event(RadioEvent::Disconnected {
                class: DeviceClass::Trainer,
                link: stale,
            })
            .await;

        assert_eq!(session.trainer().state(), ConnectionState::Ready);
        assert!(session.trainer_link.is_some());
    }

    #[tokio::test]
    async fn test_forwarded_notifications_reach_trainer() {
        let transport = transport();
        let feed = feed(&transport);
        let (sink, _events) = test_sink();
        let mut session = WorkoutSession::new(
            SessionConfig::default(),
            transport.clone(),
            Box::new(NoCompanion),
            sink,
        )
        .unwrap();
        assert_ok!(session.connect_trainer(trainer()).await);

        feed.send(Notification {
            characteristic: INDOOR_BIKE_DATA_UUID,
            value: vec![0x40, 0x00, 0x00, 0x00, 0xC8, 0x00],
        })
        .unwrap();
        tokio::task::yield_now().await;
        for _ in 0..10 {
            session.process_radio_events().await;
            if session.trainer().last_power().is_some() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(session.trainer().last_power(), Some(200));
    }

    #[tokio::test]
    async fn test_run_loop_completes_session() {
        let transport = transport();
        let _feed = feed(&transport);
        let (sink, _events) = test_sink();
        let config = SessionConfig {
            target_duration_secs: 1,
            sample_interval_ms: 100,
            hr_source: HrSource::Direct,
            ..SessionConfig::default()
        };
        let session =
            WorkoutSession::new(config, transport.clone(), Box::new(NoCompanion), sink).unwrap();

        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (_mirror, mirror_rx) = mpsc::unbounded_channel();
        commands.send(SessionCommand::ConnectTrainer(trainer())).unwrap();
        commands.send(SessionCommand::Start).unwrap();

        let finished = assert_ok!(session.run(commands_rx, mirror_rx).await);
        assert!(finished.is_finalized());
        assert!(!finished.samples.is_empty());
        assert_eq!(transport.written().first(), Some(&vec![0x00]));
    }
}
