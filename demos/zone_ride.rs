use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use ergzone::{
    ble::BtleTransport, companion::NoCompanion, orchestrator::SessionCommand,
    transport::scan_for, CoreEvent, DeviceClass, HrSource, Result, SessionConfig, WorkoutSession,
    ZoneBounds,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    info!("🚴 ergzone zone ride demo");

    let config = SessionConfig {
        target_power: 150,
        target_duration_secs: 20 * 60,
        zone: ZoneBounds::new(120, 140)?,
        hr_source: HrSource::Direct,
        ..SessionConfig::default()
    };

    let transport = Arc::new(BtleTransport::new().await?);
    info!("Searching for a trainer and a heart-rate strap...");
    let registry = scan_for(
        transport.as_ref(),
        &[DeviceClass::Trainer, DeviceClass::HeartRateMonitor],
        config.timeouts.scan_timeout(),
    )
    .await?;

    let Some(trainer) = registry.of_class(DeviceClass::Trainer).into_iter().next() else {
        error!("❌ No trainer found");
        return Ok(());
    };
    let strap = registry
        .of_class(DeviceClass::HeartRateMonitor)
        .into_iter()
        .next();

    let (events_tx, mut events_rx) = mpsc::unbounded_channel::<CoreEvent>();
    let session = WorkoutSession::new(config, transport, Box::new(NoCompanion), events_tx)?;

    let (commands, commands_rx) = mpsc::unbounded_channel();
    let (_mirror, mirror_rx) = mpsc::unbounded_channel();
    let _ = commands.send(SessionCommand::ConnectTrainer(trainer));
    match strap {
        Some(strap) => {
            let _ = commands.send(SessionCommand::ConnectHeartRate(strap));
        }
        None => warn!("⚠️ No heart-rate strap found, riding at fixed power"),
    }
    let _ = commands.send(SessionCommand::Start);

    // Print what the core reports
    let printer = tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            match event {
                CoreEvent::Snapshot(s) => info!(
                    "⏱  {:>4}s  ❤️ {:>3}  ⚡ {:>3} W  🎯 {} W  chunk {}/{}",
                    s.elapsed.as_secs(),
                    s.heart_rate.map_or_else(|| "--".to_string(), |hr| hr.to_string()),
                    s.power.unwrap_or(0),
                    s.adjusted_power,
                    s.progress.current_chunk,
                    s.progress.total_chunks,
                ),
                CoreEvent::Telemetry(frame) => {
                    if let Some(rpm) = frame.cadence_rpm() {
                        debug!("🔄 {} rpm", rpm);
                    }
                }
                CoreEvent::PowerAdjusted(a) => info!("📈 {} W -> {} W", a.from, a.to),
                CoreEvent::CommandFailed {
                    opcode,
                    result_code,
                } => warn!("Trainer rejected {:02X} with {:02X}", opcode, result_code),
                CoreEvent::TransportFailure { class, reason } => {
                    warn!("⚠️ {} failure: {}", class, reason);
                }
                CoreEvent::SessionCompleted(session) => {
                    info!(
                        "🏁 Done: {} samples, avg HR {:.0}, avg power {:.0} W",
                        session.samples.len(),
                        session.average_heart_rate().unwrap_or(0.0),
                        session.average_power().unwrap_or(0.0),
                    );
                }
                _ => {}
            }
        }
    });

    // Ctrl-C finishes the ride early
    let stop = commands.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = stop.send(SessionCommand::Finish);
        }
    });

    let finished = session.run(commands_rx, mirror_rx).await?;
    info!("✅ Recorded {} samples", finished.samples.len());
    drop(commands);
    let _ = printer.await;
    Ok(())
}
