use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use ais_sentinel::bus::{BusEvent, EventBus};
use ais_sentinel::config::AppConfig;
use ais_sentinel::database::DbDropGuard;
use ais_sentinel::errors::SentinelError;
use ais_sentinel::replay::{ReplayController, ReplayRequest};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let Some(path) = args.next() else {
        bail!("usage: ais-sentinel <file.csv[.zst]> [speedup]");
    };
    let speedup = match args.next() {
        Some(raw) => raw
            .parse::<f64>()
            .with_context(|| format!("invalid speedup {raw:?}"))?,
        // As fast as the database allows: no pacing sleeps.
        None => f64::INFINITY,
    };

    let config = AppConfig::load().context("failed to load configuration")?;
    config.validate().context("invalid configuration")?;

    let db_guard = DbDropGuard::new(config.database.clone())?;
    let db = db_guard.db();
    let bus = EventBus::default();
    let controller = ReplayController::new(db.clone(), bus.clone(), config.clone());

    // Drop cooldown rows past their retention once an hour.
    let scheduler = JobScheduler::new().await?;
    let cleanup_db = db.clone();
    let retention = config.database.cooldown_retention;
    scheduler
        .add(Job::new("0 17 * * * *", move |_id, _sched| {
            match cleanup_db.cleanup_cooldowns(retention, chrono::Utc::now()) {
                Ok(deleted) if deleted > 0 => info!("cooldown cleanup removed {deleted} rows"),
                Ok(_) => {}
                Err(e) => warn!("cooldown cleanup failed: {e}"),
            }
        })?)
        .await?;
    scheduler.start().await?;

    let mut events = controller.subscribe();
    controller.start(ReplayRequest {
        path: PathBuf::from(&path),
        speedup,
        use_streaming: true,
        batch_size: config.ingest.default_batch_size,
    })?;

    let mut poll = tokio::time::interval(std::time::Duration::from_millis(200));
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(BusEvent::Alert { data }) => info!(
                    mmsi = %data.mmsi,
                    rule = %data.rule_type,
                    severity = data.severity,
                    "{}",
                    data.summary
                ),
                Some(BusEvent::Tick { processed }) => info!("processed {processed} points"),
                Some(BusEvent::Error { message }) => error!("session error: {message}"),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received, stopping replay");
                match controller.stop() {
                    Ok(()) | Err(SentinelError::NotRunning) => {}
                    Err(e) => warn!("stop failed: {e}"),
                }
            }
            _ = poll.tick() => {
                if !controller.status().running {
                    // Drain anything already on the bus before leaving.
                    while let Some(event) = events.try_recv() {
                        if let BusEvent::Alert { data } = event {
                            info!(mmsi = %data.mmsi, rule = %data.rule_type, "{}", data.summary);
                        }
                    }
                    break;
                }
            }
        }
    }

    let status = controller.status();
    info!(
        processed = status.processed,
        dropped_events = bus.dropped_count(),
        "replay session complete"
    );
    db.flush()?;
    Ok(())
}
