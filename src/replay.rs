//! Timestamp-paced replay of recorded AIS files.
//!
//! One session at a time. The blocking loader runs on a spawn_blocking
//! thread and feeds decoded chunks through a bounded channel; the driver
//! task paces points against source timestamps, evaluates the detection
//! rules with a session-local track store, persists each point as an
//! atomic unit and fans events out on the bus. `stop` is cooperative:
//! pacing sleeps are interruptible and in-flight work is drained.

use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::bus::{BusEvent, EventBus};
use crate::config::AppConfig;
use crate::database::{Db, IngestPolicy, IngestUnit};
use crate::detection::RuleEngine;
use crate::errors::SentinelError;
use crate::loader::{LoaderStats, PointSource};
use crate::models::AisPoint;
use crate::track::TrackStore;

/// A `tick` event is emitted every this many processed points.
const TICK_EVERY: u64 = 100;

/// Chunk messages from the loader thread to the driver task.
enum ChunkMsg {
    Points(Vec<AisPoint>),
    Done(LoaderStats),
    Failed(SentinelError),
}

/// Parameters for one replay session.
#[derive(Debug, Clone)]
pub struct ReplayRequest {
    pub path: PathBuf,
    /// Wall-clock multiple; 1.0 replays in real time, infinity disables
    /// pacing entirely
    pub speedup: f64,
    /// Force streaming mode even for small files
    pub use_streaming: bool,
    /// Units committed per transaction; 1 commits per point
    pub batch_size: usize,
}

impl ReplayRequest {
    fn validate(&self) -> Result<(), SentinelError> {
        if self.speedup.is_nan() || self.speedup < 0.1 {
            return Err(SentinelError::config(format!(
                "speedup must be at least 0.1, got {}",
                self.speedup
            )));
        }
        if !(1..=10_000).contains(&self.batch_size) {
            return Err(SentinelError::config(format!(
                "batch_size must be in 1..=10000, got {}",
                self.batch_size
            )));
        }
        Ok(())
    }
}

/// Snapshot of the active (or last) session.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct ReplayStatus {
    pub running: bool,
    pub processed: u64,
    pub last_timestamp: Option<DateTime<Utc>>,
    pub stop_requested: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Starting,
    Running,
    Stopping,
}

/// Live counters shared between the driver task and `status()`.
#[derive(Debug)]
struct Progress {
    processed: AtomicU64,
    /// Epoch milliseconds of the most recently attempted point;
    /// `i64::MIN` means none yet
    last_timestamp_ms: AtomicI64,
}

impl Progress {
    fn new() -> Self {
        Self {
            processed: AtomicU64::new(0),
            last_timestamp_ms: AtomicI64::new(i64::MIN),
        }
    }

    fn last_timestamp(&self) -> Option<DateTime<Utc>> {
        let ms = self.last_timestamp_ms.load(Ordering::Relaxed);
        if ms == i64::MIN {
            None
        } else {
            DateTime::from_timestamp_millis(ms)
        }
    }
}

struct Session {
    phase: Phase,
    /// Monotone session counter, used for log correlation
    seq: u64,
    progress: Arc<Progress>,
    cancel: watch::Sender<bool>,
}

struct Inner {
    db: Db,
    bus: EventBus,
    config: AppConfig,
    session: Mutex<Session>,
}

/// Owns the single replay session slot and exposes the control surface:
/// start, stop, status, and the event bus subscription.
#[derive(Clone)]
pub struct ReplayController {
    inner: Arc<Inner>,
}

impl ReplayController {
    pub fn new(db: Db, bus: EventBus, config: AppConfig) -> Self {
        let (cancel, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                db,
                bus,
                config,
                session: Mutex::new(Session {
                    phase: Phase::Idle,
                    seq: 0,
                    progress: Arc::new(Progress::new()),
                    cancel,
                }),
            }),
        }
    }

    /// Begin a replay session. Rejects when a session is already active,
    /// when parameters are invalid, and when the source cannot be opened
    /// and decoded; in every failure case the controller stays Idle with
    /// no observable side effects.
    pub fn start(&self, request: ReplayRequest) -> Result<(), SentinelError> {
        let mut session = self
            .inner
            .session
            .lock()
            .map_err(|e| SentinelError::Lock(e.to_string()))?;
        if session.phase != Phase::Idle {
            return Err(SentinelError::AlreadyRunning);
        }
        session.phase = Phase::Starting;

        let outcome = request
            .validate()
            .and_then(|()| PointSource::open(&request.path));
        let source = match outcome {
            Ok(source) => source,
            Err(e) => {
                session.phase = Phase::Idle;
                return Err(e);
            }
        };

        session.seq += 1;
        let seq = session.seq;
        let progress = Arc::new(Progress::new());
        session.progress = progress.clone();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        session.cancel = cancel_tx;
        session.phase = Phase::Running;
        drop(session);

        info!(
            session = seq,
            path = %request.path.display(),
            speedup = request.speedup,
            batch_size = request.batch_size,
            "starting replay"
        );
        let inner = self.inner.clone();
        tokio::spawn(run_session(inner, request, source, progress, cancel_rx, seq));
        Ok(())
    }

    /// Request a cooperative stop. Idempotent while a session exists;
    /// an error when nothing is running.
    pub fn stop(&self) -> Result<(), SentinelError> {
        let mut session = self
            .inner
            .session
            .lock()
            .map_err(|e| SentinelError::Lock(e.to_string()))?;
        match session.phase {
            Phase::Idle => Err(SentinelError::NotRunning),
            Phase::Stopping => Ok(()),
            Phase::Running | Phase::Starting => {
                info!(session = session.seq, "stop requested");
                session.phase = Phase::Stopping;
                let _ = session.cancel.send(true);
                Ok(())
            }
        }
    }

    pub fn status(&self) -> ReplayStatus {
        let session = self.inner.session.lock().unwrap();
        let stop_requested = *session.cancel.borrow();
        ReplayStatus {
            running: session.phase != Phase::Idle,
            processed: session.progress.processed.load(Ordering::Relaxed),
            last_timestamp: session.progress.last_timestamp(),
            stop_requested,
        }
    }

    pub fn subscribe(&self) -> crate::bus::EventStream {
        self.inner.bus.subscribe()
    }
}

/// Per-session accounting, logged in the final summary.
#[derive(Debug, Default)]
struct SessionSummary {
    processed: u64,
    persisted: u64,
    persist_failures: u64,
    alerts: u64,
    rows_skipped: u64,
    stopped: bool,
}

async fn run_session(
    inner: Arc<Inner>,
    request: ReplayRequest,
    source: PointSource,
    progress: Arc<Progress>,
    cancel: watch::Receiver<bool>,
    seq: u64,
) {
    let result = drive(&inner, &request, source, &progress, cancel, seq).await;

    match &result {
        Ok(summary) => {
            info!(
                session = seq,
                processed = summary.processed,
                persisted = summary.persisted,
                persist_failures = summary.persist_failures,
                alerts = summary.alerts,
                rows_skipped = summary.rows_skipped,
                stopped = summary.stopped,
                "replay finished"
            );
        }
        Err(e) => {
            error!(session = seq, "replay failed: {e}");
            inner.bus.publish(BusEvent::Error {
                message: e.to_string(),
            });
        }
    }

    if let Ok(mut session) = inner.session.lock() {
        session.phase = Phase::Idle;
    }
}

async fn drive(
    inner: &Inner,
    request: &ReplayRequest,
    mut source: PointSource,
    progress: &Arc<Progress>,
    mut cancel: watch::Receiver<bool>,
    seq: u64,
) -> Result<SessionSummary, SentinelError> {
    let config = &inner.config;
    let policy = IngestPolicy {
        cooldown_sec: config.detection.alert_cooldown_sec,
        update_latest_out_of_order: config.detection.update_latest_out_of_order,
    };
    let engine = RuleEngine::new(config.detection.clone());
    // The track store lives and dies with this session.
    let mut tracks = TrackStore::new(config.detection.track_window_size);

    // Alert severity highs are per session.
    inner.db.reset_alert_severity()?;

    let streaming = request.use_streaming
        || source.file_size() > (config.ingest.streaming_threshold_mb * 1024.0 * 1024.0) as u64;
    let chunk_size = if streaming {
        config.ingest.chunk_size
    } else {
        usize::MAX
    };
    debug!(session = seq, streaming, "loader mode selected");

    // Blocking decode on its own thread, chunks through a bounded channel.
    let (chunk_tx, mut chunk_rx) = mpsc::channel::<ChunkMsg>(2);
    let producer = tokio::task::spawn_blocking(move || loop {
        match source.next_chunk(chunk_size) {
            Ok(Some(chunk)) => {
                if chunk_tx.blocking_send(ChunkMsg::Points(chunk)).is_err() {
                    break;
                }
            }
            Ok(None) => {
                let _ = chunk_tx.blocking_send(ChunkMsg::Done(source.stats()));
                break;
            }
            Err(e) => {
                let _ = chunk_tx.blocking_send(ChunkMsg::Failed(e));
                break;
            }
        }
    });

    let mut summary = SessionSummary::default();
    let mut pending: Vec<IngestUnit> = Vec::with_capacity(request.batch_size);
    let mut reference: Option<(i64, Instant)> = None;
    let mut last_tick = 0u64;

    'session: loop {
        let msg = tokio::select! {
            msg = chunk_rx.recv() => msg,
            _ = cancel.wait_for(|stop| *stop) => {
                summary.stopped = true;
                break 'session;
            }
        };
        let Some(msg) = msg else { break };

        match msg {
            ChunkMsg::Points(chunk) => {
                for point in chunk {
                    if *cancel.borrow() {
                        summary.stopped = true;
                        break 'session;
                    }

                    pace(request.speedup, &point, &mut reference, &mut cancel).await;

                    tracks.push(point.clone());
                    let prev = tracks.previous(&point.mmsi).cloned();
                    let candidates = engine.evaluate(prev.as_ref(), &point);
                    pending.push(IngestUnit { point, candidates });

                    if pending.len() >= request.batch_size {
                        flush(inner, &mut pending, &policy, progress, &mut summary, &mut last_tick);
                    }
                }
            }
            ChunkMsg::Done(stats) => {
                summary.rows_skipped = stats.skipped;
                break;
            }
            ChunkMsg::Failed(e) => {
                // Flush what we have before surfacing the terminal error.
                flush(inner, &mut pending, &policy, progress, &mut summary, &mut last_tick);
                producer.abort();
                return Err(e);
            }
        }
    }

    // Drain in-flight work whether we finished or were stopped.
    flush(inner, &mut pending, &policy, progress, &mut summary, &mut last_tick);
    inner.bus.publish(BusEvent::Tick {
        processed: summary.processed,
    });
    drop(chunk_rx);
    producer.abort();

    Ok(summary)
}

/// Sleep long enough that source-time deltas are reproduced at
/// `1/speedup` scale. The first point anchors the reference; an infinite
/// speedup never sleeps; the sleep is cut short when stop is requested.
async fn pace(
    speedup: f64,
    point: &AisPoint,
    reference: &mut Option<(i64, Instant)>,
    cancel: &mut watch::Receiver<bool>,
) {
    if !speedup.is_finite() {
        return;
    }
    let ts = point.timestamp_ms();
    let Some((ref_ts, ref_wall)) = *reference else {
        *reference = Some((ts, Instant::now()));
        return;
    };
    let target = (ts - ref_ts) as f64 / 1000.0 / speedup;
    let delay = target - ref_wall.elapsed().as_secs_f64();
    if delay > 0.0 {
        tokio::select! {
            _ = sleep(Duration::from_secs_f64(delay)) => {}
            _ = cancel.wait_for(|stop| *stop) => {}
        }
    }
}

/// Persist the pending units, publish their accepted alerts and any due
/// progress ticks. Persistence failures are counted, never fatal.
fn flush(
    inner: &Inner,
    pending: &mut Vec<IngestUnit>,
    policy: &IngestPolicy,
    progress: &Arc<Progress>,
    summary: &mut SessionSummary,
    last_tick: &mut u64,
) {
    if pending.is_empty() {
        return;
    }
    let last_ts = pending
        .last()
        .map(|unit| unit.point.timestamp_ms())
        .unwrap_or(i64::MIN);

    match inner.db.ingest_batch(pending, policy) {
        Ok(outcome) => {
            summary.processed += outcome.attempted;
            summary.persisted += outcome.persisted;
            summary.persist_failures += outcome.failed;
            summary.alerts += outcome.alerts.len() as u64;
            for alert in outcome.alerts {
                inner.bus.publish(BusEvent::Alert { data: alert });
            }
        }
        Err(e) => {
            // The whole batch failed to commit; count it as skipped and
            // keep replaying.
            warn!("batch of {} units not persisted: {e}", pending.len());
            summary.processed += pending.len() as u64;
            summary.persist_failures += pending.len() as u64;
        }
    }
    pending.clear();

    progress.processed.store(summary.processed, Ordering::Relaxed);
    progress.last_timestamp_ms.store(last_ts, Ordering::Relaxed);

    while summary.processed - *last_tick >= TICK_EVERY {
        *last_tick += TICK_EVERY;
        inner.bus.publish(BusEvent::Tick {
            processed: summary.processed,
        });
    }
}
