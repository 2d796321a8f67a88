//! Database functionality for vessel state, position history and alerts
//!
//! This module provides a thread-safe interface for:
//! - Upserting per-vessel latest state and appending position history
//! - Inserting alerts behind the durable per-(vessel, rule) cooldown gate
//! - Alert queries, statistics and CSV export
//! - Periodic flushing of data to disk and cooldown retention cleanup

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, ToSql, Transaction};
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::config::DatabaseConfig;
use crate::detection::Candidate;
use crate::errors::SentinelError;
use crate::models::{
    AisPoint, AlertFilter, AlertRecord, AlertStats, AlertStatus, Mmsi, RuleType, VesselLatest,
    VesselPosition,
};

/// How the ingest unit treats cooldowns and out-of-order points.
#[derive(Debug, Clone, Copy)]
pub struct IngestPolicy {
    /// Minimum source-time gap between two alerts of the same kind for the
    /// same vessel, in seconds
    pub cooldown_sec: i64,
    /// Overwrite the latest state even when the point's timestamp precedes
    /// the stored one
    pub update_latest_out_of_order: bool,
}

/// One point plus the candidate alerts its evaluation produced.
#[derive(Debug, Clone)]
pub struct IngestUnit {
    pub point: AisPoint,
    pub candidates: Vec<Candidate>,
}

/// Result of persisting a batch of units.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    /// Units attempted (persisted + failed)
    pub attempted: u64,
    pub persisted: u64,
    /// Units rolled back individually; the rest of the batch is unaffected
    pub failed: u64,
    /// Alerts accepted by the cooldown gate, in unit order
    pub alerts: Vec<AlertRecord>,
}

/// A guard that ensures proper shutdown of database background tasks.
///
/// When dropped, this guard ensures that:
/// - Background flush task is terminated gracefully
/// - All pending writes are flushed to disk
#[derive(Debug)]
pub struct DbDropGuard {
    /// The `Db` instance that will be shut down when this guard is dropped
    db: Db,
}

/// Thread-safe database handle.
///
/// This type is cloneable and can be shared between tasks. It provides
/// a safe interface to the underlying database operations while managing
/// concurrent access and periodic maintenance.
#[derive(Clone, Debug)]
pub struct Db {
    /// Handle to shared state
    shared: Arc<Shared>,
}

/// Shared state protected by a mutex
///
/// Uses std::sync::Mutex instead of tokio::sync::Mutex because:
/// - Critical sections are short
/// - No async operations are performed while holding the lock
#[derive(Debug)]
struct Shared {
    /// The database state protected by a mutex
    state: Mutex<DatabaseState>,
    /// Notifies the background task for flushing
    background_task: Notify,
}

/// Database connection and configuration state
///
/// Not thread-safe on its own; always accessed through the shared mutex.
#[derive(Debug)]
struct DatabaseState {
    /// Active SQLite connection
    connection: Connection,
    /// Database configuration parameters
    config: DatabaseConfig,
    /// Timestamp of last flush operation
    last_flush: Instant,
    /// Flag indicating shutdown state
    shutdown: bool,
}

/// Transaction error wrapper for better context
#[derive(Error, Debug)]
pub enum TransactionError {
    #[error("Failed to execute transaction: {context}")]
    Execute {
        context: String,
        #[source]
        source: rusqlite::Error,
    },
    #[error("Failed to commit transaction: {context}")]
    Commit {
        context: String,
        #[source]
        source: rusqlite::Error,
    },
}

impl DbDropGuard {
    /// Creates a new database instance with the specified configuration
    pub fn new(config: DatabaseConfig) -> Result<Self, SentinelError> {
        Ok(DbDropGuard {
            db: Db::new(config)?,
        })
    }

    /// Gets a handle to the database
    ///
    /// The returned handle is cheap to clone and can be shared between
    /// tasks; the underlying connection and state are shared between all
    /// clones.
    pub fn db(&self) -> Db {
        self.db.clone()
    }
}

impl Drop for DbDropGuard {
    fn drop(&mut self) {
        self.db.shutdown();
    }
}

impl Db {
    /// Create a new database handle
    fn new(config: DatabaseConfig) -> Result<Self, SentinelError> {
        config.validate()?;

        info!(
            "Initializing database: path={}, flush_interval={:?}",
            config.path.display(),
            config.flush_interval
        );

        let conn = DatabaseState::open_database(&config.path)?;
        DatabaseState::create_tables_indices(&conn)?;

        let shared = Arc::new(Shared {
            state: Mutex::new(DatabaseState {
                connection: conn,
                config,
                last_flush: Instant::now(),
                shutdown: false,
            }),
            background_task: Notify::new(),
        });

        #[cfg(not(test))]
        {
            // Only spawn background task in non-test mode
            tokio::spawn(background_flush(shared.clone()));
        }

        Ok(Self { shared })
    }

    /// Persist a batch of ingest units inside one transaction. Each unit
    /// runs under its own savepoint: a failing unit is rolled back and
    /// counted without disturbing its neighbors.
    pub fn ingest_batch(
        &self,
        units: &[IngestUnit],
        policy: &IngestPolicy,
    ) -> Result<BatchOutcome, SentinelError> {
        self.shared
            .execute_mut(|state| state.ingest_batch(units, policy))
    }

    /// Persist a single point as one atomic unit.
    pub fn ingest_point(
        &self,
        point: &AisPoint,
        candidates: Vec<Candidate>,
        policy: &IngestPolicy,
    ) -> Result<Vec<AlertRecord>, SentinelError> {
        let unit = IngestUnit {
            point: point.clone(),
            candidates,
        };
        let outcome = self.ingest_batch(std::slice::from_ref(&unit), policy)?;
        Ok(outcome.alerts)
    }

    /// Latest known state per vessel, most recently seen first.
    pub fn latest_vessels(&self, limit: Option<usize>) -> Result<Vec<VesselLatest>, SentinelError> {
        self.shared.execute_mut(|state| state.latest_vessels(limit))
    }

    /// Latest known state for one vessel.
    pub fn latest_vessel(&self, mmsi: &Mmsi) -> Result<Option<VesselLatest>, SentinelError> {
        self.shared.execute_mut(|state| state.latest_vessel(mmsi))
    }

    /// Position history for one vessel, oldest first. `limit` keeps the
    /// most recent rows.
    pub fn vessel_track(
        &self,
        mmsi: &Mmsi,
        limit: Option<usize>,
    ) -> Result<Vec<VesselPosition>, SentinelError> {
        self.shared
            .execute_mut(|state| state.vessel_track(mmsi, limit))
    }

    /// Alerts matching the filter, newest first.
    pub fn list_alerts(&self, filter: &AlertFilter) -> Result<Vec<AlertRecord>, SentinelError> {
        self.shared.execute_mut(|state| state.list_alerts(filter))
    }

    pub fn get_alert(&self, id: i64) -> Result<AlertRecord, SentinelError> {
        self.shared.execute_mut(|state| state.get_alert(id))
    }

    /// Update the review status (and optionally the notes) of one alert.
    pub fn update_alert_status(
        &self,
        id: i64,
        status: AlertStatus,
        notes: Option<&str>,
    ) -> Result<AlertRecord, SentinelError> {
        self.shared
            .execute_mut(|state| state.update_alert_status(id, status, notes))
    }

    /// Aggregate statistics over alerts in the given source-time range.
    pub fn alert_stats(
        &self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<AlertStats, SentinelError> {
        self.shared.execute_mut(|state| state.alert_stats(start, end))
    }

    /// Render the filtered alerts as CSV.
    pub fn export_alerts_csv(&self, filter: &AlertFilter) -> Result<String, SentinelError> {
        self.shared
            .execute_mut(|state| state.export_alerts_csv(filter))
    }

    /// Delete cooldown rows whose last alert is older than `max_age`
    /// relative to `now`. Returns the number of rows deleted.
    pub fn cleanup_cooldowns(
        &self,
        max_age: std::time::Duration,
        now: DateTime<Utc>,
    ) -> Result<usize, SentinelError> {
        self.shared
            .execute_mut(|state| state.cleanup_cooldowns(max_age, now))
    }

    /// Zero `last_alert_severity` for all vessels. Called when a replay
    /// session starts; severity highs are scoped to one session.
    pub fn reset_alert_severity(&self) -> Result<usize, SentinelError> {
        self.shared.execute_mut(|state| state.reset_alert_severity())
    }

    /// Explicitly flush database
    pub fn flush(&self) -> Result<(), SentinelError> {
        self.shared.execute_mut(|state| state.flush())
    }

    /// Signal the background task to shut down
    fn shutdown(&self) {
        if let Ok(mut state) = self.shared.state.lock() {
            state.shutdown = true;
        }
        self.shared.background_task.notify_one();
    }
}

pub struct DbBuilder {
    path: Option<PathBuf>,
    flush_interval: Option<Duration>,
    cooldown_retention: Option<Duration>,
}

impl DbBuilder {
    pub fn new() -> Self {
        Self {
            path: None,
            flush_interval: None,
            cooldown_retention: None,
        }
    }

    pub fn path(mut self, path: PathBuf) -> Self {
        self.path = Some(path);
        self
    }

    pub fn flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = Some(interval);
        self
    }

    pub fn cooldown_retention(mut self, retention: Duration) -> Self {
        self.cooldown_retention = Some(retention);
        self
    }

    pub fn build(self) -> Result<DbDropGuard, SentinelError> {
        let defaults = DatabaseConfig::default();
        let config = DatabaseConfig {
            path: self.path.unwrap_or(defaults.path),
            flush_interval: self.flush_interval.unwrap_or(defaults.flush_interval),
            cooldown_retention: self.cooldown_retention.unwrap_or(defaults.cooldown_retention),
        };

        DbDropGuard::new(config)
    }
}

impl Default for DbBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl Shared {
    /// Perform flush operation while holding the lock
    fn perform_flush(&self) -> Option<Instant> {
        let mut state = self.state.lock().unwrap();
        if state.shutdown {
            return None;
        }

        if state.should_flush() {
            if let Err(e) = state.flush() {
                error!("Flush error: {}", e);
            }
        }
        Some(state.next_flush_time())
    }

    /// Check if the database is shutting down
    fn is_shutdown(&self) -> bool {
        self.state.lock().unwrap().shutdown
    }

    /// Execute a query that requires mutable access to the database
    fn execute_mut<F, T>(&self, f: F) -> Result<T, SentinelError>
    where
        F: FnOnce(&mut DatabaseState) -> Result<T, SentinelError>,
    {
        let mut state = self
            .state
            .lock()
            .map_err(|e| SentinelError::Lock(e.to_string()))?;
        f(&mut state)
    }
}

impl DatabaseState {
    /// Open or create the database with optimized settings
    fn open_database(path: &Path) -> Result<Connection, SentinelError> {
        info!("Opening database at {}", path.display());
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_CREATE | OpenFlags::SQLITE_OPEN_READ_WRITE,
        )
        .map_err(|e| SentinelError::DatabaseOpen {
            path: path.to_path_buf(),
            origin: e.to_string(),
        })?;

        // Configure for performance
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| SentinelError::DatabaseConfig {
                message: "Failed to set journal_mode".to_string(),
                origin: e.to_string(),
            })?;

        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(|e| SentinelError::DatabaseConfig {
                message: "Failed to set synchronous mode".to_string(),
                origin: e.to_string(),
            })?;

        conn.pragma_update(None, "temp_store", "MEMORY")
            .map_err(|e| SentinelError::DatabaseConfig {
                message: "Failed to set temp_store".to_string(),
                origin: e.to_string(),
            })?;
        Ok(conn)
    }

    /// Create the four tables and their indexes. All timestamps are epoch
    /// milliseconds in source time.
    fn create_tables_indices(conn: &Connection) -> Result<(), SentinelError> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS vessels_latest (
                mmsi TEXT PRIMARY KEY,
                timestamp INTEGER NOT NULL,
                lat REAL NOT NULL,
                lon REAL NOT NULL,
                sog REAL,
                cog REAL,
                heading REAL,
                last_alert_severity INTEGER NOT NULL DEFAULT 0
            )",
            [],
        )
        .map_err(|e| SentinelError::TableCreation {
            table: "vessels_latest".to_string(),
            origin: e.to_string(),
        })?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS vessel_positions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                mmsi TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                lat REAL NOT NULL,
                lon REAL NOT NULL,
                sog REAL,
                cog REAL,
                heading REAL
            )",
            [],
        )
        .map_err(|e| SentinelError::TableCreation {
            table: "vessel_positions".to_string(),
            origin: e.to_string(),
        })?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS alerts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp INTEGER NOT NULL,
                mmsi TEXT NOT NULL,
                rule_type TEXT NOT NULL,
                severity INTEGER NOT NULL,
                summary TEXT NOT NULL,
                evidence TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'new',
                notes TEXT
            )",
            [],
        )
        .map_err(|e| SentinelError::TableCreation {
            table: "alerts".to_string(),
            origin: e.to_string(),
        })?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS alert_cooldowns (
                mmsi TEXT NOT NULL,
                rule_type TEXT NOT NULL,
                last_alert_timestamp INTEGER NOT NULL,
                PRIMARY KEY (mmsi, rule_type)
            )",
            [],
        )
        .map_err(|e| SentinelError::TableCreation {
            table: "alert_cooldowns".to_string(),
            origin: e.to_string(),
        })?;

        let indices = [
            (
                "idx_vessels_latest_timestamp",
                "CREATE INDEX IF NOT EXISTS idx_vessels_latest_timestamp
                 ON vessels_latest(timestamp)",
            ),
            (
                "idx_vessels_latest_severity",
                "CREATE INDEX IF NOT EXISTS idx_vessels_latest_severity
                 ON vessels_latest(last_alert_severity)",
            ),
            (
                "idx_positions_mmsi_time",
                "CREATE INDEX IF NOT EXISTS idx_positions_mmsi_time
                 ON vessel_positions(mmsi, timestamp)",
            ),
            (
                "idx_positions_time",
                "CREATE INDEX IF NOT EXISTS idx_positions_time
                 ON vessel_positions(timestamp)",
            ),
            (
                "idx_alerts_mmsi",
                "CREATE INDEX IF NOT EXISTS idx_alerts_mmsi ON alerts(mmsi)",
            ),
            (
                "idx_alerts_timestamp",
                "CREATE INDEX IF NOT EXISTS idx_alerts_timestamp ON alerts(timestamp)",
            ),
            (
                "idx_alerts_type",
                "CREATE INDEX IF NOT EXISTS idx_alerts_type ON alerts(rule_type)",
            ),
            (
                "idx_alerts_severity",
                "CREATE INDEX IF NOT EXISTS idx_alerts_severity ON alerts(severity)",
            ),
            (
                "idx_alerts_status",
                "CREATE INDEX IF NOT EXISTS idx_alerts_status ON alerts(status)",
            ),
            (
                "idx_alerts_mmsi_time",
                "CREATE INDEX IF NOT EXISTS idx_alerts_mmsi_time ON alerts(mmsi, timestamp)",
            ),
            (
                "idx_alerts_type_time",
                "CREATE INDEX IF NOT EXISTS idx_alerts_type_time ON alerts(rule_type, timestamp)",
            ),
            (
                "idx_alerts_severity_time",
                "CREATE INDEX IF NOT EXISTS idx_alerts_severity_time
                 ON alerts(severity, timestamp)",
            ),
            (
                "idx_cooldowns_last_alert",
                "CREATE INDEX IF NOT EXISTS idx_cooldowns_last_alert
                 ON alert_cooldowns(last_alert_timestamp)",
            ),
        ];
        for (name, sql) in indices {
            conn.execute(sql, [])
                .map_err(|e| SentinelError::IndexCreation {
                    index: name.to_string(),
                    origin: e.to_string(),
                })?;
        }

        Ok(())
    }

    /// Check if it's time to flush
    fn should_flush(&self) -> bool {
        self.last_flush.elapsed() >= self.config.flush_interval
    }

    /// Calculate next flush time
    fn next_flush_time(&self) -> Instant {
        self.last_flush + self.config.flush_interval
    }

    /// Execute an operation within a transaction
    fn with_transaction<F, T>(&mut self, context: &str, f: F) -> Result<T, SentinelError>
    where
        F: FnOnce(&mut Transaction) -> Result<T, SentinelError>,
    {
        let mut tx = self.connection.transaction().map_err(|e| {
            SentinelError::DatabaseTransaction(TransactionError::Execute {
                context: format!("{}: failed to start transaction", context),
                source: e,
            })
        })?;

        let result = f(&mut tx)?;

        tx.commit().map_err(|e| {
            SentinelError::DatabaseTransaction(TransactionError::Commit {
                context: format!("{}: failed to commit", context),
                source: e,
            })
        })?;

        Ok(result)
    }

    fn ingest_batch(
        &mut self,
        units: &[IngestUnit],
        policy: &IngestPolicy,
    ) -> Result<BatchOutcome, SentinelError> {
        let policy = *policy;
        self.with_transaction("ingest_batch", move |tx| {
            let mut outcome = BatchOutcome::default();
            for unit in units {
                outcome.attempted += 1;
                let mut savepoint = tx.savepoint().map_err(|e| {
                    SentinelError::DatabaseTransaction(TransactionError::Execute {
                        context: "ingest_batch: failed to open savepoint".to_string(),
                        source: e,
                    })
                })?;
                match Self::ingest_unit(&savepoint, unit, &policy) {
                    Ok(mut alerts) => {
                        savepoint.commit().map_err(|e| {
                            SentinelError::DatabaseTransaction(TransactionError::Commit {
                                context: "ingest_batch: failed to release savepoint".to_string(),
                                source: e,
                            })
                        })?;
                        outcome.persisted += 1;
                        outcome.alerts.append(&mut alerts);
                    }
                    Err(e) => {
                        warn!(
                            mmsi = %unit.point.mmsi,
                            timestamp = %unit.point.timestamp,
                            "point not persisted, rolling back unit: {e}"
                        );
                        if let Err(rollback_err) = savepoint.rollback() {
                            error!("savepoint rollback failed: {rollback_err}");
                        }
                        outcome.failed += 1;
                    }
                }
            }
            Ok(outcome)
        })
    }

    /// One atomic unit: latest-state upsert, position append, cooldown-gated
    /// alert inserts, severity high-water update.
    fn ingest_unit(
        conn: &Connection,
        unit: &IngestUnit,
        policy: &IngestPolicy,
    ) -> Result<Vec<AlertRecord>, SentinelError> {
        let point = &unit.point;
        let ts = point.timestamp_ms();
        let mmsi = point.mmsi.as_str();

        let upsert_latest = if policy.update_latest_out_of_order {
            "INSERT INTO vessels_latest (mmsi, timestamp, lat, lon, sog, cog, heading)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(mmsi) DO UPDATE SET
                timestamp = excluded.timestamp, lat = excluded.lat, lon = excluded.lon,
                sog = excluded.sog, cog = excluded.cog, heading = excluded.heading"
        } else {
            // Out-of-order points still append to history below, but the
            // latest state keeps the newest timestamp it has seen.
            "INSERT INTO vessels_latest (mmsi, timestamp, lat, lon, sog, cog, heading)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(mmsi) DO UPDATE SET
                timestamp = excluded.timestamp, lat = excluded.lat, lon = excluded.lon,
                sog = excluded.sog, cog = excluded.cog, heading = excluded.heading
             WHERE excluded.timestamp >= vessels_latest.timestamp"
        };
        conn.execute(
            upsert_latest,
            params![mmsi, ts, point.lat, point.lon, point.sog, point.cog, point.heading],
        )?;

        conn.execute(
            "INSERT INTO vessel_positions (mmsi, timestamp, lat, lon, sog, cog, heading)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![mmsi, ts, point.lat, point.lon, point.sog, point.cog, point.heading],
        )?;

        let mut accepted = Vec::new();
        let mut max_severity: Option<i64> = None;
        for candidate in &unit.candidates {
            let last_ms: Option<i64> = conn
                .query_row(
                    "SELECT last_alert_timestamp FROM alert_cooldowns
                     WHERE mmsi = ?1 AND rule_type = ?2",
                    params![mmsi, candidate.rule.as_str()],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(last_ms) = last_ms {
                if ts - last_ms < policy.cooldown_sec * 1000 {
                    debug!(
                        mmsi,
                        rule = candidate.rule.as_str(),
                        "candidate suppressed by cooldown"
                    );
                    continue;
                }
            }

            conn.execute(
                "INSERT INTO alert_cooldowns (mmsi, rule_type, last_alert_timestamp)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(mmsi, rule_type) DO UPDATE SET
                    last_alert_timestamp = excluded.last_alert_timestamp",
                params![mmsi, candidate.rule.as_str(), ts],
            )?;

            conn.execute(
                "INSERT INTO alerts (timestamp, mmsi, rule_type, severity, summary, evidence, status)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'new')",
                params![
                    ts,
                    mmsi,
                    candidate.rule.as_str(),
                    candidate.severity,
                    candidate.summary,
                    candidate.evidence.to_string()
                ],
            )?;
            let id = conn.last_insert_rowid();
            info!(
                mmsi,
                rule = candidate.rule.as_str(),
                severity = candidate.severity,
                "alert persisted: {}",
                candidate.summary
            );

            max_severity = Some(max_severity.map_or(candidate.severity, |m| m.max(candidate.severity)));
            accepted.push(AlertRecord {
                id,
                timestamp: point.timestamp,
                mmsi: point.mmsi.clone(),
                rule_type: candidate.rule,
                severity: candidate.severity,
                summary: candidate.summary.clone(),
                evidence: candidate.evidence.clone(),
                status: AlertStatus::New,
                notes: None,
            });
        }

        if let Some(severity) = max_severity {
            conn.execute(
                "UPDATE vessels_latest SET last_alert_severity = max(last_alert_severity, ?2)
                 WHERE mmsi = ?1",
                params![mmsi, severity],
            )?;
        }

        Ok(accepted)
    }

    fn latest_vessels(&self, limit: Option<usize>) -> Result<Vec<VesselLatest>, SentinelError> {
        let mut stmt = self.connection.prepare(
            "SELECT mmsi, timestamp, lat, lon, sog, cog, heading, last_alert_severity
             FROM vessels_latest ORDER BY timestamp DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit.map_or(-1, |l| l as i64)], vessel_latest_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn latest_vessel(&self, mmsi: &Mmsi) -> Result<Option<VesselLatest>, SentinelError> {
        Ok(self
            .connection
            .query_row(
                "SELECT mmsi, timestamp, lat, lon, sog, cog, heading, last_alert_severity
                 FROM vessels_latest WHERE mmsi = ?1",
                params![mmsi.as_str()],
                vessel_latest_row,
            )
            .optional()?)
    }

    fn vessel_track(
        &self,
        mmsi: &Mmsi,
        limit: Option<usize>,
    ) -> Result<Vec<VesselPosition>, SentinelError> {
        let mut stmt = self.connection.prepare(
            "SELECT id, mmsi, timestamp, lat, lon, sog, cog, heading
             FROM vessel_positions WHERE mmsi = ?1
             ORDER BY timestamp DESC, id DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(
            params![mmsi.as_str(), limit.map_or(-1, |l| l as i64)],
            vessel_position_row,
        )?;
        let mut positions = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        positions.reverse();
        Ok(positions)
    }

    fn list_alerts(&self, filter: &AlertFilter) -> Result<Vec<AlertRecord>, SentinelError> {
        let mut sql = String::from(
            "SELECT id, timestamp, mmsi, rule_type, severity, summary, evidence, status, notes
             FROM alerts",
        );
        let mut clauses: Vec<&str> = Vec::new();
        let mut values: Vec<Box<dyn ToSql>> = Vec::new();

        if let Some(mmsi) = &filter.mmsi {
            clauses.push("mmsi = ?");
            values.push(Box::new(mmsi.as_str().to_string()));
        }
        if let Some(rule) = filter.rule_type {
            clauses.push("rule_type = ?");
            values.push(Box::new(rule.as_str()));
        }
        if let Some(status) = filter.status {
            clauses.push("status = ?");
            values.push(Box::new(status.as_str()));
        }
        if let Some(min) = filter.min_severity {
            clauses.push("severity >= ?");
            values.push(Box::new(min));
        }
        if let Some(max) = filter.max_severity {
            clauses.push("severity <= ?");
            values.push(Box::new(max));
        }
        if let Some(start) = filter.start {
            clauses.push("timestamp >= ?");
            values.push(Box::new(start.timestamp_millis()));
        }
        if let Some(end) = filter.end {
            clauses.push("timestamp <= ?");
            values.push(Box::new(end.timestamp_millis()));
        }
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY timestamp DESC, id DESC LIMIT ? OFFSET ?");
        values.push(Box::new(filter.limit.map_or(-1i64, |l| l as i64)));
        values.push(Box::new(filter.offset.unwrap_or(0) as i64));

        let mut stmt = self.connection.prepare(&sql)?;
        let refs: Vec<&dyn ToSql> = values.iter().map(|v| v.as_ref()).collect();
        let rows = stmt.query_map(refs.as_slice(), alert_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn get_alert(&self, id: i64) -> Result<AlertRecord, SentinelError> {
        self.connection
            .query_row(
                "SELECT id, timestamp, mmsi, rule_type, severity, summary, evidence, status, notes
                 FROM alerts WHERE id = ?1",
                params![id],
                alert_row,
            )
            .optional()?
            .ok_or(SentinelError::AlertNotFound { id })
    }

    fn update_alert_status(
        &mut self,
        id: i64,
        status: AlertStatus,
        notes: Option<&str>,
    ) -> Result<AlertRecord, SentinelError> {
        let updated = self.connection.execute(
            "UPDATE alerts SET status = ?2, notes = coalesce(?3, notes) WHERE id = ?1",
            params![id, status.as_str(), notes],
        )?;
        if updated == 0 {
            return Err(SentinelError::AlertNotFound { id });
        }
        self.get_alert(id)
    }

    fn alert_stats(
        &self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<AlertStats, SentinelError> {
        let mut clauses: Vec<&str> = Vec::new();
        let mut values: Vec<Box<dyn ToSql>> = Vec::new();
        if let Some(start) = start {
            clauses.push("timestamp >= ?");
            values.push(Box::new(start.timestamp_millis()));
        }
        if let Some(end) = end {
            clauses.push("timestamp <= ?");
            values.push(Box::new(end.timestamp_millis()));
        }
        let where_clause = if clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", clauses.join(" AND "))
        };
        let refs: Vec<&dyn ToSql> = values.iter().map(|v| v.as_ref()).collect();

        let sql = format!(
            "SELECT COUNT(*), COALESCE(AVG(severity), 0.0),
                COALESCE(SUM(CASE WHEN severity >= 70 THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN severity >= 30 AND severity < 70 THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN severity < 30 THEN 1 ELSE 0 END), 0)
             FROM alerts{where_clause}"
        );
        let (total, average_severity, high, medium, low) =
            self.connection
                .query_row(&sql, refs.as_slice(), |row| {
                    Ok((
                        row.get::<_, i64>(0)? as u64,
                        row.get::<_, f64>(1)?,
                        row.get::<_, i64>(2)? as u64,
                        row.get::<_, i64>(3)? as u64,
                        row.get::<_, i64>(4)? as u64,
                    ))
                })?;

        let sql = format!(
            "SELECT rule_type, COUNT(*) FROM alerts{where_clause} GROUP BY rule_type"
        );
        let mut stmt = self.connection.prepare(&sql)?;
        let rows = stmt.query_map(refs.as_slice(), |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
        })?;
        let by_type = rows.collect::<rusqlite::Result<std::collections::BTreeMap<_, _>>>()?;

        Ok(AlertStats {
            total,
            by_type,
            average_severity,
            high,
            medium,
            low,
        })
    }

    fn export_alerts_csv(&self, filter: &AlertFilter) -> Result<String, SentinelError> {
        let alerts = self.list_alerts(filter)?;
        let mut writer = csv::Writer::from_writer(Vec::new());
        writer.write_record([
            "id",
            "timestamp",
            "mmsi",
            "type",
            "severity",
            "status",
            "summary",
            "notes",
            "evidence",
        ])?;
        for alert in &alerts {
            writer.write_record([
                alert.id.to_string(),
                alert.timestamp.to_rfc3339(),
                alert.mmsi.to_string(),
                alert.rule_type.to_string(),
                alert.severity.to_string(),
                alert.status.to_string(),
                alert.summary.clone(),
                alert.notes.clone().unwrap_or_default(),
                alert.evidence.to_string(),
            ])?;
        }
        let bytes = writer
            .into_inner()
            .map_err(|e| SentinelError::Io(e.into_error()))?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn cleanup_cooldowns(
        &mut self,
        max_age: std::time::Duration,
        now: DateTime<Utc>,
    ) -> Result<usize, SentinelError> {
        let cutoff = now.timestamp_millis() - max_age.as_millis() as i64;
        let deleted = self.connection.execute(
            "DELETE FROM alert_cooldowns WHERE last_alert_timestamp < ?1",
            params![cutoff],
        )?;
        if deleted > 0 {
            info!("Cleaned up {deleted} cooldown rows older than {max_age:?}");
        }
        Ok(deleted)
    }

    fn reset_alert_severity(&mut self) -> Result<usize, SentinelError> {
        Ok(self
            .connection
            .execute("UPDATE vessels_latest SET last_alert_severity = 0", [])?)
    }

    /// Explicitly flush database
    fn flush(&mut self) -> Result<(), SentinelError> {
        self.connection
            .pragma_update(None, "wal_checkpoint", "PASSIVE")?;
        self.last_flush = Instant::now();
        Ok(())
    }
}

fn datetime_from_ms(idx: usize, ms: i64) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, ms))
}

fn text_conversion_error(idx: usize, err: SentinelError) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(err))
}

fn vessel_latest_row(row: &rusqlite::Row) -> rusqlite::Result<VesselLatest> {
    Ok(VesselLatest {
        mmsi: Mmsi::try_from(row.get::<_, String>(0)?)
            .map_err(|e| text_conversion_error(0, e))?,
        timestamp: datetime_from_ms(1, row.get(1)?)?,
        lat: row.get(2)?,
        lon: row.get(3)?,
        sog: row.get(4)?,
        cog: row.get(5)?,
        heading: row.get(6)?,
        last_alert_severity: row.get(7)?,
    })
}

fn vessel_position_row(row: &rusqlite::Row) -> rusqlite::Result<VesselPosition> {
    Ok(VesselPosition {
        id: row.get(0)?,
        mmsi: Mmsi::try_from(row.get::<_, String>(1)?)
            .map_err(|e| text_conversion_error(1, e))?,
        timestamp: datetime_from_ms(2, row.get(2)?)?,
        lat: row.get(3)?,
        lon: row.get(4)?,
        sog: row.get(5)?,
        cog: row.get(6)?,
        heading: row.get(7)?,
    })
}

fn alert_row(row: &rusqlite::Row) -> rusqlite::Result<AlertRecord> {
    let rule_type: RuleType = row
        .get::<_, String>(3)?
        .parse()
        .map_err(|e| text_conversion_error(3, e))?;
    let status: AlertStatus = row
        .get::<_, String>(7)?
        .parse()
        .map_err(|e| text_conversion_error(7, e))?;
    let evidence: serde_json::Value = serde_json::from_str(&row.get::<_, String>(6)?)
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(6, rusqlite::types::Type::Text, Box::new(e))
        })?;
    Ok(AlertRecord {
        id: row.get(0)?,
        timestamp: datetime_from_ms(1, row.get(1)?)?,
        mmsi: Mmsi::try_from(row.get::<_, String>(2)?)
            .map_err(|e| text_conversion_error(2, e))?,
        rule_type,
        severity: row.get(4)?,
        summary: row.get(5)?,
        evidence,
        status,
        notes: row.get(8)?,
    })
}

/// Background task that handles periodic flushing
#[allow(dead_code)]
async fn background_flush(shared: Arc<Shared>) {
    while !shared.is_shutdown() {
        if let Some(next_flush) = shared.perform_flush() {
            tokio::select! {
                _ = tokio::time::sleep_until(next_flush) => {}
                _ = shared.background_task.notified() => {}
            }
        } else {
            shared.background_task.notified().await;
        }
    }
    debug!("Background flush task shut down");
}

#[cfg(test)]
impl Db {
    // Test helpers
    fn get_state(&self) -> Result<std::sync::MutexGuard<'_, DatabaseState>, SentinelError> {
        self.shared
            .state
            .lock()
            .map_err(|e| SentinelError::Lock(e.to_string()))
    }
}
