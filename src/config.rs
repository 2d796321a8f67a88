//! Application configuration

use std::path::PathBuf;
use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use serde_with::serde_as;
use tracing::warn;

use crate::errors::SentinelError;

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub detection: DetectionConfig,
    pub ingest: IngestConfig,
}

#[serde_as]
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: PathBuf,
    #[serde_as(as = "serde_with::DurationSeconds<u64>")]
    pub flush_interval: Duration,
    /// Cooldown rows older than this are dropped by the cleanup job.
    #[serde_as(as = "serde_with::DurationSeconds<u64>")]
    pub cooldown_retention: Duration,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("ais-sentinel.db"),
            flush_interval: Duration::from_secs(10),
            cooldown_retention: Duration::from_secs(24 * 3600),
        }
    }
}

/// Detection rule thresholds. All values are operator-configurable and
/// validated on startup; an invalid value refuses to start.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DetectionConfig {
    /// Tier-1 teleport speed threshold for gaps up to `teleport_dt_short_max_sec`
    pub teleport_speed_knots_short: f64,
    /// Tier-1 teleport speed threshold for gaps up to `teleport_dt_medium_max_sec`
    pub teleport_speed_knots_medium: f64,
    pub teleport_dt_short_max_sec: f64,
    pub teleport_dt_medium_max_sec: f64,
    /// Lower edge of the tier-2 suspicious-speed band
    pub teleport_suspicious_min_knots: f64,
    /// Tier-2 long-gap limit: ground speed in m/s above which a gap longer
    /// than `teleport_dt_medium_max_sec` is still suspicious
    pub long_gap_speed_m_per_sec: f64,

    pub max_turn_rate_deg_per_sec: f64,
    pub turn_rate_dt_max_sec: f64,
    pub min_speed_for_turn_check_knots: f64,
    /// Tier-2 turn-rate band floor
    pub turn_rate_suspicious_min_deg_per_sec: f64,
    /// Minimum speed for the tier-2 turn check
    pub min_speed_for_turn_check_low_knots: f64,

    pub accel_dt_min_sec: f64,
    pub accel_dt_max_sec: f64,
    /// Reported-vs-implied speed mismatch that triggers ACCELERATION
    pub sog_implied_diff_threshold_knots: f64,
    pub max_accel_knots_per_sec: f64,

    pub heading_cog_mismatch_min_deg: f64,
    pub heading_cog_min_turn_rate_deg_per_sec: f64,
    pub heading_cog_min_speed_knots: f64,

    pub stuck_max_distance_m: f64,
    pub stuck_min_dt_sec: f64,
    pub stuck_min_sog_knots: f64,

    /// Minimum source-time separation between two alerts of the same kind
    /// for the same vessel, in seconds
    pub alert_cooldown_sec: i64,
    /// Points retained per vessel in the track window
    pub track_window_size: usize,
    /// When a point's timestamp precedes the stored latest state, still
    /// overwrite the latest state (positions are appended either way)
    pub update_latest_out_of_order: bool,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            teleport_speed_knots_short: 60.0,
            teleport_speed_knots_medium: 100.0,
            teleport_dt_short_max_sec: 120.0,
            teleport_dt_medium_max_sec: 1800.0,
            teleport_suspicious_min_knots: 25.0,
            long_gap_speed_m_per_sec: 20.0,
            max_turn_rate_deg_per_sec: 3.0,
            turn_rate_dt_max_sec: 120.0,
            min_speed_for_turn_check_knots: 10.0,
            turn_rate_suspicious_min_deg_per_sec: 1.0,
            min_speed_for_turn_check_low_knots: 5.0,
            accel_dt_min_sec: 1.0,
            accel_dt_max_sec: 300.0,
            sog_implied_diff_threshold_knots: 15.0,
            max_accel_knots_per_sec: 1.0,
            heading_cog_mismatch_min_deg: 90.0,
            heading_cog_min_turn_rate_deg_per_sec: 2.0,
            heading_cog_min_speed_knots: 10.0,
            stuck_max_distance_m: 1.0,
            stuck_min_dt_sec: 60.0,
            stuck_min_sog_knots: 1.0,
            alert_cooldown_sec: 300,
            track_window_size: 5,
            update_latest_out_of_order: false,
        }
    }
}

/// File ingestion and replay pacing parameters.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct IngestConfig {
    /// Units committed per transaction when batching is enabled
    pub default_batch_size: usize,
    /// Files larger than this are read in streaming mode
    pub streaming_threshold_mb: f64,
    /// Rows decoded per chunk in streaming mode
    pub chunk_size: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            default_batch_size: 100,
            streaming_threshold_mb: 50.0,
            chunk_size: 10_000,
        }
    }
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(Environment::with_prefix("AISSENTINEL").separator("__"))
            .build()?;

        config.try_deserialize()
    }

    pub fn validate(&self) -> Result<(), SentinelError> {
        self.database.validate()?;
        self.detection.validate()?;
        self.ingest.validate()
    }
}

impl DatabaseConfig {
    /// Validate configuration parameters
    pub fn validate(&self) -> Result<(), SentinelError> {
        if self.path.to_str().unwrap_or("").is_empty() {
            return Err(SentinelError::config("Database path cannot be empty"));
        }

        if self.flush_interval.is_zero() {
            return Err(SentinelError::config(
                "Flush interval must be greater than zero",
            ));
        }

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.is_dir() {
                warn!(
                    "Database path parent directory does not exist: {}",
                    parent.display()
                );
            }
        }

        Ok(())
    }
}

impl DetectionConfig {
    pub fn validate(&self) -> Result<(), SentinelError> {
        let thresholds = [
            ("teleport_speed_knots_short", self.teleport_speed_knots_short),
            (
                "teleport_speed_knots_medium",
                self.teleport_speed_knots_medium,
            ),
            ("teleport_dt_short_max_sec", self.teleport_dt_short_max_sec),
            (
                "teleport_dt_medium_max_sec",
                self.teleport_dt_medium_max_sec,
            ),
            (
                "teleport_suspicious_min_knots",
                self.teleport_suspicious_min_knots,
            ),
            ("long_gap_speed_m_per_sec", self.long_gap_speed_m_per_sec),
            ("max_turn_rate_deg_per_sec", self.max_turn_rate_deg_per_sec),
            ("turn_rate_dt_max_sec", self.turn_rate_dt_max_sec),
            (
                "min_speed_for_turn_check_knots",
                self.min_speed_for_turn_check_knots,
            ),
            (
                "turn_rate_suspicious_min_deg_per_sec",
                self.turn_rate_suspicious_min_deg_per_sec,
            ),
            (
                "min_speed_for_turn_check_low_knots",
                self.min_speed_for_turn_check_low_knots,
            ),
            ("accel_dt_min_sec", self.accel_dt_min_sec),
            ("accel_dt_max_sec", self.accel_dt_max_sec),
            (
                "sog_implied_diff_threshold_knots",
                self.sog_implied_diff_threshold_knots,
            ),
            ("max_accel_knots_per_sec", self.max_accel_knots_per_sec),
            (
                "heading_cog_mismatch_min_deg",
                self.heading_cog_mismatch_min_deg,
            ),
            (
                "heading_cog_min_turn_rate_deg_per_sec",
                self.heading_cog_min_turn_rate_deg_per_sec,
            ),
            (
                "heading_cog_min_speed_knots",
                self.heading_cog_min_speed_knots,
            ),
            ("stuck_max_distance_m", self.stuck_max_distance_m),
            ("stuck_min_dt_sec", self.stuck_min_dt_sec),
            ("stuck_min_sog_knots", self.stuck_min_sog_knots),
        ];
        for (name, value) in thresholds {
            if !value.is_finite() || value < 0.0 {
                return Err(SentinelError::config(format!(
                    "{name} must be finite and non-negative, got {value}"
                )));
            }
        }

        if self.teleport_speed_knots_medium < self.teleport_speed_knots_short {
            return Err(SentinelError::config(
                "teleport_speed_knots_medium must be >= teleport_speed_knots_short",
            ));
        }
        if self.teleport_dt_medium_max_sec <= self.teleport_dt_short_max_sec {
            return Err(SentinelError::config(
                "teleport_dt_medium_max_sec must exceed teleport_dt_short_max_sec",
            ));
        }
        if self.alert_cooldown_sec < 0 {
            return Err(SentinelError::config(
                "alert_cooldown_sec must be non-negative",
            ));
        }
        if self.track_window_size < 2 {
            return Err(SentinelError::config(
                "track_window_size must be at least 2",
            ));
        }
        Ok(())
    }
}

impl IngestConfig {
    pub fn validate(&self) -> Result<(), SentinelError> {
        if !(1..=10_000).contains(&self.default_batch_size) {
            return Err(SentinelError::config(
                "default_batch_size must be in 1..=10000",
            ));
        }
        if self.chunk_size == 0 {
            return Err(SentinelError::config("chunk_size must be at least 1"));
        }
        if !self.streaming_threshold_mb.is_finite() || self.streaming_threshold_mb < 0.0 {
            return Err(SentinelError::config(
                "streaming_threshold_mb must be finite and non-negative",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        AppConfig::default().validate().unwrap();
    }

    #[test]
    fn rejects_negative_threshold() {
        let mut cfg = DetectionConfig::default();
        cfg.max_turn_rate_deg_per_sec = -1.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_non_finite_threshold() {
        let mut cfg = DetectionConfig::default();
        cfg.teleport_speed_knots_short = f64::NAN;
        assert!(cfg.validate().is_err());

        cfg = DetectionConfig::default();
        cfg.teleport_speed_knots_medium = f64::INFINITY;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_inverted_teleport_tiers() {
        let mut cfg = DetectionConfig::default();
        cfg.teleport_speed_knots_medium = 10.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_tiny_track_window() {
        let mut cfg = DetectionConfig::default();
        cfg.track_window_size = 1;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_batch_size_out_of_range() {
        let mut cfg = IngestConfig::default();
        cfg.default_batch_size = 0;
        assert!(cfg.validate().is_err());
        cfg.default_batch_size = 10_001;
        assert!(cfg.validate().is_err());
    }
}
