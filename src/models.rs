//! Data models.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::SentinelError;

/// AIS heading value meaning "not available".
pub const HEADING_UNAVAILABLE: f64 = 511.0;

/// Maritime Mobile Service Identity: exactly nine ASCII digits.
///
/// Kept as a string so leading zeros survive the round trip through
/// storage and export.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Mmsi(String);

impl Mmsi {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<&str> for Mmsi {
    type Error = SentinelError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        let trimmed = value.trim();
        if trimmed.len() == 9 && trimmed.bytes().all(|b| b.is_ascii_digit()) {
            Ok(Mmsi(trimmed.to_string()))
        } else {
            Err(SentinelError::InvalidMmsi {
                value: value.to_string(),
            })
        }
    }
}

impl TryFrom<String> for Mmsi {
    type Error = SentinelError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Mmsi::try_from(value.as_str())
    }
}

impl From<Mmsi> for String {
    fn from(mmsi: Mmsi) -> Self {
        mmsi.0
    }
}

impl fmt::Display for Mmsi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A single AIS position report, as decoded from an input file.
///
/// Never persisted as-is; the pipeline derives `VesselLatest`,
/// `VesselPosition` and `AlertRecord` rows from it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AisPoint {
    /// Vessel identifier
    pub mmsi: Mmsi,
    /// Report timestamp (source time, not wall clock)
    pub timestamp: DateTime<Utc>,
    /// Latitude in WGS84 decimal degrees
    pub lat: f64,
    /// Longitude in WGS84 decimal degrees
    pub lon: f64,
    /// Speed over ground in knots
    pub sog: Option<f64>,
    /// Course over ground in degrees [0, 360)
    pub cog: Option<f64>,
    /// Heading in degrees [0, 360), or 511 = not available
    pub heading: Option<f64>,
}

impl AisPoint {
    /// Heading with the AIS "not available" sentinel filtered out.
    pub fn heading_deg(&self) -> Option<f64> {
        self.heading.filter(|h| *h != HEADING_UNAVAILABLE)
    }

    /// Source timestamp as epoch milliseconds.
    pub fn timestamp_ms(&self) -> i64 {
        self.timestamp.timestamp_millis()
    }
}

/// Closed set of detection rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RuleType {
    #[serde(rename = "TELEPORT")]
    Teleport,
    #[serde(rename = "TELEPORT_T2")]
    TeleportT2,
    #[serde(rename = "POSITION_INVALID")]
    PositionInvalid,
    #[serde(rename = "TURN_RATE")]
    TurnRate,
    #[serde(rename = "TURN_RATE_T2")]
    TurnRateT2,
    #[serde(rename = "ACCELERATION")]
    Acceleration,
    #[serde(rename = "HEADING_COG_CONSISTENCY")]
    HeadingCogConsistency,
}

impl RuleType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleType::Teleport => "TELEPORT",
            RuleType::TeleportT2 => "TELEPORT_T2",
            RuleType::PositionInvalid => "POSITION_INVALID",
            RuleType::TurnRate => "TURN_RATE",
            RuleType::TurnRateT2 => "TURN_RATE_T2",
            RuleType::Acceleration => "ACCELERATION",
            RuleType::HeadingCogConsistency => "HEADING_COG_CONSISTENCY",
        }
    }
}

impl FromStr for RuleType {
    type Err = SentinelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "TELEPORT" => Ok(RuleType::Teleport),
            "TELEPORT_T2" => Ok(RuleType::TeleportT2),
            "POSITION_INVALID" => Ok(RuleType::PositionInvalid),
            "TURN_RATE" => Ok(RuleType::TurnRate),
            "TURN_RATE_T2" => Ok(RuleType::TurnRateT2),
            "ACCELERATION" => Ok(RuleType::Acceleration),
            "HEADING_COG_CONSISTENCY" => Ok(RuleType::HeadingCogConsistency),
            other => Err(SentinelError::InvalidRuleType {
                value: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for RuleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Review state of a persisted alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertStatus {
    New,
    Reviewed,
    Resolved,
    FalsePositive,
}

impl AlertStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertStatus::New => "new",
            AlertStatus::Reviewed => "reviewed",
            AlertStatus::Resolved => "resolved",
            AlertStatus::FalsePositive => "false_positive",
        }
    }
}

impl FromStr for AlertStatus {
    type Err = SentinelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(AlertStatus::New),
            "reviewed" => Ok(AlertStatus::Reviewed),
            "resolved" => Ok(AlertStatus::Resolved),
            "false_positive" => Ok(AlertStatus::FalsePositive),
            other => Err(SentinelError::InvalidAlertStatus {
                value: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for AlertStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted alert row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertRecord {
    pub id: i64,
    /// Timestamp of the triggering point, not wall clock
    pub timestamp: DateTime<Utc>,
    pub mmsi: Mmsi,
    pub rule_type: RuleType,
    /// 0-100
    pub severity: i64,
    pub summary: String,
    /// Rule-specific metrics; see the detection module
    pub evidence: serde_json::Value,
    pub status: AlertStatus,
    pub notes: Option<String>,
}

/// Most recent known state of a vessel, one row per MMSI.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VesselLatest {
    pub mmsi: Mmsi,
    pub timestamp: DateTime<Utc>,
    pub lat: f64,
    pub lon: f64,
    pub sog: Option<f64>,
    pub cog: Option<f64>,
    pub heading: Option<f64>,
    /// Highest alert severity seen for this vessel in the current session
    pub last_alert_severity: i64,
}

/// Append-only position history row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VesselPosition {
    pub id: i64,
    pub mmsi: Mmsi,
    pub timestamp: DateTime<Utc>,
    pub lat: f64,
    pub lon: f64,
    pub sog: Option<f64>,
    pub cog: Option<f64>,
    pub heading: Option<f64>,
}

/// Filter for alert queries and exports. All fields optional; `None`
/// means "no constraint".
#[derive(Debug, Clone, Default)]
pub struct AlertFilter {
    pub mmsi: Option<Mmsi>,
    pub rule_type: Option<RuleType>,
    pub status: Option<AlertStatus>,
    pub min_severity: Option<i64>,
    pub max_severity: Option<i64>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

/// Aggregate alert statistics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertStats {
    pub total: u64,
    pub by_type: std::collections::BTreeMap<String, u64>,
    pub average_severity: f64,
    /// severity >= 70
    pub high: u64,
    /// severity in 30..70
    pub medium: u64,
    /// severity < 30
    pub low: u64,
}
