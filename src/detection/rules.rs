//! The seven plausibility and integrity rules.
//!
//! Every rule is a pure function over `(prev, curr)` returning at most one
//! [`Candidate`]. Undefined kinematics (non-positive time delta, missing
//! angle data) make a rule stay silent rather than guess; severities are
//! computed in f64, clamped to the rule's band, and rounded.

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{json, Value};

use crate::config::DetectionConfig;
use crate::features::{angle_diff_deg, distance_m, dt_sec, implied_speed_kn, turn_rate_deg_s};
use crate::models::{AisPoint, RuleType};

use super::Candidate;

fn clamp_severity(value: f64, lo: f64, hi: f64) -> i64 {
    value.clamp(lo, hi).round() as i64
}

fn iso(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Reported speed of the current point, falling back to the speed implied
/// by the pair when SOG is absent.
fn speed_kn(p1: &AisPoint, p2: &AisPoint) -> Option<f64> {
    p2.sog
        .filter(|s| s.is_finite())
        .or_else(|| implied_speed_kn(p1, p2))
}

/// Pick the angle channel for turn computations: heading when both points
/// carry a usable heading (511 counts as missing), else COG, else none.
fn angle_channel(p1: &AisPoint, p2: &AisPoint) -> Option<(f64, f64, &'static str)> {
    if let (Some(h1), Some(h2)) = (p1.heading_deg(), p2.heading_deg()) {
        return Some((h1, h2, "heading"));
    }
    if let (Some(c1), Some(c2)) = (p1.cog, p2.cog) {
        return Some((c1, c2, "cog"));
    }
    None
}

fn pair_evidence(
    p1: &AisPoint,
    p2: &AisPoint,
    dt: f64,
    distance: f64,
    speed: f64,
    tier: &str,
) -> Value {
    json!({
        "dt_sec": dt,
        "distance_m": distance,
        "implied_speed_kn": speed,
        "tier": tier,
        "p1_lat": p1.lat,
        "p1_lon": p1.lon,
        "p1_timestamp": iso(p1.timestamp),
        "p2_lat": p2.lat,
        "p2_lon": p2.lon,
        "p2_timestamp": iso(p2.timestamp),
    })
}

fn turn_evidence(
    p1: &AisPoint,
    p2: &AisPoint,
    dt: f64,
    delta_angle: f64,
    rate: f64,
    speed: f64,
    angle_type: &str,
    tier: &str,
) -> Value {
    json!({
        "dt_sec": dt,
        "delta_angle_deg": delta_angle,
        "turn_rate_deg_s": rate,
        "speed_kn": speed,
        "angle_type": angle_type,
        "tier": tier,
        "p1_lat": p1.lat,
        "p1_lon": p1.lon,
        "p1_timestamp": iso(p1.timestamp),
        "p2_lat": p2.lat,
        "p2_lon": p2.lon,
        "p2_timestamp": iso(p2.timestamp),
    })
}

/// Tier-1 teleport: implied speed past the gap-dependent threshold.
/// Short gaps use the tighter threshold, medium gaps the looser one;
/// gaps beyond the medium window are left to the tier-2 rule.
pub fn teleport(cfg: &DetectionConfig, p1: &AisPoint, p2: &AisPoint) -> Option<Candidate> {
    let dt = dt_sec(p1, p2);
    if dt <= 0.0 {
        return None;
    }
    let (threshold, tier) = if dt <= cfg.teleport_dt_short_max_sec {
        (cfg.teleport_speed_knots_short, "short")
    } else if dt <= cfg.teleport_dt_medium_max_sec {
        (cfg.teleport_speed_knots_medium, "medium")
    } else {
        return None;
    };

    let speed = implied_speed_kn(p1, p2)?;
    if speed < threshold {
        return None;
    }

    Some(Candidate {
        rule: RuleType::Teleport,
        severity: clamp_severity(40.0 + 0.4 * (speed - threshold), 70.0, 100.0),
        summary: format!(
            "Implied speed {speed:.1} kn exceeds {threshold:.0} kn over {dt:.0} s ({tier} gap)"
        ),
        evidence: pair_evidence(p1, p2, dt, distance_m(p1, p2), speed, tier),
    })
}

/// Tier-2 teleport: jumps in the suspicious band below the tier-1
/// threshold, and implausible average speed across long gaps.
pub fn teleport_t2(cfg: &DetectionConfig, p1: &AisPoint, p2: &AisPoint) -> Option<Candidate> {
    let dt = dt_sec(p1, p2);
    if dt <= 0.0 {
        return None;
    }
    let speed = implied_speed_kn(p1, p2)?;
    let distance = distance_m(p1, p2);

    let tier = if dt <= cfg.teleport_dt_medium_max_sec {
        let threshold = if dt <= cfg.teleport_dt_short_max_sec {
            cfg.teleport_speed_knots_short
        } else {
            cfg.teleport_speed_knots_medium
        };
        if speed < cfg.teleport_suspicious_min_knots || speed >= threshold {
            return None;
        }
        if dt <= cfg.teleport_dt_short_max_sec {
            "short"
        } else {
            "medium"
        }
    } else {
        if distance <= cfg.long_gap_speed_m_per_sec * dt {
            return None;
        }
        "long_gap"
    };

    let summary = if tier == "long_gap" {
        format!(
            "Large gap ({:.1} min) covered at implied speed {speed:.1} kn",
            dt / 60.0
        )
    } else {
        format!("Suspicious jump {speed:.1} kn over {dt:.0} s ({tier} gap)")
    };

    Some(Candidate {
        rule: RuleType::TeleportT2,
        severity: clamp_severity(15.0 + 0.3 * speed, 15.0, 60.0),
        summary,
        evidence: pair_evidence(p1, p2, dt, distance, speed, tier),
    })
}

/// Position sanity: out-of-bounds coordinates, the (0, 0) "null island"
/// artifact, and a position frozen in place while the vessel reports way.
/// The first two need no previous point.
pub fn position_invalid(
    cfg: &DetectionConfig,
    prev: Option<&AisPoint>,
    curr: &AisPoint,
) -> Option<Candidate> {
    let evidence = |reason: &str, dt: Option<f64>| {
        json!({
            "lat": curr.lat,
            "lon": curr.lon,
            "sog": curr.sog,
            "dt_sec": dt,
            "reason": reason,
        })
    };

    if !(-90.0..=90.0).contains(&curr.lat) || !(-180.0..=180.0).contains(&curr.lon) {
        return Some(Candidate {
            rule: RuleType::PositionInvalid,
            severity: 75,
            summary: format!("Position out of bounds: lat={}, lon={}", curr.lat, curr.lon),
            evidence: evidence("out_of_bounds", None),
        });
    }

    if curr.lat.abs() < 0.001 && curr.lon.abs() < 0.001 {
        return Some(Candidate {
            rule: RuleType::PositionInvalid,
            severity: 75,
            summary: "Position at or near (0, 0)".to_string(),
            evidence: evidence("null_island", None),
        });
    }

    let prev = prev?;
    let dt = dt_sec(prev, curr);
    let sog = prev.sog.filter(|s| s.is_finite())?;
    if distance_m(prev, curr) < cfg.stuck_max_distance_m
        && sog >= cfg.stuck_min_sog_knots
        && dt >= cfg.stuck_min_dt_sec
    {
        return Some(Candidate {
            rule: RuleType::PositionInvalid,
            severity: 70,
            summary: format!("Position unchanged for {dt:.0} s while SOG={sog:.1} kn"),
            evidence: evidence("stuck", Some(dt)),
        });
    }

    None
}

/// Tier-1 turn rate: implausibly fast course change at speed over a short
/// interval.
pub fn turn_rate(cfg: &DetectionConfig, p1: &AisPoint, p2: &AisPoint) -> Option<Candidate> {
    let dt = dt_sec(p1, p2);
    if dt <= 0.0 || dt > cfg.turn_rate_dt_max_sec {
        return None;
    }
    let (a, b, angle_type) = angle_channel(p1, p2)?;
    let speed = speed_kn(p1, p2)?;
    if speed < cfg.min_speed_for_turn_check_knots {
        return None;
    }
    let rate = turn_rate_deg_s(a, b, dt)?;
    if rate < cfg.max_turn_rate_deg_per_sec {
        return None;
    }

    Some(Candidate {
        rule: RuleType::TurnRate,
        severity: clamp_severity(
            50.0 + 10.0 * (rate - cfg.max_turn_rate_deg_per_sec),
            70.0,
            95.0,
        ),
        summary: format!("Turn rate {rate:.2} deg/s at {speed:.1} kn ({angle_type})"),
        evidence: turn_evidence(
            p1,
            p2,
            dt,
            angle_diff_deg(a, b),
            rate,
            speed,
            angle_type,
            "normal",
        ),
    })
}

/// Tier-2 turn rate: moderate turns below the tier-1 threshold, allowed
/// down to a lower speed floor. Consulted only when tier 1 stayed silent.
pub fn turn_rate_t2(cfg: &DetectionConfig, p1: &AisPoint, p2: &AisPoint) -> Option<Candidate> {
    let dt = dt_sec(p1, p2);
    if dt <= 0.0 || dt > cfg.turn_rate_dt_max_sec {
        return None;
    }
    let (a, b, angle_type) = angle_channel(p1, p2)?;
    let speed = speed_kn(p1, p2)?;
    if speed < cfg.min_speed_for_turn_check_low_knots {
        return None;
    }
    let rate = turn_rate_deg_s(a, b, dt)?;
    if rate < cfg.turn_rate_suspicious_min_deg_per_sec {
        return None;
    }

    let tier = if speed < cfg.min_speed_for_turn_check_knots {
        "low_speed"
    } else {
        "normal"
    };

    Some(Candidate {
        rule: RuleType::TurnRateT2,
        severity: clamp_severity(25.0 + 10.0 * rate, 25.0, 55.0),
        summary: format!("Moderate turn {rate:.2} deg/s at {speed:.1} kn ({angle_type})"),
        evidence: turn_evidence(
            p1,
            p2,
            dt,
            angle_diff_deg(a, b),
            rate,
            speed,
            angle_type,
            tier,
        ),
    })
}

/// Reported speed against implied speed, and raw SOG-to-SOG acceleration.
pub fn acceleration(cfg: &DetectionConfig, p1: &AisPoint, p2: &AisPoint) -> Option<Candidate> {
    let dt = dt_sec(p1, p2);
    if dt <= cfg.accel_dt_min_sec || dt > cfg.accel_dt_max_sec {
        return None;
    }
    let sog1 = p1.sog.filter(|s| s.is_finite())?;
    let sog2 = p2.sog.filter(|s| s.is_finite())?;
    let implied = implied_speed_kn(p1, p2)?;

    let difference = (sog2 - implied).abs();
    let accel = (sog2 - sog1).abs() / dt;
    let mismatch = difference >= cfg.sog_implied_diff_threshold_knots;
    if !mismatch && accel < cfg.max_accel_knots_per_sec {
        return None;
    }

    let summary = if mismatch {
        format!("SOG mismatch: reported {sog2:.1} kn vs implied {implied:.1} kn")
    } else {
        format!("Speed change {accel:.2} kn/s exceeds plausible acceleration")
    };

    Some(Candidate {
        rule: RuleType::Acceleration,
        severity: clamp_severity(20.0 + difference, 25.0, 85.0),
        summary,
        evidence: json!({
            "difference_kn": difference,
            "implied_speed_kn": implied,
            "sog_reported": sog2,
            "accel_knots_per_sec": accel,
        }),
    })
}

/// Heading and COG pointing in very different directions at speed, while
/// the vessel is also swinging fast. Both channels must be present on the
/// current point.
pub fn heading_cog_consistency(
    cfg: &DetectionConfig,
    p1: &AisPoint,
    p2: &AisPoint,
) -> Option<Candidate> {
    let heading = p2.heading_deg()?;
    let cog = p2.cog.filter(|c| c.is_finite())?;
    let dt = dt_sec(p1, p2);
    if dt <= 0.0 {
        return None;
    }
    let speed = speed_kn(p1, p2)?;
    if speed < cfg.heading_cog_min_speed_knots {
        return None;
    }

    let mismatch = angle_diff_deg(heading, cog).abs();
    if mismatch < cfg.heading_cog_mismatch_min_deg {
        return None;
    }

    let (a, b, angle_type) = angle_channel(p1, p2)?;
    let rate = turn_rate_deg_s(a, b, dt)?;
    if rate < cfg.heading_cog_min_turn_rate_deg_per_sec {
        return None;
    }

    Some(Candidate {
        rule: RuleType::HeadingCogConsistency,
        severity: clamp_severity(60.0 + 0.2 * mismatch, 70.0, 85.0),
        summary: format!("Heading/COG diverge by {mismatch:.0} deg at {speed:.1} kn ({angle_type})"),
        evidence: json!({
            "dt_sec": dt,
            "angle_change_deg": mismatch,
            "turn_rate_deg_s": rate,
            "speed_kn": speed,
            "angle_type": angle_type,
        }),
    })
}
