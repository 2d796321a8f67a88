//! Pure kinematic derivations over pairs of position reports.
//!
//! Every function here is total and side-effect-free; where a quantity is
//! undefined (non-positive time delta) the function returns `None` instead
//! of letting NaN or infinity escape into severities or storage.

use crate::models::AisPoint;

/// WGS-84 mean Earth radius in meters.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Meters-per-second to knots.
pub const MPS_TO_KNOTS: f64 = 1.943_844_5;

/// Seconds from `p` to `q` in source time. Negative when out of order.
pub fn dt_sec(p: &AisPoint, q: &AisPoint) -> f64 {
    (q.timestamp_ms() - p.timestamp_ms()) as f64 / 1000.0
}

/// Great-circle distance between two points in meters (haversine).
pub fn distance_m(p: &AisPoint, q: &AisPoint) -> f64 {
    haversine_m(p.lat, p.lon, q.lat, q.lon)
}

pub fn haversine_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let phi1 = lat1.to_radians();
    let phi2 = lat2.to_radians();
    let dphi = (lat2 - lat1).to_radians();
    let dlambda = (lon2 - lon1).to_radians();
    let a = (dphi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (dlambda / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * a.sqrt().min(1.0).asin()
}

/// Speed implied by the distance between `p` and `q` over their time delta,
/// in knots. Undefined for non-positive deltas.
pub fn implied_speed_kn(p: &AisPoint, q: &AisPoint) -> Option<f64> {
    let dt = dt_sec(p, q);
    if dt <= 0.0 {
        return None;
    }
    let speed = distance_m(p, q) / dt * MPS_TO_KNOTS;
    speed.is_finite().then_some(speed)
}

/// Smallest signed angular difference from `a` to `b`, in [-180, 180].
pub fn angle_diff_deg(a: f64, b: f64) -> f64 {
    let mut d = (b - a) % 360.0;
    if d > 180.0 {
        d -= 360.0;
    } else if d < -180.0 {
        d += 360.0;
    }
    d
}

/// Absolute angular rate between two bearings over `dt` seconds, in
/// degrees per second. Undefined for non-positive deltas.
pub fn turn_rate_deg_s(a: f64, b: f64, dt: f64) -> Option<f64> {
    if dt <= 0.0 {
        return None;
    }
    let rate = angle_diff_deg(a, b).abs() / dt;
    rate.is_finite().then_some(rate)
}
