//! Wall-clock helpers.
//!
//! Grant expiry is compared in whole unix seconds; delivery stamps keep
//! microsecond precision. Callers pass these values into the engine so
//! tests can fabricate any clock they need.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current unix time in whole seconds.
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Current unix time as fractional seconds with microsecond precision.
pub fn unix_now_micros() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
