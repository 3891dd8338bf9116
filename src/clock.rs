//! Injectable clock plus the ISO-8601 edges of the API.
//!
//! Core code works in floating-point seconds since the epoch; ISO strings
//! appear only in request/response bodies and the watermark file.

use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Context};
use chrono::{DateTime, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use parking_lot::Mutex;

pub trait Clock: Send + Sync {
    /// Seconds since the Unix epoch.
    fn now(&self) -> f64;
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> f64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0)
    }
}

/// Settable clock for tests; replaces any global time override.
#[derive(Debug, Default)]
pub struct ManualClock {
    seconds: Mutex<f64>,
}

impl ManualClock {
    pub fn new(seconds: f64) -> Self {
        Self {
            seconds: Mutex::new(seconds),
        }
    }

    pub fn set(&self, seconds: f64) {
        *self.seconds.lock() = seconds;
    }

    pub fn advance(&self, seconds: f64) {
        *self.seconds.lock() += seconds;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> f64 {
        *self.seconds.lock()
    }
}

/// Parse an ISO-8601 timestamp into seconds since the epoch.
///
/// Accepts full RFC 3339 as well as the short `1970-01-01T01:01Z` form older
/// clients send for `since`.
pub fn seconds_from_iso(value: &str) -> anyhow::Result<f64> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        let utc = dt.with_timezone(&Utc);
        return Ok(utc.timestamp() as f64 + f64::from(utc.timestamp_subsec_micros()) / 1e6);
    }
    let short = value.strip_suffix('Z').unwrap_or(value);
    let naive = NaiveDateTime::parse_from_str(short, "%Y-%m-%dT%H:%M")
        .with_context(|| format!("unparseable timestamp {value:?}"))?;
    Ok(naive.and_utc().timestamp() as f64)
}

/// Render seconds since the epoch as RFC 3339 with microsecond precision, so
/// an `until` handed back as the next `since` preserves sub-second boundaries.
pub fn iso_from_seconds(seconds: f64) -> anyhow::Result<String> {
    let micros = (seconds * 1e6).round() as i64;
    let dt = Utc
        .timestamp_micros(micros)
        .single()
        .ok_or_else(|| anyhow!("timestamp {seconds} out of range"))?;
    Ok(dt.to_rfc3339_opts(SecondsFormat::Micros, true))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_iso_form_accepted() {
        assert_eq!(seconds_from_iso("1970-01-01T01:01Z").expect("parse"), 3660.0);
    }

    #[test]
    fn rfc3339_round_trips_with_micros() {
        let seconds = 1000.5;
        let iso = iso_from_seconds(seconds).expect("format");
        let back = seconds_from_iso(&iso).expect("parse");
        assert!((back - seconds).abs() < 1e-6, "{back} != {seconds}");
    }

    #[test]
    fn garbage_rejected() {
        assert!(seconds_from_iso("not-a-time").is_err());
    }

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::new(10.0);
        assert_eq!(clock.now(), 10.0);
        clock.advance(5.0);
        assert_eq!(clock.now(), 15.0);
        clock.set(1.0);
        assert_eq!(clock.now(), 1.0);
    }
}
