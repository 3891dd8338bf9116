//! Record and ordering-key primitives shared by every store.
//!
//! A record is an opaque JSON object; the engine never interprets fields other
//! than `id`, `lat`/`long`, `update_token` and `path`. Records are immutable
//! once written: an amendment is a brand new record with a fresh ordering key.

use std::cmp::Ordering;
use std::hash::{Hash, Hasher};

pub type Record = serde_json::Map<String, serde_json::Value>;

/// Globally unique ordering key for a record.
///
/// Ordered by seconds first, serial second. The serial breaks ties between
/// records created in the same floating-point instant and orders the records
/// of a single submission deterministically.
#[derive(Debug, Clone, Copy)]
pub struct OrderingKey {
    /// Seconds since the Unix epoch.
    pub seconds: f64,
    pub serial: u32,
}

impl OrderingKey {
    pub fn new(seconds: f64, serial: u32) -> Self {
        Self { seconds, serial }
    }
}

impl PartialEq for OrderingKey {
    fn eq(&self, other: &Self) -> bool {
        self.seconds.to_bits() == other.seconds.to_bits() && self.serial == other.serial
    }
}

impl Eq for OrderingKey {}

impl PartialOrd for OrderingKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrderingKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.seconds
            .total_cmp(&other.seconds)
            .then(self.serial.cmp(&other.serial))
    }
}

impl Hash for OrderingKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.seconds.to_bits().hash(state);
        self.serial.hash(state);
    }
}

/// Half-open window membership: `since <= t < now`.
///
/// The strict upper bound means an event written in the same instant as a poll
/// boundary is always attributed to exactly one of two adjacent polls.
pub fn in_window(seconds: f64, since: Option<f64>, now: Option<f64>) -> bool {
    since.map_or(true, |s| s <= seconds) && now.map_or(true, |n| seconds < n)
}

/// File name for a record: `KEY:SECONDS:SERIAL.data`, seconds fixed to six
/// decimal places so the name round-trips through [`parse_data_file_name`].
pub fn data_file_name(key: &str, okey: OrderingKey) -> String {
    format!("{key}:{:.6}:{}.data", okey.seconds, okey.serial)
}

pub fn parse_data_file_name(name: &str) -> Option<(String, OrderingKey)> {
    let stem = name.strip_suffix(".data")?;
    let mut parts = stem.split(':');
    let key = parts.next()?;
    let seconds: f64 = parts.next()?.parse().ok()?;
    let serial: u32 = parts.next()?.parse().ok()?;
    if parts.next().is_some() || key.is_empty() {
        return None;
    }
    Some((key.to_string(), OrderingKey::new(seconds, serial)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_is_seconds_then_serial() {
        let a = OrderingKey::new(10.0, 3);
        let b = OrderingKey::new(10.0, 4);
        let c = OrderingKey::new(10.5, 0);
        assert!(a < b);
        assert!(b < c);
        assert_eq!(a, OrderingKey::new(10.0, 3));
    }

    #[test]
    fn file_name_round_trips() {
        let okey = OrderingKey::new(1000.5, 7);
        let name = data_file_name("DEADBEEF01", okey);
        assert_eq!(name, "DEADBEEF01:1000.500000:7.data");
        let (key, parsed) = parse_data_file_name(&name).expect("parse");
        assert_eq!(key, "DEADBEEF01");
        assert_eq!(parsed, okey);
    }

    #[test]
    fn malformed_file_names_rejected() {
        assert!(parse_data_file_name("nodata").is_none());
        assert!(parse_data_file_name("A:1.0.data").is_none());
        assert!(parse_data_file_name("A:1.0:2:3.data").is_none());
        assert!(parse_data_file_name(":1.0:2.data").is_none());
    }

    #[test]
    fn window_is_half_open() {
        assert!(in_window(5.0, Some(5.0), Some(6.0)));
        assert!(!in_window(6.0, Some(5.0), Some(6.0)));
        assert!(in_window(5.0, None, None));
        assert!(!in_window(4.9, Some(5.0), None));
    }
}
