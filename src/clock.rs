//! Expiry clock helpers
//!
//! All expiries stored by the cache are UTC timestamps with whole-second
//! precision; sub-second digits are dropped rather than rounded.

use chrono::{DateTime, Utc};

/// Current UTC time, floored to the second.
pub fn now() -> DateTime<Utc> {
    floor_to_second(Utc::now())
}

/// Drop sub-second precision from a timestamp.
pub fn floor_to_second(timestamp: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp(timestamp.timestamp(), 0).unwrap_or(timestamp)
}
