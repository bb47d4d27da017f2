pub mod sync_contracts;

use chrono::{DateTime, TimeZone, Utc};

/// Milliseconds since the Unix epoch, the unit every queue timestamp is stored in.
pub fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

pub fn from_millis(value: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(value)
        .single()
        .unwrap_or_default()
}
