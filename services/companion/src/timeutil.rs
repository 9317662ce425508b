//! ISO-8601 helpers shared by the store and the cache.
//!
//! All wire and cache timestamps are `YYYY-MM-DDTHH:MM:SS` with an offset;
//! the device DB stores UNIX seconds.

use calibre_wire::UNKNOWN_TIME;
use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};

/// Parse an ISO-8601 timestamp to UNIX seconds.
///
/// Accepts a full RFC 3339 string or a bare `YYYY-MM-DDTHH:MM:SS` prefix
/// (treated as UTC). Returns `None` for anything unparseable.
pub fn parse_iso(value: &str) -> Option<i64> {
    if value.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.timestamp());
    }
    let head = value.get(..19)?;
    NaiveDateTime::parse_from_str(head, "%Y-%m-%dT%H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc().timestamp())
}

/// Format UNIX seconds as an ISO-8601 UTC string with explicit offset.
/// Zero (and anything unrepresentable) maps to the unknown-time sentinel.
pub fn format_iso(secs: i64) -> String {
    if secs == 0 {
        return UNKNOWN_TIME.to_owned();
    }
    match Utc.timestamp_opt(secs, 0).single() {
        Some(dt) => dt.format("%Y-%m-%dT%H:%M:%S+00:00").to_string(),
        None => UNKNOWN_TIME.to_owned(),
    }
}

/// Current time as UNIX seconds.
pub fn now_epoch() -> i64 {
    Utc::now().timestamp()
}

/// Current time as an ISO-8601 UTC string.
pub fn now_iso() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%S+00:00").to_string()
}

/// The last second of the local day containing `secs`.
/// Used for the DB's day-granular "added" column.
pub fn end_of_local_day(secs: i64) -> i64 {
    let Some(dt) = Local.timestamp_opt(secs, 0).single() else {
        return secs;
    };
    let Some(end) = dt.date_naive().and_hms_opt(23, 59, 59) else {
        return secs;
    };
    match Local.from_local_datetime(&end).single() {
        Some(local) => local.timestamp(),
        None => secs,
    }
}
