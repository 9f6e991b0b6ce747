//! Timestamp utilities

use chrono::{DateTime, Local, Utc};

/// Get current UTC timestamp
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Local-time stamp used in directory names (`YYYY-MM-DD-HH-MM-SS`)
///
/// Zero-padded fields so that lexical order equals chronological order.
pub fn directory_stamp(at: DateTime<Local>) -> String {
    at.format("%Y-%m-%d-%H-%M-%S").to_string()
}
