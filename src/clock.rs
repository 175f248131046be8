//! Wall-clock helpers

use chrono::Utc;

/// Current unix time in milliseconds
pub fn now_ms() -> u64 {
    Utc::now().timestamp_millis() as u64
}
