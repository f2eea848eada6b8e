//! Timestamp utilities
//!
//! Every timestamp on the relay wire is integer milliseconds since the Unix epoch.

use chrono::Utc;

/// Current wall-clock time in epoch milliseconds
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}
