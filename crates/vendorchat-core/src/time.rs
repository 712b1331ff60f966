use std::time::{SystemTime, UNIX_EPOCH};

/// Wall clock in epoch milliseconds, the unit of every message timestamp.
/// A clock set before the epoch reads as zero.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or_default()
}
