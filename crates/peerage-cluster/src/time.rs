//! Wall-clock timestamps for committed peer metadata.
//!
//! Heartbeat and join times travel through consensus and are compared on
//! other peers, so they use unix milliseconds rather than `Instant`.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Returns the current wall-clock time in milliseconds since the unix epoch.
///
/// A clock set before 1970 reads as zero.
#[inline]
pub fn unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Returns how long ago `at_ms` was, relative to `now_ms`.
///
/// Timestamps from the future (clock skew between peers) count as zero.
#[inline]
pub fn age(at_ms: u64, now_ms: u64) -> Duration {
    Duration::from_millis(now_ms.saturating_sub(at_ms))
}
