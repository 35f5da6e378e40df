//! Wall-clock helpers shared by the publish loop and the delivery handler.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Nanoseconds since the UNIX epoch; 0 if the system clock is before 1970.
pub fn now_unix_ns() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos().min(i64::MAX as u128) as i64)
        .unwrap_or(0)
}

/// Round-trip time from an embedded send time to the receive time. `None` when
/// the send time lies after the receive time (foreign payload or clock step).
pub fn round_trip(sent_ns: i64, received_ns: i64) -> Option<Duration> {
    let delta = received_ns.checked_sub(sent_ns)?;
    u64::try_from(delta).ok().map(Duration::from_nanos)
}
