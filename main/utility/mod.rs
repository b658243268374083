pub mod sock;
pub mod waker;

use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time in whole unix seconds, as used by the status
/// dump and the data-plane activity timestamps.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
