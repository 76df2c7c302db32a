//! Thin wall-clock helpers. Centralized so every module computing Tor
//! timestamps (certificate expiry, consensus freshness, guard rotation)
//! shares one source of "now" rather than reaching for `SystemTime` ad hoc.

use std::time::{SystemTime, UNIX_EPOCH};

/// Seconds since the Unix epoch.
pub fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is before the Unix epoch")
        .as_secs()
}
