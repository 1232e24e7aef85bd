use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Millisecond wall-clock source.
///
/// Lease expiry is pure arithmetic over `now_ms()`, so injecting the clock
/// makes every expiry decision testable without sleeping. Production code
/// uses [`SystemClock`]; tests drive a manual clock from
/// [`crate::test_utils`].
pub trait Clock: Send + Sync + fmt::Debug {
    /// Current time as milliseconds since the Unix epoch.
    fn now_ms(&self) -> u64;
}

/// Wall clock backed by [`SystemTime`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        // A clock before the epoch degrades to 0 rather than erroring.
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_millis() as u64)
    }
}
