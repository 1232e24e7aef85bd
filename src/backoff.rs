// Retry schedule for contended acquisition

use std::time::Duration;

/// Delay to wait before retry number `attempt` (0-based) of a contended
/// acquisition: the base delay doubled per attempt, capped at `max`.
///
/// Pure so the schedule is testable apart from any timer.
pub fn retry_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    // 2^attempt with saturation; past 2^32 the cap dominates anyway.
    let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
    base.saturating_mul(factor).min(max)
}
