//! Clocks and fixtures for exercising lease behavior without real waiting.

use crate::clock::Clock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Clock advanced explicitly by the test.
#[derive(Debug)]
pub struct ManualClock {
    now_ms: AtomicU64,
}

impl ManualClock {
    pub fn new(start_ms: u64) -> Self {
        Self {
            now_ms: AtomicU64::new(start_ms),
        }
    }

    pub fn set_ms(&self, now_ms: u64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        self.advance_ms(by.as_millis() as u64);
    }

    pub fn advance_ms(&self, by_ms: u64) {
        self.now_ms.fetch_add(by_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

/// Clock that follows the Tokio clock, so `tokio::time::advance` under
/// `start_paused` moves lease time and timer time together.
///
/// Must be created inside a runtime.
#[derive(Debug)]
pub struct SimClock {
    origin_ms: u64,
    started: tokio::time::Instant,
}

impl SimClock {
    pub fn new(origin_ms: u64) -> Self {
        Self {
            origin_ms,
            started: tokio::time::Instant::now(),
        }
    }
}

impl Clock for SimClock {
    fn now_ms(&self) -> u64 {
        self.origin_ms + self.started.elapsed().as_millis() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new(1_000);
        assert_eq!(clock.now_ms(), 1_000);
        clock.advance(Duration::from_secs(5));
        assert_eq!(clock.now_ms(), 6_000);
        clock.set_ms(100);
        assert_eq!(clock.now_ms(), 100);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sim_clock_follows_tokio_time() {
        let clock = SimClock::new(10_000);
        assert_eq!(clock.now_ms(), 10_000);
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(clock.now_ms(), 15_000);
    }
}
