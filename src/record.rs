// The persisted lease record

use crate::identity::ContextId;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// The sole persisted entity: one lease record under a well-known key.
///
/// `expires_at_ms` is always `acquired_at_ms + lease_timeout` at write time.
/// While `expires_at_ms > now` the `owner` is the context entitled to run the
/// protected operation; once it is `<= now` (or the key is absent) any
/// context may overwrite the record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRecord {
    pub owner: ContextId,
    pub acquired_at_ms: u64,
    pub expires_at_ms: u64,
}

impl LeaseRecord {
    pub fn new(owner: ContextId, now_ms: u64, lease_timeout: Duration) -> Self {
        let timeout_ms = lease_timeout.as_millis() as u64;
        Self {
            owner,
            acquired_at_ms: now_ms,
            expires_at_ms: now_ms + timeout_ms,
        }
    }

    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.expires_at_ms <= now_ms
    }

    pub fn owned_by(&self, id: &ContextId) -> bool {
        self.owner == *id
    }

    /// Time left before expiry, `None` once expired.
    pub fn remaining(&self, now_ms: u64) -> Option<Duration> {
        if self.is_expired(now_ms) {
            None
        } else {
            Some(Duration::from_millis(self.expires_at_ms - now_ms))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(now_ms: u64) -> LeaseRecord {
        LeaseRecord::new(ContextId::from_raw("ctx-a"), now_ms, Duration::from_secs(35))
    }

    #[test]
    fn test_expiry_boundary() {
        let rec = record(1_000);
        assert_eq!(rec.expires_at_ms, 36_000);
        assert!(!rec.is_expired(35_999));
        assert!(rec.is_expired(36_000));
        assert!(rec.is_expired(36_001));
    }

    #[test]
    fn test_remaining() {
        let rec = record(0);
        assert_eq!(rec.remaining(5_000), Some(Duration::from_millis(30_000)));
        assert_eq!(rec.remaining(35_000), None);
    }

    #[test]
    fn test_ownership() {
        let rec = record(0);
        assert!(rec.owned_by(&ContextId::from_raw("ctx-a")));
        assert!(!rec.owned_by(&ContextId::from_raw("ctx-b")));
    }

    #[test]
    fn test_json_shape() {
        let rec = record(1_000);
        let json = serde_json::to_string(&rec).unwrap();
        let back: LeaseRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, rec);
        assert!(json.contains("\"owner\""));
        assert!(json.contains("\"expires_at_ms\""));
    }
}
