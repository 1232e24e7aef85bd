// Per-context identity generation

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

static PROCESS_START: OnceLock<Instant> = OnceLock::new();

/// Identifier distinguishing this execution context from all siblings
/// sharing the same store.
///
/// Composed from a wall-clock sample, a random component, and a monotonic
/// high-resolution sample, so that two contexts starting in the same
/// millisecond still diverge without a central allocator. Generated once per
/// context lifetime and immutable afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContextId(String);

impl ContextId {
    /// Generate a fresh identity from the ambient clocks.
    ///
    /// Never fails: an unavailable clock source degrades to a zero component
    /// (lower uniqueness) instead of erroring.
    pub fn generate() -> Self {
        let wall_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_millis() as u64);
        let entropy: u32 = rand::random();
        let mono_ns = PROCESS_START.get_or_init(Instant::now).elapsed().as_nanos() as u64;

        Self(format!("{wall_ms:x}-{entropy:08x}-{mono_ns:x}"))
    }

    /// Construct an identity from a fixed string. Intended for tests.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
