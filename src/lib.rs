#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! Cross-context lease lock over a shared key-value store.
//!
//! Several execution contexts (browser tabs of the same session) share one
//! persistent key-value store and need to agree on which single context may
//! submit game actions. The store offers no locking primitive, no
//! compare-and-swap, and no delivery guarantees, so the lock is built as a
//! time-bounded lease: a single record `{owner, acquired_at, expires_at}`
//! under a well-known key, renewed by a heartbeat while the holder is alive
//! and reclaimable by anyone once it expires. A context that dies without
//! cleanup simply stops renewing, and its lease lapses after the timeout.
//!
//! The acquisition path is read-then-write with no atomicity between the
//! two: when several contexts observe an expired or absent lease at the same
//! time, the last write wins and both may briefly believe they hold it. This
//! is a documented property of the design, not a bug to paper over; see
//! [`LeaseLock::acquire`].

pub mod backoff;
pub mod clock;
pub mod error;
pub mod guard;
pub mod identity;
pub mod lock;
pub mod record;
pub mod store;

pub mod test_utils;

pub use clock::{Clock, SystemClock};
pub use error::{Error, Result};
pub use guard::{ActionBackend, ActionGuard, GuardedBackend, HoldPolicy};
pub use identity::ContextId;
pub use lock::{LeaseLock, LockConfig, LockState, LockStats, LockStatus, DEFAULT_LEASE_KEY};
pub use record::LeaseRecord;
pub use store::{LeaseChange, LeaseStore, MemoryLeaseStore, RecordHandle};
