// Shared store access: the raw key-value trait plus the typed record handle

use crate::error::{Error, Result};
use crate::identity::ContextId;
use crate::record::LeaseRecord;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::warn;

/// Capacity of the change-event channel. A lagging subscriber drops old
/// events and resynchronizes from the store on its next read, so a small
/// buffer suffices.
const CHANGE_CHANNEL_CAPACITY: usize = 16;

/// A mutation observed on the shared store, carrying the raw old and new
/// values of the affected key. `None` means the key was absent on that side
/// of the mutation.
#[derive(Debug, Clone)]
pub struct LeaseChange {
    pub key: String,
    pub old: Option<String>,
    pub new: Option<String>,
}

/// Shared persistent key-value store, as seen by the lock.
///
/// The store guarantees only that a write is eventually visible to sibling
/// contexts' reads and eventually surfaces on their change subscriptions.
/// No atomicity is provided between a `read` and a subsequent `write`; the
/// lock layers its lease semantics on top of that weakness rather than
/// assuming it away.
#[async_trait]
pub trait LeaseStore: Send + Sync + fmt::Debug {
    async fn read(&self, key: &str) -> Result<Option<String>>;
    async fn write(&self, key: &str, value: &str) -> Result<()>;
    async fn clear(&self, key: &str) -> Result<()>;

    /// Subscribe to mutation events for all keys in this store. Events are
    /// advisory: delivery may lag or drop, and correctness never depends on
    /// them.
    fn subscribe(&self) -> broadcast::Receiver<LeaseChange>;
}

/// In-memory [`LeaseStore`] with broadcast change events.
///
/// Reference implementation for tests and in-process use; a browser-storage
/// binding implements the same trait outside this crate. `fail_writes`
/// simulates quota exhaustion for failure-path tests.
#[derive(Debug)]
pub struct MemoryLeaseStore {
    data: Mutex<HashMap<String, String>>,
    changes: broadcast::Sender<LeaseChange>,
    fail_writes: AtomicBool,
}

impl MemoryLeaseStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            data: Mutex::new(HashMap::new()),
            changes,
            fail_writes: AtomicBool::new(false),
        }
    }

    /// Make every subsequent `write` fail, simulating an exhausted quota.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn publish(&self, key: &str, old: Option<String>, new: Option<String>) {
        // No subscribers is fine; errors here only mean nobody is listening.
        let _ = self.changes.send(LeaseChange {
            key: key.to_owned(),
            old,
            new,
        });
    }
}

impl Default for MemoryLeaseStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LeaseStore for MemoryLeaseStore {
    async fn read(&self, key: &str) -> Result<Option<String>> {
        Ok(self.data.lock().get(key).cloned())
    }

    async fn write(&self, key: &str, value: &str) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::Storage("write quota exceeded".to_owned()));
        }
        let old = self.data.lock().insert(key.to_owned(), value.to_owned());
        self.publish(key, old, Some(value.to_owned()));
        Ok(())
    }

    async fn clear(&self, key: &str) -> Result<()> {
        let old = self.data.lock().remove(key);
        if old.is_some() {
            self.publish(key, old, None);
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<LeaseChange> {
        self.changes.subscribe()
    }
}

/// Typed accessor for the single lease record under one well-known key.
///
/// Owns the serialization boundary: corrupt stored values are discarded as
/// if the key were absent (logged, never fatal), and a failed write is
/// reported to the caller as "acquisition did not happen".
#[derive(Debug, Clone)]
pub struct RecordHandle {
    store: Arc<dyn LeaseStore>,
    key: String,
    lease_timeout: Duration,
}

impl RecordHandle {
    pub fn new(store: Arc<dyn LeaseStore>, key: impl Into<String>, lease_timeout: Duration) -> Self {
        Self {
            store,
            key: key.into(),
            lease_timeout,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Read and deserialize the current record. A value that fails to parse
    /// is treated as absent so a corrupted store self-heals on the next
    /// write.
    pub async fn read(&self) -> Result<Option<LeaseRecord>> {
        match self.store.read(&self.key).await? {
            None => Ok(None),
            Some(raw) => match serde_json::from_str(&raw) {
                Ok(record) => Ok(Some(record)),
                Err(err) => {
                    warn!(key = %self.key, %err, "discarding corrupt lease record");
                    Ok(None)
                }
            },
        }
    }

    /// Write a fresh record for `owner`, stamping `acquired_at = now` and
    /// `expires_at = now + lease_timeout`.
    pub async fn write(&self, owner: &ContextId, now_ms: u64) -> Result<LeaseRecord> {
        let record = LeaseRecord::new(owner.clone(), now_ms, self.lease_timeout);
        let raw = serde_json::to_string(&record)?;
        self.store.write(&self.key, &raw).await?;
        Ok(record)
    }

    pub async fn clear(&self) -> Result<()> {
        self.store.clear(&self.key).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LeaseChange> {
        self.store.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(store: &Arc<MemoryLeaseStore>) -> RecordHandle {
        let store: Arc<dyn LeaseStore> = Arc::clone(store) as _;
        RecordHandle::new(store, "lease", Duration::from_secs(35))
    }

    #[tokio::test]
    async fn test_read_absent() {
        let store = Arc::new(MemoryLeaseStore::new());
        assert_eq!(handle(&store).read().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let store = Arc::new(MemoryLeaseStore::new());
        let handle = handle(&store);
        let owner = ContextId::from_raw("ctx-a");
        let written = handle
            .write(&owner, 1_000)
            .await
            .unwrap();
        assert_eq!(written.expires_at_ms, 36_000);
        assert_eq!(handle.read().await.unwrap(), Some(written));
    }

    #[tokio::test]
    async fn test_corrupt_value_reads_as_absent() {
        let store = Arc::new(MemoryLeaseStore::new());
        store.write("lease", "{not json").await.unwrap();
        assert_eq!(handle(&store).read().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_failed_write_is_reported() {
        let store = Arc::new(MemoryLeaseStore::new());
        store.set_fail_writes(true);
        let err = handle(&store)
            .write(&ContextId::from_raw("ctx-a"), 0)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Storage(_)));
    }

    #[tokio::test]
    async fn test_clear_is_idempotent() {
        let store = Arc::new(MemoryLeaseStore::new());
        let handle = handle(&store);
        handle.clear().await.unwrap();
        handle
            .write(&ContextId::from_raw("ctx-a"), 0)
            .await
            .unwrap();
        handle.clear().await.unwrap();
        handle.clear().await.unwrap();
        assert_eq!(handle.read().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_mutations_publish_old_and_new() {
        let store = Arc::new(MemoryLeaseStore::new());
        let mut rx = store.subscribe();

        store.write("lease", "v1").await.unwrap();
        store.write("lease", "v2").await.unwrap();
        store.clear("lease").await.unwrap();

        let first = rx.recv().await.unwrap();
        assert_eq!((first.old.as_deref(), first.new.as_deref()), (None, Some("v1")));
        let second = rx.recv().await.unwrap();
        assert_eq!(
            (second.old.as_deref(), second.new.as_deref()),
            (Some("v1"), Some("v2"))
        );
        let third = rx.recv().await.unwrap();
        assert_eq!((third.old.as_deref(), third.new.as_deref()), (Some("v2"), None));
    }
}
