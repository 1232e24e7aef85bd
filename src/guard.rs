// Guarded-operation wrapper and backend decoration

use crate::error::{Error, Result};
use crate::lock::{LeaseLock, LockState};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// What to do with the lease after a guarded operation succeeds.
///
/// `Retain` is the default: the acquisition cost is paid once and amortized
/// over every later call from this long-lived context, at the price of
/// holding the lease between calls. `Release` gives strict per-call
/// exclusion back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HoldPolicy {
    #[default]
    Retain,
    Release,
}

/// Runs operations only while this context holds the lease, acquiring it on
/// demand.
#[derive(Debug, Clone)]
pub struct ActionGuard {
    lock: Arc<LeaseLock>,
    policy: HoldPolicy,
}

impl ActionGuard {
    pub fn new(lock: Arc<LeaseLock>) -> Self {
        Self::with_policy(lock, HoldPolicy::default())
    }

    pub fn with_policy(lock: Arc<LeaseLock>, policy: HoldPolicy) -> Self {
        Self { lock, policy }
    }

    pub fn lock(&self) -> &Arc<LeaseLock> {
        &self.lock
    }

    pub fn policy(&self) -> HoldPolicy {
        self.policy
    }

    /// Run `op` under the lease.
    ///
    /// Already `Held` means `op` is invoked directly; otherwise the lease is
    /// acquired first, and an acquisition failure is returned without ever
    /// invoking `op`. The operation's own output (including any error it
    /// carries) passes through unchanged.
    pub async fn guard<F, Fut, T>(&self, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        if self.lock.state() != LockState::Held {
            self.lock.acquire().await?;
        }

        let output = op().await;

        if self.policy == HoldPolicy::Release {
            self.lock.release().await?;
        }
        Ok(output)
    }
}

/// The host backend at the interface boundary: a readiness signal plus the
/// sensitive submit operation the lock exists to protect. The action and its
/// outcome are opaque to this crate.
#[async_trait]
pub trait ActionBackend: Send + Sync {
    type Action: Send + 'static;
    type Outcome: Send + 'static;

    /// Whether the backend has finished its own startup.
    async fn is_ready(&self) -> bool;

    async fn submit(&self, action: Self::Action) -> Result<Self::Outcome>;
}

/// Decorator substituting a guarded submit for the backend's own.
#[derive(Debug)]
pub struct GuardedBackend<B> {
    inner: B,
    guard: ActionGuard,
}

impl<B: ActionBackend> GuardedBackend<B> {
    pub fn new(inner: B, guard: ActionGuard) -> Self {
        Self { inner, guard }
    }

    /// Poll the backend's readiness signal, then wrap it. Gives up with
    /// [`Error::BackendNotReady`] after `max_polls` failed polls.
    pub async fn install(
        inner: B,
        guard: ActionGuard,
        poll_period: Duration,
        max_polls: u32,
    ) -> Result<Self> {
        for poll in 0..max_polls {
            if inner.is_ready().await {
                debug!(poll, "backend ready, installing guarded submit");
                return Ok(Self::new(inner, guard));
            }
            tokio::time::sleep(poll_period).await;
        }
        Err(Error::BackendNotReady { polls: max_polls })
    }

    pub fn guard(&self) -> &ActionGuard {
        &self.guard
    }

    pub fn into_inner(self) -> B {
        self.inner
    }
}

#[async_trait]
impl<B: ActionBackend> ActionBackend for GuardedBackend<B> {
    type Action = B::Action;
    type Outcome = B::Outcome;

    async fn is_ready(&self) -> bool {
        self.inner.is_ready().await
    }

    async fn submit(&self, action: Self::Action) -> Result<Self::Outcome> {
        self.guard.guard(|| self.inner.submit(action)).await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::ContextId;
    use crate::lock::{LockConfig, DEFAULT_LEASE_KEY};
    use crate::store::{LeaseStore, MemoryLeaseStore};
    use crate::test_utils::ManualClock;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    fn guarded_lock(store: &Arc<MemoryLeaseStore>, name: &str) -> Arc<LeaseLock> {
        let store: Arc<dyn LeaseStore> = Arc::clone(store) as _;
        LeaseLock::with_parts(
            store,
            DEFAULT_LEASE_KEY,
            ContextId::from_raw(name),
            LockConfig {
                acquire_attempts: 1,
                ..LockConfig::default()
            },
            Arc::new(ManualClock::new(0)) as _,
        )
    }

    #[tokio::test]
    async fn test_guard_acquires_on_demand_and_retains() {
        let store = Arc::new(MemoryLeaseStore::new());
        let guard = ActionGuard::new(guarded_lock(&store, "ctx-a"));

        let out = guard.guard(|| async { 7 }).await.unwrap();
        assert_eq!(out, 7);
        assert_eq!(guard.lock().state(), LockState::Held);

        // Second call reuses the held lease without a fresh acquisition.
        guard.guard(|| async {}).await.unwrap();
        assert_eq!(guard.lock().stats().acquires, 1);
    }

    #[tokio::test]
    async fn test_guard_release_policy_clears_lease() {
        let store = Arc::new(MemoryLeaseStore::new());
        let guard =
            ActionGuard::with_policy(guarded_lock(&store, "ctx-a"), HoldPolicy::Release);

        guard.guard(|| async {}).await.unwrap();
        assert_eq!(guard.lock().state(), LockState::Unheld);
        assert_eq!(store.read(DEFAULT_LEASE_KEY).await.unwrap(), None);

        // Each call pays its own acquisition.
        guard.guard(|| async {}).await.unwrap();
        assert_eq!(guard.lock().stats().acquires, 2);
    }

    #[tokio::test]
    async fn test_contended_guard_never_invokes_op() {
        let store = Arc::new(MemoryLeaseStore::new());
        let holder = guarded_lock(&store, "ctx-a");
        holder.acquire().await.unwrap();

        let guard = ActionGuard::new(guarded_lock(&store, "ctx-b"));
        let ran = AtomicBool::new(false);
        let err = guard
            .guard(|| async {
                ran.store(true, Ordering::SeqCst);
            })
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Unavailable { .. }));
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_guard_passes_operation_error_through() {
        let store = Arc::new(MemoryLeaseStore::new());
        let guard = ActionGuard::new(guarded_lock(&store, "ctx-a"));

        let out: std::result::Result<(), &str> =
            guard.guard(|| async { Err("submit rejected") }).await.unwrap();
        assert_eq!(out, Err("submit rejected"));
        // An operation failure does not give up the lease.
        assert_eq!(guard.lock().state(), LockState::Held);
    }

    #[derive(Debug)]
    struct FakeBackend {
        ready_after: AtomicU32,
        submitted: AtomicU32,
    }

    #[async_trait]
    impl ActionBackend for FakeBackend {
        type Action = &'static str;
        type Outcome = u32;

        async fn is_ready(&self) -> bool {
            if self.ready_after.load(Ordering::SeqCst) == 0 {
                true
            } else {
                self.ready_after.fetch_sub(1, Ordering::SeqCst);
                false
            }
        }

        async fn submit(&self, _action: Self::Action) -> Result<Self::Outcome> {
            Ok(self.submitted.fetch_add(1, Ordering::SeqCst) + 1)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_install_polls_readiness() {
        let store = Arc::new(MemoryLeaseStore::new());
        let guard = ActionGuard::new(guarded_lock(&store, "ctx-a"));
        let backend = FakeBackend {
            ready_after: AtomicU32::new(2),
            submitted: AtomicU32::new(0),
        };

        let wrapped =
            GuardedBackend::install(backend, guard, Duration::from_millis(100), 5)
                .await
                .unwrap();
        assert_eq!(wrapped.submit("raid").await.unwrap(), 1);
        assert_eq!(wrapped.guard().lock().state(), LockState::Held);
    }

    #[tokio::test(start_paused = true)]
    async fn test_install_gives_up() {
        let store = Arc::new(MemoryLeaseStore::new());
        let guard = ActionGuard::new(guarded_lock(&store, "ctx-a"));
        let backend = FakeBackend {
            ready_after: AtomicU32::new(100),
            submitted: AtomicU32::new(0),
        };

        let err = GuardedBackend::install(backend, guard, Duration::from_millis(100), 3)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BackendNotReady { polls: 3 }));
    }
}
