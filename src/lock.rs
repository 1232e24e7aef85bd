// Lease lock state machine, heartbeat renewal, and cross-context change
// notification

use crate::backoff::retry_delay;
use crate::clock::{Clock, SystemClock};
use crate::error::{Error, Result};
use crate::identity::ContextId;
use crate::record::LeaseRecord;
use crate::store::{LeaseChange, LeaseStore, RecordHandle};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, trace, warn};

/// Well-known key the lease record lives under.
pub const DEFAULT_LEASE_KEY: &str = "action-lease";

/// Tuning for one [`LeaseLock`].
#[derive(Debug, Clone)]
pub struct LockConfig {
    /// How long a written lease stays valid without renewal.
    pub lease_timeout: Duration,

    /// Heartbeat renewal period. Kept well under `lease_timeout` (7:1 by
    /// default) so several missed ticks still leave margin before expiry.
    pub heartbeat_period: Duration,

    /// Attempt budget for [`LeaseLock::acquire`].
    pub acquire_attempts: u32,

    /// First retry delay when the lease is contended.
    pub base_delay: Duration,

    /// Cap on the retry delay.
    pub max_delay: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            lease_timeout: Duration::from_secs(35),
            heartbeat_period: Duration::from_secs(5),
            acquire_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(2),
        }
    }
}

/// Local ownership belief.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    /// Not holding the lease.
    Unheld,
    /// Holding the lease; the heartbeat is renewing it.
    Held,
    /// The lease was lost involuntarily (expired under us, reclaimed by a
    /// sibling, or the record vanished). Behaves like `Unheld` for the next
    /// acquisition, but is surfaced separately so callers can observe the
    /// loss.
    Lost,
}

/// Read-only view of the stored record relative to this context.
#[derive(Debug, Clone)]
pub struct LockStatus {
    pub has_lock: bool,
    pub lock_owner: Option<ContextId>,
    pub is_owner: bool,
    pub expires_in: Option<Duration>,
    pub is_expired: bool,
}

/// Snapshot of the lock's internal counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockStats {
    /// Read attempts made by `acquire`.
    pub acquire_attempts: u64,
    /// Successful fresh acquisitions.
    pub acquires: u64,
    /// Heartbeat renewals.
    pub renewals: u64,
    /// Losses reclaimed within the same heartbeat tick.
    pub reclaims: u64,
    /// Involuntary losses detected (heartbeat or notifier).
    pub losses: u64,
    /// Losses detected via a change event rather than a heartbeat tick.
    pub takeovers: u64,
    /// Voluntary releases.
    pub releases: u64,
}

#[derive(Debug, Default)]
struct Counters {
    acquire_attempts: AtomicU64,
    acquires: AtomicU64,
    renewals: AtomicU64,
    reclaims: AtomicU64,
    losses: AtomicU64,
    takeovers: AtomicU64,
    releases: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HeartbeatOutcome {
    /// Still the owner; record rewritten with a fresh expiry.
    Renewed,
    /// The record was gone or expired, and we won it back immediately.
    Reclaimed,
    /// The lease belongs to someone else now; the heartbeat must stop.
    Lost,
}

#[derive(Debug)]
struct Inner {
    state: LockState,
    heartbeat: Option<JoinHandle<()>>,
    notifier: Option<JoinHandle<()>>,
}

/// Lease-based mutual exclusion over a shared key-value store.
///
/// States: `Unheld` → `Held` (acquire) → `Lost` (involuntary loss) or
/// `Unheld` (release). There is no terminal state; the lock is reusable for
/// the lifetime of the context.
///
/// Acquisition is read-then-write with no atomicity between the two steps.
/// Two contexts that both observe an expired or absent lease may both write,
/// and the last write wins; the loser finds out on its next heartbeat tick
/// or change event. This window is an accepted cost of building a lock on a
/// store with no compare-and-swap, and the stored record remains the single
/// source of truth at every read.
#[derive(Debug)]
pub struct LeaseLock {
    handle: RecordHandle,
    identity: ContextId,
    config: LockConfig,
    clock: Arc<dyn Clock>,
    inner: Mutex<Inner>,
    counters: Counters,
}

impl LeaseLock {
    /// Create a lock over `key` in `store` with a generated identity and the
    /// system clock. Must be called within a Tokio runtime: the change
    /// notifier task is spawned here.
    pub fn new(store: Arc<dyn LeaseStore>, key: impl Into<String>, config: LockConfig) -> Arc<Self> {
        Self::with_parts(store, key, ContextId::generate(), config, Arc::new(SystemClock))
    }

    /// Fully parameterized constructor; tests inject identity and clock.
    pub fn with_parts(
        store: Arc<dyn LeaseStore>,
        key: impl Into<String>,
        identity: ContextId,
        config: LockConfig,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        let handle = RecordHandle::new(store, key, config.lease_timeout);
        let lock = Arc::new(Self {
            handle,
            identity,
            config,
            clock,
            inner: Mutex::new(Inner {
                state: LockState::Unheld,
                heartbeat: None,
                notifier: None,
            }),
            counters: Counters::default(),
        });
        lock.spawn_notifier();
        lock
    }

    pub fn identity(&self) -> &ContextId {
        &self.identity
    }

    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    /// Current local ownership belief.
    pub fn state(&self) -> LockState {
        self.inner.lock().state
    }

    /// Acquire the lease with the configured attempt budget and base delay.
    pub async fn acquire(self: &Arc<Self>) -> Result<()> {
        self.acquire_with(self.config.acquire_attempts, self.config.base_delay)
            .await
    }

    /// Acquire the lease, retrying a contended record up to `max_attempts`
    /// times with an increasing delay between attempts.
    ///
    /// A self-owned unexpired record is treated as already held and is not
    /// rewritten; its expiry moves only on the next heartbeat tick. Exhausting
    /// the budget returns [`Error::Unavailable`]; the operation this lock
    /// guards must not proceed on that path.
    pub async fn acquire_with(self: &Arc<Self>, max_attempts: u32, base_delay: Duration) -> Result<()> {
        let mut last_holder = None;

        for attempt in 0..max_attempts {
            self.counters.acquire_attempts.fetch_add(1, Ordering::Relaxed);
            let now = self.clock.now_ms();

            match self.handle.read().await? {
                Some(record) if record.owned_by(&self.identity) && !record.is_expired(now) => {
                    trace!(owner = %self.identity, "lease already held by this context");
                    self.note_held();
                    return Ok(());
                }
                Some(record) if !record.is_expired(now) => {
                    last_holder = Some(record.owner.clone());
                    let delay = retry_delay(attempt, base_delay, self.config.max_delay);
                    debug!(
                        attempt,
                        holder = %record.owner,
                        ?delay,
                        "lease held by another context"
                    );
                    if attempt + 1 < max_attempts {
                        tokio::time::sleep(delay).await;
                    }
                }
                _ => {
                    // Absent, expired, or corrupt (which reads as absent).
                    let record = self.handle.write(&self.identity, now).await?;
                    self.counters.acquires.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        owner = %self.identity,
                        expires_at_ms = record.expires_at_ms,
                        "lease acquired"
                    );
                    self.note_held();
                    return Ok(());
                }
            }
        }

        Err(Error::Unavailable {
            attempts: max_attempts,
            holder: last_holder,
        })
    }

    /// Release the lease.
    ///
    /// Always stops the heartbeat and converges local state to `Unheld`,
    /// even when ownership was already lost; the stored record is cleared
    /// only if it still names this context.
    pub async fn release(&self) -> Result<()> {
        {
            let mut inner = self.inner.lock();
            inner.state = LockState::Unheld;
            if let Some(heartbeat) = inner.heartbeat.take() {
                heartbeat.abort();
            }
        }
        self.counters.releases.fetch_add(1, Ordering::Relaxed);

        let owned = matches!(
            self.handle.read().await?,
            Some(record) if record.owned_by(&self.identity)
        );
        if owned {
            self.handle.clear().await?;
            debug!(owner = %self.identity, "lease released");
        }
        Ok(())
    }

    /// Read-only view of the stored record relative to this context.
    pub async fn status(&self) -> Result<LockStatus> {
        let now = self.clock.now_ms();
        let record = self.handle.read().await?;
        Ok(LockStatus {
            has_lock: record.as_ref().is_some_and(|r| !r.is_expired(now)),
            lock_owner: record.as_ref().map(|r| r.owner.clone()),
            is_owner: record.as_ref().is_some_and(|r| r.owned_by(&self.identity)),
            expires_in: record.as_ref().and_then(|r| r.remaining(now)),
            is_expired: record.as_ref().is_some_and(|r| r.is_expired(now)),
        })
    }

    /// Snapshot of the internal counters.
    pub fn stats(&self) -> LockStats {
        LockStats {
            acquire_attempts: self.counters.acquire_attempts.load(Ordering::Relaxed),
            acquires: self.counters.acquires.load(Ordering::Relaxed),
            renewals: self.counters.renewals.load(Ordering::Relaxed),
            reclaims: self.counters.reclaims.load(Ordering::Relaxed),
            losses: self.counters.losses.load(Ordering::Relaxed),
            takeovers: self.counters.takeovers.load(Ordering::Relaxed),
            releases: self.counters.releases.load(Ordering::Relaxed),
        }
    }

    /// Mark the lock held and make sure a heartbeat task is running.
    fn note_held(self: &Arc<Self>) {
        let mut inner = self.inner.lock();
        inner.state = LockState::Held;
        let stale = inner
            .heartbeat
            .as_ref()
            .map_or(true, |task| task.is_finished());
        if stale {
            inner.heartbeat = Some(tokio::spawn(Self::run_heartbeat(Arc::downgrade(self))));
        }
    }

    async fn run_heartbeat(weak: Weak<Self>) {
        let period = match weak.upgrade() {
            Some(lock) => lock.config.heartbeat_period,
            None => return,
        };
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick of an interval fires immediately; the lease was
        // just written, so skip it.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let Some(lock) = weak.upgrade() else { break };
            if lock.state() != LockState::Held {
                break;
            }
            match lock.heartbeat_tick().await {
                Ok(HeartbeatOutcome::Renewed | HeartbeatOutcome::Reclaimed) => {}
                Ok(HeartbeatOutcome::Lost) => break,
                Err(err) => {
                    // Storage hiccup. Keep the timer alive: the next tick may
                    // succeed before the lease lapses.
                    error!(%err, "heartbeat renewal failed");
                }
            }
        }
    }

    /// One heartbeat tick: renew a self-owned record, reclaim an
    /// absent/expired one, or detect that the lease now belongs elsewhere.
    pub(crate) async fn heartbeat_tick(&self) -> Result<HeartbeatOutcome> {
        let now = self.clock.now_ms();

        match self.handle.read().await? {
            Some(record) if record.owned_by(&self.identity) => {
                let renewed = self.handle.write(&self.identity, now).await?;
                self.counters.renewals.fetch_add(1, Ordering::Relaxed);
                trace!(expires_at_ms = renewed.expires_at_ms, "lease renewed");
                Ok(HeartbeatOutcome::Renewed)
            }
            current => {
                self.counters.losses.fetch_add(1, Ordering::Relaxed);
                let reclaimable = current.as_ref().map_or(true, |r| r.is_expired(now));

                if reclaimable {
                    match self.handle.write(&self.identity, now).await {
                        Ok(record) => {
                            self.counters.reclaims.fetch_add(1, Ordering::Relaxed);
                            warn!(
                                expires_at_ms = record.expires_at_ms,
                                "lease record was gone, reclaimed"
                            );
                            self.inner.lock().state = LockState::Held;
                            return Ok(HeartbeatOutcome::Reclaimed);
                        }
                        Err(err) => {
                            error!(%err, "failed to reclaim lost lease");
                        }
                    }
                }

                warn!(
                    holder = ?current.map(|r| r.owner),
                    "lease lost to another context"
                );
                self.inner.lock().state = LockState::Lost;
                Ok(HeartbeatOutcome::Lost)
            }
        }
    }

    fn spawn_notifier(self: &Arc<Self>) {
        let mut events = self.handle.subscribe();
        let weak = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(change) => {
                        let Some(lock) = weak.upgrade() else { break };
                        lock.observe_change(&change);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        // Advisory channel; the heartbeat re-reads the store
                        // on its own cadence regardless.
                        debug!(skipped, "lease change events lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        self.inner.lock().notifier = Some(task);
    }

    /// React to a store mutation published by a sibling context. If the old
    /// value named this context as owner and the new one does not, ownership
    /// is gone: mark `Lost` and stop the heartbeat now instead of waiting
    /// for the next tick.
    fn observe_change(&self, change: &LeaseChange) {
        if change.key != self.handle.key() {
            return;
        }
        let was_ours = owner_of(change.old.as_deref()).is_some_and(|o| o == self.identity);
        let still_ours = owner_of(change.new.as_deref()).is_some_and(|o| o == self.identity);
        if !was_ours || still_ours {
            return;
        }

        let mut inner = self.inner.lock();
        if inner.state == LockState::Held {
            warn!(
                new_owner = ?owner_of(change.new.as_deref()),
                "lease taken over by another context"
            );
            self.counters.takeovers.fetch_add(1, Ordering::Relaxed);
            self.counters.losses.fetch_add(1, Ordering::Relaxed);
            inner.state = LockState::Lost;
            if let Some(heartbeat) = inner.heartbeat.take() {
                heartbeat.abort();
            }
        }
    }
}

impl Drop for LeaseLock {
    fn drop(&mut self) {
        let mut inner = self.inner.lock();
        for task in [inner.heartbeat.take(), inner.notifier.take()]
            .into_iter()
            .flatten()
        {
            task.abort();
        }
    }
}

fn owner_of(raw: Option<&str>) -> Option<ContextId> {
    raw.and_then(|raw| serde_json::from_str::<LeaseRecord>(raw).ok())
        .map(|record| record.owner)
}
