//! Fleet-wide named mutexes with lease-based preemption.
//!
//! A lock is a single document in the `locks` collection; the unique index on
//! `name` makes insertion the acquisition primitive. Contenders wait on the
//! removal feed (to be woken the instant the lock frees up) raced against a
//! lease deadline; an expired lease is preempted by a conditional delete
//! matching `(id, renewedAt)` together, so a lease renewed moments before the
//! staleness check is never stolen.
//!
//! Preemption is a liveness heuristic, not proof of death: a preempted holder
//! may still be mid-flight, so protected operations must be idempotent
//! check-then-act sequences. Holders running long critical sections call
//! [`LockHandle::renew`] periodically and must abort if it fails.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use mongodb::bson::DateTime;
use tokio::sync::broadcast;
use tracing::{debug, instrument, warn};

use crate::errors::RallyError;
use crate::observability::metrics;
use crate::store::CoordStore;

/// Default lease window before a holder is presumed dead and preempted.
pub const DEFAULT_PREEMPT_TIMEOUT: Duration = Duration::from_secs(10);

/// Fleet-wide named mutex.
///
/// Cheap to clone; all state lives in the store.
#[derive(Clone)]
pub struct DistributedLock {
    store: Arc<dyn CoordStore>,
    preempt_timeout: Duration,
}

impl DistributedLock {
    /// Create a lock service over `store` with the given lease window.
    #[must_use]
    pub fn new(store: Arc<dyn CoordStore>, preempt_timeout: Duration) -> Self {
        Self {
            store,
            preempt_timeout,
        }
    }

    /// Run `critical_section` with exclusive fleet-wide ownership of `name`.
    ///
    /// Acquisition retries indefinitely until acquired or preempted - there
    /// is no caller timeout. Only the calling task suspends while waiting;
    /// the wait races the lock-removal feed against the current holder's
    /// lease deadline.
    ///
    /// The lock is released on every exit path: explicitly after the critical
    /// section resolves (success or error), and by a best-effort drop release
    /// if the calling task is aborted mid-section.
    ///
    /// # Errors
    ///
    /// Returns the critical section's error, or `RallyError::Database` if a
    /// store operation fails while acquiring.
    pub async fn with_lock<F, Fut, T>(&self, name: &str, critical_section: F) -> Result<T, RallyError>
    where
        F: FnOnce(LockHandle) -> Fut,
        Fut: Future<Output = Result<T, RallyError>>,
    {
        let handle = self.acquire(name).await?;
        let result = critical_section(handle.clone()).await;
        handle.release().await;
        result
    }

    /// Acquire `name`, suspending until the lock is ours.
    #[instrument(skip_all, fields(name = %name))]
    async fn acquire(&self, name: &str) -> Result<LockHandle, RallyError> {
        // Subscribe before the first insert attempt so a removal between the
        // failed insert and the wait is never missed.
        let mut removals = self.store.lock_removals();
        let mut removals_open = true;

        loop {
            if let Some(lock) = self.store.try_insert_lock(name, DateTime::now()).await? {
                debug!(target: "rally.lock", name = %name, id = %lock.id, "Lock acquired");
                metrics::record_lock_acquired(name);
                return Ok(LockHandle::new(Arc::clone(&self.store), lock.id, lock.name));
            }

            // Contended: wait for the holder to release or its lease to lapse.
            let Some(holder) = self.store.find_lock(name).await? else {
                // Released between our insert and read; try again immediately.
                continue;
            };

            let lease_start = holder.lease_start().to_chrono();
            let elapsed = (Utc::now() - lease_start)
                .to_std()
                .unwrap_or(Duration::ZERO);
            let remaining = self.preempt_timeout.saturating_sub(elapsed);

            let lease_expired = tokio::select! {
                () = tokio::time::sleep(remaining) => true,
                received = removals.recv(), if removals_open => {
                    if let Err(broadcast::error::RecvError::Closed) = received {
                        // No pump (or it died): timer-driven retries only.
                        removals_open = false;
                    }
                    // Any removal, lag, or close: re-attempt the insert.
                    false
                }
            };

            if lease_expired {
                // Re-validate the holder is unchanged - match by id AND
                // renewedAt - then steal the lease.
                if self.store.preempt_lock(&holder.id, holder.renewed_at).await? {
                    warn!(
                        target: "rally.lock",
                        name = %name,
                        holder = %holder.id,
                        lease_age_secs = elapsed.as_secs() + remaining.as_secs(),
                        "Preempted expired lock lease"
                    );
                    metrics::record_lock_preempted(name);
                }
            }
        }
    }
}

/// Handle to a held lock, passed into the critical section.
///
/// Clones share the same underlying lease state.
#[derive(Clone)]
pub struct LockHandle {
    inner: Arc<LockHandleInner>,
}

struct LockHandleInner {
    store: Arc<dyn CoordStore>,
    id: String,
    name: String,
    /// Last `renewedAt` value we wrote, matched on the next renewal.
    lease: tokio::sync::Mutex<Option<DateTime>>,
    released: AtomicBool,
}

impl LockHandle {
    fn new(store: Arc<dyn CoordStore>, id: String, name: String) -> Self {
        Self {
            inner: Arc::new(LockHandleInner {
                store,
                id,
                name,
                lease: tokio::sync::Mutex::new(None),
                released: AtomicBool::new(false),
            }),
        }
    }

    /// Name of the held lock.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Extend the lease by bumping `renewedAt`.
    ///
    /// # Errors
    ///
    /// Returns `RallyError::LockLost` if the conditional update matched zero
    /// documents: the lock was preempted and this holder no longer has
    /// exclusivity. The caller MUST abort its critical section, not continue.
    pub async fn renew(&self) -> Result<(), RallyError> {
        let mut lease = self.inner.lease.lock().await;
        let now = DateTime::now();
        let renewed = self
            .inner
            .store
            .renew_lock(&self.inner.id, *lease, now)
            .await?;
        if !renewed {
            return Err(RallyError::LockLost(self.inner.name.clone()));
        }
        *lease = Some(now);
        Ok(())
    }

    /// Delete our lock document. Idempotent.
    ///
    /// A failed delete is logged, not surfaced: the stale document will be
    /// preempted after the lease window by the next contender.
    pub(crate) async fn release(&self) {
        if self.inner.released.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.inner.store.release_lock(&self.inner.id).await {
            warn!(
                target: "rally.lock",
                name = %self.inner.name,
                error = %e,
                "Failed to release lock, leaving it to preemption"
            );
        }
    }
}

impl Drop for LockHandleInner {
    fn drop(&mut self) {
        // Reached with `released` unset only when the owning task was aborted
        // mid-critical-section; schedule a best-effort release.
        if !*self.released.get_mut() {
            let store = Arc::clone(&self.store);
            let id = self.id.clone();
            let name = self.name.clone();
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                runtime.spawn(async move {
                    if store.release_lock(&id).await.is_ok() {
                        debug!(target: "rally.lock", name = %name, "Released abandoned lock");
                    }
                });
            }
        }
    }
}
