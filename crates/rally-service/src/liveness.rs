//! Server liveness registry and dead-server cleanup hook framework.
//!
//! Each process upserts its own `ServerRecord` on every heartbeat and sweeps
//! for peers that have gone silent for longer than the server TTL. When a
//! sweep finds dead servers it invokes every registered cleanup hook with the
//! full batch of dead ids, then deletes the records.
//!
//! The registry is an explicit per-process value: `server_id` and the hook
//! list are construction state, never module-level globals. Hooks run
//! sequentially in registration order with no per-hook isolation - a hook
//! error aborts the remainder of that sweep cycle (including record
//! deletion), and the batch is retried on the next cycle.
//!
//! Reaping waits out four nominal heartbeat periods, which makes
//! false-positive reaping under ordinary jitter or GC pauses unlikely but not
//! impossible. Consumers must treat "my own id got reaped" as a rare but real
//! event and rely on idempotent cleanup, not instance-level invalidation.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::future::BoxFuture;
use mongodb::bson::DateTime;
use tracing::{debug, info, instrument};

use crate::errors::RallyError;
use crate::observability::metrics;
use crate::store::CoordStore;

/// A cleanup hook invoked with the full batch of dead server ids.
pub type CleanupHook = Arc<dyn Fn(Vec<String>) -> BoxFuture<'static, Result<(), RallyError>> + Send + Sync>;

/// Timestamp `age` before now, for staleness cutoffs.
#[must_use]
pub fn cutoff_before(age: Duration) -> DateTime {
    let age = chrono::Duration::milliseconds(i64::try_from(age.as_millis()).unwrap_or(i64::MAX));
    DateTime::from_chrono(chrono::Utc::now() - age)
}

/// Per-process server liveness registry.
pub struct LivenessRegistry {
    store: Arc<dyn CoordStore>,
    server_id: String,
    server_ttl: Duration,
    hooks: Mutex<Vec<CleanupHook>>,
}

impl LivenessRegistry {
    /// Create a registry for this process.
    #[must_use]
    pub fn new(store: Arc<dyn CoordStore>, server_id: String, server_ttl: Duration) -> Self {
        Self {
            store,
            server_id,
            server_ttl,
            hooks: Mutex::new(Vec::new()),
        }
    }

    /// This process's server id.
    #[must_use]
    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    /// Append `hook` to the process-local cleanup hook list.
    ///
    /// Hooks run in registration order during every sweep that finds dead
    /// servers, each receiving the full dead-id batch.
    pub fn register_cleanup_hook<F, Fut>(&self, hook: F)
    where
        F: Fn(Vec<String>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<(), RallyError>> + Send + 'static,
    {
        let hook: CleanupHook = Arc::new(move |dead| Box::pin(hook(dead)));
        self.hooks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(hook);
    }

    /// One periodic cycle: heartbeat our own record, then sweep for dead
    /// peers.
    ///
    /// # Errors
    ///
    /// Returns `RallyError::Database` on store failures, or the first hook
    /// error (which aborted the rest of the sweep).
    pub async fn periodic(&self) -> Result<(), RallyError> {
        self.heartbeat().await?;
        self.sweep().await?;
        Ok(())
    }

    /// Upsert this process's heartbeat record. Idempotent by server id.
    pub async fn heartbeat(&self) -> Result<(), RallyError> {
        self.store
            .heartbeat_server(&self.server_id, DateTime::now())
            .await?;
        debug!(target: "rally.liveness", server_id = %self.server_id, "Heartbeat recorded");
        Ok(())
    }

    /// Find servers silent for longer than the TTL, run the cleanup hooks
    /// with the dead batch, then delete the records. Returns the number of
    /// servers reaped.
    #[instrument(skip_all)]
    pub async fn sweep(&self) -> Result<u64, RallyError> {
        let dead = self
            .store
            .stale_servers(cutoff_before(self.server_ttl))
            .await?;
        if dead.is_empty() {
            return Ok(0);
        }

        // Snapshot the hook list; registration during a sweep affects the
        // next cycle only.
        let hooks: Vec<CleanupHook> = self
            .hooks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        for hook in hooks {
            hook(dead.clone()).await?;
        }

        let reaped = self.store.delete_servers(&dead).await?;
        info!(
            target: "rally.liveness",
            server_id = %self.server_id,
            reaped_count = reaped,
            dead_servers = ?dead,
            "Reaped dead servers"
        );
        metrics::record_servers_reaped(reaped);
        Ok(reaped)
    }
}
