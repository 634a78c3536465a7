//! Signal sweep background task.
//!
//! Periodically deletes call signal mailboxes older than the signal TTL whose
//! sender or target is no longer a live participant, bounding storage growth
//! from crashed tabs that never unsubscribed cleanly. Shares the liveness
//! loop's cadence but not its hook mechanism: signal garbage is judged by
//! participant liveness, not server liveness.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::config::Config;
use crate::liveness::cutoff_before;
use crate::observability::metrics;
use crate::store::CoordStore;

/// Configuration for the signal sweep task.
#[derive(Debug, Clone)]
pub struct SignalSweepConfig {
    /// Delay between sweeps.
    pub interval: Duration,
    /// Age below which a mailbox is never deleted, regardless of participant
    /// liveness.
    pub signal_ttl: Duration,
}

impl SignalSweepConfig {
    /// Derive from the service config.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            interval: Duration::from_secs(config.sweep_interval_seconds),
            signal_ttl: Duration::from_secs(config.signal_ttl_seconds),
        }
    }
}

/// Run the signal sweep loop until the cancellation token fires.
#[instrument(skip_all, name = "rally.task.signal_sweep")]
pub async fn start_signal_sweep(
    store: Arc<dyn CoordStore>,
    config: SignalSweepConfig,
    cancel_token: CancellationToken,
) {
    info!(
        target: "rally.task.signal_sweep",
        interval_secs = config.interval.as_secs(),
        signal_ttl_secs = config.signal_ttl.as_secs(),
        "Starting signal sweep task"
    );

    let mut interval = tokio::time::interval(config.interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                run_signal_sweep(&store, &config).await;
            }
            () = cancel_token.cancelled() => {
                info!(
                    target: "rally.task.signal_sweep",
                    "Signal sweep task received shutdown signal, exiting"
                );
                break;
            }
        }
    }

    info!(target: "rally.task.signal_sweep", "Signal sweep task stopped");
}

/// Run a single sweep iteration.
///
/// Separated from the loop for direct testing.
pub async fn run_signal_sweep(store: &Arc<dyn CoordStore>, config: &SignalSweepConfig) {
    match store.sweep_signals(cutoff_before(config.signal_ttl)).await {
        Ok(swept) => {
            if swept > 0 {
                info!(
                    target: "rally.task.signal_sweep",
                    swept_count = swept,
                    "Swept orphaned call signals"
                );
                metrics::record_signals_swept(swept);
            }
        }
        Err(e) => {
            warn!(
                target: "rally.task.signal_sweep",
                error = %e,
                "Signal sweep failed"
            );
        }
    }
}
