//! Liveness heartbeat loop.
//!
//! Periodically runs one registry cycle (heartbeat our own record, sweep for
//! dead peers). Each delay is the base interval plus uniform random jitter so
//! a fleet started together does not hammer the store in lockstep.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::Config;
use crate::liveness::LivenessRegistry;

/// Configuration for the liveness loop.
#[derive(Debug, Clone)]
pub struct LivenessLoopConfig {
    /// Base delay between cycles.
    pub interval: Duration,
    /// Upper bound on the extra random delay added to each cycle.
    pub jitter: Duration,
}

impl LivenessLoopConfig {
    /// Derive from the service config.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            interval: Duration::from_secs(config.heartbeat_interval_seconds),
            jitter: Duration::from_secs(config.heartbeat_jitter_seconds),
        }
    }
}

/// Base interval plus a fresh uniform jitter.
fn jittered(config: &LivenessLoopConfig) -> Duration {
    let jitter_ms = config.jitter.as_millis().min(u128::from(u64::MAX));
    #[allow(clippy::cast_possible_truncation)]
    let jitter_ms = jitter_ms as u64;
    let extra = if jitter_ms == 0 {
        0
    } else {
        rand::thread_rng().gen_range(0..=jitter_ms)
    };
    config.interval + Duration::from_millis(extra)
}

/// Run the liveness loop until the cancellation token fires.
///
/// The first cycle runs immediately so the process is visible to the fleet
/// as soon as it starts. Cycle errors (store failures, hook errors) are
/// logged and the loop continues; a hook error means that sweep's dead batch
/// is retried next cycle.
pub async fn start_liveness_loop(
    registry: Arc<LivenessRegistry>,
    config: LivenessLoopConfig,
    cancel_token: CancellationToken,
) {
    info!(
        target: "rally.task.liveness",
        server_id = %registry.server_id(),
        interval_secs = config.interval.as_secs(),
        jitter_secs = config.jitter.as_secs(),
        "Starting liveness loop"
    );

    loop {
        if let Err(e) = registry.periodic().await {
            error!(
                target: "rally.task.liveness",
                server_id = %registry.server_id(),
                error = %e,
                "Liveness cycle failed"
            );
        }

        tokio::select! {
            () = tokio::time::sleep(jittered(&config)) => {}
            () = cancel_token.cancelled() => {
                info!(
                    target: "rally.task.liveness",
                    "Liveness loop received shutdown signal, exiting"
                );
                break;
            }
        }
    }

    info!(target: "rally.task.liveness", "Liveness loop stopped");
}
