//! Metrics definitions for the Rally service.
//!
//! All metrics follow Prometheus naming conventions:
//! - `rally_` prefix
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Cardinality
//!
//! Labels are bounded: `op` is bounded by code (store operation names),
//! `status` has 2 values, and `name` (lock names) is bounded by the small
//! fixed set of resource keys the application locks on.

use metrics::{counter, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Initialize the Prometheus metrics recorder and return the handle for
/// serving `/metrics`.
///
/// Must be called before any metrics are recorded.
///
/// # Errors
///
/// Returns an error if the recorder fails to install (e.g., already
/// installed).
pub fn init_metrics_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Prefix("rally_store_op".to_string()),
            &[
                0.001, 0.002, 0.005, 0.010, 0.020, 0.050, 0.100, 0.250, 0.500, 1.000,
            ],
        )
        .map_err(|e| format!("Failed to set store op buckets: {e}"))?
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus recorder: {e}"))
}

/// Record a store operation.
///
/// Metric: `rally_store_op_duration_seconds`, `rally_store_ops_total`
/// Labels: `op`, `status`
pub fn record_store_op(op: &'static str, ok: bool, duration: Duration) {
    let status = if ok { "success" } else { "error" };

    histogram!("rally_store_op_duration_seconds", "op" => op).record(duration.as_secs_f64());

    counter!("rally_store_ops_total",
        "op" => op,
        "status" => status
    )
    .increment(1);
}

/// Record a lock acquisition.
///
/// Metric: `rally_lock_acquired_total`, labels: `name`
pub fn record_lock_acquired(name: &str) {
    counter!("rally_lock_acquired_total", "name" => name.to_string()).increment(1);
}

/// Record a lock preemption (expired lease stolen from a presumed-dead
/// holder).
///
/// Metric: `rally_lock_preempted_total`, labels: `name`
pub fn record_lock_preempted(name: &str) {
    counter!("rally_lock_preempted_total", "name" => name.to_string()).increment(1);
}

/// Record servers reaped by a liveness sweep.
///
/// Metric: `rally_servers_reaped_total`
pub fn record_servers_reaped(count: u64) {
    counter!("rally_servers_reaped_total").increment(count);
}

/// Record a participant joining a call.
///
/// Metric: `rally_call_participants_joined_total`
pub fn record_participant_joined() {
    counter!("rally_call_participants_joined_total").increment(1);
}

/// Record one relayed signaling message.
///
/// Metric: `rally_signals_relayed_total`
pub fn record_signal_relayed() {
    counter!("rally_signals_relayed_total").increment(1);
}

/// Record signal mailboxes deleted by the age/liveness sweep.
///
/// Metric: `rally_signals_swept_total`
pub fn record_signals_swept(count: u64) {
    counter!("rally_signals_swept_total").increment(count);
}

#[cfg(test)]
mod tests {
    use super::*;

    // These tests execute the recording functions for coverage; without an
    // installed recorder the metrics crate records to a global no-op, which
    // must not panic.

    #[test]
    fn test_record_store_op() {
        record_store_op("try_insert_lock", true, Duration::from_millis(2));
        record_store_op("append_signal", true, Duration::from_millis(5));
        record_store_op("sweep_signals", false, Duration::from_millis(50));
    }

    #[test]
    fn test_record_lock_metrics() {
        record_lock_acquired("drive:hunt1");
        record_lock_preempted("drive:hunt1");
    }

    #[test]
    fn test_record_sweep_metrics() {
        record_servers_reaped(0);
        record_servers_reaped(3);
        record_signals_swept(7);
    }

    #[test]
    fn test_record_relay_metrics() {
        record_participant_joined();
        record_signal_relayed();
    }
}
