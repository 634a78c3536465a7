//! Background tasks: the liveness heartbeat/sweep loop and the signal sweep.
//!
//! Both loops support graceful shutdown via a cancellation token: when the
//! token is cancelled, the task completes its current iteration and exits
//! cleanly.

pub mod liveness_loop;
pub mod signal_sweep;

pub use liveness_loop::{start_liveness_loop, LivenessLoopConfig};
pub use signal_sweep::{run_signal_sweep, start_signal_sweep, SignalSweepConfig};
