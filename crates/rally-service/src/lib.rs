//! Rally coordination service library.
//!
//! Rally coordinates a fleet of stateless server processes that share one
//! MongoDB instance. This crate provides the three server-side primitives:
//!
//! - [`lock`] - fleet-wide named mutexes with lease-based preemption
//! - [`liveness`] - per-process heartbeats plus a hook registry invoked when
//!   a server is presumed dead
//! - [`relay`] - call participant registry and signal mailbox used by browser
//!   clients to negotiate direct WebRTC connections
//!
//! # Architecture
//!
//! Every cross-process guarantee is expressed through single-document atomic
//! store operations (unique-index insert, conditional update, conditional
//! delete, atomic list append) - never through in-process locks. The store
//! seam is the [`store::CoordStore`] trait: production uses
//! [`store::MongoCoordStore`], tests use the in-memory implementation from
//! `rally-test-utils`.
//!
//! In-process wakeups (lock-freed notification, subscription feeds) ride on
//! broadcast channels fed by MongoDB change-stream pump tasks. The design
//! tolerates a brief window of duplicate execution after mistaken preemption;
//! operations protected by the lock must be idempotent.
//!
//! # Modules
//!
//! - [`config`] - service configuration from environment
//! - [`errors`] - error types with client-visible error codes
//! - [`store`] - storage seam and MongoDB implementation
//! - [`lock`] - distributed lock
//! - [`liveness`] - server liveness registry and GC hook framework
//! - [`relay`] - call signaling relay and subscriptions
//! - [`tasks`] - background heartbeat and sweep loops
//! - [`observability`] - health endpoints and metrics helpers

#![warn(clippy::pedantic)]

pub mod config;
pub mod errors;
pub mod liveness;
pub mod lock;
pub mod observability;
pub mod relay;
pub mod store;
pub mod tasks;
