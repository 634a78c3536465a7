//! # Rally Test Utilities
//!
//! Shared test utilities for the Rally workspace.
//!
//! Provides mock implementations for isolated testing without real
//! infrastructure:
//!
//! - `memory_store` - In-memory `CoordStore` with the same atomic semantics
//!   as the MongoDB store, plus direct-seeding helpers for staleness tests
//! - `fake_peer` - Scripted peer connection engine and signal outboxes for
//!   driving the client negotiation state machine
//! - `fixtures` - Document builders and timestamp helpers
//!
//! ## Usage
//!
//! ```rust,ignore
//! use rally_test_utils::{MemoryCoordStore, fixtures};
//! use std::sync::Arc;
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let store = Arc::new(MemoryCoordStore::new());
//!     store.seed_lock("drive:hunt1", fixtures::seconds_ago(60), None);
//!     // ...
//! }
//! ```

pub mod fake_peer;
pub mod fixtures;
pub mod memory_store;

pub use fake_peer::{FakePeerConnection, FakePeerFactory, RecordingOutbox, RelayOutbox};
pub use memory_store::MemoryCoordStore;
