//! Storage seam for the Rally coordination collections.
//!
//! Every cross-process invariant in Rally rests on the atomic single-document
//! primitives exposed here: unique-index insert (mutual exclusion),
//! conditional update (lease renewal), conditional delete (preemption),
//! upsert by `_id` (heartbeat), and atomic list append (ordered mailbox).
//! Any store substituted in must preserve those primitives; the lock,
//! liveness, and relay layers never compensate with in-process locks.
//!
//! Two implementations exist: [`MongoCoordStore`] for production and an
//! in-memory store in `rally-test-utils` for deterministic multi-process
//! simulation.

pub mod documents;
pub mod mongo;

use async_trait::async_trait;
use mongodb::bson::DateTime;
use tokio::sync::broadcast;

use crate::errors::RallyError;
use common::types::SignalMessage;
use documents::{LockDoc, ParticipantDoc, SignalDoc};

pub use mongo::MongoCoordStore;

/// Capacity of the broadcast channels carrying store events.
///
/// Slow subscribers that fall more than this many events behind observe a
/// `Lagged` error and must resync from a snapshot.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// A push event about the call-relay collections, keyed by document id.
///
/// This is the externally observable contract of the reactive feed: inserts
/// and updates carry the full document, removals carry only the id.
#[derive(Debug, Clone)]
pub enum CallEvent {
    /// A participant document was inserted.
    ParticipantAdded(ParticipantDoc),
    /// A participant document was updated in place.
    ParticipantChanged(ParticipantDoc),
    /// A participant document was removed.
    ParticipantRemoved { id: String },
    /// A signal mailbox was created or appended to.
    SignalUpserted(SignalDoc),
    /// A signal mailbox was removed (unsubscribe cascade or sweep).
    SignalRemoved { id: String },
}

/// Atomic storage operations shared by all Rally server processes.
///
/// Implementations must make each method a single atomic step from the point
/// of view of concurrent callers in other processes; compound sweeps
/// (`sweep_signals`) may be multi-step internally because their effects are
/// idempotent and re-checked every cycle.
#[async_trait]
pub trait CoordStore: Send + Sync {
    // --- locks ---

    /// Atomically insert a lock document for `name`.
    ///
    /// Returns the new document on success, `None` if a document with this
    /// name already exists (duplicate-key failure - expected contention, not
    /// an error).
    async fn try_insert_lock(
        &self,
        name: &str,
        now: DateTime,
    ) -> Result<Option<LockDoc>, RallyError>;

    /// Fetch the current holder's document for `name`, if any.
    async fn find_lock(&self, name: &str) -> Result<Option<LockDoc>, RallyError>;

    /// Conditionally bump `renewed_at` on the lock with `id`, matching the
    /// previously observed `renewed_at` value. Returns `false` when the match
    /// fails (the lock was preempted or re-acquired by someone else).
    async fn renew_lock(
        &self,
        id: &str,
        expected_renewed_at: Option<DateTime>,
        now: DateTime,
    ) -> Result<bool, RallyError>;

    /// Conditionally delete the lock with `id`, matching `renewed_at` so a
    /// lease renewed after the staleness check is never stolen. Returns
    /// `true` if a document was deleted.
    async fn preempt_lock(
        &self,
        id: &str,
        expected_renewed_at: Option<DateTime>,
    ) -> Result<bool, RallyError>;

    /// Delete our own lock document unconditionally.
    async fn release_lock(&self, id: &str) -> Result<(), RallyError>;

    /// Subscribe to lock removal notifications (document ids). Fed by the
    /// change-stream pump in production; used to wake contenders the instant
    /// a lock frees up.
    fn lock_removals(&self) -> broadcast::Receiver<String>;

    // --- server liveness ---

    /// Upsert this process's heartbeat record (idempotent by `_id`).
    async fn heartbeat_server(&self, server_id: &str, now: DateTime) -> Result<(), RallyError>;

    /// Ids of all servers whose last heartbeat is older than `cutoff`.
    async fn stale_servers(&self, cutoff: DateTime) -> Result<Vec<String>, RallyError>;

    /// Delete the given server records; returns the number deleted.
    async fn delete_servers(&self, ids: &[String]) -> Result<u64, RallyError>;

    // --- call participants ---

    /// Insert a new call participant.
    async fn insert_participant(&self, doc: ParticipantDoc) -> Result<(), RallyError>;

    /// Fetch one participant by id.
    async fn find_participant(&self, id: &str) -> Result<Option<ParticipantDoc>, RallyError>;

    /// All live participants for one `(hunt, call)`.
    async fn participants_in_call(
        &self,
        hunt: &str,
        call: &str,
    ) -> Result<Vec<ParticipantDoc>, RallyError>;

    /// Update mute/deafen flags in place. Returns `false` if the participant
    /// no longer exists.
    async fn update_participant_flags(
        &self,
        id: &str,
        muted: bool,
        deafened: bool,
    ) -> Result<bool, RallyError>;

    /// Delete one participant document.
    async fn remove_participant(&self, id: &str) -> Result<(), RallyError>;

    /// Ids of participants hosted on any of the given servers.
    async fn participants_on_servers(
        &self,
        server_ids: &[String],
    ) -> Result<Vec<String>, RallyError>;

    // --- call signals ---

    /// Atomically append `message` to the mailbox for the directed pair
    /// `(sender, target)`, creating the mailbox (stamped `created_at = now`)
    /// on first append.
    async fn append_signal(
        &self,
        sender: &str,
        target: &str,
        message: SignalMessage,
        now: DateTime,
    ) -> Result<(), RallyError>;

    /// All mailboxes targeting `target`.
    async fn signals_for_target(&self, target: &str) -> Result<Vec<SignalDoc>, RallyError>;

    /// Delete every mailbox the participant sent or received; returns the
    /// number deleted.
    async fn delete_signals_involving(&self, participant_id: &str) -> Result<u64, RallyError>;

    /// Delete mailboxes older than `cutoff` whose sender or target is no
    /// longer a live participant; returns the number deleted. Mailboxes
    /// younger than `cutoff` are never deleted regardless of liveness.
    async fn sweep_signals(&self, cutoff: DateTime) -> Result<u64, RallyError>;

    /// Subscribe to the call-relay event feed.
    fn call_events(&self) -> broadcast::Receiver<CallEvent>;
}
