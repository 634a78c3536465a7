//! Call signaling relay.
//!
//! Lets two participants in the same call negotiate a direct WebRTC peer
//! connection via server-relayed messages, and exposes live call membership.
//!
//! Presence: [`CallRelay::join`] inserts a `CallParticipant` tagged with the
//! caller's identity, tab, and hosting server id, and returns a live
//! subscription over the call's membership; leaving (or dropping the
//! subscription) deletes the participant and every signal mailbox it sent or
//! received.
//!
//! Messages: [`CallRelay::signal_peer`] atomically appends to the mailbox for
//! one directed pair. A user may only act as a participant it created
//! (checked against `createdBy`), which prevents eavesdropping on another
//! user's negotiation.

pub mod subscriptions;

use std::sync::Arc;

use mongodb::bson::DateTime;
use tracing::{info, instrument};

use crate::errors::RallyError;
use crate::liveness::LivenessRegistry;
use crate::observability::metrics;
use crate::store::documents::ParticipantDoc;
use crate::store::CoordStore;
use common::types::{new_id, SignalMessage};

pub use subscriptions::{CallJoinSubscription, CallParticipantEvent, SignalSubscription};

/// Read-only presence counts for one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallMetadata {
    /// Tabs currently in the call.
    pub participant_count: usize,
    /// Of those, how many are muted.
    pub muted_count: usize,
    /// Of those, how many are deafened.
    pub deafened_count: usize,
}

/// Server-side call signaling relay.
///
/// Cheap to clone; all state lives in the store.
#[derive(Clone)]
pub struct CallRelay {
    store: Arc<dyn CoordStore>,
    server_id: String,
}

impl CallRelay {
    /// Create a relay hosted by `server_id`.
    #[must_use]
    pub fn new(store: Arc<dyn CoordStore>, server_id: String) -> Self {
        Self { store, server_id }
    }

    /// Join a call: insert a participant for this user's tab and return a
    /// live membership subscription.
    ///
    /// # Errors
    ///
    /// Returns `RallyError::Database` on store failures.
    #[instrument(skip_all, fields(hunt = %hunt, call = %call, user = %user))]
    pub async fn join(
        &self,
        user: &str,
        hunt: &str,
        call: &str,
        tab: &str,
    ) -> Result<CallJoinSubscription, RallyError> {
        // Subscribe before the insert and snapshot so no membership event in
        // between is missed; duplicates are filtered against the snapshot.
        let events = self.store.call_events();

        let participant = ParticipantDoc {
            id: new_id(),
            hunt: hunt.to_string(),
            call: call.to_string(),
            tab: tab.to_string(),
            server: self.server_id.clone(),
            created_by: user.to_string(),
            muted: false,
            deafened: false,
            deleted: false,
        };
        self.store.insert_participant(participant.clone()).await?;

        let snapshot = self.store.participants_in_call(hunt, call).await?;

        info!(
            target: "rally.relay",
            hunt = %hunt,
            call = %call,
            participant = %participant.id,
            "Participant joined call"
        );
        metrics::record_participant_joined();

        Ok(CallJoinSubscription::new(
            Arc::clone(&self.store),
            participant,
            snapshot,
            events,
        ))
    }

    /// Read-only presence counts for one call.
    pub async fn metadata(&self, hunt: &str, call: &str) -> Result<CallMetadata, RallyError> {
        let participants = self.store.participants_in_call(hunt, call).await?;
        Ok(CallMetadata {
            participant_count: participants.len(),
            muted_count: participants.iter().filter(|p| p.muted).count(),
            deafened_count: participants.iter().filter(|p| p.deafened).count(),
        })
    }

    /// Relay one signaling message from `self_id` to `peer_id`.
    ///
    /// Appends atomically to the `(sender = self_id, target = peer_id)`
    /// mailbox, creating it on first append. Order within the mailbox is
    /// server receipt order; the two directions of a negotiation are
    /// independent documents with no relative ordering.
    ///
    /// # Errors
    ///
    /// - `RallyError::ParticipantNotFound` if either participant is unknown
    /// - `RallyError::NotOwner` if `self_id` was not created by `user`
    #[instrument(skip_all, fields(sender = %self_id, target = %peer_id))]
    pub async fn signal_peer(
        &self,
        user: &str,
        self_id: &str,
        peer_id: &str,
        message: SignalMessage,
    ) -> Result<(), RallyError> {
        self.owned_participant(user, self_id).await?;
        self.store
            .find_participant(peer_id)
            .await?
            .ok_or_else(|| RallyError::ParticipantNotFound(peer_id.to_string()))?;

        self.store
            .append_signal(self_id, peer_id, message, DateTime::now())
            .await?;
        metrics::record_signal_relayed();
        Ok(())
    }

    /// Subscribe to the signal mailboxes targeting `participant_id`.
    ///
    /// # Errors
    ///
    /// - `RallyError::ParticipantNotFound` if the participant is unknown
    /// - `RallyError::NotOwner` if the participant was not created by `user`
    pub async fn signal_subscription(
        &self,
        user: &str,
        participant_id: &str,
    ) -> Result<SignalSubscription, RallyError> {
        self.owned_participant(user, participant_id).await?;

        let events = self.store.call_events();
        let snapshot = self.store.signals_for_target(participant_id).await?;
        Ok(SignalSubscription::new(
            participant_id.to_string(),
            snapshot,
            events,
        ))
    }

    /// Set the muted flag on one of the caller's participants.
    pub async fn set_muted(
        &self,
        user: &str,
        participant_id: &str,
        muted: bool,
    ) -> Result<(), RallyError> {
        let participant = self.owned_participant(user, participant_id).await?;
        self.store
            .update_participant_flags(participant_id, muted, participant.deafened)
            .await?;
        Ok(())
    }

    /// Set the deafened flag on one of the caller's participants.
    pub async fn set_deafened(
        &self,
        user: &str,
        participant_id: &str,
        deafened: bool,
    ) -> Result<(), RallyError> {
        let participant = self.owned_participant(user, participant_id).await?;
        self.store
            .update_participant_flags(participant_id, participant.muted, deafened)
            .await?;
        Ok(())
    }

    /// Fetch a participant and verify `user` created it.
    async fn owned_participant(
        &self,
        user: &str,
        participant_id: &str,
    ) -> Result<ParticipantDoc, RallyError> {
        let participant = self
            .store
            .find_participant(participant_id)
            .await?
            .ok_or_else(|| RallyError::ParticipantNotFound(participant_id.to_string()))?;
        if participant.created_by != user {
            return Err(RallyError::NotOwner(participant_id.to_string()));
        }
        Ok(participant)
    }
}

/// Wire dead-server cleanup of orphaned call participants.
///
/// Participants are tagged with their hosting server; when the liveness sweep
/// reaps a server, this hook removes the participants that server hosted
/// (and their signal mailboxes), so crashed processes do not leave ghosts in
/// call membership. Independent of the age-based signal sweep.
pub fn register_participant_cleanup(registry: &LivenessRegistry, store: Arc<dyn CoordStore>) {
    registry.register_cleanup_hook(move |dead_servers| {
        let store = Arc::clone(&store);
        async move {
            let orphaned = store.participants_on_servers(&dead_servers).await?;
            if orphaned.is_empty() {
                return Ok(());
            }
            for participant_id in &orphaned {
                store.remove_participant(participant_id).await?;
                store.delete_signals_involving(participant_id).await?;
            }
            info!(
                target: "rally.relay",
                orphaned_count = orphaned.len(),
                dead_servers = ?dead_servers,
                "Removed call participants orphaned by dead servers"
            );
            Ok(())
        }
    });
}
