//! Live subscriptions over call membership and signal mailboxes.
//!
//! A subscription is a snapshot plus a filtered event feed - the observable
//! contract of a reactive cursor: inserts/updates carry full documents,
//! removals carry the document id. Subscribers that fall behind the broadcast
//! channel resynchronize from a fresh snapshot and emit the membership diff.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::errors::RallyError;
use crate::store::documents::{ParticipantDoc, SignalDoc};
use crate::store::{CallEvent, CoordStore};

/// A membership change in one call.
#[derive(Debug, Clone)]
pub enum CallParticipantEvent {
    /// A participant joined the call.
    Joined(ParticipantDoc),
    /// A participant's flags changed (mute/deafen).
    Updated(ParticipantDoc),
    /// A participant left the call.
    Left {
        /// Id of the departed participant.
        id: String,
    },
}

/// Live membership subscription for one `(hunt, call)`, created by
/// [`crate::relay::CallRelay::join`].
///
/// Holds this tab's own participant registration: call
/// [`CallJoinSubscription::leave`] to unregister, or drop the subscription to
/// schedule the same teardown best-effort. The remote side of any negotiation
/// observes departure only through ICE/connection-state transitions, never an
/// explicit teardown message.
pub struct CallJoinSubscription {
    store: Arc<dyn CoordStore>,
    participant: ParticipantDoc,
    snapshot: Vec<ParticipantDoc>,
    members: HashSet<String>,
    events: broadcast::Receiver<CallEvent>,
    pending: VecDeque<CallParticipantEvent>,
    left: bool,
}

impl CallJoinSubscription {
    pub(crate) fn new(
        store: Arc<dyn CoordStore>,
        participant: ParticipantDoc,
        snapshot: Vec<ParticipantDoc>,
        events: broadcast::Receiver<CallEvent>,
    ) -> Self {
        let members = snapshot.iter().map(|p| p.id.clone()).collect();
        Self {
            store,
            participant,
            snapshot,
            members,
            events,
            pending: VecDeque::new(),
            left: false,
        }
    }

    /// This tab's own participant document.
    #[must_use]
    pub fn participant(&self) -> &ParticipantDoc {
        &self.participant
    }

    /// Membership snapshot taken at join time (includes self).
    #[must_use]
    pub fn participants(&self) -> &[ParticipantDoc] {
        &self.snapshot
    }

    /// Next membership change for this call.
    ///
    /// Returns `None` when the event feed has shut down. Events for other
    /// calls are filtered out; duplicates against the snapshot are suppressed.
    pub async fn next_event(&mut self) -> Option<CallParticipantEvent> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(event);
            }

            let received = self.events.recv().await;
            match received {
                Ok(CallEvent::ParticipantAdded(doc)) => {
                    if self.is_in_call(&doc) && self.members.insert(doc.id.clone()) {
                        return Some(CallParticipantEvent::Joined(doc));
                    }
                }
                Ok(CallEvent::ParticipantChanged(doc)) => {
                    if self.members.contains(&doc.id) {
                        return Some(CallParticipantEvent::Updated(doc));
                    }
                }
                Ok(CallEvent::ParticipantRemoved { id }) => {
                    if self.members.remove(&id) {
                        return Some(CallParticipantEvent::Left { id });
                    }
                }
                Ok(CallEvent::SignalUpserted(_) | CallEvent::SignalRemoved { .. }) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(
                        target: "rally.relay",
                        call = %self.participant.call,
                        skipped,
                        "Membership feed lagged, resynchronizing from snapshot"
                    );
                    self.resync().await;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    fn is_in_call(&self, doc: &ParticipantDoc) -> bool {
        doc.hunt == self.participant.hunt && doc.call == self.participant.call && !doc.deleted
    }

    /// Re-read membership and queue the diff as Joined/Left events.
    async fn resync(&mut self) {
        let fresh = match self
            .store
            .participants_in_call(&self.participant.hunt, &self.participant.call)
            .await
        {
            Ok(fresh) => fresh,
            Err(e) => {
                warn!(
                    target: "rally.relay",
                    error = %e,
                    "Resync read failed, keeping stale membership"
                );
                return;
            }
        };

        let fresh_ids: HashSet<String> = fresh.iter().map(|p| p.id.clone()).collect();
        let departed: Vec<String> = self.members.difference(&fresh_ids).cloned().collect();
        for id in departed {
            self.members.remove(&id);
            self.pending.push_back(CallParticipantEvent::Left { id });
        }
        for doc in fresh {
            if self.members.insert(doc.id.clone()) {
                self.pending.push_back(CallParticipantEvent::Joined(doc));
            }
        }
    }

    /// Leave the call: delete this participant and cascade-delete every
    /// signal mailbox it sent or received.
    ///
    /// # Errors
    ///
    /// Returns `RallyError::Database` on store failures; the periodic sweeps
    /// will finish any partial teardown.
    pub async fn leave(mut self) -> Result<(), RallyError> {
        self.left = true;
        let id = self.participant.id.clone();
        debug!(
            target: "rally.relay",
            participant = %id,
            call = %self.participant.call,
            "Participant leaving call"
        );
        teardown(&self.store, &id).await
    }
}

impl Drop for CallJoinSubscription {
    fn drop(&mut self) {
        // Reached with `left` unset when the subscription was dropped without
        // an explicit leave; schedule the same teardown best-effort.
        if !self.left {
            let store = Arc::clone(&self.store);
            let id = self.participant.id.clone();
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                runtime.spawn(async move {
                    let _ = teardown(&store, &id).await;
                });
            }
        }
    }
}

async fn teardown(store: &Arc<dyn CoordStore>, participant_id: &str) -> Result<(), RallyError> {
    store.remove_participant(participant_id).await?;
    store.delete_signals_involving(participant_id).await?;
    Ok(())
}

/// Live subscription over the signal mailboxes targeting one participant,
/// created by [`crate::relay::CallRelay::signal_subscription`].
///
/// Each update delivers the full mailbox document; the consumer tracks how
/// many messages it has already processed and only acts on the new suffix.
pub struct SignalSubscription {
    target: String,
    snapshot: Vec<SignalDoc>,
    events: broadcast::Receiver<CallEvent>,
}

impl SignalSubscription {
    pub(crate) fn new(
        target: String,
        snapshot: Vec<SignalDoc>,
        events: broadcast::Receiver<CallEvent>,
    ) -> Self {
        Self {
            target,
            snapshot,
            events,
        }
    }

    /// Mailboxes already targeting this participant at subscribe time.
    #[must_use]
    pub fn snapshot(&self) -> &[SignalDoc] {
        &self.snapshot
    }

    /// Next mailbox update targeting this participant.
    ///
    /// Returns `None` when the event feed has shut down.
    pub async fn next(&mut self) -> Option<SignalDoc> {
        loop {
            let received = self.events.recv().await;
            match received {
                Ok(CallEvent::SignalUpserted(doc)) => {
                    if doc.target == self.target {
                        return Some(doc);
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    // Safe to continue: the next upsert delivers the full
                    // mailbox, and suffix tracking absorbs the gap.
                    warn!(
                        target: "rally.relay",
                        target_participant = %self.target,
                        skipped,
                        "Signal feed lagged"
                    );
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
