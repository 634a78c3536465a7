//! In-memory implementation of `CoordStore` for testing.
//!
//! Mirrors the MongoDB store's atomic semantics - unique-name lock insert,
//! conditional renew/preempt matching `(id, renewedAt)`, upsert-by-id
//! heartbeats, atomic mailbox append - and feeds the same broadcast channels
//! the change-stream pumps feed in production, so lock wakeups and call
//! subscriptions behave identically in tests.
//!
//! Seeding helpers write documents with arbitrary timestamps directly, which
//! is how staleness and preemption scenarios are constructed without waiting
//! out real TTLs.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use mongodb::bson::DateTime;
use tokio::sync::broadcast;

use common::types::{new_id, SignalMessage};
use rally_service::errors::RallyError;
use rally_service::store::documents::{LockDoc, ParticipantDoc, SignalDoc};
use rally_service::store::{CallEvent, CoordStore, EVENT_CHANNEL_CAPACITY};

/// In-memory coordination store.
#[derive(Clone)]
pub struct MemoryCoordStore {
    inner: Arc<Mutex<Inner>>,
    lock_removals_tx: broadcast::Sender<String>,
    call_events_tx: broadcast::Sender<CallEvent>,
}

#[derive(Default)]
struct Inner {
    /// Lock documents keyed by name (the unique index).
    locks: HashMap<String, LockDoc>,
    /// Server heartbeats keyed by server id.
    servers: HashMap<String, DateTime>,
    /// Participants keyed by id.
    participants: HashMap<String, ParticipantDoc>,
    /// Signal mailboxes keyed by (sender, target).
    signals: HashMap<(String, String), SignalDoc>,
}

impl Default for MemoryCoordStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCoordStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        let (lock_removals_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (call_events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            lock_removals_tx,
            call_events_tx,
        }
    }

    // --- seeding and inspection helpers ---

    /// Seed a lock document with explicit timestamps (e.g., an expired
    /// lease). Returns the document.
    pub fn seed_lock(
        &self,
        name: &str,
        created_at: DateTime,
        renewed_at: Option<DateTime>,
    ) -> LockDoc {
        let lock = LockDoc {
            id: new_id(),
            name: name.to_string(),
            created_at,
            renewed_at,
        };
        let mut inner = self.inner.lock().unwrap();
        inner.locks.insert(name.to_string(), lock.clone());
        lock
    }

    /// Current lock document for `name`, if any.
    pub fn get_lock(&self, name: &str) -> Option<LockDoc> {
        self.inner.lock().unwrap().locks.get(name).cloned()
    }

    /// Seed a server heartbeat with an explicit timestamp.
    pub fn seed_server(&self, server_id: &str, updated_at: DateTime) {
        self.inner
            .lock()
            .unwrap()
            .servers
            .insert(server_id.to_string(), updated_at);
    }

    /// All server ids currently recorded.
    pub fn server_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.lock().unwrap().servers.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Heartbeat timestamp for one server.
    pub fn server_heartbeat(&self, server_id: &str) -> Option<DateTime> {
        self.inner.lock().unwrap().servers.get(server_id).copied()
    }

    /// Seed a full signal mailbox (e.g., with an old `created_at` for sweep
    /// tests).
    pub fn seed_signal(&self, doc: SignalDoc) {
        let mut inner = self.inner.lock().unwrap();
        inner
            .signals
            .insert((doc.sender.clone(), doc.target.clone()), doc);
    }

    /// The mailbox for one directed pair, if any.
    pub fn get_signal(&self, sender: &str, target: &str) -> Option<SignalDoc> {
        self.inner
            .lock()
            .unwrap()
            .signals
            .get(&(sender.to_string(), target.to_string()))
            .cloned()
    }

    /// Total number of signal mailboxes.
    pub fn signal_count(&self) -> usize {
        self.inner.lock().unwrap().signals.len()
    }

    /// All participant ids currently stored.
    pub fn participant_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .inner
            .lock()
            .unwrap()
            .participants
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }
}

#[async_trait]
impl CoordStore for MemoryCoordStore {
    async fn try_insert_lock(
        &self,
        name: &str,
        now: DateTime,
    ) -> Result<Option<LockDoc>, RallyError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.locks.contains_key(name) {
            return Ok(None);
        }
        let lock = LockDoc {
            id: new_id(),
            name: name.to_string(),
            created_at: now,
            renewed_at: None,
        };
        inner.locks.insert(name.to_string(), lock.clone());
        Ok(Some(lock))
    }

    async fn find_lock(&self, name: &str) -> Result<Option<LockDoc>, RallyError> {
        Ok(self.get_lock(name))
    }

    async fn renew_lock(
        &self,
        id: &str,
        expected_renewed_at: Option<DateTime>,
        now: DateTime,
    ) -> Result<bool, RallyError> {
        let mut inner = self.inner.lock().unwrap();
        match inner
            .locks
            .values_mut()
            .find(|lock| lock.id == id && lock.renewed_at == expected_renewed_at)
        {
            Some(lock) => {
                lock.renewed_at = Some(now);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn preempt_lock(
        &self,
        id: &str,
        expected_renewed_at: Option<DateTime>,
    ) -> Result<bool, RallyError> {
        let removed = {
            let mut inner = self.inner.lock().unwrap();
            let name = inner
                .locks
                .iter()
                .find(|(_, lock)| lock.id == id && lock.renewed_at == expected_renewed_at)
                .map(|(name, _)| name.clone());
            match name {
                Some(name) => {
                    inner.locks.remove(&name);
                    true
                }
                None => false,
            }
        };
        if removed {
            let _ = self.lock_removals_tx.send(id.to_string());
        }
        Ok(removed)
    }

    async fn release_lock(&self, id: &str) -> Result<(), RallyError> {
        let removed = {
            let mut inner = self.inner.lock().unwrap();
            let name = inner
                .locks
                .iter()
                .find(|(_, lock)| lock.id == id)
                .map(|(name, _)| name.clone());
            match name {
                Some(name) => {
                    inner.locks.remove(&name);
                    true
                }
                None => false,
            }
        };
        if removed {
            let _ = self.lock_removals_tx.send(id.to_string());
        }
        Ok(())
    }

    fn lock_removals(&self) -> broadcast::Receiver<String> {
        self.lock_removals_tx.subscribe()
    }

    async fn heartbeat_server(&self, server_id: &str, now: DateTime) -> Result<(), RallyError> {
        self.inner
            .lock()
            .unwrap()
            .servers
            .insert(server_id.to_string(), now);
        Ok(())
    }

    async fn stale_servers(&self, cutoff: DateTime) -> Result<Vec<String>, RallyError> {
        let inner = self.inner.lock().unwrap();
        let mut stale: Vec<String> = inner
            .servers
            .iter()
            .filter(|(_, updated_at)| **updated_at < cutoff)
            .map(|(id, _)| id.clone())
            .collect();
        stale.sort();
        Ok(stale)
    }

    async fn delete_servers(&self, ids: &[String]) -> Result<u64, RallyError> {
        let mut inner = self.inner.lock().unwrap();
        let mut deleted = 0;
        for id in ids {
            if inner.servers.remove(id).is_some() {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    async fn insert_participant(&self, doc: ParticipantDoc) -> Result<(), RallyError> {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.participants.contains_key(&doc.id) {
                return Err(RallyError::Database(format!(
                    "duplicate participant id: {}",
                    doc.id
                )));
            }
            inner.participants.insert(doc.id.clone(), doc.clone());
        }
        let _ = self.call_events_tx.send(CallEvent::ParticipantAdded(doc));
        Ok(())
    }

    async fn find_participant(&self, id: &str) -> Result<Option<ParticipantDoc>, RallyError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .participants
            .get(id)
            .filter(|p| !p.deleted)
            .cloned())
    }

    async fn participants_in_call(
        &self,
        hunt: &str,
        call: &str,
    ) -> Result<Vec<ParticipantDoc>, RallyError> {
        let inner = self.inner.lock().unwrap();
        let mut participants: Vec<ParticipantDoc> = inner
            .participants
            .values()
            .filter(|p| p.hunt == hunt && p.call == call && !p.deleted)
            .cloned()
            .collect();
        participants.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(participants)
    }

    async fn update_participant_flags(
        &self,
        id: &str,
        muted: bool,
        deafened: bool,
    ) -> Result<bool, RallyError> {
        let updated = {
            let mut inner = self.inner.lock().unwrap();
            match inner.participants.get_mut(id) {
                Some(participant) => {
                    participant.muted = muted;
                    participant.deafened = deafened;
                    Some(participant.clone())
                }
                None => None,
            }
        };
        match updated {
            Some(doc) => {
                let _ = self.call_events_tx.send(CallEvent::ParticipantChanged(doc));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn remove_participant(&self, id: &str) -> Result<(), RallyError> {
        let removed = self.inner.lock().unwrap().participants.remove(id).is_some();
        if removed {
            let _ = self.call_events_tx.send(CallEvent::ParticipantRemoved {
                id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn participants_on_servers(
        &self,
        server_ids: &[String],
    ) -> Result<Vec<String>, RallyError> {
        let inner = self.inner.lock().unwrap();
        let mut ids: Vec<String> = inner
            .participants
            .values()
            .filter(|p| server_ids.contains(&p.server))
            .map(|p| p.id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn append_signal(
        &self,
        sender: &str,
        target: &str,
        message: SignalMessage,
        now: DateTime,
    ) -> Result<(), RallyError> {
        let doc = {
            let mut inner = self.inner.lock().unwrap();
            let key = (sender.to_string(), target.to_string());
            let doc = inner.signals.entry(key).or_insert_with(|| SignalDoc {
                id: new_id(),
                sender: sender.to_string(),
                target: target.to_string(),
                messages: Vec::new(),
                created_at: now,
            });
            doc.messages.push(message);
            doc.clone()
        };
        let _ = self.call_events_tx.send(CallEvent::SignalUpserted(doc));
        Ok(())
    }

    async fn signals_for_target(&self, target: &str) -> Result<Vec<SignalDoc>, RallyError> {
        let inner = self.inner.lock().unwrap();
        let mut signals: Vec<SignalDoc> = inner
            .signals
            .values()
            .filter(|s| s.target == target)
            .cloned()
            .collect();
        signals.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(signals)
    }

    async fn delete_signals_involving(&self, participant_id: &str) -> Result<u64, RallyError> {
        let removed: Vec<SignalDoc> = {
            let mut inner = self.inner.lock().unwrap();
            let keys: Vec<(String, String)> = inner
                .signals
                .values()
                .filter(|s| s.sender == participant_id || s.target == participant_id)
                .map(|s| (s.sender.clone(), s.target.clone()))
                .collect();
            keys.iter()
                .filter_map(|key| inner.signals.remove(key))
                .collect()
        };
        for doc in &removed {
            let _ = self
                .call_events_tx
                .send(CallEvent::SignalRemoved { id: doc.id.clone() });
        }
        Ok(removed.len() as u64)
    }

    async fn sweep_signals(&self, cutoff: DateTime) -> Result<u64, RallyError> {
        let removed: Vec<SignalDoc> = {
            let mut inner = self.inner.lock().unwrap();
            let keys: Vec<(String, String)> = inner
                .signals
                .values()
                .filter(|s| {
                    s.created_at < cutoff
                        && (!inner.participants.contains_key(&s.sender)
                            || !inner.participants.contains_key(&s.target))
                })
                .map(|s| (s.sender.clone(), s.target.clone()))
                .collect();
            keys.iter()
                .filter_map(|key| inner.signals.remove(key))
                .collect()
        };
        for doc in &removed {
            let _ = self
                .call_events_tx
                .send(CallEvent::SignalRemoved { id: doc.id.clone() });
        }
        Ok(removed.len() as u64)
    }

    fn call_events(&self) -> broadcast::Receiver<CallEvent> {
        self.call_events_tx.subscribe()
    }
}
