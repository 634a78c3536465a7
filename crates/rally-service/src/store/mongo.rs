//! MongoDB-backed implementation of [`CoordStore`].
//!
//! Collections:
//!
//! - `locks` - unique index on `name`; duplicate insert is the mutual
//!   exclusion primitive
//! - `servers` - heartbeat records keyed by server id
//! - `callParticipants` - index on `(hunt, call)`
//! - `callSignals` - unique index on `(sender, target)`; `$push` is the
//!   ordered-append primitive
//!
//! # Change-stream pumps
//!
//! Lock-removal wakeups and the call-relay event feed are broadcast channels
//! fed by change-stream pump tasks spawned at connect time. A pump failure
//! (standalone server without an oplog, transient disconnect) degrades
//! push wakeups to timer-driven retries; it never affects correctness of the
//! atomic write path. Pumps retry with a fixed backoff until cancelled.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use mongodb::bson::{doc, Bson, DateTime, Document};
use mongodb::change_stream::event::{ChangeStreamEvent, OperationType};
use mongodb::options::{FullDocumentType, IndexOptions};
use mongodb::{Client, Collection, Database, IndexModel};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::Config;
use crate::errors::RallyError;
use crate::observability::metrics;
use crate::store::documents::{LockDoc, ParticipantDoc, ServerDoc, SignalDoc};
use crate::store::{CallEvent, CoordStore, EVENT_CHANNEL_CAPACITY};
use common::secret::ExposeSecret;
use common::types::{new_id, SignalMessage};

/// Backoff between change-stream reconnect attempts.
const PUMP_RETRY_BACKOFF: Duration = Duration::from_secs(5);

/// Attempts for the append-signal upsert race (concurrent first appends to
/// the same missing mailbox can collide on the unique index).
const APPEND_SIGNAL_ATTEMPTS: usize = 3;

/// MongoDB error code for duplicate key violations.
const DUPLICATE_KEY_CODE: i32 = 11000;

/// MongoDB-backed coordination store.
///
/// Cheap to clone: the underlying `mongodb::Client` is designed to be shared
/// across tasks without locking.
#[derive(Clone)]
pub struct MongoCoordStore {
    locks: Collection<LockDoc>,
    servers: Collection<ServerDoc>,
    participants: Collection<ParticipantDoc>,
    signals: Collection<SignalDoc>,
    lock_removals_tx: broadcast::Sender<String>,
    call_events_tx: broadcast::Sender<CallEvent>,
}

impl MongoCoordStore {
    /// Connect to MongoDB, ensure indexes, and spawn the change-stream pumps.
    ///
    /// # Errors
    ///
    /// Returns `RallyError::Database` if the connection or index creation
    /// fails. Pump startup failures are not errors (see module docs).
    pub async fn connect(config: &Config, cancel_token: CancellationToken) -> Result<Self, RallyError> {
        let client = Client::with_uri_str(config.mongodb_url.expose_secret())
            .await
            .map_err(|e| {
                // Do NOT log the URL: it may contain credentials
                error!(
                    target: "rally.store.mongo",
                    error = %e,
                    "Failed to connect to MongoDB"
                );
                RallyError::Database(format!("Failed to connect to MongoDB: {e}"))
            })?;

        let db = client.database(&config.database);
        let store = Self::from_database(&db);
        store.ensure_indexes(&db).await?;
        store.spawn_pumps(cancel_token);

        info!(
            target: "rally.store.mongo",
            database = %config.database,
            "MongoDB store initialized"
        );

        Ok(store)
    }

    fn from_database(db: &Database) -> Self {
        let (lock_removals_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (call_events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            locks: db.collection("locks"),
            servers: db.collection("servers"),
            participants: db.collection("callParticipants"),
            signals: db.collection("callSignals"),
            lock_removals_tx,
            call_events_tx,
        }
    }

    /// Create the indexes every invariant rests on. Idempotent.
    async fn ensure_indexes(&self, db: &Database) -> Result<(), RallyError> {
        let unique = |keys: Document| {
            IndexModel::builder()
                .keys(keys)
                .options(IndexOptions::builder().unique(true).build())
                .build()
        };

        self.locks.create_index(unique(doc! { "name": 1 })).await?;
        self.signals
            .create_index(unique(doc! { "sender": 1, "target": 1 }))
            .await?;
        self.participants
            .create_index(IndexModel::builder().keys(doc! { "hunt": 1, "call": 1 }).build())
            .await?;
        self.servers
            .create_index(IndexModel::builder().keys(doc! { "updatedAt": 1 }).build())
            .await?;
        self.signals
            .create_index(IndexModel::builder().keys(doc! { "createdAt": 1 }).build())
            .await?;

        debug!(target: "rally.store.mongo", database = %db.name(), "Indexes ensured");
        Ok(())
    }

    /// Spawn the change-stream pump tasks feeding the broadcast channels.
    fn spawn_pumps(&self, cancel_token: CancellationToken) {
        let locks = self.locks.clone();
        let removals_tx = self.lock_removals_tx.clone();
        let token = cancel_token.child_token();
        tokio::spawn(async move {
            run_lock_removal_pump(locks, removals_tx, token).await;
        });

        let participants = self.participants.clone();
        let events_tx = self.call_events_tx.clone();
        let token = cancel_token.child_token();
        tokio::spawn(async move {
            run_participant_pump(participants, events_tx, token).await;
        });

        let signals = self.signals.clone();
        let events_tx = self.call_events_tx.clone();
        let token = cancel_token.child_token();
        tokio::spawn(async move {
            run_signal_pump(signals, events_tx, token).await;
        });
    }
}

/// Whether a MongoDB error is a duplicate-key write failure.
fn is_duplicate_key(err: &mongodb::error::Error) -> bool {
    use mongodb::error::{ErrorKind, WriteFailure};
    match err.kind.as_ref() {
        ErrorKind::Write(WriteFailure::WriteError(write_error)) => {
            write_error.code == DUPLICATE_KEY_CODE
        }
        _ => false,
    }
}

#[async_trait]
impl CoordStore for MongoCoordStore {
    #[instrument(skip_all, fields(name = %name))]
    async fn try_insert_lock(
        &self,
        name: &str,
        now: DateTime,
    ) -> Result<Option<LockDoc>, RallyError> {
        let start = std::time::Instant::now();
        let lock = LockDoc {
            id: new_id(),
            name: name.to_string(),
            created_at: now,
            renewed_at: None,
        };

        let result = self.locks.insert_one(&lock).await;
        // Duplicate key is expected contention, not a store failure.
        let round_trip_ok = match &result {
            Ok(_) => true,
            Err(e) => is_duplicate_key(e),
        };
        metrics::record_store_op("try_insert_lock", round_trip_ok, start.elapsed());

        match result {
            Ok(_) => Ok(Some(lock)),
            Err(e) if is_duplicate_key(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn find_lock(&self, name: &str) -> Result<Option<LockDoc>, RallyError> {
        Ok(self.locks.find_one(doc! { "name": name }).await?)
    }

    async fn renew_lock(
        &self,
        id: &str,
        expected_renewed_at: Option<DateTime>,
        now: DateTime,
    ) -> Result<bool, RallyError> {
        // Match on the previously observed renewedAt; an absent field matches
        // Bson::Null.
        let expected = expected_renewed_at.map_or(Bson::Null, Bson::DateTime);
        let result = self
            .locks
            .update_one(
                doc! { "_id": id, "renewedAt": expected },
                doc! { "$set": { "renewedAt": now } },
            )
            .await?;
        Ok(result.matched_count == 1)
    }

    async fn preempt_lock(
        &self,
        id: &str,
        expected_renewed_at: Option<DateTime>,
    ) -> Result<bool, RallyError> {
        let expected = expected_renewed_at.map_or(Bson::Null, Bson::DateTime);
        let result = self
            .locks
            .delete_one(doc! { "_id": id, "renewedAt": expected })
            .await?;
        Ok(result.deleted_count == 1)
    }

    async fn release_lock(&self, id: &str) -> Result<(), RallyError> {
        self.locks.delete_one(doc! { "_id": id }).await?;
        Ok(())
    }

    fn lock_removals(&self) -> broadcast::Receiver<String> {
        self.lock_removals_tx.subscribe()
    }

    #[instrument(skip_all, fields(server_id = %server_id))]
    async fn heartbeat_server(&self, server_id: &str, now: DateTime) -> Result<(), RallyError> {
        let start = std::time::Instant::now();
        let result = self
            .servers
            .update_one(
                doc! { "_id": server_id },
                doc! { "$set": { "updatedAt": now } },
            )
            .upsert(true)
            .await;
        metrics::record_store_op("heartbeat_server", result.is_ok(), start.elapsed());
        result?;
        Ok(())
    }

    async fn stale_servers(&self, cutoff: DateTime) -> Result<Vec<String>, RallyError> {
        let mut cursor = self
            .servers
            .find(doc! { "updatedAt": { "$lt": cutoff } })
            .await?;
        let mut ids = Vec::new();
        while let Some(server) = cursor.next().await {
            ids.push(server?.id);
        }
        Ok(ids)
    }

    async fn delete_servers(&self, ids: &[String]) -> Result<u64, RallyError> {
        let result = self
            .servers
            .delete_many(doc! { "_id": { "$in": ids.to_vec() } })
            .await?;
        Ok(result.deleted_count)
    }

    async fn insert_participant(&self, participant: ParticipantDoc) -> Result<(), RallyError> {
        self.participants.insert_one(&participant).await?;
        Ok(())
    }

    async fn find_participant(&self, id: &str) -> Result<Option<ParticipantDoc>, RallyError> {
        Ok(self
            .participants
            .find_one(doc! { "_id": id, "deleted": false })
            .await?)
    }

    async fn participants_in_call(
        &self,
        hunt: &str,
        call: &str,
    ) -> Result<Vec<ParticipantDoc>, RallyError> {
        let mut cursor = self
            .participants
            .find(doc! { "hunt": hunt, "call": call, "deleted": false })
            .await?;
        let mut participants = Vec::new();
        while let Some(participant) = cursor.next().await {
            participants.push(participant?);
        }
        Ok(participants)
    }

    async fn update_participant_flags(
        &self,
        id: &str,
        muted: bool,
        deafened: bool,
    ) -> Result<bool, RallyError> {
        let result = self
            .participants
            .update_one(
                doc! { "_id": id },
                doc! { "$set": { "muted": muted, "deafened": deafened } },
            )
            .await?;
        Ok(result.matched_count == 1)
    }

    async fn remove_participant(&self, id: &str) -> Result<(), RallyError> {
        self.participants.delete_one(doc! { "_id": id }).await?;
        Ok(())
    }

    async fn participants_on_servers(
        &self,
        server_ids: &[String],
    ) -> Result<Vec<String>, RallyError> {
        let mut cursor = self
            .participants
            .find(doc! { "server": { "$in": server_ids.to_vec() } })
            .await?;
        let mut ids = Vec::new();
        while let Some(participant) = cursor.next().await {
            ids.push(participant?.id);
        }
        Ok(ids)
    }

    #[instrument(skip_all, fields(sender = %sender, target = %target))]
    async fn append_signal(
        &self,
        sender: &str,
        target: &str,
        message: SignalMessage,
        now: DateTime,
    ) -> Result<(), RallyError> {
        let start = std::time::Instant::now();
        let message_bson = mongodb::bson::to_bson(&message)
            .map_err(|e| RallyError::Internal(format!("signal serialization failed: {e}")))?;

        // First appends to the same missing mailbox can race on the unique
        // (sender, target) index; the loser's retry lands as a plain $push.
        let mut last_err = None;
        for _ in 0..APPEND_SIGNAL_ATTEMPTS {
            let result = self
                .signals
                .update_one(
                    doc! { "sender": sender, "target": target },
                    doc! {
                        "$push": { "messages": message_bson.clone() },
                        "$setOnInsert": { "_id": new_id(), "createdAt": now },
                    },
                )
                .upsert(true)
                .await;

            match result {
                Ok(_) => {
                    metrics::record_store_op("append_signal", true, start.elapsed());
                    return Ok(());
                }
                Err(e) if is_duplicate_key(&e) => {
                    last_err = Some(e);
                }
                Err(e) => {
                    metrics::record_store_op("append_signal", false, start.elapsed());
                    return Err(e.into());
                }
            }
        }

        metrics::record_store_op("append_signal", false, start.elapsed());
        Err(RallyError::Database(format!(
            "append_signal kept colliding on ({sender}, {target}): {}",
            last_err.map_or_else(|| "unknown".to_string(), |e| e.to_string())
        )))
    }

    async fn signals_for_target(&self, target: &str) -> Result<Vec<SignalDoc>, RallyError> {
        let mut cursor = self.signals.find(doc! { "target": target }).await?;
        let mut signals = Vec::new();
        while let Some(signal) = cursor.next().await {
            signals.push(signal?);
        }
        Ok(signals)
    }

    async fn delete_signals_involving(&self, participant_id: &str) -> Result<u64, RallyError> {
        let result = self
            .signals
            .delete_many(doc! {
                "$or": [ { "sender": participant_id }, { "target": participant_id } ],
            })
            .await?;
        Ok(result.deleted_count)
    }

    #[instrument(skip_all)]
    async fn sweep_signals(&self, cutoff: DateTime) -> Result<u64, RallyError> {
        let start = std::time::Instant::now();
        let live: Vec<Bson> = self.participants.distinct("_id", doc! {}).await?;

        let result = self
            .signals
            .delete_many(doc! {
                "createdAt": { "$lt": cutoff },
                "$or": [
                    { "sender": { "$nin": live.clone() } },
                    { "target": { "$nin": live } },
                ],
            })
            .await;
        metrics::record_store_op("sweep_signals", result.is_ok(), start.elapsed());
        Ok(result?.deleted_count)
    }

    fn call_events(&self) -> broadcast::Receiver<CallEvent> {
        self.call_events_tx.subscribe()
    }
}

/// Extract the string `_id` from a change event's document key.
fn document_key_id(key: Option<&Document>) -> Option<String> {
    key.and_then(|k| k.get_str("_id").ok()).map(String::from)
}

/// Pump lock deletions into the removal broadcast.
async fn run_lock_removal_pump(
    locks: Collection<LockDoc>,
    removals_tx: broadcast::Sender<String>,
    cancel_token: CancellationToken,
) {
    let pipeline = vec![doc! { "$match": { "operationType": "delete" } }];

    loop {
        let stream = tokio::select! {
            () = cancel_token.cancelled() => {
                info!(target: "rally.store.mongo", "Lock removal pump shutting down");
                return;
            }
            result = async { locks.watch().pipeline(pipeline.clone()).await } => result,
        };

        let mut stream = match stream {
            Ok(s) => s,
            Err(e) => {
                warn!(
                    target: "rally.store.mongo",
                    error = %e,
                    "Lock removal change stream unavailable, retrying"
                );
                tokio::select! {
                    () = cancel_token.cancelled() => return,
                    () = tokio::time::sleep(PUMP_RETRY_BACKOFF) => continue,
                }
            }
        };

        loop {
            let event: Option<Result<ChangeStreamEvent<LockDoc>, _>> = tokio::select! {
                () = cancel_token.cancelled() => {
                    info!(target: "rally.store.mongo", "Lock removal pump shutting down");
                    return;
                }
                event = stream.next() => event,
            };

            match event {
                Some(Ok(event)) => {
                    if let Some(id) = document_key_id(event.document_key.as_ref()) {
                        // Send fails only when no contender is waiting
                        let _ = removals_tx.send(id);
                    }
                }
                Some(Err(e)) => {
                    warn!(
                        target: "rally.store.mongo",
                        error = %e,
                        "Lock removal change stream error, reconnecting"
                    );
                    break;
                }
                None => break,
            }
        }
    }
}

/// Pump participant inserts/updates/deletes into the call event broadcast.
async fn run_participant_pump(
    participants: Collection<ParticipantDoc>,
    events_tx: broadcast::Sender<CallEvent>,
    cancel_token: CancellationToken,
) {
    run_call_event_pump(
        "participant",
        participants,
        events_tx,
        cancel_token,
        |event| match event.operation_type {
            OperationType::Insert => event.full_document.map(CallEvent::ParticipantAdded),
            OperationType::Update | OperationType::Replace => {
                event.full_document.map(CallEvent::ParticipantChanged)
            }
            OperationType::Delete => document_key_id(event.document_key.as_ref())
                .map(|id| CallEvent::ParticipantRemoved { id }),
            _ => None,
        },
    )
    .await;
}

/// Pump signal upserts/deletes into the call event broadcast.
async fn run_signal_pump(
    signals: Collection<SignalDoc>,
    events_tx: broadcast::Sender<CallEvent>,
    cancel_token: CancellationToken,
) {
    run_call_event_pump("signal", signals, events_tx, cancel_token, |event| {
        match event.operation_type {
            OperationType::Insert | OperationType::Update | OperationType::Replace => {
                event.full_document.map(CallEvent::SignalUpserted)
            }
            OperationType::Delete => {
                document_key_id(event.document_key.as_ref()).map(|id| CallEvent::SignalRemoved { id })
            }
            _ => None,
        }
    })
    .await;
}

/// Shared pump loop: watch a collection with update lookups, map events into
/// `CallEvent`s, reconnect with backoff on stream errors.
async fn run_call_event_pump<T, F>(
    entity: &'static str,
    collection: Collection<T>,
    events_tx: broadcast::Sender<CallEvent>,
    cancel_token: CancellationToken,
    map_event: F,
) where
    T: serde::de::DeserializeOwned + Unpin + Send + Sync + 'static,
    F: Fn(ChangeStreamEvent<T>) -> Option<CallEvent>,
{
    loop {
        let stream = tokio::select! {
            () = cancel_token.cancelled() => {
                info!(target: "rally.store.mongo", entity, "Call event pump shutting down");
                return;
            }
            result = async {
                collection
                    .watch()
                    .full_document(FullDocumentType::UpdateLookup)
                    .await
            } => result,
        };

        let mut stream = match stream {
            Ok(s) => s,
            Err(e) => {
                warn!(
                    target: "rally.store.mongo",
                    entity,
                    error = %e,
                    "Change stream unavailable, retrying"
                );
                tokio::select! {
                    () = cancel_token.cancelled() => return,
                    () = tokio::time::sleep(PUMP_RETRY_BACKOFF) => continue,
                }
            }
        };

        loop {
            let event = tokio::select! {
                () = cancel_token.cancelled() => {
                    info!(target: "rally.store.mongo", entity, "Call event pump shutting down");
                    return;
                }
                event = stream.next() => event,
            };

            match event {
                Some(Ok(event)) => {
                    if let Some(call_event) = map_event(event) {
                        let _ = events_tx.send(call_event);
                    }
                }
                Some(Err(e)) => {
                    warn!(
                        target: "rally.store.mongo",
                        entity,
                        error = %e,
                        "Change stream error, reconnecting"
                    );
                    break;
                }
                None => break,
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_document_key_id_extraction() {
        let key = doc! { "_id": "lock-1" };
        assert_eq!(document_key_id(Some(&key)), Some("lock-1".to_string()));
        assert_eq!(document_key_id(None), None);

        // Non-string ids (other collections' ObjectIds) are ignored
        let oid_key = doc! { "_id": mongodb::bson::oid::ObjectId::new() };
        assert_eq!(document_key_id(Some(&oid_key)), None);
    }
}
