//! Document types for the Rally coordination collections.
//!
//! All documents serialize to BSON with camelCase field names and string
//! `_id` values. Timestamps are BSON datetimes.

use common::types::SignalMessage;
use mongodb::bson::DateTime;
use serde::{Deserialize, Serialize};

/// A held (or contended) fleet-wide lock.
///
/// At most one live document exists per `name` at any instant, enforced by a
/// unique index; a duplicate insert fails atomically. The document is created
/// on first acquire, renewed in place while held, and deleted on release or
/// preemption.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockDoc {
    #[serde(rename = "_id")]
    pub id: String,
    pub name: String,
    pub created_at: DateTime,
    /// Absent until the first renewal. The lease window is measured from
    /// `renewed_at` when present, else `created_at`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub renewed_at: Option<DateTime>,
}

impl LockDoc {
    /// Start of the current lease window.
    #[must_use]
    pub fn lease_start(&self) -> DateTime {
        self.renewed_at.unwrap_or(self.created_at)
    }
}

/// Heartbeat record for one running server process.
///
/// Upserted by its owner on every heartbeat; deleted by any process's sweep
/// once `updated_at` is older than the server TTL.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerDoc {
    #[serde(rename = "_id")]
    pub id: String,
    pub updated_at: DateTime,
}

/// One browser tab currently in a call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantDoc {
    #[serde(rename = "_id")]
    pub id: String,
    pub hunt: String,
    pub call: String,
    pub tab: String,
    /// Server process hosting this participant's subscription.
    pub server: String,
    pub created_by: String,
    pub muted: bool,
    pub deafened: bool,
    pub deleted: bool,
}

/// Ordered signal mailbox for one *directed* pair of participants.
///
/// One document per (sender, target); `messages` grows by atomic append only,
/// so order within a document is server receipt order. There is no ordering
/// guarantee between the two directions of a negotiation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalDoc {
    #[serde(rename = "_id")]
    pub id: String,
    pub sender: String,
    pub target: String,
    pub messages: Vec<SignalMessage>,
    pub created_at: DateTime,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use common::types::SignalKind;

    #[test]
    fn test_lock_doc_lease_start_prefers_renewed_at() {
        let created = DateTime::from_millis(1_000);
        let renewed = DateTime::from_millis(5_000);

        let mut lock = LockDoc {
            id: "l-1".to_string(),
            name: "drive:hunt1".to_string(),
            created_at: created,
            renewed_at: None,
        };
        assert_eq!(lock.lease_start(), created);

        lock.renewed_at = Some(renewed);
        assert_eq!(lock.lease_start(), renewed);
    }

    #[test]
    fn test_participant_doc_bson_field_names() {
        let doc = ParticipantDoc {
            id: "p-1".to_string(),
            hunt: "hunt1".to_string(),
            call: "puzzle1".to_string(),
            tab: "tab-1".to_string(),
            server: "rally-a".to_string(),
            created_by: "user-1".to_string(),
            muted: false,
            deafened: false,
            deleted: false,
        };

        let bson = mongodb::bson::to_document(&doc).unwrap();
        assert_eq!(bson.get_str("_id").unwrap(), "p-1");
        assert_eq!(bson.get_str("createdBy").unwrap(), "user-1");
        assert!(!bson.get_bool("deafened").unwrap());
    }

    #[test]
    fn test_signal_doc_message_wire_format() {
        let doc = SignalDoc {
            id: "s-1".to_string(),
            sender: "p-1".to_string(),
            target: "p-2".to_string(),
            messages: vec![SignalMessage::sdp("v=0"), SignalMessage::ice_candidate(None)],
            created_at: DateTime::from_millis(1_000),
        };

        let bson = mongodb::bson::to_document(&doc).unwrap();
        let messages = bson.get_array("messages").unwrap();
        assert_eq!(messages.len(), 2);

        let first = messages[0].as_document().unwrap();
        assert_eq!(first.get_str("type").unwrap(), "sdp");

        let second = messages[1].as_document().unwrap();
        assert_eq!(second.get_str("type").unwrap(), "iceCandidate");
        assert!(second.get("content").unwrap().as_null().is_some());

        let round_trip: SignalDoc = mongodb::bson::from_document(bson).unwrap();
        assert_eq!(round_trip.messages[0].kind, SignalKind::Sdp);
        assert_eq!(round_trip.messages[1].content, None);
    }
}
