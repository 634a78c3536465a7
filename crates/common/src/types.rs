//! Common data types for Rally components.
//!
//! Identifiers (server, participant, hunt, call, tab, user) are opaque
//! strings: the relay never interprets them, only compares and partitions by
//! them. Signaling payloads are the one wire format shared between the
//! server-side relay and the client-side negotiation state machine.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of a relayed signaling message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalKind {
    /// Session description (offer or answer).
    #[serde(rename = "sdp")]
    Sdp,
    /// ICE candidate; `content` of `None` means "no more candidates".
    #[serde(rename = "iceCandidate")]
    IceCandidate,
}

/// One signaling message relayed between two call participants.
///
/// Messages are append-only within a directed pair's mailbox; order within a
/// mailbox is server receipt order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalMessage {
    /// Message kind.
    #[serde(rename = "type")]
    pub kind: SignalKind,
    /// Serialized payload: an SDP blob for `Sdp`, candidate JSON for
    /// `IceCandidate` (or `None` for end-of-candidates).
    pub content: Option<String>,
}

impl SignalMessage {
    /// Build an SDP message.
    #[must_use]
    pub fn sdp(description: impl Into<String>) -> Self {
        Self {
            kind: SignalKind::Sdp,
            content: Some(description.into()),
        }
    }

    /// Build an ICE candidate message.
    #[must_use]
    pub fn ice_candidate(candidate: Option<String>) -> Self {
        Self {
            kind: SignalKind::IceCandidate,
            content: candidate,
        }
    }
}

/// Generate a fresh opaque document id.
///
/// Participant and signal documents use random UUIDs as their string `_id`;
/// the lexicographic ordering of these ids also decides negotiation roles.
#[must_use]
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}
