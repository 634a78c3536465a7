//! Scripted peer connection engine and signal outboxes for negotiation
//! tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use common::types::SignalMessage;
use rally_client::errors::ClientError;
use rally_client::negotiation::{PeerConnection, SignalOutbox};
use rally_client::session::PeerConnectionFactory;
use rally_service::relay::CallRelay;

/// Observable state of a [`FakePeerConnection`].
#[derive(Debug, Default, Clone)]
pub struct FakePeerState {
    /// Last locally applied description.
    pub local_description: Option<String>,
    /// Last remotely applied description.
    pub remote_description: Option<String>,
    /// Remote ICE candidates received, in order (`None` = end marker).
    pub remote_candidates: Vec<Option<String>>,
    /// Offers created so far.
    pub offers_created: u32,
    /// Answers created so far.
    pub answers_created: u32,
    /// Whether the connection was closed.
    pub closed: bool,
}

/// Fake WebRTC engine that fabricates SDP blobs and records every call.
///
/// Clones share state, so tests can keep a handle for inspection after
/// moving the connection into a negotiation.
#[derive(Clone)]
pub struct FakePeerConnection {
    label: String,
    state: Arc<Mutex<FakePeerState>>,
}

impl FakePeerConnection {
    /// Create an engine labelled `label` (labels end up inside fabricated
    /// SDP blobs, making assertions readable).
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            state: Arc::new(Mutex::new(FakePeerState::default())),
        }
    }

    /// Snapshot of the recorded state.
    pub fn state(&self) -> FakePeerState {
        self.state.lock().unwrap().clone()
    }
}

#[async_trait]
impl PeerConnection for FakePeerConnection {
    async fn create_offer(&mut self) -> Result<String, ClientError> {
        let mut state = self.state.lock().unwrap();
        state.offers_created += 1;
        Ok(format!("offer:{}:{}", self.label, state.offers_created))
    }

    async fn create_answer(&mut self) -> Result<String, ClientError> {
        let mut state = self.state.lock().unwrap();
        if state.remote_description.is_none() {
            return Err(ClientError::Engine(
                "create_answer without remote description".to_string(),
            ));
        }
        state.answers_created += 1;
        Ok(format!("answer:{}:{}", self.label, state.answers_created))
    }

    async fn set_local_description(&mut self, sdp: &str) -> Result<(), ClientError> {
        self.state.lock().unwrap().local_description = Some(sdp.to_string());
        Ok(())
    }

    async fn set_remote_description(&mut self, sdp: &str) -> Result<(), ClientError> {
        self.state.lock().unwrap().remote_description = Some(sdp.to_string());
        Ok(())
    }

    async fn add_ice_candidate(&mut self, candidate: Option<&str>) -> Result<(), ClientError> {
        self.state
            .lock()
            .unwrap()
            .remote_candidates
            .push(candidate.map(String::from));
        Ok(())
    }

    async fn close(&mut self) {
        self.state.lock().unwrap().closed = true;
    }
}

/// Factory producing [`FakePeerConnection`]s and retaining a handle to each
/// for later inspection.
#[derive(Clone, Default)]
pub struct FakePeerFactory {
    created: Arc<Mutex<HashMap<String, FakePeerConnection>>>,
}

impl FakePeerFactory {
    /// Create an empty factory.
    pub fn new() -> Self {
        Self::default()
    }

    /// The connection created for `peer_id`, if any.
    pub fn connection(&self, peer_id: &str) -> Option<FakePeerConnection> {
        self.created.lock().unwrap().get(peer_id).cloned()
    }
}

#[async_trait]
impl PeerConnectionFactory for FakePeerFactory {
    type Connection = FakePeerConnection;

    async fn create(&mut self, peer_id: &str) -> Result<Self::Connection, ClientError> {
        let connection = FakePeerConnection::new(peer_id);
        self.created
            .lock()
            .unwrap()
            .insert(peer_id.to_string(), connection.clone());
        Ok(connection)
    }
}

/// Outbox that records messages instead of relaying them.
#[derive(Clone, Default)]
pub struct RecordingOutbox {
    sent: Arc<Mutex<Vec<(String, String, SignalMessage)>>>,
}

impl RecordingOutbox {
    /// Create an empty outbox.
    pub fn new() -> Self {
        Self::default()
    }

    /// All `(sender, target, message)` triples sent so far.
    pub fn sent(&self) -> Vec<(String, String, SignalMessage)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl SignalOutbox for RecordingOutbox {
    async fn send(
        &self,
        sender: &str,
        target: &str,
        message: SignalMessage,
    ) -> Result<(), ClientError> {
        self.sent
            .lock()
            .unwrap()
            .push((sender.to_string(), target.to_string(), message));
        Ok(())
    }
}

/// Outbox backed by a real [`CallRelay`], for end-to-end tests.
#[derive(Clone)]
pub struct RelayOutbox {
    relay: CallRelay,
    user: String,
}

impl RelayOutbox {
    /// Create an outbox acting as `user`.
    pub fn new(relay: CallRelay, user: impl Into<String>) -> Self {
        Self {
            relay,
            user: user.into(),
        }
    }
}

#[async_trait]
impl SignalOutbox for RelayOutbox {
    async fn send(
        &self,
        sender: &str,
        target: &str,
        message: SignalMessage,
    ) -> Result<(), ClientError> {
        self.relay
            .signal_peer(&self.user, sender, target, message)
            .await
            .map_err(|e| ClientError::Signaling(e.to_string()))
    }
}
