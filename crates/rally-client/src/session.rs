//! Per-call supervision of pairwise negotiations.
//!
//! A [`CallSession`] owns one [`PeerNegotiation`] per remote participant in
//! the call, creating them as membership events arrive and tearing them down
//! when peers leave or the session closes.

use std::collections::HashMap;

use async_trait::async_trait;
use tracing::debug;

use crate::errors::ClientError;
use crate::negotiation::{PeerConnection, PeerNegotiation, SignalOutbox};
use common::types::SignalMessage;

/// Creates one peer connection per remote participant.
#[async_trait]
pub trait PeerConnectionFactory: Send {
    /// The engine connection type produced.
    type Connection: PeerConnection + Send;

    /// Create a fresh connection for negotiating with `peer_id`.
    async fn create(&mut self, peer_id: &str) -> Result<Self::Connection, ClientError>;
}

/// Client-side state for one tab's membership in one call.
pub struct CallSession<F, O>
where
    F: PeerConnectionFactory,
    O: SignalOutbox + Clone,
{
    self_id: String,
    factory: F,
    outbox: O,
    peers: HashMap<String, PeerNegotiation<F::Connection, O>>,
}

impl<F, O> CallSession<F, O>
where
    F: PeerConnectionFactory,
    O: SignalOutbox + Clone,
{
    /// Create a session for our own participant id.
    pub fn new(self_id: impl Into<String>, factory: F, outbox: O) -> Self {
        Self {
            self_id: self_id.into(),
            factory,
            outbox,
            peers: HashMap::new(),
        }
    }

    /// Our own participant id.
    #[must_use]
    pub fn self_id(&self) -> &str {
        &self.self_id
    }

    /// Remote participants we currently hold a negotiation for.
    pub fn peer_ids(&self) -> impl Iterator<Item = &str> {
        self.peers.keys().map(String::as_str)
    }

    /// React to a participant joining the call: create a connection and
    /// start negotiating. Our own join event and duplicates are ignored.
    ///
    /// # Errors
    ///
    /// Engine or relay failures while starting the negotiation.
    pub async fn peer_joined(&mut self, peer_id: &str) -> Result<(), ClientError> {
        if peer_id == self.self_id || self.peers.contains_key(peer_id) {
            return Ok(());
        }

        let connection = self.factory.create(peer_id).await?;
        let mut negotiation =
            PeerNegotiation::new(&self.self_id, peer_id, connection, self.outbox.clone());
        negotiation.start().await?;
        self.peers.insert(peer_id.to_string(), negotiation);

        debug!(
            target: "rally.client.session",
            peer = %peer_id,
            "Negotiation created for joined peer"
        );
        Ok(())
    }

    /// React to a participant leaving: tear down its negotiation locally.
    pub async fn peer_left(&mut self, peer_id: &str) {
        if let Some(negotiation) = self.peers.remove(peer_id) {
            negotiation.close().await;
            debug!(
                target: "rally.client.session",
                peer = %peer_id,
                "Negotiation closed for departed peer"
            );
        }
    }

    /// Route a mailbox update to the negotiation for its sender.
    ///
    /// Updates from senders we hold no negotiation for (e.g., a peer that
    /// already left) are ignored.
    ///
    /// # Errors
    ///
    /// Engine, relay, or protocol failures from the negotiation.
    pub async fn apply_signal(
        &mut self,
        sender: &str,
        messages: &[SignalMessage],
    ) -> Result<(), ClientError> {
        if let Some(negotiation) = self.peers.get_mut(sender) {
            negotiation.apply(messages).await
        } else {
            debug!(
                target: "rally.client.session",
                sender = %sender,
                "Ignoring signal from unknown sender"
            );
            Ok(())
        }
    }

    /// Relay a locally discovered ICE candidate for one peer.
    ///
    /// # Errors
    ///
    /// Relay failures.
    pub async fn local_candidate(
        &self,
        peer_id: &str,
        candidate: Option<String>,
    ) -> Result<(), ClientError> {
        if let Some(negotiation) = self.peers.get(peer_id) {
            negotiation.local_candidate(candidate).await?;
        }
        Ok(())
    }

    /// Tear down every negotiation (leaving the call or unmounting).
    pub async fn close(mut self) {
        for (_, negotiation) in self.peers.drain() {
            negotiation.close().await;
        }
    }
}
