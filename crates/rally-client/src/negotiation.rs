//! Pairwise peer connection negotiation.
//!
//! One [`PeerNegotiation`] drives the SDP offer/answer exchange and ICE
//! candidate relay for a single ordered pair of participants. Messages travel
//! through the server-side relay in two independent directed mailboxes; order
//! is guaranteed only within each direction.

use async_trait::async_trait;
use tracing::debug;

use crate::errors::ClientError;
use common::types::{SignalKind, SignalMessage};

/// The two deterministic roles in a pairwise negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Builds and sends the initial SDP offer.
    Initiator,
    /// Answers offers from the initiator.
    Responder,
}

/// Decide this participant's role against a peer.
///
/// The participant whose id compares lexicographically smaller is the
/// initiator. Both sides compute the same total order independently, which
/// is what prevents simultaneous offers.
#[must_use]
pub fn negotiation_role(self_id: &str, peer_id: &str) -> Role {
    if self_id < peer_id {
        Role::Initiator
    } else {
        Role::Responder
    }
}

/// Seam over the platform WebRTC engine.
///
/// Implementations wrap whatever peer-connection object the platform
/// provides; the negotiation only ever drives it through these calls.
#[async_trait]
pub trait PeerConnection: Send {
    /// Build an SDP offer describing the local session.
    async fn create_offer(&mut self) -> Result<String, ClientError>;

    /// Build an SDP answer to the current remote offer.
    async fn create_answer(&mut self) -> Result<String, ClientError>;

    /// Apply a local session description.
    async fn set_local_description(&mut self, sdp: &str) -> Result<(), ClientError>;

    /// Apply the peer's session description.
    async fn set_remote_description(&mut self, sdp: &str) -> Result<(), ClientError>;

    /// Add a relayed remote ICE candidate; `None` means the remote side has
    /// no more candidates.
    async fn add_ice_candidate(&mut self, candidate: Option<&str>) -> Result<(), ClientError>;

    /// Tear the connection down. The remote side observes this only through
    /// ICE/connection-state transitions.
    async fn close(&mut self);
}

/// Seam over the relay's `signal_peer` call.
#[async_trait]
pub trait SignalOutbox: Send + Sync {
    /// Relay one message from `sender` to `target`.
    async fn send(
        &self,
        sender: &str,
        target: &str,
        message: SignalMessage,
    ) -> Result<(), ClientError>;
}

/// Negotiation state for one ordered pair of participants.
pub struct PeerNegotiation<P, O> {
    self_id: String,
    peer_id: String,
    role: Role,
    connection: P,
    outbox: O,
    /// Messages from the peer's mailbox already processed; only the suffix
    /// past this count is ever acted on.
    consumed: usize,
}

impl<P, O> PeerNegotiation<P, O>
where
    P: PeerConnection,
    O: SignalOutbox,
{
    /// Create the negotiation for `(self_id, peer_id)`; the role follows
    /// from the id order.
    pub fn new(
        self_id: impl Into<String>,
        peer_id: impl Into<String>,
        connection: P,
        outbox: O,
    ) -> Self {
        let self_id = self_id.into();
        let peer_id = peer_id.into();
        let role = negotiation_role(&self_id, &peer_id);
        Self {
            self_id,
            peer_id,
            role,
            connection,
            outbox,
            consumed: 0,
        }
    }

    /// This side's role.
    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    /// The remote participant id.
    #[must_use]
    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    /// Messages already consumed from the peer's mailbox.
    #[must_use]
    pub fn consumed(&self) -> usize {
        self.consumed
    }

    /// Kick off the exchange. The initiator builds an offer, applies it
    /// locally, and relays it; the responder waits.
    ///
    /// # Errors
    ///
    /// Engine or relay failures.
    pub async fn start(&mut self) -> Result<(), ClientError> {
        if self.role == Role::Initiator {
            let offer = self.connection.create_offer().await?;
            self.connection.set_local_description(&offer).await?;
            self.outbox
                .send(&self.self_id, &self.peer_id, SignalMessage::sdp(offer))
                .await?;
            debug!(
                target: "rally.client.negotiation",
                peer = %self.peer_id,
                "Sent offer"
            );
        }
        Ok(())
    }

    /// Process a mailbox update from the peer.
    ///
    /// `messages` is the full ordered message list of the
    /// `(sender = peer, target = self)` mailbox; only the new suffix is
    /// processed. A message is counted as consumed even when acting on it
    /// fails, so a failed message is never replayed.
    ///
    /// # Errors
    ///
    /// Engine, relay, or protocol failures.
    pub async fn apply(&mut self, messages: &[SignalMessage]) -> Result<(), ClientError> {
        while let Some(message) = messages.get(self.consumed) {
            self.consumed += 1;
            self.handle(message).await?;
        }
        Ok(())
    }

    async fn handle(&mut self, message: &SignalMessage) -> Result<(), ClientError> {
        match message.kind {
            SignalKind::Sdp => {
                let sdp = message.content.as_deref().ok_or_else(|| {
                    ClientError::Protocol("sdp message without content".to_string())
                })?;
                self.connection.set_remote_description(sdp).await?;

                // The responder answers every offer it receives (including
                // renegotiations); the initiator just applied an answer.
                if self.role == Role::Responder {
                    let answer = self.connection.create_answer().await?;
                    self.connection.set_local_description(&answer).await?;
                    self.outbox
                        .send(&self.self_id, &self.peer_id, SignalMessage::sdp(answer))
                        .await?;
                    debug!(
                        target: "rally.client.negotiation",
                        peer = %self.peer_id,
                        "Sent answer"
                    );
                }
            }
            SignalKind::IceCandidate => {
                self.connection
                    .add_ice_candidate(message.content.as_deref())
                    .await?;
            }
        }
        Ok(())
    }

    /// Relay a locally discovered ICE candidate (`None` once candidate
    /// gathering finishes).
    ///
    /// # Errors
    ///
    /// Relay failures.
    pub async fn local_candidate(&self, candidate: Option<String>) -> Result<(), ClientError> {
        self.outbox
            .send(
                &self.self_id,
                &self.peer_id,
                SignalMessage::ice_candidate(candidate),
            )
            .await
    }

    /// Tear down the peer connection.
    pub async fn close(mut self) {
        self.connection.close().await;
    }
}
