//! Client-side error types.

use thiserror::Error;

/// Errors from the negotiation state machine.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The WebRTC engine failed (offer/answer creation, description or
    /// candidate application).
    #[error("Peer connection error: {0}")]
    Engine(String),

    /// Sending through the signaling relay failed.
    #[error("Signaling error: {0}")]
    Signaling(String),

    /// A relayed message violated the protocol (e.g., an SDP message with no
    /// content).
    #[error("Protocol error: {0}")]
    Protocol(String),
}
