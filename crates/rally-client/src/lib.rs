//! Rally client-side negotiation state machine.
//!
//! Consumes the call signaling relay to negotiate direct WebRTC peer
//! connections between browser tabs. The WebRTC engine itself sits behind
//! the [`PeerConnection`] trait; sending messages back through the relay sits
//! behind [`SignalOutbox`]. This crate owns only the protocol:
//!
//! - Deterministic roles: for each pair, the participant with the smaller id
//!   is the initiator, the other the responder - both sides agree without a
//!   message exchange, so simultaneous offers cannot happen.
//! - Suffix-only consumption: each relayed mailbox update delivers the full
//!   ordered message list; a negotiation tracks how many messages it already
//!   processed and never reprocesses.
//! - [`CallSession`] supervises one negotiation per remote participant,
//!   creating them as peers join and tearing them down as peers leave. There
//!   is no explicit teardown message: the remote side observes departure
//!   through ICE/connection-state transitions.

#![warn(clippy::pedantic)]

pub mod errors;
pub mod negotiation;
pub mod session;

pub use errors::ClientError;
pub use negotiation::{
    negotiation_role, PeerConnection, PeerNegotiation, Role, SignalOutbox,
};
pub use session::{CallSession, PeerConnectionFactory};
