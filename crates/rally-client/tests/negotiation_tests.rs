//! Negotiation state machine tests against the scripted fake engine.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]

use common::types::{SignalKind, SignalMessage};
use rally_client::{CallSession, ClientError, PeerNegotiation, Role};
use rally_test_utils::{FakePeerConnection, FakePeerFactory, RecordingOutbox};

#[tokio::test]
async fn test_initiator_offers_on_start() {
    let connection = FakePeerConnection::new("p1");
    let outbox = RecordingOutbox::new();
    let mut negotiation = PeerNegotiation::new("p1", "p2", connection.clone(), outbox.clone());
    assert_eq!(negotiation.role(), Role::Initiator);

    negotiation.start().await.unwrap();

    let sent = outbox.sent();
    assert_eq!(sent.len(), 1);
    let (sender, target, message) = &sent[0];
    assert_eq!(sender, "p1");
    assert_eq!(target, "p2");
    assert_eq!(message.kind, SignalKind::Sdp);
    assert_eq!(message.content.as_deref(), Some("offer:p1:1"));

    let state = connection.state();
    assert_eq!(state.local_description.as_deref(), Some("offer:p1:1"));
    assert_eq!(state.offers_created, 1);
}

#[tokio::test]
async fn test_responder_waits_on_start() {
    let connection = FakePeerConnection::new("p2");
    let outbox = RecordingOutbox::new();
    let mut negotiation = PeerNegotiation::new("p2", "p1", connection.clone(), outbox.clone());
    assert_eq!(negotiation.role(), Role::Responder);

    negotiation.start().await.unwrap();

    assert!(outbox.sent().is_empty(), "Responder must not offer");
    assert_eq!(connection.state().offers_created, 0);
}

#[tokio::test]
async fn test_responder_answers_received_offer() {
    let connection = FakePeerConnection::new("p2");
    let outbox = RecordingOutbox::new();
    let mut negotiation = PeerNegotiation::new("p2", "p1", connection.clone(), outbox.clone());

    negotiation
        .apply(&[SignalMessage::sdp("offer:p1:1")])
        .await
        .unwrap();

    let state = connection.state();
    assert_eq!(state.remote_description.as_deref(), Some("offer:p1:1"));
    assert_eq!(state.answers_created, 1);
    assert_eq!(state.local_description.as_deref(), Some("answer:p2:1"));

    // The answer goes back through the reverse directed pair.
    let sent = outbox.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, "p2");
    assert_eq!(sent[0].1, "p1");
    assert_eq!(sent[0].2.content.as_deref(), Some("answer:p2:1"));
}

#[tokio::test]
async fn test_initiator_applies_answer_without_answering_back() {
    let connection = FakePeerConnection::new("p1");
    let outbox = RecordingOutbox::new();
    let mut negotiation = PeerNegotiation::new("p1", "p2", connection.clone(), outbox.clone());

    negotiation.start().await.unwrap();
    negotiation
        .apply(&[SignalMessage::sdp("answer:p2:1")])
        .await
        .unwrap();

    let state = connection.state();
    assert_eq!(state.remote_description.as_deref(), Some("answer:p2:1"));
    assert_eq!(state.answers_created, 0, "Initiator never answers");
    assert_eq!(outbox.sent().len(), 1, "Only the original offer was sent");
}

#[tokio::test]
async fn test_mailbox_suffix_is_processed_exactly_once() {
    let connection = FakePeerConnection::new("p2");
    let outbox = RecordingOutbox::new();
    let mut negotiation = PeerNegotiation::new("p2", "p1", connection.clone(), outbox.clone());

    let offer = SignalMessage::sdp("offer:p1:1");
    negotiation.apply(std::slice::from_ref(&offer)).await.unwrap();
    assert_eq!(negotiation.consumed(), 1);

    // The same mailbox delivered again (e.g., a redundant update): no-op.
    negotiation.apply(std::slice::from_ref(&offer)).await.unwrap();
    assert_eq!(negotiation.consumed(), 1);
    assert_eq!(
        connection.state().answers_created,
        1,
        "Replayed messages must never be reprocessed"
    );

    // The mailbox grows: only the new suffix is acted on.
    let grown = vec![
        offer,
        SignalMessage::ice_candidate(Some("{\"candidate\":\"host-1\"}".to_string())),
        SignalMessage::ice_candidate(None),
    ];
    negotiation.apply(&grown).await.unwrap();
    assert_eq!(negotiation.consumed(), 3);

    let state = connection.state();
    assert_eq!(state.answers_created, 1);
    assert_eq!(
        state.remote_candidates,
        vec![Some("{\"candidate\":\"host-1\"}".to_string()), None],
        "Candidates applied once, in order, ending with the null marker"
    );
}

#[tokio::test]
async fn test_sdp_without_content_is_a_protocol_error() {
    let connection = FakePeerConnection::new("p2");
    let outbox = RecordingOutbox::new();
    let mut negotiation = PeerNegotiation::new("p2", "p1", connection, outbox);

    let malformed = SignalMessage {
        kind: SignalKind::Sdp,
        content: None,
    };
    let result = negotiation.apply(&[malformed]).await;

    assert!(matches!(result, Err(ClientError::Protocol(_))));
    assert_eq!(
        negotiation.consumed(),
        1,
        "Even a rejected message counts as consumed"
    );
}

#[tokio::test]
async fn test_local_candidates_are_relayed() {
    let connection = FakePeerConnection::new("p1");
    let outbox = RecordingOutbox::new();
    let negotiation = PeerNegotiation::new("p1", "p2", connection, outbox.clone());

    negotiation
        .local_candidate(Some("{\"candidate\":\"srflx-1\"}".to_string()))
        .await
        .unwrap();
    negotiation.local_candidate(None).await.unwrap();

    let sent = outbox.sent();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].2.kind, SignalKind::IceCandidate);
    assert_eq!(
        sent[0].2.content.as_deref(),
        Some("{\"candidate\":\"srflx-1\"}")
    );
    assert_eq!(sent[1].2.content, None, "Null marks end of candidates");
}

#[tokio::test]
async fn test_session_supervises_one_negotiation_per_peer() {
    let factory = FakePeerFactory::new();
    let outbox = RecordingOutbox::new();
    let mut session = CallSession::new("p2", factory.clone(), outbox.clone());

    // Own membership event and duplicates are ignored.
    session.peer_joined("p2").await.unwrap();
    assert_eq!(session.peer_ids().count(), 0);

    session.peer_joined("p1").await.unwrap();
    session.peer_joined("p1").await.unwrap();
    assert_eq!(session.peer_ids().count(), 1);

    // p2 > p1, so toward p1 we are the responder: no offer sent.
    assert!(outbox.sent().is_empty());

    // Toward p3 we are the initiator: an offer goes out on join.
    session.peer_joined("p3").await.unwrap();
    let sent = outbox.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].1, "p3");
    assert_eq!(sent[0].2.kind, SignalKind::Sdp);

    // Departure tears the peer's connection down locally.
    session.peer_left("p1").await;
    assert_eq!(session.peer_ids().count(), 1);
    assert!(factory.connection("p1").unwrap().state().closed);
    assert!(!factory.connection("p3").unwrap().state().closed);

    session.close().await;
    assert!(factory.connection("p3").unwrap().state().closed);
}

#[tokio::test]
async fn test_session_routes_signals_by_sender() {
    let factory = FakePeerFactory::new();
    let outbox = RecordingOutbox::new();
    let mut session = CallSession::new("p2", factory.clone(), outbox);

    session.peer_joined("p1").await.unwrap();

    session
        .apply_signal("p1", &[SignalMessage::sdp("offer:p1:1")])
        .await
        .unwrap();
    assert_eq!(
        factory
            .connection("p1")
            .unwrap()
            .state()
            .remote_description
            .as_deref(),
        Some("offer:p1:1")
    );

    // A sender we hold no negotiation for is ignored, not an error.
    session
        .apply_signal("ghost", &[SignalMessage::sdp("stray")])
        .await
        .unwrap();
}
