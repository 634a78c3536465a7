//! End-to-end call scenario: two users join one call through the relay, the
//! deterministic initiator offers, the responder answers, ICE candidates
//! flow, and teardown cascades.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]

use std::sync::Arc;
use std::time::Duration;

use common::types::SignalKind;
use rally_client::{negotiation_role, CallSession, Role};
use rally_service::relay::{CallParticipantEvent, CallRelay, SignalSubscription};
use rally_service::store::CoordStore;
use rally_test_utils::{FakePeerFactory, MemoryCoordStore, RelayOutbox};

/// Apply every mailbox update currently queued on a signal subscription.
async fn pump(
    session: &mut CallSession<FakePeerFactory, RelayOutbox>,
    signals: &mut SignalSubscription,
) {
    while let Ok(Some(doc)) =
        tokio::time::timeout(Duration::from_millis(100), signals.next()).await
    {
        session.apply_signal(&doc.sender, &doc.messages).await.unwrap();
    }
}

#[tokio::test]
async fn test_two_party_call_negotiates_end_to_end() {
    let store = Arc::new(MemoryCoordStore::new());
    let coord: Arc<dyn CoordStore> = Arc::clone(&store) as Arc<dyn CoordStore>;
    let relay = CallRelay::new(coord, "rally-a".to_string());

    // Both users join the same call.
    let mut sub_a = relay.join("userA", "hunt1", "c1", "tab-a").await.unwrap();
    let sub_b = relay.join("userB", "hunt1", "c1", "tab-b").await.unwrap();
    let pa = sub_a.participant().id.clone();
    let pb = sub_b.participant().id.clone();

    // A sees B's arrival through the membership feed.
    match tokio::time::timeout(Duration::from_secs(1), sub_a.next_event())
        .await
        .unwrap()
        .unwrap()
    {
        CallParticipantEvent::Joined(doc) => assert_eq!(doc.id, pb),
        other => panic!("expected Joined, got {other:?}"),
    }

    let mut signals_a = relay.signal_subscription("userA", &pa).await.unwrap();
    let mut signals_b = relay.signal_subscription("userB", &pb).await.unwrap();

    let factory_a = FakePeerFactory::new();
    let factory_b = FakePeerFactory::new();
    let mut session_a = CallSession::new(
        pa.clone(),
        factory_a.clone(),
        RelayOutbox::new(relay.clone(), "userA"),
    );
    let mut session_b = CallSession::new(
        pb.clone(),
        factory_b.clone(),
        RelayOutbox::new(relay.clone(), "userB"),
    );

    // Membership drives negotiation creation on both sides; whichever id is
    // smaller initiates, so exactly one offer is relayed.
    session_a.peer_joined(&pb).await.unwrap();
    session_b.peer_joined(&pa).await.unwrap();

    let (initiator_id, responder_id) = if negotiation_role(&pa, &pb) == Role::Initiator {
        (pa.clone(), pb.clone())
    } else {
        (pb.clone(), pa.clone())
    };

    let offer_box = store.get_signal(&initiator_id, &responder_id).unwrap();
    assert_eq!(offer_box.messages.len(), 1);
    assert_eq!(offer_box.messages[0].kind, SignalKind::Sdp);
    assert!(
        store.get_signal(&responder_id, &initiator_id).is_none(),
        "The responder must not have offered"
    );

    // Deliver the offer, then the answer.
    pump(&mut session_a, &mut signals_a).await;
    pump(&mut session_b, &mut signals_b).await;
    pump(&mut session_a, &mut signals_a).await;
    pump(&mut session_b, &mut signals_b).await;

    // Expected final state: two mailboxes, one message each.
    let offer_box = store.get_signal(&initiator_id, &responder_id).unwrap();
    let answer_box = store.get_signal(&responder_id, &initiator_id).unwrap();
    assert_eq!(offer_box.messages.len(), 1);
    assert_eq!(answer_box.messages.len(), 1);
    assert_eq!(answer_box.messages[0].kind, SignalKind::Sdp);

    // Both engines hold a description in each direction.
    let conn_a = factory_a.connection(&pb).unwrap().state();
    let conn_b = factory_b.connection(&pa).unwrap().state();
    for state in [&conn_a, &conn_b] {
        assert!(state.local_description.is_some());
        assert!(state.remote_description.is_some());
    }
    assert_eq!(conn_a.answers_created + conn_b.answers_created, 1);
    assert_eq!(conn_a.offers_created + conn_b.offers_created, 1);

    // ICE candidates trickle from A to B, ending with the null marker.
    session_a
        .local_candidate(&pb, Some("{\"candidate\":\"host-a\"}".to_string()))
        .await
        .unwrap();
    session_a.local_candidate(&pb, None).await.unwrap();
    pump(&mut session_b, &mut signals_b).await;

    let b_state = factory_b.connection(&pa).unwrap().state();
    assert_eq!(
        b_state.remote_candidates,
        vec![Some("{\"candidate\":\"host-a\"}".to_string()), None]
    );

    // B leaves: its participant and every mailbox it touched disappear; A
    // observes only the membership change.
    session_b.close().await;
    sub_b.leave().await.unwrap();

    match tokio::time::timeout(Duration::from_secs(1), sub_a.next_event())
        .await
        .unwrap()
        .unwrap()
    {
        CallParticipantEvent::Left { id } => assert_eq!(id, pb),
        other => panic!("expected Left, got {other:?}"),
    }
    session_a.peer_left(&pb).await;

    assert_eq!(store.signal_count(), 0);
    assert_eq!(store.participant_ids(), vec![pa.clone()]);
    assert!(factory_a.connection(&pb).unwrap().state().closed);
}
