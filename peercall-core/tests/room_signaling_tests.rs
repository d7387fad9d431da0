//! Two sessions talking through the in-process relay

#![allow(clippy::unwrap_used)]

mod common;

use common::{MockDevices, MockPeer, MockPeerFactory};
use peercall_core::{
    CallBackends, CallConfig, CallRole, CallSessionManager, ConnectionState, MediaDevices,
    SessionId, SignalingHub,
};
use std::sync::Arc;

fn participant(
    hub: &Arc<SignalingHub>,
    name: &str,
    role: CallRole,
) -> (CallSessionManager, Arc<MockPeer>) {
    let peer = Arc::new(MockPeer::default());
    let backends = CallBackends {
        signaling: Arc::new(hub.channel(name)),
        media: Arc::new(MockDevices::default()) as Arc<dyn MediaDevices>,
        peers: Arc::new(MockPeerFactory {
            peer: Arc::clone(&peer),
        }),
    };
    let session = CallSessionManager::new(SessionId::new("room-7"), role, CallConfig::default(), backends);
    (session, peer)
}

#[tokio::test]
async fn offer_and_answer_cross_the_relay() {
    let hub = SignalingHub::new();
    let (mut responder, responder_peer) = participant(&hub, "student", CallRole::Responder);
    let (mut initiator, initiator_peer) = participant(&hub, "mentor", CallRole::Initiator);

    responder.start().await.unwrap();
    initiator.start().await.unwrap();
    assert_eq!(hub.member_count(&SessionId::new("room-7")), 2);

    // responder sees user-joined, then the offer
    responder.process_pending().await;
    assert_eq!(responder.state(), ConnectionState::Negotiating);
    assert!(responder_peer.log().contains(&"remote:Offer".to_string()));

    initiator.process_pending().await;
    assert!(initiator_peer.log().contains(&"remote:Answer".to_string()));

    for (session, peer) in [
        (&mut initiator, &initiator_peer),
        (&mut responder, &responder_peer),
    ] {
        peer.emit_remote_track();
        peer.emit_connected();
        session.process_pending().await;
        assert_eq!(session.state(), ConnectionState::Connected);
    }

    initiator.send_chat("welcome");
    responder.process_pending().await;
    let log = responder.chat_log();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].text, "welcome");
    assert_eq!(log[0].sender_label, "Remote");
}

#[tokio::test]
async fn hanging_up_disconnects_the_other_side() {
    let hub = SignalingHub::new();
    let (mut responder, _) = participant(&hub, "student", CallRole::Responder);
    let (mut initiator, _) = participant(&hub, "mentor", CallRole::Initiator);
    responder.start().await.unwrap();
    initiator.start().await.unwrap();
    responder.process_pending().await;

    initiator.end().await;
    assert_eq!(hub.member_count(&SessionId::new("room-7")), 1);

    responder.process_pending().await;
    assert_eq!(responder.state(), ConnectionState::Disconnected);
    assert_eq!(hub.member_count(&SessionId::new("room-7")), 0);
}

#[tokio::test]
async fn initiator_joining_first_still_connects() {
    let hub = SignalingHub::new();
    let (mut initiator, initiator_peer) = participant(&hub, "mentor", CallRole::Initiator);
    let (mut responder, responder_peer) = participant(&hub, "student", CallRole::Responder);

    // nobody is in the room to receive the first offer
    initiator.start().await.unwrap();
    responder.start().await.unwrap();
    assert_eq!(responder.process_pending().await, 0);

    initiator.process_pending().await;
    responder.process_pending().await;
    assert_eq!(responder.state(), ConnectionState::Negotiating);
    assert!(responder_peer.log().contains(&"remote:Offer".to_string()));

    initiator.process_pending().await;
    assert!(initiator_peer.log().contains(&"remote:Answer".to_string()));
    let offers_created = initiator_peer
        .log()
        .iter()
        .filter(|l| *l == "create-offer")
        .count();
    assert_eq!(offers_created, 1);

    for (session, peer) in [
        (&mut initiator, &initiator_peer),
        (&mut responder, &responder_peer),
    ] {
        peer.emit_remote_track();
        peer.emit_connected();
        session.process_pending().await;
        assert_eq!(session.state(), ConnectionState::Connected);
    }
}
