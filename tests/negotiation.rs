//! Engine-level tests driven through the public handle, with scripted and
//! paired in-memory relays standing in for the signaling service.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{
    init_tracing, wait_until, DeniedCapture, MemoryRelay, NullCapture, ScriptedRelay, SlowCapture,
};
use screenlink::{
    CandidateInit, PeerSession, SessionConfig, SessionEvents, SignalMessage,
};
use webrtc::api::APIBuilder;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

const WAIT: Duration = Duration::from_secs(5);

/// Config that skips external STUN servers; loopback host candidates are all
/// these tests need.
fn local_config() -> SessionConfig {
    SessionConfig {
        ice_servers: Vec::new(),
        ..Default::default()
    }
}

/// A bare peer connection for producing fixture descriptions.
async fn scratch_peer() -> Arc<RTCPeerConnection> {
    let api = APIBuilder::new().build();
    Arc::new(
        api.new_peer_connection(RTCConfiguration::default())
            .await
            .expect("scratch peer connection"),
    )
}

/// A real offer, as the remote initiator would send it.
async fn fixture_offer() -> String {
    let pc = scratch_peer().await;
    let _dc = pc.create_data_channel("chat", None).await.unwrap();
    let offer = pc.create_offer(None).await.unwrap();
    pc.set_local_description(offer).await.unwrap();
    let sdp = pc.local_description().await.unwrap().sdp;
    pc.close().await.unwrap();
    sdp
}

/// A real answer to `offer_sdp`, as the remote responder would send it.
async fn fixture_answer(offer_sdp: String) -> String {
    let pc = scratch_peer().await;
    pc.set_remote_description(RTCSessionDescription::offer(offer_sdp).unwrap())
        .await
        .unwrap();
    let answer = pc.create_answer(None).await.unwrap();
    pc.set_local_description(answer).await.unwrap();
    let sdp = pc.local_description().await.unwrap().sdp;
    pc.close().await.unwrap();
    sdp
}

fn offer_frame(sdp: &str) -> String {
    serde_json::to_string(&SignalMessage::Offer { sdp: sdp.into() }).unwrap()
}

fn answer_frame(sdp: &str) -> String {
    serde_json::to_string(&SignalMessage::Answer { sdp: sdp.into() }).unwrap()
}

fn candidate_frame(n: u16) -> String {
    serde_json::to_string(&SignalMessage::Candidate {
        ice: CandidateInit {
            candidate: format!("candidate:{n} 1 udp 2130706431 127.0.0.1 {} typ host", 40000 + n),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        },
    })
    .unwrap()
}

fn offers(messages: &[SignalMessage]) -> usize {
    messages
        .iter()
        .filter(|m| matches!(m, SignalMessage::Offer { .. }))
        .count()
}

fn answers(messages: &[SignalMessage]) -> usize {
    messages
        .iter()
        .filter(|m| matches!(m, SignalMessage::Answer { .. }))
        .count()
}

#[tokio::test]
async fn initiator_sends_offer_and_rejects_restart() {
    init_tracing();
    let relay = ScriptedRelay::new();
    let session = PeerSession::connect(
        local_config(),
        relay.clone(),
        Arc::new(NullCapture),
        SessionEvents::default(),
    )
    .await
    .unwrap();

    session.start_as_initiator().await.unwrap();
    let sent = relay.sent_messages();
    assert_eq!(offers(&sent), 1, "exactly one offer on the wire");

    // a session exists: a second start must be refused, state untouched
    assert!(session.start_as_initiator().await.is_err());
    assert_eq!(offers(&relay.sent_messages()), 1);

    session.stop().await;
}

#[tokio::test]
async fn duplicate_inbound_offer_is_ignored() {
    init_tracing();
    let relay = ScriptedRelay::new();
    let session = PeerSession::connect(
        local_config(),
        relay.clone(),
        Arc::new(NullCapture),
        SessionEvents::default(),
    )
    .await
    .unwrap();

    let offer = fixture_offer().await;
    relay.inject(offer_frame(&offer));
    assert!(
        wait_until(WAIT, || answers(&relay.sent_messages()) == 1).await,
        "responder should answer the first offer"
    );

    relay.inject(offer_frame(&offer));
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(
        answers(&relay.sent_messages()),
        1,
        "a second offer while a session exists must not produce another answer"
    );

    session.stop().await;
}

#[tokio::test]
async fn candidate_and_answer_without_session_are_ignored() {
    init_tracing();
    let relay = ScriptedRelay::new();
    let session = PeerSession::connect(
        local_config(),
        relay.clone(),
        Arc::new(NullCapture),
        SessionEvents::default(),
    )
    .await
    .unwrap();

    relay.inject(candidate_frame(1));
    relay.inject(answer_frame("v=0"));
    relay.inject("not json at all");
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(relay.sent_count(), 0);
    assert!(!session.is_connected());

    // the engine is still usable afterwards
    session.start_as_initiator().await.unwrap();
    assert_eq!(offers(&relay.sent_messages()), 1);
    session.stop().await;
}

#[tokio::test]
async fn early_candidates_are_buffered_until_the_answer() {
    init_tracing();
    let relay = ScriptedRelay::new();
    let session = PeerSession::connect(
        local_config(),
        relay.clone(),
        Arc::new(NullCapture),
        SessionEvents::default(),
    )
    .await
    .unwrap();

    session.start_as_initiator().await.unwrap();
    let offer_sdp = match &relay.sent_messages()[0] {
        SignalMessage::Offer { sdp } => sdp.clone(),
        other => panic!("expected offer, got {other:?}"),
    };

    // candidates racing ahead of the answer must queue, not crash or drop
    relay.inject(candidate_frame(1));
    relay.inject(candidate_frame(2));
    let answer = fixture_answer(offer_sdp).await;
    relay.inject(answer_frame(&answer));
    // and one arriving after the remote description applies immediately
    relay.inject(candidate_frame(3));
    tokio::time::sleep(Duration::from_millis(300)).await;

    // negotiation survived the whole sequence
    assert_eq!(offers(&relay.sent_messages()), 1);
    session.stop().await;
}

#[tokio::test]
async fn media_denial_aborts_without_a_session() {
    init_tracing();
    let relay = ScriptedRelay::new();
    let failures = Arc::new(AtomicUsize::new(0));
    let failures_probe = failures.clone();
    let session = PeerSession::connect(
        local_config(),
        relay.clone(),
        Arc::new(DeniedCapture),
        SessionEvents::default().with_session_failed(move |_| {
            failures_probe.fetch_add(1, Ordering::SeqCst);
        }),
    )
    .await
    .unwrap();

    assert!(session.start_as_initiator().await.is_err());
    assert_eq!(relay.sent_count(), 0, "no offer after a capture failure");

    // the responder path reports upward instead of returning
    relay.inject(offer_frame(&fixture_offer().await));
    assert!(wait_until(WAIT, || failures.load(Ordering::SeqCst) >= 1).await);
    assert_eq!(relay.sent_count(), 0);

    // no half-built session lingers
    assert!(!session.is_connected());
    session.stop().await;
}

#[tokio::test]
async fn stop_is_idempotent() {
    init_tracing();
    let relay = ScriptedRelay::new();
    let session = PeerSession::connect(
        local_config(),
        relay.clone(),
        Arc::new(NullCapture),
        SessionEvents::default(),
    )
    .await
    .unwrap();

    // safe from Idle
    session.stop().await;
    assert_eq!(relay.closes.load(Ordering::SeqCst), 1);

    session.stop().await;
    session.stop().await;
    assert_eq!(
        relay.closes.load(Ordering::SeqCst),
        1,
        "repeated stop must not release the transport again"
    );
    assert_eq!(relay.sent_count(), 0);
}

#[tokio::test]
async fn late_media_completion_after_stop_is_inert() {
    init_tracing();
    let relay = ScriptedRelay::new();
    let session = Arc::new(
        PeerSession::connect(
            local_config(),
            relay.clone(),
            Arc::new(SlowCapture(Duration::from_millis(400))),
            SessionEvents::default(),
        )
        .await
        .unwrap(),
    );

    let starter = {
        let session = session.clone();
        tokio::spawn(async move { session.start_as_initiator().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    session.stop().await;

    starter.await.unwrap().unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(
        relay.sent_count(),
        0,
        "a capture completing after stop must not produce an offer"
    );
}

#[tokio::test]
async fn relay_loss_before_negotiation_fails_the_session() {
    init_tracing();
    let relay = ScriptedRelay::new();
    let failures = Arc::new(Mutex::new(Vec::<String>::new()));
    let failures_probe = failures.clone();
    let session = PeerSession::connect(
        local_config(),
        relay.clone(),
        Arc::new(NullCapture),
        SessionEvents::default().with_session_failed(move |e| {
            failures_probe.lock().unwrap().push(e.to_string());
        }),
    )
    .await
    .unwrap();

    session.start_as_initiator().await.unwrap();
    relay.fail("relay unreachable");

    assert!(
        wait_until(WAIT, || !failures.lock().unwrap().is_empty()).await,
        "relay loss before the direct channel must fail the session"
    );
    assert!(failures.lock().unwrap()[0].contains("relay"));
    assert!(!session.is_connected());
    session.stop().await;
}

#[tokio::test]
async fn full_session_over_loopback_retires_the_relay() {
    init_tracing();
    let (relay_a, relay_b) = MemoryRelay::pair();

    let received_b = Arc::new(Mutex::new(Vec::<String>::new()));
    let received_probe = received_b.clone();

    let a = PeerSession::connect(
        local_config(),
        relay_a.clone(),
        Arc::new(NullCapture),
        SessionEvents::default(),
    )
    .await
    .unwrap();
    let b = PeerSession::connect(
        local_config(),
        relay_b.clone(),
        Arc::new(NullCapture),
        SessionEvents::default().with_incoming_message(move |text| {
            received_probe.lock().unwrap().push(text);
        }),
    )
    .await
    .unwrap();

    a.start_as_initiator().await.unwrap();

    assert!(
        wait_until(Duration::from_secs(30), || a.is_connected() && b.is_connected()).await,
        "direct channel should open on both ends over loopback"
    );

    // signaling retired exactly once per side
    assert!(wait_until(WAIT, || {
        relay_a.closes.load(Ordering::SeqCst) == 1 && relay_b.closes.load(Ordering::SeqCst) == 1
    })
    .await);

    let frames_a = relay_a.sent_count();
    let frames_b = relay_b.sent_count();

    a.send("hello").await;
    assert!(
        wait_until(WAIT, || received_b.lock().unwrap().as_slice() == ["hello"]).await,
        "payload should arrive over the direct channel"
    );

    // and it never traversed the relay
    assert_eq!(relay_a.sent_count(), frames_a);
    assert_eq!(relay_b.sent_count(), frames_b);
    assert!(relay_a
        .sent
        .lock()
        .unwrap()
        .iter()
        .all(|frame| !frame.contains("hello")));

    a.stop().await;
    b.stop().await;
    assert_eq!(relay_a.closes.load(Ordering::SeqCst), 1);
    assert_eq!(relay_b.closes.load(Ordering::SeqCst), 1);
}
