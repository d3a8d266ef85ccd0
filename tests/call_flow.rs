use peercall::errors::{CallError, DeviceError, NegotiationError, TransportError};
use peercall::peer::TransportEvent;
use peercall::testing::FakeTransportFactory;
use peercall::{
    CallConfig, CallController, CallEvent, EndReason, IceCandidate, IncomingOffer, LoopbackHub,
    MediaSource, NegotiationState, Participant, SessionDescription, SignalEnvelope,
    SignalMessage, SignalingChannel, StaticIdentity, SyntheticCapture, TrackKind,
};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

const REMOTE_OFFER: &str =
    "v=0\r\na=fingerprint:sha-256 AA:BB:CC:DD\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\n";
const REMOTE_VIDEO_OFFER: &str = "v=0\r\na=fingerprint:sha-256 AA:BB:CC:DD\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\nm=video 9 UDP/TLS/RTP/SAVPF 96\r\n";

struct Peer {
    controller: CallController,
    capture: Arc<SyntheticCapture>,
    transports: Arc<FakeTransportFactory>,
    events: broadcast::Receiver<CallEvent>,
}

fn peer_with(
    name: &str,
    signaling: Arc<dyn SignalingChannel>,
    transports: FakeTransportFactory,
) -> Peer {
    let capture = Arc::new(SyntheticCapture::new());
    let transports = Arc::new(transports);
    let controller = CallController::new(
        CallConfig::default(),
        Arc::new(MediaSource::new(capture.clone())),
        transports.clone(),
        signaling,
        Arc::new(StaticIdentity::new(name, name)),
    );
    let events = controller.subscribe();
    Peer {
        controller,
        capture,
        transports,
        events,
    }
}

fn peer(name: &str, signaling: Arc<dyn SignalingChannel>) -> Peer {
    peer_with(name, signaling, FakeTransportFactory::new())
}

fn remote() -> Participant {
    Participant {
        id: "bob".into(),
        display_name: "Bob".into(),
        avatar_url: None,
    }
}

fn drain(rx: &mut broadcast::Receiver<CallEvent>) -> Vec<CallEvent> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        out.push(event);
    }
    out
}

async fn wait_for<F>(rx: &mut broadcast::Receiver<CallEvent>, pred: F) -> CallEvent
where
    F: Fn(&CallEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(60), async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) => continue,
                Err(e) => panic!("event stream broke: {e}"),
            }
        }
    })
    .await
    .expect("event did not arrive")
}

async fn wait_for_state(rx: &mut broadcast::Receiver<CallEvent>, state: NegotiationState) {
    wait_for(rx, |e| matches!(e, CallEvent::StateChanged(s) if *s == state)).await;
}

fn states(events: &[CallEvent]) -> Vec<NegotiationState> {
    events
        .iter()
        .filter_map(|e| match e {
            CallEvent::StateChanged(s) => Some(*s),
            _ => None,
        })
        .collect()
}

/// Brings a callee to Connected using a hand-made offer.
async fn connected_callee(p: &mut Peer) -> String {
    let id = p
        .controller
        .accept_incoming(IncomingOffer {
            session_id: "remote-session".into(),
            from: remote(),
            description: SessionDescription::offer(REMOTE_OFFER),
        })
        .await
        .unwrap();
    p.transports
        .last()
        .unwrap()
        .emit(TransportEvent::PathEstablished);
    wait_for_state(&mut p.events, NegotiationState::Connected).await;
    id
}

#[tokio::test]
async fn caller_announces_tracks_and_offer_progress() {
    let (a, b) = LoopbackHub::pair();
    let mut inbox = b.subscribe();
    let mut alice = peer("alice", Arc::new(a));

    let session_id = alice.controller.start_call(true).await.unwrap();

    let events = drain(&mut alice.events);
    let ready: Vec<TrackKind> = events
        .iter()
        .filter_map(|e| match e {
            CallEvent::LocalTrackReady(t) => Some(t.kind()),
            _ => None,
        })
        .collect();
    assert_eq!(ready, vec![TrackKind::Audio, TrackKind::Video]);
    assert_eq!(
        states(&events),
        vec![NegotiationState::OfferCreated, NegotiationState::OfferSent]
    );

    let sent = inbox.try_recv().unwrap();
    assert_eq!(sent.session_id, session_id);
    assert_eq!(sent.from.id, "alice");
    match sent.message {
        SignalMessage::Offer(offer) => assert!(offer.has_video()),
        other => panic!("expected an offer, got {other:?}"),
    }
    assert_eq!(alice.controller.state().await, NegotiationState::OfferSent);
}

#[tokio::test]
async fn callee_sends_exactly_one_answer_then_connects() {
    let (caller_side, b) = LoopbackHub::pair();
    let mut inbox = caller_side.subscribe();
    let mut bob = peer("bob", Arc::new(b));

    bob.controller
        .accept_incoming(IncomingOffer {
            session_id: "s-1".into(),
            from: remote(),
            description: SessionDescription::offer(REMOTE_VIDEO_OFFER),
        })
        .await
        .unwrap();

    let answers: Vec<_> = std::iter::from_fn(|| inbox.try_recv().ok())
        .filter(|env| matches!(env.message, SignalMessage::Answer(_)))
        .collect();
    assert_eq!(answers.len(), 1);
    assert_eq!(answers[0].session_id, "s-1");

    // video was offered, so both tracks were captured
    assert_eq!(bob.capture.open_handles(), 2);

    let transport = bob.transports.last().unwrap();
    transport.emit(TransportEvent::PathEstablished);
    wait_for_state(&mut bob.events, NegotiationState::Connected).await;
    assert_eq!(bob.controller.state().await, NegotiationState::Connected);
    assert!(bob.controller.verification_code().await.is_some());
}

#[tokio::test]
async fn two_controllers_negotiate_over_loopback() {
    let (a, b) = LoopbackHub::pair();
    let mut alice = peer("alice", Arc::new(a));
    let mut bob = peer("bob", Arc::new(b));
    let _alice_loop = alice.controller.spawn_signaling_loop();
    let _bob_loop = bob.controller.spawn_signaling_loop();

    let session_id = alice.controller.start_call(false).await.unwrap();

    let offer = match wait_for(&mut bob.events, |e| matches!(e, CallEvent::IncomingCall(_))).await {
        CallEvent::IncomingCall(offer) => offer,
        _ => unreachable!(),
    };
    assert_eq!(offer.session_id, session_id);
    assert_eq!(offer.from.display_name, "alice");

    bob.controller.accept_incoming(offer).await.unwrap();
    wait_for_state(&mut alice.events, NegotiationState::AnswerReceived).await;

    // trickle one candidate each way
    let a_transport = alice.transports.last().unwrap();
    let b_transport = bob.transports.last().unwrap();
    let a_cand = IceCandidate::new("candidate:1 1 udp 2130706431 10.0.0.1 5000 typ host");
    let b_cand = IceCandidate::new("candidate:2 1 udp 2130706431 10.0.0.2 6000 typ host");
    a_transport.emit(TransportEvent::LocalCandidate(a_cand.clone()));
    b_transport.emit(TransportEvent::LocalCandidate(b_cand.clone()));

    a_transport.emit(TransportEvent::PathEstablished);
    b_transport.emit(TransportEvent::PathEstablished);
    wait_for_state(&mut alice.events, NegotiationState::Connected).await;
    wait_for_state(&mut bob.events, NegotiationState::Connected).await;

    for _ in 0..50 {
        if a_transport.applied_candidates().contains(&b_cand)
            && b_transport.applied_candidates().contains(&a_cand)
        {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(a_transport.applied_candidates(), vec![b_cand]);
    assert_eq!(b_transport.applied_candidates(), vec![a_cand]);

    let alice_code = alice.controller.verification_code().await.unwrap();
    let bob_code = bob.controller.verification_code().await.unwrap();
    assert_eq!(alice_code, bob_code);
}

#[tokio::test]
async fn start_call_while_connected_is_rejected() {
    let (_caller_side, b) = LoopbackHub::pair();
    let mut bob = peer("bob", Arc::new(b));
    let session_id = connected_callee(&mut bob).await;
    drain(&mut bob.events);

    assert_eq!(
        bob.controller.start_call(true).await.unwrap_err(),
        CallError::AlreadyActive
    );
    assert_eq!(bob.transports.opened().len(), 1);
    assert_eq!(bob.controller.state().await, NegotiationState::Connected);
    let session = bob.controller.session().await.unwrap();
    assert_eq!(session.id(), session_id);
    assert!(states(&drain(&mut bob.events)).is_empty());
}

#[tokio::test]
async fn end_call_is_idempotent() {
    let (a, _b) = LoopbackHub::pair();
    let mut alice = peer("alice", Arc::new(a));
    alice.controller.start_call(true).await.unwrap();
    drain(&mut alice.events);

    assert!(alice.controller.end_call().await);
    assert!(!alice.controller.end_call().await);
    assert!(!alice.controller.end_call().await);

    let events = drain(&mut alice.events);
    assert_eq!(states(&events), vec![NegotiationState::Closed]);
    let ended: Vec<_> = events
        .iter()
        .filter(|e| matches!(e, CallEvent::CallEnded(_)))
        .collect();
    assert_eq!(ended.len(), 1);
    assert!(matches!(ended[0], CallEvent::CallEnded(EndReason::Hangup)));

    let stats = alice.capture.stats();
    assert_eq!(stats.opened.load(Ordering::SeqCst), 2);
    assert_eq!(stats.stopped.load(Ordering::SeqCst), 2);
    assert_eq!(alice.capture.open_handles(), 0);
    assert_eq!(alice.transports.last().unwrap().close_count(), 1);
    assert_eq!(alice.controller.state().await, NegotiationState::Idle);
    assert!(!alice.controller.is_busy());
}

/// Hangs up three times and checks the call was released exactly once.
async fn assert_single_hangup(p: &mut Peer) {
    assert!(p.controller.end_call().await);
    assert!(!p.controller.end_call().await);
    assert!(!p.controller.end_call().await);

    let events = drain(&mut p.events);
    assert_eq!(states(&events), vec![NegotiationState::Closed]);
    let ended = events
        .iter()
        .filter(|e| matches!(e, CallEvent::CallEnded(EndReason::Hangup)))
        .count();
    assert_eq!(ended, 1);

    let stats = p.capture.stats();
    assert_eq!(
        stats.stopped.load(Ordering::SeqCst),
        stats.opened.load(Ordering::SeqCst)
    );
    assert_eq!(p.capture.open_handles(), 0);
    assert_eq!(p.transports.last().unwrap().close_count(), 1);
    assert_eq!(p.controller.state().await, NegotiationState::Idle);
}

#[tokio::test]
async fn end_call_from_connected_is_idempotent() {
    let (_caller_side, b) = LoopbackHub::pair();
    let mut bob = peer("bob", Arc::new(b));
    connected_callee(&mut bob).await;
    drain(&mut bob.events);

    assert_single_hangup(&mut bob).await;
}

#[tokio::test(start_paused = true)]
async fn end_call_while_disconnected_cancels_the_grace_timer() {
    let (_caller_side, b) = LoopbackHub::pair();
    let mut bob = peer("bob", Arc::new(b));
    connected_callee(&mut bob).await;
    let transport = bob.transports.last().unwrap();

    transport.emit(TransportEvent::PathLost);
    wait_for_state(&mut bob.events, NegotiationState::Disconnected).await;
    tokio::time::sleep(Duration::from_secs(2)).await;
    drain(&mut bob.events);

    assert_single_hangup(&mut bob).await;

    // well past the grace window: nothing fires for the ended call
    tokio::time::sleep(Duration::from_secs(60)).await;
    let late = drain(&mut bob.events);
    assert!(late.is_empty(), "late events after hangup: {late:?}");
    assert_eq!(transport.close_count(), 1);
    assert!(!bob.controller.is_busy());
}

#[tokio::test]
async fn end_call_without_a_call_is_silent() {
    let (a, _b) = LoopbackHub::pair();
    let mut alice = peer("alice", Arc::new(a));
    assert!(!alice.controller.end_call().await);
    assert!(drain(&mut alice.events).is_empty());
}

#[tokio::test]
async fn toggling_video_twice_restores_it() {
    let (a, _b) = LoopbackHub::pair();
    let mut alice = peer("alice", Arc::new(a));
    assert_eq!(
        alice.controller.toggle_video().unwrap_err(),
        CallError::NoActiveCall
    );

    alice.controller.start_call(true).await.unwrap();
    drain(&mut alice.events);

    assert_eq!(alice.controller.toggle_video(), Ok(Some(false)));
    assert_eq!(alice.controller.toggle_video(), Ok(Some(true)));

    let events = drain(&mut alice.events);
    assert_eq!(events.len(), 2);
    assert!(events.iter().all(|e| matches!(
        e,
        CallEvent::MediaStateChanged {
            kind: TrackKind::Video,
            ..
        }
    )));
    assert_eq!(alice.transports.opened().len(), 1);
    assert_eq!(alice.capture.open_handles(), 2);

    let session = alice.controller.session().await.unwrap();
    let video = session
        .local_tracks()
        .iter()
        .find(|t| t.kind() == TrackKind::Video)
        .unwrap();
    assert!(video.is_enabled());
}

#[tokio::test]
async fn muting_audio_is_visible_on_the_bound_track() {
    let (a, _b) = LoopbackHub::pair();
    let alice = peer("alice", Arc::new(a));
    alice.controller.start_call(false).await.unwrap();

    assert_eq!(alice.controller.toggle_audio(), Ok(Some(false)));
    let bound = alice.transports.last().unwrap().local_tracks();
    assert!(!bound[0].is_enabled());
    // audio-only call
    assert_eq!(alice.controller.toggle_video(), Ok(None));

    alice.controller.end_call().await;
    assert_eq!(
        alice.controller.toggle_audio().unwrap_err(),
        CallError::NoActiveCall
    );
}

#[tokio::test(start_paused = true)]
async fn lost_path_without_recovery_fails_and_cleans_up() {
    let (_caller_side, b) = LoopbackHub::pair();
    let mut bob = peer("bob", Arc::new(b));
    connected_callee(&mut bob).await;
    let transport = bob.transports.last().unwrap();

    transport.emit(TransportEvent::PathLost);
    wait_for_state(&mut bob.events, NegotiationState::Disconnected).await;
    wait_for_state(&mut bob.events, NegotiationState::Failed).await;
    let ended = wait_for(&mut bob.events, |e| matches!(e, CallEvent::CallEnded(_))).await;
    assert!(matches!(
        ended,
        CallEvent::CallEnded(EndReason::ConnectionFailed)
    ));

    assert_eq!(bob.capture.open_handles(), 0);
    assert_eq!(transport.close_count(), 1);
    assert_eq!(bob.controller.state().await, NegotiationState::Idle);
    assert!(!bob.controller.end_call().await);
}

#[tokio::test(start_paused = true)]
async fn path_recovering_inside_the_grace_window_keeps_the_call() {
    let (_caller_side, b) = LoopbackHub::pair();
    let mut bob = peer("bob", Arc::new(b));
    connected_callee(&mut bob).await;
    let transport = bob.transports.last().unwrap();

    transport.emit(TransportEvent::PathLost);
    wait_for_state(&mut bob.events, NegotiationState::Disconnected).await;
    tokio::time::sleep(Duration::from_secs(3)).await;
    transport.emit(TransportEvent::PathEstablished);
    wait_for_state(&mut bob.events, NegotiationState::Connected).await;

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(bob.controller.state().await, NegotiationState::Connected);
    assert!(drain(&mut bob.events).is_empty());
}

#[tokio::test]
async fn transport_failure_before_connect_fails_the_call() {
    let (a, _b) = LoopbackHub::pair();
    let mut alice = peer("alice", Arc::new(a));
    alice.controller.start_call(false).await.unwrap();

    alice
        .transports
        .last()
        .unwrap()
        .emit(TransportEvent::PathFailed);
    wait_for_state(&mut alice.events, NegotiationState::Failed).await;
    let ended = wait_for(&mut alice.events, |e| matches!(e, CallEvent::CallEnded(_))).await;
    assert!(matches!(
        ended,
        CallEvent::CallEnded(EndReason::ConnectionFailed)
    ));
    assert_eq!(alice.capture.open_handles(), 0);
}

#[tokio::test]
async fn device_failure_leaves_nothing_behind() {
    let (a, _b) = LoopbackHub::pair();
    let alice = peer("alice", Arc::new(a));
    alice
        .capture
        .fail_on(TrackKind::Video, DeviceError::PermissionDenied("camera".into()));

    let err = alice.controller.start_call(true).await.unwrap_err();
    assert_eq!(
        err,
        CallError::Device(DeviceError::PermissionDenied("camera".into()))
    );
    assert_eq!(alice.capture.open_handles(), 0);
    assert!(alice.transports.opened().is_empty());
    assert!(!alice.controller.is_busy());

    alice.capture.clear_failure();
    alice.controller.start_call(true).await.unwrap();
    assert_eq!(alice.capture.open_handles(), 2);
}

#[tokio::test]
async fn transport_open_failure_releases_media() {
    let (a, _b) = LoopbackHub::pair();
    let mut alice = peer("alice", Arc::new(a));
    alice
        .transports
        .fail_next_open(TransportError::Backend("no sockets".into()));

    let err = alice.controller.start_call(false).await.unwrap_err();
    assert!(matches!(err, CallError::Transport(_)));
    assert_eq!(alice.capture.open_handles(), 0);
    let events = drain(&mut alice.events);
    assert!(events
        .iter()
        .any(|e| matches!(e, CallEvent::CallEnded(EndReason::SetupFailed(_)))));
}

#[tokio::test]
async fn unreachable_signaling_fails_setup() {
    // a lone endpoint has nobody to deliver to
    let hub = LoopbackHub::new();
    let alice = peer("alice", Arc::new(hub.endpoint()));

    let err = alice.controller.start_call(false).await.unwrap_err();
    assert!(matches!(
        err,
        CallError::Negotiation(NegotiationError::Transport(TransportError::Unreachable(_)))
    ));
    assert_eq!(alice.capture.open_handles(), 0);
    assert_eq!(alice.transports.last().unwrap().close_count(), 1);
    assert!(!alice.controller.is_busy());
}

#[tokio::test]
async fn end_call_interrupts_setup() {
    let (a, _b) = LoopbackHub::pair();
    let mut alice = peer_with(
        "alice",
        Arc::new(a),
        FakeTransportFactory::with_offer_gate(),
    );

    let controller = alice.controller.clone();
    let setup = tokio::spawn(async move { controller.start_call(true).await });

    // wait until the offer is being created
    loop {
        if let Some(t) = alice.transports.last() {
            if t.local_tracks().len() == 2 {
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    assert!(alice.controller.end_call().await);
    assert_eq!(setup.await.unwrap().unwrap_err(), CallError::Cancelled);

    assert!(!alice.controller.end_call().await);

    alice.transports.release_offers();
    tokio::task::yield_now().await;
    assert_eq!(alice.capture.open_handles(), 0);
    let stats = alice.capture.stats();
    assert_eq!(stats.opened.load(Ordering::SeqCst), 2);
    assert_eq!(stats.stopped.load(Ordering::SeqCst), 2);
    assert_eq!(alice.transports.last().unwrap().close_count(), 1);

    let events = drain(&mut alice.events);
    assert_eq!(states(&events), vec![NegotiationState::Closed]);
    let ended: Vec<_> = events
        .iter()
        .filter(|e| matches!(e, CallEvent::CallEnded(_)))
        .collect();
    assert_eq!(ended.len(), 1);
    assert!(matches!(ended[0], CallEvent::CallEnded(EndReason::Hangup)));
    assert!(!alice.controller.is_busy());
}

#[tokio::test]
async fn candidates_arriving_before_acceptance_are_applied_on_accept() {
    let (_caller_side, b) = LoopbackHub::pair();
    let mut bob = peer("bob", Arc::new(b));
    let early = IceCandidate::new("candidate:7 1 udp 1 198.51.100.7 7000 typ srflx");

    bob.controller
        .handle_signal(SignalEnvelope {
            session_id: "s-early".into(),
            from: remote(),
            message: SignalMessage::Offer(SessionDescription::offer(REMOTE_OFFER)),
            ts: 0,
        })
        .await
        .unwrap();
    bob.controller
        .handle_signal(SignalEnvelope {
            session_id: "s-early".into(),
            from: remote(),
            message: SignalMessage::Candidate(early.clone()),
            ts: 0,
        })
        .await
        .unwrap();

    let offer = match wait_for(&mut bob.events, |e| matches!(e, CallEvent::IncomingCall(_))).await {
        CallEvent::IncomingCall(offer) => offer,
        _ => unreachable!(),
    };
    bob.controller.accept_incoming(offer).await.unwrap();

    let transport = bob.transports.last().unwrap();
    assert_eq!(transport.applied_candidates(), vec![early.clone()]);

    // a redelivered copy changes nothing
    bob.controller
        .handle_signal(SignalEnvelope {
            session_id: "s-early".into(),
            from: remote(),
            message: SignalMessage::Candidate(early.clone()),
            ts: 0,
        })
        .await
        .unwrap();
    assert_eq!(transport.applied_candidates(), vec![early]);
}

#[tokio::test]
async fn answer_after_hangup_is_rejected() {
    let (a, _b) = LoopbackHub::pair();
    let alice = peer("alice", Arc::new(a));
    let session_id = alice.controller.start_call(false).await.unwrap();
    alice.controller.end_call().await;

    let err = alice
        .controller
        .handle_signal(SignalEnvelope {
            session_id,
            from: remote(),
            message: SignalMessage::Answer(SessionDescription::answer("v=0\r\n")),
            ts: 0,
        })
        .await
        .unwrap_err();
    assert_eq!(err, CallError::Negotiation(NegotiationError::SessionClosed));
}

#[tokio::test]
async fn malformed_answer_ends_the_call() {
    let (a, _b) = LoopbackHub::pair();
    let mut alice = peer("alice", Arc::new(a));
    let session_id = alice.controller.start_call(false).await.unwrap();

    let err = alice
        .controller
        .handle_signal(SignalEnvelope {
            session_id,
            from: remote(),
            message: SignalMessage::Answer(SessionDescription::answer("garbage")),
            ts: 0,
        })
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CallError::Negotiation(NegotiationError::Malformed { .. })
    ));
    let ended = wait_for(&mut alice.events, |e| matches!(e, CallEvent::CallEnded(_))).await;
    assert!(matches!(
        ended,
        CallEvent::CallEnded(EndReason::NegotiationFailed(_))
    ));
    assert_eq!(alice.capture.open_handles(), 0);
}

#[tokio::test]
async fn remote_track_is_surfaced_and_cleared_on_hangup() {
    let (_caller_side, b) = LoopbackHub::pair();
    let mut bob = peer("bob", Arc::new(b));
    connected_callee(&mut bob).await;

    let track = peercall::MediaTrack::remote("remote-video", TrackKind::Video);
    bob.transports
        .last()
        .unwrap()
        .emit(TransportEvent::RemoteTrack(track.clone()));
    let event = wait_for(&mut bob.events, |e| {
        matches!(e, CallEvent::RemoteTrackAvailable(_))
    })
    .await;
    assert!(matches!(event, CallEvent::RemoteTrackAvailable(t) if t == track));
    assert_eq!(
        bob.controller.session().await.unwrap().remote_track(),
        Some(&track)
    );

    bob.controller.end_call().await;
    assert!(bob.controller.session().await.is_none());
}

fn envelope(session_id: &str, message: SignalMessage) -> SignalEnvelope {
    SignalEnvelope {
        session_id: session_id.into(),
        from: remote(),
        message,
        ts: 0,
    }
}

#[tokio::test]
async fn hanging_up_keeps_candidates_of_a_waiting_offer() {
    let (_caller_side, b) = LoopbackHub::pair();
    let mut bob = peer("bob", Arc::new(b));
    bob.controller.start_call(false).await.unwrap();

    // a second caller rings while the first call is up
    let early = IceCandidate::new("candidate:7 1 udp 1 198.51.100.7 7000 typ srflx");
    bob.controller
        .handle_signal(envelope(
            "carol-call",
            SignalMessage::Offer(SessionDescription::offer(REMOTE_OFFER)),
        ))
        .await
        .unwrap();
    bob.controller
        .handle_signal(envelope("carol-call", SignalMessage::Candidate(early.clone())))
        .await
        .unwrap();
    let offer = match wait_for(&mut bob.events, |e| matches!(e, CallEvent::IncomingCall(_))).await {
        CallEvent::IncomingCall(offer) => offer,
        _ => unreachable!(),
    };

    assert!(bob.controller.end_call().await);
    assert_eq!(bob.controller.pending_candidates("carol-call"), 1);

    bob.controller.accept_incoming(offer).await.unwrap();
    let transport = bob.transports.last().unwrap();
    assert_eq!(transport.session_id(), "carol-call");
    assert_eq!(transport.applied_candidates(), vec![early]);
}

#[tokio::test]
async fn unknown_session_candidates_stay_bounded() {
    let (_caller_side, b) = LoopbackHub::pair();
    let bob = peer("bob", Arc::new(b));
    let max = bob.controller.config().session.max_pending_sessions;
    let real = IceCandidate::new("candidate:7 1 udp 1 198.51.100.7 7000 typ srflx");

    bob.controller
        .handle_signal(envelope(
            "real-call",
            SignalMessage::Offer(SessionDescription::offer(REMOTE_OFFER)),
        ))
        .await
        .unwrap();
    bob.controller
        .handle_signal(envelope("real-call", SignalMessage::Candidate(real.clone())))
        .await
        .unwrap();

    for i in 0..10_000 {
        let junk = IceCandidate::new(format!("candidate:{i} 1 udp 1 10.0.0.1 5000 typ host"));
        bob.controller
            .handle_signal(envelope(&format!("junk-{i}"), SignalMessage::Candidate(junk)))
            .await
            .unwrap();
    }
    let held = (0..10_000)
        .filter(|i| bob.controller.pending_candidates(&format!("junk-{i}")) > 0)
        .count();
    assert!(held < max, "{held} junk sessions still buffered");
    assert_eq!(bob.controller.pending_candidates("junk-9999"), 1);
    assert_eq!(bob.controller.pending_candidates("junk-0"), 0);

    // the surfaced offer's candidate survived the flood
    assert_eq!(bob.controller.pending_candidates("real-call"), 1);
}

#[tokio::test]
async fn late_candidates_for_an_ended_call_are_dropped() {
    let (_caller_side, b) = LoopbackHub::pair();
    let mut bob = peer("bob", Arc::new(b));
    let session_id = connected_callee(&mut bob).await;
    bob.controller.end_call().await;

    let late = IceCandidate::new("candidate:9 1 udp 1 203.0.113.9 9000 typ relay");
    bob.controller
        .handle_signal(envelope(&session_id, SignalMessage::Candidate(late)))
        .await
        .unwrap();
    assert_eq!(bob.controller.pending_candidates(&session_id), 0);
    assert!(bob.transports.last().unwrap().applied_candidates().is_empty());
}
