// Integration tests for the call session flow
//
// Drives complete sessions over the in-process relay and loopback network:
// - Idempotent initialization
// - Caller/answerer assignment and glare resolution
// - Mute/camera toggles without renegotiation
// - Peer departure and rejoin
// - Teardown completeness and setup failures

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use mentorcall_core::negotiator::{AnswerOutcome, CallUpdate};
use mentorcall_core::{
    CallConfig, CallError, CallRole, CallSession, CallStatus, CallView, DeviceBehavior,
    InMemoryRelay, LoopbackNetwork, MediaConstraints, Negotiator, NegotiatorState, Notice,
    PeerInfo, SessionDeps, SessionHandle, SessionId, SessionParams, SyntheticDevices,
};
use mentorcall_core::{LocalMediaAcquirer, PeerNetwork};

const WAIT: Duration = Duration::from_secs(5);
const SESSION: &str = "abc123";

struct Harness {
    relay: InMemoryRelay,
    network: LoopbackNetwork,
    config: CallConfig,
}

impl Harness {
    fn new() -> Self {
        Self {
            relay: InMemoryRelay::new(2),
            network: LoopbackNetwork::new(),
            config: CallConfig::default(),
        }
    }

    fn join_with(&self, name: &str, devices: Arc<SyntheticDevices>) -> SessionHandle {
        CallSession::spawn(
            SessionDeps {
                devices,
                network: Arc::new(self.network.clone()),
                signaling: Arc::new(self.relay.clone()),
            },
            SessionParams {
                session_id: SessionId::from(SESSION),
                display_name: name.to_string(),
                config: self.config.clone(),
            },
        )
    }

    fn join(&self, name: &str) -> (SessionHandle, Arc<SyntheticDevices>) {
        let devices = Arc::new(SyntheticDevices::new());
        (self.join_with(name, devices.clone()), devices)
    }

    fn members(&self) -> usize {
        self.relay.member_count(&SessionId::from(SESSION))
    }
}

fn connected(view: &CallView) -> bool {
    view.peer_connected
}

fn waiting(view: &CallView) -> bool {
    matches!(
        view.state,
        NegotiatorState::AwaitingPeer | NegotiatorState::PeerDeparted
    )
}

async fn connect_pair(harness: &Harness) -> (SessionHandle, SessionHandle) {
    let (asha, _) = harness.join("Asha");
    asha.initialize().await.unwrap();
    let (rahul, _) = harness.join("Rahul");
    rahul.initialize().await.unwrap();

    asha.wait_for(WAIT, connected).await.unwrap();
    rahul.wait_for(WAIT, connected).await.unwrap();
    (asha, rahul)
}

#[tokio::test]
async fn test_end_to_end_first_joiner_becomes_caller() {
    let harness = Harness::new();

    let (asha, _) = harness.join("Asha");
    asha.initialize().await.unwrap();

    let view = asha.current();
    assert_eq!(view.state, NegotiatorState::AwaitingPeer);
    assert_eq!(view.peer_name, "Connecting...");
    assert!(view.remote_stream.is_none());

    let (rahul, _) = harness.join("Rahul");
    rahul.initialize().await.unwrap();

    let asha_view = asha.wait_for(WAIT, connected).await.unwrap();
    let rahul_view = rahul.wait_for(WAIT, connected).await.unwrap();

    assert_eq!(
        asha_view.state,
        NegotiatorState::Connected {
            role: CallRole::Caller
        }
    );
    assert_eq!(
        rahul_view.state,
        NegotiatorState::Connected {
            role: CallRole::Answerer
        }
    );
    assert_eq!(asha_view.peer_name, "Rahul");
    assert_eq!(rahul_view.peer_name, "Asha");
    assert_eq!(asha_view.status_text(), "Connected");

    // Each side renders the other's live stream
    let asha_local = asha_view.local_stream.unwrap();
    let rahul_local = rahul_view.local_stream.unwrap();
    assert_eq!(rahul_view.remote_stream.unwrap().id(), asha_local.id());
    assert_eq!(asha_view.remote_stream.unwrap().id(), rahul_local.id());
}

#[tokio::test]
async fn test_repeated_initialize_acquires_and_registers_once() {
    let harness = Harness::new();
    let devices = Arc::new(SyntheticDevices::new().with_delay(Duration::from_millis(20)));
    let asha = harness.join_with("Asha", devices.clone());

    let results = join_all((0..5).map(|_| asha.initialize())).await;
    assert!(results.iter().all(Result::is_ok));
    asha.initialize().await.unwrap();

    assert_eq!(devices.request_count(), 1);
    assert_eq!(harness.network.registration_count(), 1);
    assert_eq!(harness.members(), 1);
    assert_eq!(asha.current().state, NegotiatorState::AwaitingPeer);
}

#[tokio::test]
async fn test_toggle_twice_restores_flags_without_renegotiation() {
    let harness = Harness::new();
    let (asha, rahul) = connect_pair(&harness).await;

    let before = asha.current();
    let stream = before.local_stream.clone().unwrap();
    let state = before.state;

    assert!(!asha.toggle_mic().await.unwrap());
    // The remote side shares the track handles
    let remote = rahul.current().remote_stream.unwrap();
    assert!(remote.audio_tracks().all(|t| !t.is_enabled()));
    assert!(remote.video_tracks().all(|t| t.is_enabled()));

    assert!(asha.toggle_mic().await.unwrap());
    assert!(!asha.toggle_cam().await.unwrap());
    assert!(asha.toggle_cam().await.unwrap());

    let after = asha.current();
    assert!(after.mic_enabled && after.cam_enabled);
    assert!(after.local_stream.unwrap().same_stream(&stream));
    assert_eq!(after.state, state);
    assert_eq!(harness.network.registration_count(), 2);
    assert!(remote.audio_tracks().all(|t| t.is_enabled()));
}

#[tokio::test]
async fn test_peer_departure_returns_to_waiting() {
    let harness = Harness::new();
    let (asha, rahul) = connect_pair(&harness).await;
    let mut notices = asha.notices();
    let stream = asha.current().local_stream.unwrap();

    rahul.end_call().await.unwrap();

    let view = asha
        .wait_for(WAIT, |v| v.state == NegotiatorState::PeerDeparted)
        .await
        .unwrap();
    assert!(view.remote_stream.is_none());
    assert!(!view.peer_connected);
    assert_eq!(view.peer_name, "Connecting...");
    assert_eq!(view.status_text(), "Peer left");

    // Local media is untouched
    let local = view.local_stream.unwrap();
    assert!(local.same_stream(&stream));
    assert!(local.is_live());
    assert!(view.mic_enabled);

    let notice = tokio::time::timeout(WAIT, notices.recv()).await.unwrap().unwrap();
    assert!(matches!(notice, Notice::Info(ref text) if text.contains("Rahul")));

    // The remaining participant calls whoever joins next
    let (rahul_again, _) = harness.join("Rahul");
    rahul_again.initialize().await.unwrap();
    let view = asha.wait_for(WAIT, connected).await.unwrap();
    assert_eq!(view.peer_name, "Rahul");
    assert!(view.local_stream.unwrap().same_stream(&stream));
}

#[tokio::test]
async fn test_end_call_releases_everything() {
    let harness = Harness::new();
    let (asha, rahul) = connect_pair(&harness).await;
    let stream = asha.current().local_stream.unwrap();

    asha.end_call().await.unwrap();

    let view = asha.current();
    assert_eq!(view.state, NegotiatorState::Ended);
    assert_eq!(view.status_text(), "Call ended");
    assert!(view.remote_stream.is_none());
    assert!(!stream.is_live());
    assert!(stream.tracks().iter().all(|t| !t.is_enabled()));
    assert_eq!(harness.members(), 1);
    assert_eq!(harness.network.endpoint_count(), 1);

    rahul.wait_for(WAIT, waiting).await.unwrap();
    assert!(matches!(asha.end_call().await, Err(CallError::SessionClosed)));
}

#[tokio::test]
async fn test_dropping_handles_tears_down() {
    let harness = Harness::new();
    let (asha, _) = harness.join("Asha");
    asha.initialize().await.unwrap();

    let mut view = asha.view();
    let stream = asha.current().local_stream.unwrap();
    drop(asha);

    tokio::time::timeout(WAIT, view.wait_for(CallView::is_ended))
        .await
        .unwrap()
        .unwrap();
    assert!(!stream.is_live());
    assert_eq!(harness.members(), 0);
    assert_eq!(harness.network.endpoint_count(), 0);
}

#[tokio::test]
async fn test_media_denied_ends_session_with_error() {
    let harness = Harness::new();
    let devices = Arc::new(SyntheticDevices::with_behavior(DeviceBehavior::DenyPermission));
    let asha = harness.join_with("Asha", devices);
    let mut notices = asha.notices();

    asha.initialize().await.unwrap();

    let view = asha.wait_for(WAIT, CallView::is_ended).await.unwrap();
    assert!(matches!(view.status, CallStatus::Error(_)));
    assert!(view.status_text().starts_with("Error: "));
    assert!(matches!(notices.recv().await.unwrap(), Notice::Error(_)));

    // Never proceeded to negotiation
    assert_eq!(harness.network.registration_count(), 0);
    assert_eq!(harness.members(), 0);
}

#[tokio::test]
async fn test_third_participant_is_refused() {
    let harness = Harness::new();
    let (_asha, _rahul) = connect_pair(&harness).await;

    let (third, devices) = harness.join("Intruder");
    third.initialize().await.unwrap();

    let view = third.wait_for(WAIT, CallView::is_ended).await.unwrap();
    assert!(matches!(view.status, CallStatus::Error(_)));
    assert_eq!(devices.request_count(), 1);
    assert_eq!(harness.members(), 2);
}

#[tokio::test]
async fn test_negotiation_timeout_is_not_retried() {
    let mut harness = Harness::new();
    harness.config.negotiation_timeout_ms = 200;
    harness.network.stall_media(true);

    let (asha, _) = harness.join("Asha");
    asha.initialize().await.unwrap();
    let (rahul, _) = harness.join("Rahul");
    rahul.initialize().await.unwrap();

    let view = asha.wait_for(WAIT, CallView::is_ended).await.unwrap();
    assert!(matches!(view.status, CallStatus::Error(_)));
    assert_eq!(harness.network.registration_count(), 2);
}

async fn ready_negotiator(
    network: &LoopbackNetwork,
) -> (
    Negotiator,
    tokio::sync::mpsc::UnboundedReceiver<mentorcall_core::IncomingCall>,
) {
    let network: Arc<dyn PeerNetwork> = Arc::new(network.clone());
    let mut negotiator = Negotiator::new(network, Duration::from_secs(2));
    negotiator.begin().unwrap();
    let incoming = negotiator.register().await.unwrap();
    negotiator.mark_announced().unwrap();
    negotiator.mark_awaiting_peer().unwrap();
    (negotiator, incoming)
}

#[tokio::test]
async fn test_simultaneous_calls_resolve_to_one_caller() {
    for round in 0..20 {
        let network = LoopbackNetwork::new();
        let acquirer = LocalMediaAcquirer::new(
            Arc::new(SyntheticDevices::new()),
            MediaConstraints::default(),
        );
        let media = acquirer.acquire().await.unwrap();

        let (mut a, mut a_in) = ready_negotiator(&network).await;
        let (mut b, mut b_in) = ready_negotiator(&network).await;
        let a_info = PeerInfo {
            peer_id: a.address().unwrap().clone(),
            name: "A".to_string(),
        };
        let b_info = PeerInfo {
            peer_id: b.address().unwrap().clone(),
            name: "B".to_string(),
        };

        a.call(&b_info, &media, "A").await.unwrap();
        b.call(&a_info, &media, "B").await.unwrap();

        // Vary which side handles its inbound call first
        let to_a = a_in.recv().await.unwrap();
        let to_b = b_in.recv().await.unwrap();
        let outcomes = if round % 2 == 0 {
            let x = a.answer(to_a, &media).await.unwrap();
            let y = b.answer(to_b, &media).await.unwrap();
            [x, y]
        } else {
            let y = b.answer(to_b, &media).await.unwrap();
            let x = a.answer(to_a, &media).await.unwrap();
            [x, y]
        };
        assert_eq!(
            outcomes
                .iter()
                .filter(|o| **o == AnswerOutcome::Answered)
                .count(),
            1
        );

        for negotiator in [&mut a, &mut b] {
            loop {
                let event = tokio::time::timeout(WAIT, negotiator.next_call_event())
                    .await
                    .unwrap();
                if negotiator.handle_call_event(event).unwrap() == CallUpdate::Connected {
                    break;
                }
            }
            assert!(negotiator.has_active_call());
        }

        let mut roles = [a.call_role().unwrap(), b.call_role().unwrap()];
        roles.sort_by_key(|r| *r == CallRole::Answerer);
        assert_eq!(roles, [CallRole::Caller, CallRole::Answerer]);

        let smaller = if a.address() < b.address() { &a } else { &b };
        assert_eq!(smaller.call_role(), Some(CallRole::Answerer));
    }
}
