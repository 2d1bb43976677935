//! Negotiation over real peer connections (webrtc-rs)

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use super::{
    CallEvent, CallHandle, CallLink, CallMetadata, CallResponder, CallRole, IncomingCall,
    PeerEndpoint, PeerNetwork, Registration, RemoteMediaStream,
};
use crate::config::IceServerConfig;
use crate::error::{CallError, Result};
use crate::media::{LocalMediaStream, MediaTrack, TrackKind};
use crate::types::{PeerAddress, StreamId};

const AUDIO_FRAME: Duration = Duration::from_millis(20);
const VIDEO_FRAME: Duration = Duration::from_millis(33);

/// A remote track silent for longer than this reads as disabled
const FLOW_GAP: Duration = Duration::from_millis(500);

/// Opus CELT silence frame
const OPUS_SILENCE: &[u8] = &[0xf8, 0xff, 0xfe];
/// VP8 key frame header of a 16x16 frame; synthetic cameras have no encoder
const VP8_FILLER: &[u8] = &[0x50, 0x01, 0x00, 0x9d, 0x01, 0x2a, 0x10, 0x00, 0x10, 0x00];

/// SDP blob exchanged during negotiation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SessionDescription {
    Offer { sdp: String },
    Answer { sdp: String },
}

impl SessionDescription {
    #[must_use]
    pub fn sdp(&self) -> &str {
        match self {
            Self::Offer { sdp } | Self::Answer { sdp } => sdp,
        }
    }
}

/// Offer routed to an address, awaiting an answer or a refusal
pub struct OfferRequest {
    pub from: PeerAddress,
    pub metadata: CallMetadata,
    pub offer: SessionDescription,
    reply: oneshot::Sender<Option<SessionDescription>>,
}

impl OfferRequest {
    pub fn new(
        from: PeerAddress,
        metadata: CallMetadata,
        offer: SessionDescription,
    ) -> (Self, oneshot::Receiver<Option<SessionDescription>>) {
        let (reply, rx) = oneshot::channel();
        (
            Self {
                from,
                metadata,
                offer,
                reply,
            },
            rx,
        )
    }

    /// Send the answer back, or `None` to refuse
    pub fn respond(self, answer: Option<SessionDescription>) {
        let _ = self.reply.send(answer);
    }

    #[must_use]
    pub fn is_abandoned(&self) -> bool {
        self.reply.is_closed()
    }
}

/// Carries offers and answers between registered addresses
#[async_trait]
pub trait DescriptionExchange: Send + Sync {
    async fn listen(&self, address: &PeerAddress) -> Result<mpsc::UnboundedReceiver<OfferRequest>>;

    async fn send_offer(&self, to: &PeerAddress, request: OfferRequest) -> Result<()>;

    async fn forget(&self, address: &PeerAddress);
}

/// In-process description exchange
#[derive(Clone, Default)]
pub struct InMemoryExchange {
    listeners: Arc<DashMap<PeerAddress, mpsc::UnboundedSender<OfferRequest>>>,
}

impl InMemoryExchange {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DescriptionExchange for InMemoryExchange {
    async fn listen(&self, address: &PeerAddress) -> Result<mpsc::UnboundedReceiver<OfferRequest>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners.insert(address.clone(), tx);
        Ok(rx)
    }

    async fn send_offer(&self, to: &PeerAddress, request: OfferRequest) -> Result<()> {
        let listener = self
            .listeners
            .get(to)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| CallError::NegotiationFailed(format!("peer {to} is not reachable")))?;
        listener
            .send(request)
            .map_err(|_| CallError::NegotiationFailed(format!("peer {to} hung up")))
    }

    async fn forget(&self, address: &PeerAddress) {
        self.listeners.remove(address);
    }
}

fn rtc_error(context: &str) -> impl Fn(webrtc::Error) -> CallError + '_ {
    move |e| CallError::NegotiationFailed(format!("{context}: {e}"))
}

fn ice_servers(servers: &[IceServerConfig]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|s| RTCIceServer {
            urls: s.urls.clone(),
            username: s.username.clone().unwrap_or_default(),
            credential: s.credential.clone().unwrap_or_default(),
            ..Default::default()
        })
        .collect()
}

/// Number of audio/video sections a description announces
fn media_sections(sdp: &str) -> usize {
    sdp.lines()
        .filter(|line| line.starts_with("m=audio") || line.starts_with("m=video"))
        .count()
}

/// Tracks received from the peer.
///
/// Surfaced as one stream once the connection is up and every announced
/// media section has delivered its track.
struct RemoteTracks {
    events: mpsc::UnboundedSender<CallEvent>,
    progress: Mutex<RemoteProgress>,
}

#[derive(Default)]
struct RemoteProgress {
    stream_id: Option<StreamId>,
    expected: Option<usize>,
    tracks: Vec<Arc<MediaTrack>>,
    connected: bool,
    surfaced: bool,
}

impl RemoteTracks {
    fn new(events: mpsc::UnboundedSender<CallEvent>) -> Self {
        Self {
            events,
            progress: Mutex::new(RemoteProgress::default()),
        }
    }

    fn expect(&self, sections: usize) {
        let mut progress = self.progress.lock();
        progress.expected = Some(sections);
        self.surface_if_ready(&mut progress);
    }

    fn add(&self, stream_id: &str, track: Arc<MediaTrack>) {
        let mut progress = self.progress.lock();
        progress
            .stream_id
            .get_or_insert_with(|| StreamId::new(stream_id));
        progress.tracks.push(track);
        self.surface_if_ready(&mut progress);
    }

    fn mark_connected(&self) {
        let mut progress = self.progress.lock();
        progress.connected = true;
        self.surface_if_ready(&mut progress);
    }

    fn notify(&self, event: CallEvent) {
        let _ = self.events.send(event);
    }

    fn surface_if_ready(&self, progress: &mut RemoteProgress) {
        if progress.surfaced || !progress.connected {
            return;
        }
        if !progress
            .expected
            .is_some_and(|expected| progress.tracks.len() >= expected)
        {
            return;
        }

        progress.surfaced = true;
        let id = progress
            .stream_id
            .clone()
            .unwrap_or_else(StreamId::generate);
        self.notify(CallEvent::RemoteStream(RemoteMediaStream::new(
            id,
            progress.tracks.clone(),
        )));
    }
}

/// Mirror the packet flow of one remote track onto its `MediaTrack`.
///
/// `next_packet` resolves to `false` once the flow has ended for good.
async fn observe_flow<F, Fut>(track: Arc<MediaTrack>, mut next_packet: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    loop {
        match tokio::time::timeout(FLOW_GAP, next_packet()).await {
            Ok(true) => track.set_enabled(true),
            Ok(false) => break,
            Err(_) => track.set_enabled(false),
        }
    }
    track.stop();
    debug!(track_id = %track.id(), "Remote track ended");
}

/// Feed one local track into its sender while the track is live.
///
/// A disabled track sends nothing, which the far side reads as muted.
async fn pump_samples(track: Arc<MediaTrack>, sender: Arc<TrackLocalStaticSample>) {
    let (payload, frame) = match track.kind() {
        TrackKind::Audio => (OPUS_SILENCE, AUDIO_FRAME),
        TrackKind::Video => (VP8_FILLER, VIDEO_FRAME),
    };

    let mut ticker = tokio::time::interval(frame);
    while track.is_live() {
        ticker.tick().await;
        if !track.is_enabled() {
            continue;
        }
        let sample = Sample {
            data: payload.into(),
            duration: frame,
            ..Default::default()
        };
        if let Err(e) = sender.write_sample(&sample).await {
            debug!(track_id = %track.id(), error = %e, "Sample pump stopped");
            break;
        }
    }
}

/// A peer connection plus the tasks feeding its senders
struct Connection {
    pc: Arc<RTCPeerConnection>,
    pumps: Vec<JoinHandle<()>>,
}

/// Negotiation infrastructure backed by `RTCPeerConnection`s
#[derive(Clone)]
pub struct RtcNetwork {
    api: Arc<API>,
    config: RTCConfiguration,
    exchange: Arc<dyn DescriptionExchange>,
    open: Arc<AtomicUsize>,
}

impl RtcNetwork {
    pub fn new(servers: &[IceServerConfig], exchange: Arc<dyn DescriptionExchange>) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(rtc_error("register codecs"))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(rtc_error("register interceptors"))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        Ok(Self {
            api: Arc::new(api),
            config: RTCConfiguration {
                ice_servers: ice_servers(servers),
                ..Default::default()
            },
            exchange,
            open: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Peer connections created and not yet closed
    #[must_use]
    pub fn open_connections(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }

    /// Peer connection with the local tracks attached and the remote side wired up
    async fn prepare(
        &self,
        local: &LocalMediaStream,
        remote: Arc<RemoteTracks>,
    ) -> Result<Connection> {
        let pc = Arc::new(
            self.api
                .new_peer_connection(self.config.clone())
                .await
                .map_err(rtc_error("create peer connection"))?,
        );
        self.open.fetch_add(1, Ordering::SeqCst);

        let senders = match attach_local_tracks(&pc, local).await {
            Ok(senders) => senders,
            Err(e) => {
                self.discard(&pc).await;
                return Err(e);
            }
        };
        watch_connection(&pc, remote);

        let pumps = senders
            .into_iter()
            .map(|(track, sender)| tokio::spawn(pump_samples(track, sender)))
            .collect();
        Ok(Connection { pc, pumps })
    }

    async fn discard(&self, pc: &RTCPeerConnection) {
        self.open.fetch_sub(1, Ordering::SeqCst);
        if let Err(e) = pc.close().await {
            warn!(error = %e, "Failed to close peer connection");
        }
    }

    /// Close a connection that never made it into a call handle
    async fn release(&self, connection: Connection) {
        for pump in &connection.pumps {
            pump.abort();
        }
        self.discard(&connection.pc).await;
    }
}

async fn attach_local_tracks(
    pc: &RTCPeerConnection,
    local: &LocalMediaStream,
) -> Result<Vec<(Arc<MediaTrack>, Arc<TrackLocalStaticSample>)>> {
    let mut senders = Vec::with_capacity(local.tracks().len());
    for track in local.tracks() {
        let mime_type = match track.kind() {
            TrackKind::Audio => MIME_TYPE_OPUS,
            TrackKind::Video => MIME_TYPE_VP8,
        };
        let sender = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: mime_type.to_owned(),
                ..Default::default()
            },
            track.id().to_string(),
            local.id().to_string(),
        ));
        pc.add_track(sender.clone() as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(rtc_error("add track"))?;
        senders.push((track.clone(), sender));
    }
    Ok(senders)
}

/// Route connection state and arriving remote tracks into `remote`
fn watch_connection(pc: &RTCPeerConnection, remote: Arc<RemoteTracks>) {
    let on_state = remote.clone();
    pc.on_peer_connection_state_change(Box::new(move |state| {
        let remote = on_state.clone();
        Box::pin(async move {
            debug!(state = %state, "Peer connection state changed");
            match state {
                RTCPeerConnectionState::Connected => remote.mark_connected(),
                RTCPeerConnectionState::Failed => {
                    remote.notify(CallEvent::Failed("peer connection failed".to_string()));
                }
                RTCPeerConnectionState::Disconnected | RTCPeerConnectionState::Closed => {
                    remote.notify(CallEvent::Closed);
                }
                _ => {}
            }
        })
    }));

    pc.on_track(Box::new(move |track, _receiver, _transceiver| {
        let remote = remote.clone();
        Box::pin(async move {
            let kind = match track.kind() {
                RTPCodecType::Audio => TrackKind::Audio,
                RTPCodecType::Video => TrackKind::Video,
                RTPCodecType::Unspecified => {
                    warn!(track_id = %track.id(), "Ignoring remote track of unknown kind");
                    return;
                }
            };
            info!(track_id = %track.id(), %kind, "Remote track arrived");

            let media = Arc::new(MediaTrack::new(kind, format!("remote {kind}")));
            remote.add(&track.stream_id(), media.clone());

            tokio::spawn(observe_flow(media, move || {
                let track = track.clone();
                async move { track.read_rtp().await.is_ok() }
            }));
        })
    }));
}

/// Set the local description and wait until candidate gathering is done
async fn complete_local_description(
    pc: &RTCPeerConnection,
    description: RTCSessionDescription,
) -> Result<String> {
    let mut gathered = pc.gathering_complete_promise().await;
    pc.set_local_description(description)
        .await
        .map_err(rtc_error("set local description"))?;
    let _ = gathered.recv().await;

    pc.local_description()
        .await
        .map(|d| d.sdp)
        .ok_or_else(|| CallError::NegotiationFailed("no local description".to_string()))
}

struct OfferTarget {
    from: PeerAddress,
    to: PeerAddress,
    metadata: CallMetadata,
}

/// Caller side of one exchange. `Ok(false)` when the peer refused the offer.
async fn offer_and_apply_answer(
    pc: &RTCPeerConnection,
    exchange: &dyn DescriptionExchange,
    target: OfferTarget,
    remote: &RemoteTracks,
) -> Result<bool> {
    let offer = pc.create_offer(None).await.map_err(rtc_error("create offer"))?;
    let sdp = complete_local_description(pc, offer).await?;

    let (request, reply) = OfferRequest::new(
        target.from,
        target.metadata,
        SessionDescription::Offer { sdp },
    );
    exchange.send_offer(&target.to, request).await?;

    let Ok(Some(answer)) = reply.await else {
        return Ok(false);
    };

    remote.expect(media_sections(answer.sdp()));
    let description = RTCSessionDescription::answer(answer.sdp().to_string())
        .map_err(rtc_error("parse answer"))?;
    pc.set_remote_description(description)
        .await
        .map_err(rtc_error("set remote description"))?;
    Ok(true)
}

/// Answerer side of one exchange: apply the offer and produce the answer
async fn answer_offer(pc: &RTCPeerConnection, offer_sdp: &str) -> Result<String> {
    let offer = RTCSessionDescription::offer(offer_sdp.to_string())
        .map_err(rtc_error("parse offer"))?;
    pc.set_remote_description(offer)
        .await
        .map_err(rtc_error("set remote description"))?;

    let answer = pc
        .create_answer(None)
        .await
        .map_err(rtc_error("create answer"))?;
    complete_local_description(pc, answer).await
}

#[async_trait]
impl PeerNetwork for RtcNetwork {
    async fn register(&self) -> Result<Registration> {
        let address = PeerAddress::generate();
        let mut offers = self.exchange.listen(&address).await?;
        let (tx, rx) = mpsc::unbounded_channel();

        let network = self.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(request) = offers.recv().await {
                let incoming = IncomingCall::new(
                    request.from.clone(),
                    request.metadata.clone(),
                    Box::new(RtcResponder {
                        network: network.clone(),
                        request,
                    }),
                );
                if tx.send(incoming).is_err() {
                    break;
                }
            }
        });

        info!(address = %address, "WebRTC endpoint registered");

        Ok(Registration {
            address: address.clone(),
            endpoint: Box::new(RtcEndpoint {
                network: self.clone(),
                address,
                forwarder: Mutex::new(Some(forwarder)),
            }),
            incoming: rx,
        })
    }
}

struct RtcEndpoint {
    network: RtcNetwork,
    address: PeerAddress,
    forwarder: Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl PeerEndpoint for RtcEndpoint {
    fn address(&self) -> &PeerAddress {
        &self.address
    }

    async fn call(
        &self,
        peer: &PeerAddress,
        local: &LocalMediaStream,
        metadata: CallMetadata,
    ) -> Result<CallHandle> {
        let (tx, rx) = mpsc::unbounded_channel();
        let remote = Arc::new(RemoteTracks::new(tx));
        let connection = self.network.prepare(local, remote.clone()).await?;

        let exchange = self.network.exchange.clone();
        let target = OfferTarget {
            from: self.address.clone(),
            to: peer.clone(),
            metadata,
        };
        let task_pc = connection.pc.clone();

        // Offer/answer runs in the background so the session keeps handling
        // inbound calls while this one is pending.
        let task = tokio::spawn(async move {
            let to = target.to.clone();
            match offer_and_apply_answer(&task_pc, exchange.as_ref(), target, &remote).await {
                Ok(true) => debug!(peer = %to, "Answer applied"),
                Ok(false) => remote.notify(CallEvent::Closed),
                Err(e) => remote.notify(CallEvent::Failed(e.to_string())),
            }
        });

        Ok(CallHandle::new(
            peer.clone(),
            CallRole::Caller,
            rx,
            Box::new(RtcLink::new(&self.network, connection, Some(task))),
        ))
    }

    async fn destroy(&self) {
        if let Some(forwarder) = self.forwarder.lock().take() {
            forwarder.abort();
        }
        self.network.exchange.forget(&self.address).await;
        info!(address = %self.address, "WebRTC endpoint destroyed");
    }
}

struct RtcResponder {
    network: RtcNetwork,
    request: OfferRequest,
}

#[async_trait]
impl CallResponder for RtcResponder {
    async fn answer(self: Box<Self>, local: &LocalMediaStream) -> Result<CallHandle> {
        let Self { network, request } = *self;

        let (tx, rx) = mpsc::unbounded_channel();
        let remote = Arc::new(RemoteTracks::new(tx));
        remote.expect(media_sections(request.offer.sdp()));
        let connection = network.prepare(local, remote).await?;

        let answered = match answer_offer(&connection.pc, request.offer.sdp()).await {
            Ok(_) if request.is_abandoned() => Err(CallError::CallCancelled),
            other => other,
        };
        let sdp = match answered {
            Ok(sdp) => sdp,
            Err(e) => {
                network.release(connection).await;
                return Err(e);
            }
        };

        let from = request.from.clone();
        request.respond(Some(SessionDescription::Answer { sdp }));

        Ok(CallHandle::new(
            from,
            CallRole::Answerer,
            rx,
            Box::new(RtcLink::new(&network, connection, None)),
        ))
    }

    fn reject(self: Box<Self>, reason: &str) {
        debug!(from = %self.request.from, reason, "Refusing offer");
        self.request.respond(None);
    }

    fn is_cancelled(&self) -> bool {
        self.request.is_abandoned()
    }
}

struct RtcLink {
    pc: Arc<RTCPeerConnection>,
    open: Arc<AtomicUsize>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RtcLink {
    fn new(network: &RtcNetwork, connection: Connection, negotiation: Option<JoinHandle<()>>) -> Self {
        let mut tasks = connection.pumps;
        tasks.extend(negotiation);
        Self {
            pc: connection.pc,
            open: network.open.clone(),
            tasks: Mutex::new(tasks),
        }
    }
}

impl CallLink for RtcLink {
    fn close(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.open.fetch_sub(1, Ordering::SeqCst);

        let pc = self.pc.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = pc.close().await {
                        warn!(error = %e, "Failed to close peer connection");
                    }
                });
            }
            Err(_) => warn!("No runtime to close peer connection on"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{LocalMediaAcquirer, MediaConstraints, SyntheticDevices};

    const SAMPLE_SDP: &str = "v=0\r\n\
o=- 0 0 IN IP4 127.0.0.1\r\n\
s=-\r\n\
t=0 0\r\n\
m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n\
a=mid:0\r\n\
m=video 9 UDP/TLS/RTP/SAVPF 96\r\n\
a=mid:1\r\n\
m=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\n";

    async fn local_media() -> (LocalMediaAcquirer, LocalMediaStream) {
        let acquirer = LocalMediaAcquirer::new(
            Arc::new(SyntheticDevices::new()),
            MediaConstraints::default(),
        );
        let media = acquirer.acquire().await.unwrap();
        (acquirer, media)
    }

    #[test]
    fn test_media_sections_counted() {
        assert_eq!(media_sections(SAMPLE_SDP), 2);
        assert_eq!(media_sections("v=0\r\n"), 0);
    }

    #[test]
    fn test_ice_server_credentials_are_carried() {
        let servers = ice_servers(&[
            IceServerConfig::stun("stun:stun.l.google.com:19302"),
            IceServerConfig {
                urls: vec!["turn:turn.example.com:3478".to_string()],
                username: Some("mentor".to_string()),
                credential: Some("secret".to_string()),
            },
        ]);
        assert_eq!(servers.len(), 2);
        assert!(servers[0].username.is_empty());
        assert_eq!(servers[1].credential, "secret");
    }

    #[test]
    fn test_description_json_shape() {
        let json = serde_json::to_value(SessionDescription::Offer {
            sdp: "v=0".to_string(),
        })
        .unwrap();
        assert_eq!(json["type"], "offer");
        assert_eq!(json["sdp"], "v=0");
    }

    #[test]
    fn test_remote_stream_waits_for_tracks_and_connection() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let remote = RemoteTracks::new(tx);
        remote.expect(2);

        remote.add(
            "stream-asha",
            Arc::new(MediaTrack::new(TrackKind::Audio, "remote audio")),
        );
        remote.mark_connected();
        // Video section announced but its track has not arrived
        assert!(rx.try_recv().is_err());

        remote.add(
            "stream-asha",
            Arc::new(MediaTrack::new(TrackKind::Video, "remote video")),
        );
        let Ok(CallEvent::RemoteStream(stream)) = rx.try_recv() else {
            panic!("expected remote stream");
        };
        assert_eq!(stream.id(), &StreamId::new("stream-asha"));
        assert_eq!(stream.audio_tracks().count(), 1);
        assert_eq!(stream.video_tracks().count(), 1);

        remote.mark_connected();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_remote_stream_surfaces_on_connect_when_tracks_came_first() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let remote = RemoteTracks::new(tx);
        remote.expect(1);
        remote.add(
            "stream-rahul",
            Arc::new(MediaTrack::new(TrackKind::Audio, "remote audio")),
        );
        assert!(rx.try_recv().is_err());

        remote.mark_connected();
        assert!(matches!(rx.try_recv(), Ok(CallEvent::RemoteStream(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_packet_gap_reads_as_disabled() {
        let track = Arc::new(MediaTrack::new(TrackKind::Audio, "remote audio"));
        let (packets, feed) = mpsc::unbounded_channel::<bool>();
        let feed = Arc::new(tokio::sync::Mutex::new(feed));

        let observer = tokio::spawn(observe_flow(track.clone(), move || {
            let feed = feed.clone();
            async move { feed.lock().await.recv().await.unwrap_or(false) }
        }));

        packets.send(true).unwrap();
        tokio::time::sleep(FLOW_GAP / 2).await;
        assert!(track.is_enabled());

        // Sender muted: nothing arrives
        tokio::time::sleep(FLOW_GAP * 2).await;
        assert!(!track.is_enabled());

        packets.send(true).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(track.is_enabled());

        packets.send(false).unwrap();
        observer.await.unwrap();
        assert!(!track.is_live());
    }

    #[tokio::test]
    async fn test_exchange_refuses_unknown_address() {
        let exchange = InMemoryExchange::new();
        let (request, _reply) = OfferRequest::new(
            PeerAddress::from("a"),
            CallMetadata { name: "A".into() },
            SessionDescription::Offer { sdp: String::new() },
        );
        let result = exchange.send_offer(&PeerAddress::from("b"), request).await;
        assert!(matches!(result, Err(CallError::NegotiationFailed(_))));
    }

    #[tokio::test]
    async fn test_failed_answer_closes_peer_connection() {
        let network = RtcNetwork::new(&[], Arc::new(InMemoryExchange::new())).unwrap();
        let (_acquirer, media) = local_media().await;

        let (request, _reply) = OfferRequest::new(
            PeerAddress::from("p-asha"),
            CallMetadata {
                name: "Asha".into(),
            },
            SessionDescription::Offer {
                sdp: "not a session description".to_string(),
            },
        );
        let responder = Box::new(RtcResponder {
            network: network.clone(),
            request,
        });

        let result = responder.answer(&media).await;
        assert!(matches!(result, Err(CallError::NegotiationFailed(_))));
        assert_eq!(network.open_connections(), 0);
    }

    #[tokio::test]
    #[ignore = "Requires UDP networking"]
    async fn test_rtc_call_connects_on_loopback() {
        let exchange: Arc<dyn DescriptionExchange> = Arc::new(InMemoryExchange::new());
        let network = RtcNetwork::new(&[], exchange).unwrap();
        let (_acquirer, media) = local_media().await;

        let a = network.register().await.unwrap();
        let mut b = network.register().await.unwrap();

        let mut outbound = a
            .endpoint
            .call(&b.address, &media, CallMetadata { name: "A".into() })
            .await
            .unwrap();
        let incoming = b.incoming.recv().await.unwrap();
        let mut inbound = incoming.answer(&media).await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(20), outbound.next_event())
            .await
            .unwrap();
        let Some(CallEvent::RemoteStream(remote)) = event else {
            panic!("expected remote stream");
        };
        // Built from the tracks that actually arrived, under the sender's stream id
        assert_eq!(remote.id(), media.id());
        assert_eq!(remote.tracks().len(), media.tracks().len());

        let event = tokio::time::timeout(Duration::from_secs(20), inbound.next_event())
            .await
            .unwrap();
        assert!(matches!(event, Some(CallEvent::RemoteStream(_))));

        // Muting the sender stops the flow, which the receiving side observes
        media.audio_tracks().for_each(|t| t.set_enabled(false));
        tokio::time::sleep(FLOW_GAP * 3).await;
        assert!(remote.audio_tracks().all(|t| !t.is_enabled()));

        assert_eq!(network.open_connections(), 2);
        outbound.close();
        inbound.close();
        assert_eq!(network.open_connections(), 0);
        a.endpoint.destroy().await;
        b.endpoint.destroy().await;
    }
}
