//! Peer connection negotiator
//!
//! Owns the registration with the negotiation infrastructure and at most one
//! active call handle. Decides the caller/answerer role for each call and
//! resolves simultaneous calls deterministically by comparing addresses.

mod loopback;
mod rtc;
mod state;

pub use loopback::LoopbackNetwork;
pub use rtc::{DescriptionExchange, InMemoryExchange, RtcNetwork, SessionDescription};
pub use state::{CallRole, NegotiatorState};

use crate::error::{CallError, Result};
use crate::media::{LocalMediaStream, MediaTrack, TrackKind};
use crate::signaling::PeerInfo;
use crate::types::{CallId, PeerAddress, StreamId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Metadata the caller attaches to an outbound call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallMetadata {
    /// Display name of the calling participant
    pub name: String,
}

/// Stream received from the peer
#[derive(Clone)]
pub struct RemoteMediaStream {
    id: StreamId,
    tracks: Vec<Arc<MediaTrack>>,
}

impl RemoteMediaStream {
    #[must_use]
    pub fn new(id: StreamId, tracks: Vec<Arc<MediaTrack>>) -> Self {
        Self { id, tracks }
    }

    #[must_use]
    pub const fn id(&self) -> &StreamId {
        &self.id
    }

    #[must_use]
    pub fn tracks(&self) -> &[Arc<MediaTrack>] {
        &self.tracks
    }

    pub fn audio_tracks(&self) -> impl Iterator<Item = &Arc<MediaTrack>> {
        self.tracks.iter().filter(|t| t.kind() == TrackKind::Audio)
    }

    pub fn video_tracks(&self) -> impl Iterator<Item = &Arc<MediaTrack>> {
        self.tracks.iter().filter(|t| t.kind() == TrackKind::Video)
    }
}

impl fmt::Debug for RemoteMediaStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteMediaStream")
            .field("id", &self.id)
            .field("tracks", &self.tracks.len())
            .finish()
    }
}

/// Progress reported by an active call
#[derive(Debug, Clone)]
pub enum CallEvent {
    /// The peer's media is flowing
    RemoteStream(RemoteMediaStream),
    /// The other side closed or declined the call
    Closed,
    /// The connection could not be established or was lost
    Failed(String),
}

/// Infrastructure side of a call handle
pub trait CallLink: Send + Sync {
    /// Release the underlying connection. Called at most once.
    fn close(&self);
}

/// The single live peer connection of a session
pub struct CallHandle {
    id: CallId,
    peer: PeerAddress,
    role: CallRole,
    events: mpsc::UnboundedReceiver<CallEvent>,
    link: Box<dyn CallLink>,
    closed: bool,
}

impl CallHandle {
    pub fn new(
        peer: PeerAddress,
        role: CallRole,
        events: mpsc::UnboundedReceiver<CallEvent>,
        link: Box<dyn CallLink>,
    ) -> Self {
        Self {
            id: CallId::generate(),
            peer,
            role,
            events,
            link,
            closed: false,
        }
    }

    #[must_use]
    pub const fn id(&self) -> &CallId {
        &self.id
    }

    #[must_use]
    pub const fn peer(&self) -> &PeerAddress {
        &self.peer
    }

    #[must_use]
    pub const fn role(&self) -> CallRole {
        self.role
    }

    #[must_use]
    pub const fn is_closed(&self) -> bool {
        self.closed
    }

    /// Next progress event; `None` once the call is closed or the
    /// infrastructure dropped its side.
    pub async fn next_event(&mut self) -> Option<CallEvent> {
        if self.closed {
            return None;
        }
        self.events.recv().await
    }

    /// Close the call. Idempotent.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.events.close();
        self.link.close();
        debug!(call_id = %self.id, peer = %self.peer, "Call handle closed");
    }
}

impl Drop for CallHandle {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for CallHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallHandle")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("role", &self.role)
            .field("closed", &self.closed)
            .finish()
    }
}

/// Answers or declines one inbound call on behalf of the infrastructure
#[async_trait]
pub trait CallResponder: Send {
    async fn answer(self: Box<Self>, local: &LocalMediaStream) -> Result<CallHandle>;

    fn reject(self: Box<Self>, reason: &str);

    /// The caller gave up before the call was answered
    fn is_cancelled(&self) -> bool {
        false
    }
}

/// Inbound connection request routed to this participant's address
pub struct IncomingCall {
    pub from: PeerAddress,
    pub metadata: CallMetadata,
    responder: Box<dyn CallResponder>,
}

impl IncomingCall {
    pub fn new(from: PeerAddress, metadata: CallMetadata, responder: Box<dyn CallResponder>) -> Self {
        Self {
            from,
            metadata,
            responder,
        }
    }

    pub async fn answer(self, local: &LocalMediaStream) -> Result<CallHandle> {
        self.responder.answer(local).await
    }

    pub fn reject(self, reason: &str) {
        self.responder.reject(reason);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.responder.is_cancelled()
    }
}

impl fmt::Debug for IncomingCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IncomingCall")
            .field("from", &self.from)
            .field("metadata", &self.metadata)
            .finish()
    }
}

/// This participant's endpoint on the negotiation infrastructure
#[async_trait]
pub trait PeerEndpoint: Send + Sync {
    fn address(&self) -> &PeerAddress;

    /// Place an outbound call carrying the local stream
    async fn call(
        &self,
        peer: &PeerAddress,
        local: &LocalMediaStream,
        metadata: CallMetadata,
    ) -> Result<CallHandle>;

    /// Release the endpoint; the address stops receiving calls
    async fn destroy(&self);
}

/// Result of a successful registration
pub struct Registration {
    pub address: PeerAddress,
    pub endpoint: Box<dyn PeerEndpoint>,
    pub incoming: mpsc::UnboundedReceiver<IncomingCall>,
}

/// Negotiation infrastructure: hands out addresses and routes calls
#[async_trait]
pub trait PeerNetwork: Send + Sync {
    async fn register(&self) -> Result<Registration>;
}

/// What became of a peer-joined notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    Calling,
    /// Already in a call with that peer
    Ignored,
}

/// What became of an inbound call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnswerOutcome {
    Answered,
    Rejected,
    /// The caller hung up before it could be answered
    Cancelled,
}

/// Effect of a call event on the negotiator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallUpdate {
    Connected,
    /// The attempt ended before connecting; waiting again
    Declined,
    PeerDeparted,
}

/// Peer connection state machine for one session
pub struct Negotiator {
    network: Arc<dyn PeerNetwork>,
    timeout: Duration,
    state: NegotiatorState,
    address: Option<PeerAddress>,
    endpoint: Option<Box<dyn PeerEndpoint>>,
    call: Option<CallHandle>,
    peer: Option<PeerInfo>,
    remote: Option<RemoteMediaStream>,
    deadline: Option<Instant>,
}

impl Negotiator {
    pub fn new(network: Arc<dyn PeerNetwork>, timeout: Duration) -> Self {
        Self {
            network,
            timeout,
            state: NegotiatorState::Uninitialized,
            address: None,
            endpoint: None,
            call: None,
            peer: None,
            remote: None,
            deadline: None,
        }
    }

    #[must_use]
    pub const fn state(&self) -> NegotiatorState {
        self.state
    }

    #[must_use]
    pub const fn address(&self) -> Option<&PeerAddress> {
        self.address.as_ref()
    }

    /// The peer currently being negotiated or connected with
    #[must_use]
    pub const fn peer(&self) -> Option<&PeerInfo> {
        self.peer.as_ref()
    }

    #[must_use]
    pub const fn remote_stream(&self) -> Option<&RemoteMediaStream> {
        self.remote.as_ref()
    }

    #[must_use]
    pub fn has_active_call(&self) -> bool {
        self.call.as_ref().is_some_and(|c| !c.is_closed())
    }

    #[must_use]
    pub fn call_role(&self) -> Option<CallRole> {
        self.call.as_ref().map(CallHandle::role)
    }

    fn transition(&mut self, next: NegotiatorState) -> Result<()> {
        if !self.state.can_transition_to(&next) {
            return Err(CallError::invalid_transition(self.state, next));
        }
        debug!(from = %self.state, to = %next, "Negotiator transition");
        self.state = next;
        Ok(())
    }

    /// Claim initialization. Only the first caller succeeds.
    pub fn begin(&mut self) -> Result<()> {
        self.transition(NegotiatorState::AcquiringMedia)
    }

    /// Register with the infrastructure and obtain this participant's address
    pub async fn register(&mut self) -> Result<mpsc::UnboundedReceiver<IncomingCall>> {
        if self.state != NegotiatorState::AcquiringMedia {
            return Err(CallError::invalid_transition(
                self.state,
                NegotiatorState::AddressAssigned,
            ));
        }

        let registration = self.network.register().await?;
        info!(address = %registration.address, "Negotiator address assigned");

        self.address = Some(registration.address);
        self.endpoint = Some(registration.endpoint);
        self.transition(NegotiatorState::AddressAssigned)?;
        Ok(registration.incoming)
    }

    pub fn mark_announced(&mut self) -> Result<()> {
        self.transition(NegotiatorState::Announced)
    }

    pub fn mark_awaiting_peer(&mut self) -> Result<()> {
        self.transition(NegotiatorState::AwaitingPeer)
    }

    /// React to a peer-joined notification by calling that peer
    pub async fn call(
        &mut self,
        peer: &PeerInfo,
        local: &LocalMediaStream,
        own_name: &str,
    ) -> Result<CallOutcome> {
        if self.state.has_call() {
            if self.call.as_ref().is_some_and(|c| c.peer() == &peer.peer_id) {
                debug!(peer = %peer.peer_id, "Already in a call with joined peer, ignoring");
                return Ok(CallOutcome::Ignored);
            }
            info!(peer = %peer.peer_id, "Replacing stale call with newly joined peer");
            self.close_call();
        } else if !self.state.is_waiting() {
            return Err(CallError::invalid_transition(
                self.state,
                NegotiatorState::Negotiating {
                    role: CallRole::Caller,
                },
            ));
        }

        let endpoint = self
            .endpoint
            .as_ref()
            .ok_or_else(|| CallError::NegotiationFailed("endpoint not registered".to_string()))?;

        let handle = endpoint
            .call(
                &peer.peer_id,
                local,
                CallMetadata {
                    name: own_name.to_string(),
                },
            )
            .await?;

        info!(call_id = %handle.id(), peer = %peer.peer_id, "Calling peer");
        self.install(handle, peer.clone(), CallRole::Caller)?;
        Ok(CallOutcome::Calling)
    }

    /// React to an inbound call, resolving glare when both sides called
    pub async fn answer(
        &mut self,
        incoming: IncomingCall,
        local: &LocalMediaStream,
    ) -> Result<AnswerOutcome> {
        if incoming.is_cancelled() {
            debug!(from = %incoming.from, "Inbound call cancelled before answer");
            return Ok(AnswerOutcome::Cancelled);
        }

        if self.state.has_call() {
            let same_peer = self.call.as_ref().is_some_and(|c| c.peer() == &incoming.from);
            let calling = self.state
                == NegotiatorState::Negotiating {
                    role: CallRole::Caller,
                };

            if same_peer && calling {
                if !self.yields_to(&incoming.from) {
                    info!(from = %incoming.from, "Glare: keeping outbound call, rejecting inbound");
                    incoming.reject("glare");
                    return Ok(AnswerOutcome::Rejected);
                }
                info!(from = %incoming.from, "Glare: dropping outbound call to answer inbound");
            } else if same_peer {
                debug!(from = %incoming.from, "Duplicate inbound call, rejecting");
                incoming.reject("already connected");
                return Ok(AnswerOutcome::Rejected);
            } else {
                info!(from = %incoming.from, "Replacing stale call with inbound caller");
            }
            self.close_call();
        } else if !self.state.is_waiting() {
            warn!(from = %incoming.from, state = %self.state, "Not ready for inbound call, rejecting");
            incoming.reject("not ready");
            return Ok(AnswerOutcome::Rejected);
        }

        let peer = PeerInfo {
            peer_id: incoming.from.clone(),
            name: incoming.metadata.name.clone(),
        };
        let handle = match incoming.answer(local).await {
            Ok(handle) => handle,
            Err(CallError::CallCancelled) => {
                debug!(from = %peer.peer_id, "Caller hung up while answering");
                if self.state.has_call() {
                    // The call dropped in favour of this one is already closed
                    self.peer = None;
                    self.state = if matches!(self.state, NegotiatorState::Negotiating { .. }) {
                        NegotiatorState::AwaitingPeer
                    } else {
                        NegotiatorState::PeerDeparted
                    };
                }
                return Ok(AnswerOutcome::Cancelled);
            }
            Err(e) => return Err(e),
        };

        info!(call_id = %handle.id(), peer = %peer.peer_id, "Answered inbound call");
        self.install(handle, peer, CallRole::Answerer)?;
        Ok(AnswerOutcome::Answered)
    }

    /// Whether this side becomes answerer-only when both sides called each other
    fn yields_to(&self, other: &PeerAddress) -> bool {
        self.address.as_ref().is_some_and(|own| own < other)
    }

    fn install(&mut self, handle: CallHandle, peer: PeerInfo, role: CallRole) -> Result<()> {
        self.transition(NegotiatorState::Negotiating { role })?;
        self.call = Some(handle);
        self.peer = Some(peer);
        self.remote = None;
        self.deadline = Some(Instant::now() + self.timeout);
        Ok(())
    }

    /// Next event of the active call; pending forever while there is none.
    ///
    /// A call still negotiating when the timeout elapses yields
    /// [`CallEvent::Failed`].
    pub async fn next_call_event(&mut self) -> CallEvent {
        let timeout = self.timeout;
        let deadline = self.deadline;

        let Some(call) = self.call.as_mut().filter(|c| !c.is_closed()) else {
            return std::future::pending().await;
        };

        match deadline {
            Some(deadline) => match tokio::time::timeout_at(deadline, call.next_event()).await {
                Ok(event) => event.unwrap_or(CallEvent::Closed),
                Err(_) => CallEvent::Failed(format!("no remote stream within {timeout:?}")),
            },
            None => call.next_event().await.unwrap_or(CallEvent::Closed),
        }
    }

    /// Apply an event produced by [`Self::next_call_event`]
    pub fn handle_call_event(&mut self, event: CallEvent) -> Result<CallUpdate> {
        match event {
            CallEvent::RemoteStream(stream) => {
                let role = self
                    .state
                    .role()
                    .ok_or_else(|| CallError::invalid_transition(self.state, "Connected"))?;
                self.transition(NegotiatorState::Connected { role })?;
                info!(
                    stream_id = %stream.id(),
                    tracks = stream.tracks().len(),
                    ?role,
                    "Remote stream received"
                );
                self.remote = Some(stream);
                self.deadline = None;
                Ok(CallUpdate::Connected)
            }
            CallEvent::Closed => {
                if matches!(self.state, NegotiatorState::Negotiating { .. }) {
                    info!("Call closed before connecting, waiting for peer");
                    self.close_call();
                    self.peer = None;
                    self.transition(NegotiatorState::AwaitingPeer)?;
                    Ok(CallUpdate::Declined)
                } else {
                    self.depart();
                    Ok(CallUpdate::PeerDeparted)
                }
            }
            CallEvent::Failed(reason) => {
                warn!(reason = %reason, "Call failed");
                self.close_call();
                Err(CallError::NegotiationFailed(reason))
            }
        }
    }

    /// The room directory reported that the peer left.
    ///
    /// Returns whether a call was torn down.
    pub fn on_peer_left(&mut self) -> bool {
        if !self.state.has_call() {
            debug!(state = %self.state, "Peer left with no active call");
            return false;
        }
        self.depart();
        true
    }

    fn depart(&mut self) {
        self.close_call();
        self.peer = None;
        if self.state.can_transition_to(&NegotiatorState::PeerDeparted) {
            self.state = NegotiatorState::PeerDeparted;
            info!("Peer departed, waiting for peer");
        }
    }

    /// Close the active call handle, if any, and clear the remote stream
    pub fn close_call(&mut self) {
        if let Some(mut call) = self.call.take() {
            call.close();
        }
        self.remote = None;
        self.deadline = None;
    }

    /// Release the endpoint so the address no longer receives calls
    pub async fn destroy_endpoint(&mut self) {
        if let Some(endpoint) = self.endpoint.take() {
            endpoint.destroy().await;
            debug!(address = %endpoint.address(), "Endpoint destroyed");
        }
    }

    /// Close the call, release the endpoint, and end. Safe to repeat.
    pub async fn teardown(&mut self) {
        self.close_call();
        self.destroy_endpoint().await;
        self.end();
    }

    pub fn end(&mut self) {
        if !self.state.is_terminal() {
            debug!(from = %self.state, "Negotiator ended");
            self.state = NegotiatorState::Ended;
        }
        self.peer = None;
    }
}
