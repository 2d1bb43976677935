//! Session room directory client
//!
//! A thin wrapper over a persistent bidirectional channel to the signaling
//! relay. One transport is connected per session and disposed with it; there
//! is no process-wide channel shared between sessions.

mod relay;
mod websocket;

pub use relay::InMemoryRelay;
pub use websocket::WebSocketConnector;

use crate::error::{CallError, Result};
use crate::types::{PeerAddress, SessionId};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Identity and display name of a participant, as carried on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    #[serde(rename = "peerId")]
    pub peer_id: PeerAddress,
    pub name: String,
}

/// Events this client sends to the relay
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundEvent {
    /// `join_video_room{room, peerId, name}`
    JoinVideoRoom {
        room: SessionId,
        peer_id: PeerAddress,
        name: String,
    },
}

/// Events the relay delivers to this client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    /// `other_user_for_video{peerId, name}`
    PeerJoined(PeerInfo),
    /// `peer_left{}`
    PeerLeft,
}

/// Envelope every signaling message travels in
#[derive(Debug, Serialize, Deserialize)]
struct Frame {
    event: String,
    #[serde(default)]
    data: serde_json::Value,
}

#[derive(Serialize, Deserialize)]
struct JoinPayload {
    room: SessionId,
    #[serde(rename = "peerId")]
    peer_id: PeerAddress,
    name: String,
}

const JOIN_VIDEO_ROOM: &str = "join_video_room";
const OTHER_USER_FOR_VIDEO: &str = "other_user_for_video";
const PEER_LEFT: &str = "peer_left";

impl OutboundEvent {
    pub fn encode(&self) -> Result<String> {
        let frame = match self {
            Self::JoinVideoRoom {
                room,
                peer_id,
                name,
            } => Frame {
                event: JOIN_VIDEO_ROOM.to_string(),
                data: serde_json::to_value(JoinPayload {
                    room: room.clone(),
                    peer_id: peer_id.clone(),
                    name: name.clone(),
                })?,
            },
        };
        Ok(serde_json::to_string(&frame)?)
    }

    /// Returns `Ok(None)` for events this side does not understand
    pub fn decode(text: &str) -> Result<Option<Self>> {
        let frame: Frame = serde_json::from_str(text)?;
        match frame.event.as_str() {
            JOIN_VIDEO_ROOM => {
                let payload: JoinPayload = serde_json::from_value(frame.data)?;
                Ok(Some(Self::JoinVideoRoom {
                    room: payload.room,
                    peer_id: payload.peer_id,
                    name: payload.name,
                }))
            }
            other => {
                debug!(event = other, "Skipping unknown outbound event");
                Ok(None)
            }
        }
    }
}

impl InboundEvent {
    pub fn encode(&self) -> Result<String> {
        let frame = match self {
            Self::PeerJoined(info) => Frame {
                event: OTHER_USER_FOR_VIDEO.to_string(),
                data: serde_json::to_value(info)?,
            },
            Self::PeerLeft => Frame {
                event: PEER_LEFT.to_string(),
                data: serde_json::json!({}),
            },
        };
        Ok(serde_json::to_string(&frame)?)
    }

    /// Returns `Ok(None)` for events this side does not understand
    pub fn decode(text: &str) -> Result<Option<Self>> {
        let frame: Frame = serde_json::from_str(text)?;
        match frame.event.as_str() {
            OTHER_USER_FOR_VIDEO => Ok(Some(Self::PeerJoined(serde_json::from_value(frame.data)?))),
            PEER_LEFT => Ok(Some(Self::PeerLeft)),
            other => {
                debug!(event = other, "Skipping unknown inbound event");
                Ok(None)
            }
        }
    }
}

/// One connected signaling channel, scoped to a single session
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    async fn emit(&self, event: OutboundEvent) -> Result<()>;

    /// Inbound event stream. Can be taken once; later calls return `None`.
    fn take_inbound(&self) -> Option<mpsc::UnboundedReceiver<InboundEvent>>;

    /// Disconnect. The relay treats this as the participant leaving.
    async fn close(&self);
}

/// Opens a fresh signaling transport for a session
#[async_trait]
pub trait SignalingConnector: Send + Sync {
    async fn connect(&self, session: &SessionId) -> Result<Box<dyn SignalingTransport>>;
}

pub type ListenerId = u64;

type PeerJoinedListener = Box<dyn Fn(&PeerInfo) + Send + Sync>;
type PeerLeftListener = Box<dyn Fn() + Send + Sync>;

/// Room directory client for one session
pub struct RoomDirectoryClient {
    session: SessionId,
    transport: Box<dyn SignalingTransport>,
    announced: AtomicBool,
    closed: AtomicBool,
    next_listener: AtomicU64,
    joined_listeners: Mutex<Vec<(ListenerId, PeerJoinedListener)>>,
    left_listeners: Mutex<Vec<(ListenerId, PeerLeftListener)>>,
}

impl RoomDirectoryClient {
    pub async fn connect(connector: &dyn SignalingConnector, session: SessionId) -> Result<Self> {
        let transport = connector.connect(&session).await?;
        info!(session_id = %session, "Connected to room directory");
        Ok(Self::new(session, transport))
    }

    pub fn new(session: SessionId, transport: Box<dyn SignalingTransport>) -> Self {
        Self {
            session,
            transport,
            announced: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            next_listener: AtomicU64::new(1),
            joined_listeners: Mutex::new(Vec::new()),
            left_listeners: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub const fn session(&self) -> &SessionId {
        &self.session
    }

    /// Inbound events from the transport, to be fed back through [`Self::dispatch`]
    pub fn take_inbound(&self) -> Option<mpsc::UnboundedReceiver<InboundEvent>> {
        self.transport.take_inbound()
    }

    /// Tell the relay this participant is present. Exactly once per session.
    pub async fn announce_presence(&self, address: &PeerAddress, name: &str) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CallError::SessionClosed);
        }
        if self.announced.swap(true, Ordering::AcqRel) {
            return Err(CallError::invalid_transition("Announced", "Announced"));
        }

        let event = OutboundEvent::JoinVideoRoom {
            room: self.session.clone(),
            peer_id: address.clone(),
            name: name.to_string(),
        };

        if let Err(e) = self.transport.emit(event).await {
            self.announced.store(false, Ordering::Release);
            return Err(e);
        }

        info!(session_id = %self.session, peer_id = %address, "Announced presence");
        Ok(())
    }

    #[must_use]
    pub fn is_announced(&self) -> bool {
        self.announced.load(Ordering::Acquire)
    }

    pub fn on_peer_joined<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&PeerInfo) + Send + Sync + 'static,
    {
        let id = self.next_listener.fetch_add(1, Ordering::Relaxed);
        self.joined_listeners.lock().push((id, Box::new(listener)));
        id
    }

    pub fn on_peer_left<F>(&self, listener: F) -> ListenerId
    where
        F: Fn() + Send + Sync + 'static,
    {
        let id = self.next_listener.fetch_add(1, Ordering::Relaxed);
        self.left_listeners.lock().push((id, Box::new(listener)));
        id
    }

    /// Unregister a single listener. Returns false if it was not registered.
    pub fn off(&self, id: ListenerId) -> bool {
        let mut joined = self.joined_listeners.lock();
        let before = joined.len();
        joined.retain(|(lid, _)| *lid != id);
        if joined.len() != before {
            return true;
        }
        drop(joined);

        let mut left = self.left_listeners.lock();
        let before = left.len();
        left.retain(|(lid, _)| *lid != id);
        left.len() != before
    }

    pub fn clear_listeners(&self) {
        self.joined_listeners.lock().clear();
        self.left_listeners.lock().clear();
        debug!(session_id = %self.session, "Room directory listeners cleared");
    }

    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.joined_listeners.lock().len() + self.left_listeners.lock().len()
    }

    /// Route an inbound event to the listeners registered right now.
    ///
    /// Listeners run under the registry lock and must not call back into this
    /// client.
    pub fn dispatch(&self, event: &InboundEvent) {
        if self.closed.load(Ordering::Acquire) {
            debug!(session_id = %self.session, ?event, "Dropping event for closed room directory");
            return;
        }

        match event {
            InboundEvent::PeerJoined(info) => {
                for (_, listener) in self.joined_listeners.lock().iter() {
                    listener(info);
                }
            }
            InboundEvent::PeerLeft => {
                for (_, listener) in self.left_listeners.lock().iter() {
                    listener();
                }
            }
        }
    }

    /// Unregister every listener and disconnect. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.clear_listeners();
        self.transport.close().await;
        info!(session_id = %self.session, "Room directory connection closed");
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Drop for RoomDirectoryClient {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::Acquire) {
            warn!(session_id = %self.session, "Room directory client dropped without close");
        }
    }
}
