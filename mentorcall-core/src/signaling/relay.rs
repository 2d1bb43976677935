use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{InboundEvent, OutboundEvent, PeerInfo, SignalingConnector, SignalingTransport};
use crate::error::{CallError, Result};
use crate::types::{generate_id, SessionId};

type ConnectionId = String;
type EventSender = mpsc::UnboundedSender<InboundEvent>;

/// Participant that has announced presence in a room
#[derive(Debug, Clone)]
struct Member {
    connection_id: ConnectionId,
    peer: PeerInfo,
    sender: EventSender,
}

/// In-process room directory relay
///
/// Tracks which participants announced presence in each session room,
/// notifies the other members on join and on disconnect. Rooms are bounded
/// at `capacity` members.
#[derive(Clone)]
pub struct InMemoryRelay {
    capacity: usize,
    /// Map of session -> announced members
    rooms: Arc<DashMap<SessionId, Vec<Member>>>,
    /// Map of connection_id -> (session, sender) for every open transport
    connections: Arc<DashMap<ConnectionId, (SessionId, EventSender)>>,
}

impl InMemoryRelay {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            rooms: Arc::new(DashMap::new()),
            connections: Arc::new(DashMap::new()),
        }
    }

    /// Number of members that announced presence in a room
    #[must_use]
    pub fn member_count(&self, session: &SessionId) -> usize {
        self.rooms.get(session).map_or(0, |members| members.len())
    }

    /// Number of open transports across all rooms
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    fn join(&self, connection_id: &str, peer: PeerInfo) -> Result<()> {
        let (session, sender) = self
            .connections
            .get(connection_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| CallError::SignalingUnavailable("connection closed".to_string()))?;

        let mut members = self.rooms.entry(session.clone()).or_default();

        if members.iter().any(|m| m.connection_id == connection_id) {
            return Err(CallError::SignalingUnavailable(
                "connection already joined".to_string(),
            ));
        }
        if members.len() >= self.capacity {
            warn!(
                session_id = %session,
                peer_id = %peer.peer_id,
                capacity = self.capacity,
                "Join refused, room full"
            );
            return Err(CallError::SignalingUnavailable("room full".to_string()));
        }

        for member in members.iter() {
            if let Err(err) = member.sender.send(InboundEvent::PeerJoined(peer.clone())) {
                debug!(
                    session_id = %session,
                    connection_id = %member.connection_id,
                    error = %err,
                    "Member no longer listening"
                );
            }
        }

        info!(
            session_id = %session,
            peer_id = %peer.peer_id,
            name = %peer.name,
            connection_id = %connection_id,
            "Participant joined room"
        );

        members.push(Member {
            connection_id: connection_id.to_string(),
            peer,
            sender,
        });
        Ok(())
    }

    fn leave(&self, connection_id: &str) {
        let Some((_, (session, _))) = self.connections.remove(connection_id) else {
            return;
        };

        let Some(mut members) = self.rooms.get_mut(&session) else {
            return;
        };

        let Some(position) = members.iter().position(|m| m.connection_id == connection_id) else {
            return;
        };
        let departed = members.remove(position);

        for member in members.iter() {
            let _ = member.sender.send(InboundEvent::PeerLeft);
        }

        info!(
            session_id = %session,
            peer_id = %departed.peer.peer_id,
            remaining = members.len(),
            "Participant left room"
        );

        if members.is_empty() {
            drop(members); // Drop the RefMut before removing
            self.rooms.remove(&session);
            debug!(session_id = %session, "Room empty, removed");
        }
    }
}

#[async_trait]
impl SignalingConnector for InMemoryRelay {
    async fn connect(&self, session: &SessionId) -> Result<Box<dyn SignalingTransport>> {
        let connection_id = generate_id();
        let (tx, rx) = mpsc::unbounded_channel();

        self.connections
            .insert(connection_id.clone(), (session.clone(), tx));

        debug!(session_id = %session, connection_id = %connection_id, "Relay connection opened");

        Ok(Box::new(RelayTransport {
            relay: self.clone(),
            connection_id,
            inbound: Mutex::new(Some(rx)),
            closed: AtomicBool::new(false),
        }))
    }
}

struct RelayTransport {
    relay: InMemoryRelay,
    connection_id: ConnectionId,
    inbound: Mutex<Option<mpsc::UnboundedReceiver<InboundEvent>>>,
    closed: AtomicBool,
}

#[async_trait]
impl SignalingTransport for RelayTransport {
    async fn emit(&self, event: OutboundEvent) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CallError::SignalingUnavailable("transport closed".to_string()));
        }
        match event {
            OutboundEvent::JoinVideoRoom { peer_id, name, .. } => {
                self.relay
                    .join(&self.connection_id, PeerInfo { peer_id, name })
            }
        }
    }

    fn take_inbound(&self) -> Option<mpsc::UnboundedReceiver<InboundEvent>> {
        self.inbound.lock().take()
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.relay.leave(&self.connection_id);
        }
    }
}

impl Drop for RelayTransport {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.relay.leave(&self.connection_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PeerAddress;

    fn join_event(session: &str, peer: &str, name: &str) -> OutboundEvent {
        OutboundEvent::JoinVideoRoom {
            room: SessionId::from(session),
            peer_id: PeerAddress::from(peer),
            name: name.to_string(),
        }
    }

    #[tokio::test]
    async fn test_only_existing_member_is_notified() {
        let relay = InMemoryRelay::new(2);
        let session = SessionId::from("abc123");

        let asha = relay.connect(&session).await.unwrap();
        let mut asha_rx = asha.take_inbound().unwrap();
        asha.emit(join_event("abc123", "p-asha", "Asha")).await.unwrap();

        let rahul = relay.connect(&session).await.unwrap();
        let mut rahul_rx = rahul.take_inbound().unwrap();
        rahul.emit(join_event("abc123", "p-rahul", "Rahul")).await.unwrap();

        match asha_rx.try_recv().unwrap() {
            InboundEvent::PeerJoined(info) => {
                assert_eq!(info.peer_id, PeerAddress::from("p-rahul"));
                assert_eq!(info.name, "Rahul");
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(rahul_rx.try_recv().is_err());
        assert_eq!(relay.member_count(&session), 2);
    }

    #[tokio::test]
    async fn test_room_full() {
        let relay = InMemoryRelay::new(2);
        let session = SessionId::from("abc123");

        let a = relay.connect(&session).await.unwrap();
        let b = relay.connect(&session).await.unwrap();
        let c = relay.connect(&session).await.unwrap();
        a.emit(join_event("abc123", "a", "A")).await.unwrap();
        b.emit(join_event("abc123", "b", "B")).await.unwrap();

        let err = c.emit(join_event("abc123", "c", "C")).await.unwrap_err();
        assert!(matches!(err, CallError::SignalingUnavailable(_)));
        assert_eq!(relay.member_count(&session), 2);
    }

    #[tokio::test]
    async fn test_close_notifies_remaining_member() {
        let relay = InMemoryRelay::new(2);
        let session = SessionId::from("abc123");

        let a = relay.connect(&session).await.unwrap();
        let mut a_rx = a.take_inbound().unwrap();
        let b = relay.connect(&session).await.unwrap();
        a.emit(join_event("abc123", "a", "A")).await.unwrap();
        b.emit(join_event("abc123", "b", "B")).await.unwrap();
        let _ = a_rx.try_recv();

        b.close().await;
        b.close().await;

        assert_eq!(a_rx.try_recv().unwrap(), InboundEvent::PeerLeft);
        assert!(a_rx.try_recv().is_err());
        assert_eq!(relay.member_count(&session), 1);

        drop(a);
        assert_eq!(relay.member_count(&session), 0);
        assert_eq!(relay.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_rooms_are_isolated() {
        let relay = InMemoryRelay::new(2);

        let a = relay.connect(&SessionId::from("one")).await.unwrap();
        let mut a_rx = a.take_inbound().unwrap();
        let b = relay.connect(&SessionId::from("two")).await.unwrap();
        a.emit(join_event("one", "a", "A")).await.unwrap();
        b.emit(join_event("two", "b", "B")).await.unwrap();

        assert!(a_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_emit_after_close_fails() {
        let relay = InMemoryRelay::new(2);
        let a = relay.connect(&SessionId::from("abc123")).await.unwrap();
        a.close().await;
        assert!(a.emit(join_event("abc123", "a", "A")).await.is_err());
        assert!(a.take_inbound().is_some());
        assert!(a.take_inbound().is_none());
    }
}
