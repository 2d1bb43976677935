use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::{
    CallEvent, CallHandle, CallLink, CallMetadata, CallResponder, CallRole, IncomingCall,
    PeerEndpoint, PeerNetwork, Registration, RemoteMediaStream,
};
use crate::error::{CallError, Result};
use crate::media::LocalMediaStream;
use crate::types::PeerAddress;

/// In-process negotiation infrastructure.
///
/// Routes calls between endpoints registered on the same network. A remote
/// stream carries the very track handles of the sender, so enabling or
/// disabling a track is observed on the receiving side immediately.
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    inner: Arc<NetworkInner>,
}

#[derive(Default)]
struct NetworkInner {
    endpoints: DashMap<PeerAddress, mpsc::UnboundedSender<IncomingCall>>,
    registrations: AtomicUsize,
    stall: AtomicBool,
}

impl LoopbackNetwork {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Total registrations served since creation
    #[must_use]
    pub fn registration_count(&self) -> usize {
        self.inner.registrations.load(Ordering::SeqCst)
    }

    /// Endpoints currently reachable
    #[must_use]
    pub fn endpoint_count(&self) -> usize {
        self.inner.endpoints.len()
    }

    /// When set, answered calls never deliver media (simulates a traversal failure)
    pub fn stall_media(&self, stall: bool) {
        self.inner.stall.store(stall, Ordering::SeqCst);
    }
}

#[async_trait]
impl PeerNetwork for LoopbackNetwork {
    async fn register(&self) -> Result<Registration> {
        let address = PeerAddress::generate();
        let (tx, rx) = mpsc::unbounded_channel();

        self.inner.endpoints.insert(address.clone(), tx);
        self.inner.registrations.fetch_add(1, Ordering::SeqCst);
        debug!(address = %address, "Loopback endpoint registered");

        Ok(Registration {
            address: address.clone(),
            endpoint: Box::new(LoopbackEndpoint {
                inner: self.inner.clone(),
                address,
                destroyed: AtomicBool::new(false),
            }),
            incoming: rx,
        })
    }
}

struct LoopbackEndpoint {
    inner: Arc<NetworkInner>,
    address: PeerAddress,
    destroyed: AtomicBool,
}

impl LoopbackEndpoint {
    fn unregister(&self) {
        if !self.destroyed.swap(true, Ordering::AcqRel) {
            self.inner.endpoints.remove(&self.address);
        }
    }
}

#[async_trait]
impl PeerEndpoint for LoopbackEndpoint {
    fn address(&self) -> &PeerAddress {
        &self.address
    }

    async fn call(
        &self,
        peer: &PeerAddress,
        local: &LocalMediaStream,
        metadata: CallMetadata,
    ) -> Result<CallHandle> {
        if self.destroyed.load(Ordering::Acquire) {
            return Err(CallError::NegotiationFailed("endpoint destroyed".to_string()));
        }

        let target = self
            .inner
            .endpoints
            .get(peer)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| CallError::NegotiationFailed(format!("peer {peer} is not reachable")))?;

        let (caller_tx, caller_rx) = mpsc::unbounded_channel();
        let call = Arc::new(CallState {
            caller_events: caller_tx,
            answerer_events: Mutex::new(None),
            closed: AtomicBool::new(false),
            stall: self.inner.stall.load(Ordering::SeqCst),
        });

        let incoming = IncomingCall::new(
            self.address.clone(),
            metadata,
            Box::new(LoopbackResponder {
                call: call.clone(),
                caller_stream: local.clone(),
                caller: self.address.clone(),
            }),
        );

        target
            .send(incoming)
            .map_err(|_| CallError::NegotiationFailed(format!("peer {peer} hung up")))?;

        info!(from = %self.address, to = %peer, "Loopback call placed");

        Ok(CallHandle::new(
            peer.clone(),
            CallRole::Caller,
            caller_rx,
            Box::new(LoopbackLink {
                call,
                side: CallRole::Caller,
            }),
        ))
    }

    async fn destroy(&self) {
        self.unregister();
    }
}

impl Drop for LoopbackEndpoint {
    fn drop(&mut self) {
        self.unregister();
    }
}

/// Shared between both ends of one loopback call
struct CallState {
    caller_events: mpsc::UnboundedSender<CallEvent>,
    answerer_events: Mutex<Option<mpsc::UnboundedSender<CallEvent>>>,
    closed: AtomicBool,
    stall: bool,
}

impl CallState {
    /// Mark closed and tell the other side. No-op if already closed.
    fn hang_up(&self, by: CallRole) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        match by {
            CallRole::Caller => {
                if let Some(tx) = self.answerer_events.lock().as_ref() {
                    let _ = tx.send(CallEvent::Closed);
                }
            }
            CallRole::Answerer => {
                let _ = self.caller_events.send(CallEvent::Closed);
            }
        }
    }
}

struct LoopbackResponder {
    call: Arc<CallState>,
    caller_stream: LocalMediaStream,
    caller: PeerAddress,
}

fn remote_of(stream: &LocalMediaStream) -> RemoteMediaStream {
    RemoteMediaStream::new(stream.id().clone(), stream.tracks().to_vec())
}

#[async_trait]
impl CallResponder for LoopbackResponder {
    async fn answer(self: Box<Self>, local: &LocalMediaStream) -> Result<CallHandle> {
        let (answerer_tx, answerer_rx) = mpsc::unbounded_channel();
        {
            // Checked under the lock so a concurrent hang-up either sees the
            // answerer's channel or is seen here
            let mut answerer_events = self.call.answerer_events.lock();
            if self.call.closed.load(Ordering::Acquire) {
                return Err(CallError::CallCancelled);
            }
            if !self.call.stall {
                let _ = answerer_tx.send(CallEvent::RemoteStream(remote_of(&self.caller_stream)));
                let _ = self
                    .call
                    .caller_events
                    .send(CallEvent::RemoteStream(remote_of(local)));
            }
            *answerer_events = Some(answerer_tx);
        }

        Ok(CallHandle::new(
            self.caller.clone(),
            CallRole::Answerer,
            answerer_rx,
            Box::new(LoopbackLink {
                call: self.call.clone(),
                side: CallRole::Answerer,
            }),
        ))
    }

    fn reject(self: Box<Self>, reason: &str) {
        debug!(caller = %self.caller, reason, "Loopback call rejected");
        self.call.hang_up(CallRole::Answerer);
    }

    fn is_cancelled(&self) -> bool {
        self.call.closed.load(Ordering::Acquire)
    }
}

struct LoopbackLink {
    call: Arc<CallState>,
    side: CallRole,
}

impl CallLink for LoopbackLink {
    fn close(&self) {
        self.call.hang_up(self.side);
    }
}
