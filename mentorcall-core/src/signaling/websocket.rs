use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use super::{InboundEvent, OutboundEvent, SignalingConnector, SignalingTransport};
use crate::error::{CallError, Result};
use crate::types::SessionId;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connects to a room directory relay over WebSocket.
///
/// Each frame is a text message carrying one `{"event", "data"}` envelope.
/// The session id is passed as the `room` query parameter.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    url: String,
}

impl WebSocketConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    fn session_url(&self, session: &SessionId) -> String {
        let separator = if self.url.contains('?') { '&' } else { '?' };
        format!("{}{}room={}", self.url, separator, session)
    }
}

#[async_trait]
impl SignalingConnector for WebSocketConnector {
    async fn connect(&self, session: &SessionId) -> Result<Box<dyn SignalingTransport>> {
        let url = self.session_url(session);
        info!(url = %url, "Connecting to signaling relay");

        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| CallError::SignalingUnavailable(format!("failed to connect: {e}")))?;

        let (write, read) = ws_stream.split();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();

        let sender = tokio::spawn(sender_task(write, out_rx));
        let receiver = tokio::spawn(receiver_task(read, in_tx));

        Ok(Box::new(WebSocketTransport {
            outbound: out_tx,
            inbound: Mutex::new(Some(in_rx)),
            closed: AtomicBool::new(false),
            tasks: Mutex::new(vec![sender, receiver]),
        }))
    }
}

/// Sender task: forwards queued frames to the socket
async fn sender_task(
    mut write: SplitSink<WsStream, Message>,
    mut rx: mpsc::UnboundedReceiver<Message>,
) {
    while let Some(msg) = rx.recv().await {
        let closing = matches!(msg, Message::Close(_));
        if let Err(e) = write.send(msg).await {
            error!("Failed to send signaling frame: {}", e);
            break;
        }
        if closing {
            break;
        }
    }

    debug!("Signaling sender task terminated");
}

/// Receiver task: decodes frames and forwards known events
async fn receiver_task(mut read: SplitStream<WsStream>, tx: mpsc::UnboundedSender<InboundEvent>) {
    while let Some(msg_result) = read.next().await {
        match msg_result {
            Ok(Message::Text(text)) => match InboundEvent::decode(&text) {
                Ok(Some(event)) => {
                    if tx.send(event).is_err() {
                        break;
                    }
                }
                Ok(None) => {}
                Err(e) => warn!("Failed to decode signaling frame: {}", e),
            },
            Ok(Message::Close(_)) => {
                info!("Signaling connection closed by relay");
                break;
            }
            Err(e) => {
                error!("Signaling socket error: {}", e);
                break;
            }
            _ => {}
        }
    }

    debug!("Signaling receiver task terminated");
}

struct WebSocketTransport {
    outbound: mpsc::UnboundedSender<Message>,
    inbound: Mutex<Option<mpsc::UnboundedReceiver<InboundEvent>>>,
    closed: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl WebSocketTransport {
    fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.outbound.send(Message::Close(None));
        // The sender task drains the close frame on its own; only the reader is cut short
        if let Some(receiver) = self.tasks.lock().pop() {
            receiver.abort();
        }
    }
}

#[async_trait]
impl SignalingTransport for WebSocketTransport {
    async fn emit(&self, event: OutboundEvent) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CallError::SignalingUnavailable("transport closed".to_string()));
        }
        let text = event.encode()?;
        self.outbound
            .send(Message::Text(text))
            .map_err(|_| CallError::SignalingUnavailable("signaling connection lost".to_string()))
    }

    fn take_inbound(&self) -> Option<mpsc::UnboundedReceiver<InboundEvent>> {
        self.inbound.lock().take()
    }

    async fn close(&self) {
        self.shutdown();
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        self.shutdown();
    }
}
