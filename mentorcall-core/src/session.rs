//! Call session
//!
//! One actor task per session drives the media acquirer, the room directory
//! client and the negotiator from a single event loop. Hosts talk to it
//! through a cloneable [`SessionHandle`] and observe it through a
//! `watch` channel of [`CallView`]s plus a `broadcast` channel of notices.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, info, warn};

use crate::config::CallConfig;
use crate::error::{CallError, Result};
use crate::media::{LocalMediaAcquirer, LocalMediaStream, MediaDevices};
use crate::negotiator::{
    AnswerOutcome, CallEvent, CallOutcome, CallUpdate, IncomingCall, Negotiator, NegotiatorState,
    PeerNetwork,
};
use crate::signaling::{InboundEvent, PeerInfo, RoomDirectoryClient, SignalingConnector};
use crate::types::SessionId;
use crate::view::{CallView, Notice};

/// Collaborators a session is wired to
#[derive(Clone)]
pub struct SessionDeps {
    pub devices: Arc<dyn MediaDevices>,
    pub network: Arc<dyn PeerNetwork>,
    pub signaling: Arc<dyn SignalingConnector>,
}

/// Who is joining which session
#[derive(Debug, Clone)]
pub struct SessionParams {
    pub session_id: SessionId,
    pub display_name: String,
    pub config: CallConfig,
}

const NOTICE_CAPACITY: usize = 32;

enum Command {
    Initialize(oneshot::Sender<Result<()>>),
    ToggleMic(oneshot::Sender<Result<bool>>),
    ToggleCam(oneshot::Sender<Result<bool>>),
    EndCall(oneshot::Sender<()>),
}

/// Room directory events, as delivered by the registered listeners
enum RoomEvent {
    PeerJoined(PeerInfo),
    PeerLeft,
}

/// Control surface of a running session.
///
/// Dropping the last handle tears the session down.
#[derive(Clone)]
pub struct SessionHandle {
    session_id: SessionId,
    commands: mpsc::UnboundedSender<Command>,
    view: watch::Receiver<CallView>,
    notices: broadcast::Sender<Notice>,
}

impl SessionHandle {
    #[must_use]
    pub const fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .map_err(|_| CallError::SessionClosed)?;
        rx.await.map_err(|_| CallError::SessionClosed)
    }

    /// Start the session. Only the first invocation does anything; later
    /// ones return once the first has finished.
    ///
    /// Setup failures are not returned here: they are published as an error
    /// notice and status and the session ends. The session stays responsive
    /// while the device prompt is open, so `end_call` does not wait for it.
    pub async fn initialize(&self) -> Result<()> {
        self.request(Command::Initialize).await?
    }

    /// Flip the microphone; returns the new enabled flag
    pub async fn toggle_mic(&self) -> Result<bool> {
        self.request(Command::ToggleMic).await?
    }

    /// Flip the camera; returns the new enabled flag
    pub async fn toggle_cam(&self) -> Result<bool> {
        self.request(Command::ToggleCam).await?
    }

    /// Hang up and tear the session down
    pub async fn end_call(&self) -> Result<()> {
        self.request(Command::EndCall).await
    }

    #[must_use]
    pub fn view(&self) -> watch::Receiver<CallView> {
        self.view.clone()
    }

    #[must_use]
    pub fn current(&self) -> CallView {
        self.view.borrow().clone()
    }

    #[must_use]
    pub fn notices(&self) -> broadcast::Receiver<Notice> {
        self.notices.subscribe()
    }

    /// Wait until the view satisfies `predicate`
    pub async fn wait_for<F>(&self, timeout: Duration, mut predicate: F) -> Result<CallView>
    where
        F: FnMut(&CallView) -> bool,
    {
        let mut view = self.view.clone();
        let waited = tokio::time::timeout(timeout, async {
            view.wait_for(&mut predicate).await.map(|v| v.clone())
        })
        .await;

        match waited {
            Ok(Ok(view)) => Ok(view),
            Ok(Err(_)) => Err(CallError::SessionClosed),
            Err(_) => Err(CallError::Timeout(format!(
                "session {} did not reach the expected state within {timeout:?} (last status: {})",
                self.session_id,
                self.view.borrow().status
            ))),
        }
    }
}

/// Session actor
pub struct CallSession {
    params: SessionParams,
    deps: SessionDeps,
    media: Arc<LocalMediaAcquirer>,
    /// Pending device request; the permission prompt may stay open indefinitely
    acquiring: Option<JoinHandle<Result<LocalMediaStream>>>,
    init_waiters: Vec<oneshot::Sender<Result<()>>>,
    negotiator: Negotiator,
    directory: Option<RoomDirectoryClient>,
    signaling_rx: Option<mpsc::UnboundedReceiver<InboundEvent>>,
    room_tx: mpsc::UnboundedSender<RoomEvent>,
    room_rx: mpsc::UnboundedReceiver<RoomEvent>,
    incoming: Option<mpsc::UnboundedReceiver<IncomingCall>>,
    commands: mpsc::UnboundedReceiver<Command>,
    view: watch::Sender<CallView>,
    notices: broadcast::Sender<Notice>,
    failure: Option<String>,
    torn_down: bool,
}

impl CallSession {
    /// Start the actor for one session and return its handle
    pub fn spawn(deps: SessionDeps, params: SessionParams) -> SessionHandle {
        let media = Arc::new(LocalMediaAcquirer::new(
            deps.devices.clone(),
            params.config.media,
        ));
        let negotiator = Negotiator::new(deps.network.clone(), params.config.negotiation_timeout());

        let initial = CallView::derive(
            &params.session_id,
            &params.display_name,
            &params.config.peer_placeholder,
            &media,
            &negotiator,
            None,
        );
        let (view_tx, view_rx) = watch::channel(initial);
        let (notice_tx, _) = broadcast::channel(NOTICE_CAPACITY);
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (room_tx, room_rx) = mpsc::unbounded_channel();

        let handle = SessionHandle {
            session_id: params.session_id.clone(),
            commands: command_tx,
            view: view_rx,
            notices: notice_tx.clone(),
        };

        let session = Self {
            params,
            deps,
            media,
            acquiring: None,
            init_waiters: Vec::new(),
            negotiator,
            directory: None,
            signaling_rx: None,
            room_tx,
            room_rx,
            incoming: None,
            commands: command_rx,
            view: view_tx,
            notices: notice_tx,
            failure: None,
            torn_down: false,
        };

        tokio::spawn(session.run());
        handle
    }

    async fn run(mut self) {
        info!(
            session_id = %self.params.session_id,
            name = %self.params.display_name,
            "Call session started"
        );

        loop {
            tokio::select! {
                command = self.commands.recv() => {
                    let Some(command) = command else {
                        debug!(session_id = %self.params.session_id, "All handles dropped");
                        break;
                    };
                    if self.handle_command(command).await {
                        break;
                    }
                }
                acquired = join_opt(&mut self.acquiring) => {
                    self.acquiring = None;
                    if self.on_media_acquired(acquired).await {
                        break;
                    }
                }
                event = recv_opt(&mut self.signaling_rx) => match event {
                    Some(event) => {
                        if let Some(directory) = &self.directory {
                            directory.dispatch(&event);
                        }
                    }
                    None => {
                        warn!(session_id = %self.params.session_id, "Signaling channel closed");
                        self.signaling_rx = None;
                    }
                },
                Some(event) = self.room_rx.recv() => {
                    if self.on_room_event(event).await {
                        break;
                    }
                }
                call = recv_opt(&mut self.incoming) => match call {
                    Some(call) => {
                        if self.on_incoming(call).await {
                            break;
                        }
                    }
                    None => self.incoming = None,
                },
                event = self.negotiator.next_call_event() => {
                    if self.on_call_event(event) {
                        break;
                    }
                }
            }
        }

        self.teardown().await;
        info!(session_id = %self.params.session_id, "Call session finished");
    }

    /// Returns true when the session is over
    async fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::Initialize(reply) => {
                if self.acquiring.is_some() {
                    // Answered together with the first request
                    self.init_waiters.push(reply);
                    return false;
                }
                if self.negotiator.state() != NegotiatorState::Uninitialized {
                    debug!(
                        session_id = %self.params.session_id,
                        state = %self.negotiator.state(),
                        "Session already initialized"
                    );
                    let _ = reply.send(Ok(()));
                    return false;
                }

                self.init_waiters.push(reply);
                if let Err(e) = self.request_media() {
                    self.fail(&e);
                    return true;
                }
                false
            }
            Command::ToggleMic(reply) => {
                let _ = reply.send(self.toggle(|media| {
                    let enabled = !media.audio_enabled();
                    media.set_audio_enabled(enabled);
                    enabled
                }));
                false
            }
            Command::ToggleCam(reply) => {
                let _ = reply.send(self.toggle(|media| {
                    let enabled = !media.video_enabled();
                    media.set_video_enabled(enabled);
                    enabled
                }));
                false
            }
            Command::EndCall(reply) => {
                info!(session_id = %self.params.session_id, "Ending call");
                self.teardown().await;
                let _ = reply.send(());
                true
            }
        }
    }

    fn toggle(&mut self, flip: impl FnOnce(&LocalMediaAcquirer) -> bool) -> Result<bool> {
        if self.media.stream().is_none() {
            return Err(CallError::invalid_transition(self.negotiator.state(), "Toggle"));
        }
        let enabled = flip(self.media.as_ref());
        self.publish();
        Ok(enabled)
    }

    /// Claim initialization and open the device prompt in the background
    fn request_media(&mut self) -> Result<()> {
        self.negotiator.begin()?;
        self.publish();

        let media = self.media.clone();
        self.acquiring = Some(tokio::spawn(async move { media.acquire().await }));
        Ok(())
    }

    /// Returns true when the session is over
    async fn on_media_acquired(
        &mut self,
        acquired: std::result::Result<Result<LocalMediaStream>, JoinError>,
    ) -> bool {
        let result = match acquired {
            Ok(Ok(_)) => self.join_room().await,
            Ok(Err(e)) => Err(e),
            Err(e) => Err(CallError::MediaUnavailable(format!(
                "device request aborted: {e}"
            ))),
        };

        match result {
            Ok(()) => {
                self.answer_init_waiters();
                false
            }
            Err(e) => {
                // Waiters are answered once teardown has run
                self.fail(&e);
                true
            }
        }
    }

    fn answer_init_waiters(&mut self) {
        for waiter in self.init_waiters.drain(..) {
            let _ = waiter.send(Ok(()));
        }
    }

    /// Everything after the local stream is in hand
    async fn join_room(&mut self) -> Result<()> {
        self.publish();

        self.incoming = Some(self.negotiator.register().await?);
        self.publish();

        let directory = RoomDirectoryClient::connect(
            self.deps.signaling.as_ref(),
            self.params.session_id.clone(),
        )
        .await?;
        self.signaling_rx = directory.take_inbound();

        let tx = self.room_tx.clone();
        directory.on_peer_joined(move |peer| {
            let _ = tx.send(RoomEvent::PeerJoined(peer.clone()));
        });
        let tx = self.room_tx.clone();
        directory.on_peer_left(move || {
            let _ = tx.send(RoomEvent::PeerLeft);
        });

        let directory = self.directory.insert(directory);
        let address = self
            .negotiator
            .address()
            .cloned()
            .ok_or_else(|| CallError::invalid_transition(self.negotiator.state(), "Announced"))?;
        directory
            .announce_presence(&address, &self.params.display_name)
            .await?;

        self.negotiator.mark_announced()?;
        self.negotiator.mark_awaiting_peer()?;
        self.publish();

        info!(
            session_id = %self.params.session_id,
            address = %address,
            "Session ready, waiting for peer"
        );
        Ok(())
    }

    fn local_stream(&self) -> Result<LocalMediaStream> {
        self.media
            .stream()
            .ok_or_else(|| CallError::MediaUnavailable("local stream released".to_string()))
    }

    /// Returns true when the session is over
    async fn on_room_event(&mut self, event: RoomEvent) -> bool {
        let result = match event {
            RoomEvent::PeerJoined(peer) => self.on_peer_joined(peer).await,
            RoomEvent::PeerLeft => {
                let name = self.negotiator.peer().map(|p| p.name.clone());
                if self.negotiator.on_peer_left() {
                    self.notify(Notice::Info(format!(
                        "{} left the call",
                        name.as_deref().unwrap_or("Your peer")
                    )));
                }
                Ok(())
            }
        };
        self.settle(result).await
    }

    async fn on_peer_joined(&mut self, peer: PeerInfo) -> Result<()> {
        if Some(&peer.peer_id) == self.negotiator.address() {
            return Ok(());
        }
        info!(
            session_id = %self.params.session_id,
            peer = %peer.peer_id,
            name = %peer.name,
            "Peer joined room"
        );
        let local = self.local_stream()?;
        if self
            .negotiator
            .call(&peer, &local, &self.params.display_name)
            .await?
            == CallOutcome::Calling
        {
            self.publish();
        }
        Ok(())
    }

    /// Returns true when the session is over
    async fn on_incoming(&mut self, call: IncomingCall) -> bool {
        let result = self.answer_incoming(call).await;
        self.settle(result).await
    }

    async fn answer_incoming(&mut self, call: IncomingCall) -> Result<()> {
        info!(
            session_id = %self.params.session_id,
            from = %call.from,
            name = %call.metadata.name,
            "Inbound call"
        );
        let local = self.local_stream()?;
        if self.negotiator.answer(call, &local).await? == AnswerOutcome::Answered {
            self.publish();
        }
        Ok(())
    }

    /// Returns true when the session failed
    fn on_call_event(&mut self, event: CallEvent) -> bool {
        let peer_name = self.negotiator.peer().map(|p| p.name.clone());
        match self.negotiator.handle_call_event(event) {
            Ok(CallUpdate::Connected) => {
                self.notify(Notice::Info(format!(
                    "Connected with {}",
                    peer_name.as_deref().unwrap_or("peer")
                )));
            }
            Ok(CallUpdate::PeerDeparted) => {
                self.notify(Notice::Info(format!(
                    "{} left the call",
                    peer_name.as_deref().unwrap_or("Your peer")
                )));
            }
            Ok(CallUpdate::Declined) => {}
            Err(e) => {
                self.fail(&e);
                return true;
            }
        }
        self.publish();
        false
    }

    /// Tear down on error; returns true when the session is over
    async fn settle(&mut self, result: Result<()>) -> bool {
        match result {
            Ok(()) => false,
            Err(e) if e.is_fatal() => {
                self.fail(&e);
                self.teardown().await;
                true
            }
            Err(e) => {
                warn!(session_id = %self.params.session_id, error = %e, "Ignoring event");
                false
            }
        }
    }

    fn fail(&mut self, e: &CallError) {
        error!(
            session_id = %self.params.session_id,
            state = %self.negotiator.state(),
            error = %e,
            "Call session failed"
        );
        let message = e.user_message();
        self.notify(Notice::Error(message.clone()));
        self.failure = Some(message);
        self.publish();
    }

    /// Release everything in a fixed order, whatever state the session is in
    async fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;

        // 1. room directory listeners and channel
        if let Some(directory) = self.directory.take() {
            directory.close().await;
        }
        self.signaling_rx = None;

        // 2. active call
        self.negotiator.close_call();

        // 3. negotiation endpoint
        self.negotiator.destroy_endpoint().await;
        self.incoming = None;

        // 4. local media; a prompt still open resolves into a released
        // acquirer, which stops whatever stream it eventually yields
        self.acquiring = None;
        self.media.release();

        self.negotiator.end();
        self.publish();
        self.answer_init_waiters();
        info!(session_id = %self.params.session_id, "Call session torn down");
    }

    fn notify(&self, notice: Notice) {
        // No subscribers is fine
        let _ = self.notices.send(notice);
    }

    fn publish(&self) {
        self.view.send_replace(CallView::derive(
            &self.params.session_id,
            &self.params.display_name,
            &self.params.config.peer_placeholder,
            &self.media,
            &self.negotiator,
            self.failure.as_deref(),
        ));
    }
}

async fn join_opt<T>(task: &mut Option<JoinHandle<T>>) -> std::result::Result<T, JoinError> {
    match task {
        Some(task) => task.await,
        None => std::future::pending().await,
    }
}

async fn recv_opt<T>(rx: &mut Option<mpsc::UnboundedReceiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
