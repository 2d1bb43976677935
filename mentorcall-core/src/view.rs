//! Call session view-model
//!
//! [`CallView`] is recomputed from the media, negotiator and failure state
//! after every change and published to the rendering layer, which binds the
//! stream handles to its output sinks.

use crate::media::{LocalMediaAcquirer, LocalMediaStream};
use crate::negotiator::{Negotiator, NegotiatorState, RemoteMediaStream};
use crate::types::SessionId;
use std::fmt;

/// Persistent on-screen status line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallStatus {
    Idle,
    RequestingMedia,
    MediaReady,
    WaitingForPeer,
    Connecting,
    Connected,
    PeerLeft,
    Ended,
    Error(String),
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "Not started"),
            Self::RequestingMedia => write!(f, "Requesting camera/mic..."),
            Self::MediaReady => write!(f, "Camera/Mic ready"),
            Self::WaitingForPeer => write!(f, "Waiting for peer..."),
            Self::Connecting => write!(f, "Connecting..."),
            Self::Connected => write!(f, "Connected"),
            Self::PeerLeft => write!(f, "Peer left"),
            Self::Ended => write!(f, "Call ended"),
            Self::Error(message) => write!(f, "Error: {message}"),
        }
    }
}

impl CallStatus {
    fn derive(state: NegotiatorState, failure: Option<&str>) -> Self {
        if let Some(message) = failure {
            return Self::Error(message.to_string());
        }
        match state {
            NegotiatorState::Uninitialized => Self::Idle,
            NegotiatorState::AcquiringMedia => Self::RequestingMedia,
            NegotiatorState::AddressAssigned | NegotiatorState::Announced => Self::MediaReady,
            NegotiatorState::AwaitingPeer => Self::WaitingForPeer,
            NegotiatorState::Negotiating { .. } => Self::Connecting,
            NegotiatorState::Connected { .. } => Self::Connected,
            NegotiatorState::PeerDeparted => Self::PeerLeft,
            NegotiatorState::Ended => Self::Ended,
        }
    }
}

/// Non-blocking notification for the participant
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    Info(String),
    Error(String),
}

/// Everything the call screen renders
#[derive(Debug, Clone)]
pub struct CallView {
    pub session_id: SessionId,
    pub own_name: String,
    pub mic_enabled: bool,
    pub cam_enabled: bool,
    /// Placeholder until the peer is known
    pub peer_name: String,
    /// Choose live video over the placeholder tile
    pub peer_connected: bool,
    pub status: CallStatus,
    pub state: NegotiatorState,
    pub local_stream: Option<LocalMediaStream>,
    pub remote_stream: Option<RemoteMediaStream>,
}

impl CallView {
    pub(crate) fn derive(
        session_id: &SessionId,
        own_name: &str,
        placeholder: &str,
        media: &LocalMediaAcquirer,
        negotiator: &Negotiator,
        failure: Option<&str>,
    ) -> Self {
        let state = negotiator.state();
        Self {
            session_id: session_id.clone(),
            own_name: own_name.to_string(),
            mic_enabled: media.audio_enabled(),
            cam_enabled: media.video_enabled(),
            peer_name: negotiator
                .peer()
                .map_or_else(|| placeholder.to_string(), |p| p.name.clone()),
            peer_connected: matches!(state, NegotiatorState::Connected { .. }),
            status: CallStatus::derive(state, failure),
            state,
            local_stream: media.stream(),
            remote_stream: negotiator.remote_stream().cloned(),
        }
    }

    /// Text of the status line
    #[must_use]
    pub fn status_text(&self) -> String {
        self.status.to_string()
    }

    #[must_use]
    pub const fn is_ended(&self) -> bool {
        matches!(self.state, NegotiatorState::Ended)
    }
}
