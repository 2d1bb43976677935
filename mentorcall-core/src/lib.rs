//! `MentorCall` call session core
//!
//! Establishes a live one-to-one audio/video call between the two
//! participants of a booked mentorship session.
//!
//! ## Architecture
//!
//! - **`LocalMediaAcquirer`**: Captures camera and microphone, toggles tracks in place
//! - **`RoomDirectoryClient`**: Announces presence and relays join/leave notifications
//! - **`Negotiator`**: Caller/answerer state machine owning the single call handle
//! - **`CallSession`**: Per-session actor publishing a `CallView` to the host
//!
//! ## Flow
//!
//! The participant who already waits in the room is told that the other one
//! joined and becomes the caller. The newcomer receives the inbound call and
//! answers with its own stream. If both sides call each other, the side with
//! the smaller address drops its outbound call and answers.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use mentorcall_core::{CallSession, SessionDeps, SessionParams};
//!
//! let handle = CallSession::spawn(deps, SessionParams {
//!     session_id: "abc123".into(),
//!     display_name: "Asha".to_string(),
//!     config: config.call.clone(),
//! });
//! handle.initialize().await?;
//! let mut view = handle.view();
//! ```

pub mod config;
pub mod error;
pub mod logging;
pub mod media;
pub mod negotiator;
pub mod session;
pub mod signaling;
pub mod types;
pub mod view;

pub use self::config::{CallConfig, Config, IceServerConfig, LoggingConfig};
pub use error::{CallError, Result};
pub use media::{
    DeviceBehavior, LocalMediaAcquirer, LocalMediaStream, MediaConstraints, MediaDevices,
    MediaTrack, SyntheticDevices, TrackKind,
};
pub use negotiator::{
    CallEvent, CallHandle, CallMetadata, CallRole, IncomingCall, LoopbackNetwork, Negotiator,
    NegotiatorState, PeerEndpoint, PeerNetwork, Registration, RemoteMediaStream, RtcNetwork,
};
pub use session::{CallSession, SessionDeps, SessionHandle, SessionParams};
pub use signaling::{
    InMemoryRelay, InboundEvent, OutboundEvent, PeerInfo, RoomDirectoryClient,
    SignalingConnector, SignalingTransport, WebSocketConnector,
};
pub use types::{CallId, PeerAddress, SessionId, StreamId, TrackId};
pub use view::{CallStatus, CallView, Notice};
