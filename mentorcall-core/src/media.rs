//! Local media acquisition
//!
//! This module handles:
//! - Camera/microphone capture through the [`MediaDevices`] port
//! - Shared track handles whose enabled flag flips in place (mute / camera off)
//! - Scoped release of every track when the session exits

use crate::error::{CallError, Result};
use crate::types::{StreamId, TrackId};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Media track kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Audio => write!(f, "audio"),
            Self::Video => write!(f, "video"),
        }
    }
}

/// Which devices to capture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }
}

/// One captured track.
///
/// Shared by reference between the local preview and the peer connection, so
/// flipping `enabled` is observed by both without renegotiation.
pub struct MediaTrack {
    id: TrackId,
    kind: TrackKind,
    label: String,
    enabled: AtomicBool,
    live: AtomicBool,
}

impl MediaTrack {
    pub fn new(kind: TrackKind, label: impl Into<String>) -> Self {
        Self {
            id: TrackId::new(crate::types::generate_id()),
            kind,
            label: label.into(),
            enabled: AtomicBool::new(true),
            live: AtomicBool::new(true),
        }
    }

    #[must_use]
    pub const fn id(&self) -> &TrackId {
        &self.id
    }

    #[must_use]
    pub const fn kind(&self) -> TrackKind {
        self.kind
    }

    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Flip the enabled flag in place. A stopped track stays disabled.
    pub fn set_enabled(&self, enabled: bool) {
        if !self.is_live() {
            return;
        }
        self.enabled.store(enabled, Ordering::Release);
    }

    #[must_use]
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    /// Stop the track for good
    pub fn stop(&self) {
        self.live.store(false, Ordering::Release);
        self.enabled.store(false, Ordering::Release);
    }
}

impl fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("enabled", &self.is_enabled())
            .field("live", &self.is_live())
            .finish()
    }
}

struct StreamInner {
    id: StreamId,
    tracks: Vec<Arc<MediaTrack>>,
}

/// Handle to the local camera/microphone stream.
///
/// Cloning the handle does not copy the stream; every clone refers to the same
/// tracks.
#[derive(Clone)]
pub struct LocalMediaStream {
    inner: Arc<StreamInner>,
}

impl LocalMediaStream {
    #[must_use]
    pub fn new(tracks: Vec<Arc<MediaTrack>>) -> Self {
        Self {
            inner: Arc::new(StreamInner {
                id: StreamId::generate(),
                tracks,
            }),
        }
    }

    #[must_use]
    pub fn id(&self) -> &StreamId {
        &self.inner.id
    }

    #[must_use]
    pub fn tracks(&self) -> &[Arc<MediaTrack>] {
        &self.inner.tracks
    }

    pub fn audio_tracks(&self) -> impl Iterator<Item = &Arc<MediaTrack>> {
        self.tracks_of(TrackKind::Audio)
    }

    pub fn video_tracks(&self) -> impl Iterator<Item = &Arc<MediaTrack>> {
        self.tracks_of(TrackKind::Video)
    }

    fn tracks_of(&self, kind: TrackKind) -> impl Iterator<Item = &Arc<MediaTrack>> {
        self.inner.tracks.iter().filter(move |t| t.kind() == kind)
    }

    /// True while at least one track is still capturing
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.inner.tracks.iter().any(|t| t.is_live())
    }

    /// Identity comparison: both handles refer to the same capture
    #[must_use]
    pub fn same_stream(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn stop_all(&self) {
        for track in &self.inner.tracks {
            track.stop();
        }
    }
}

impl fmt::Debug for LocalMediaStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalMediaStream")
            .field("id", &self.inner.id)
            .field("tracks", &self.inner.tracks)
            .finish()
    }
}

/// Camera/microphone capture API of the hosting device
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Ask for capture permission and open the requested devices
    async fn get_user_media(&self, constraints: MediaConstraints) -> Result<LocalMediaStream>;
}

/// Outcome a [`SyntheticDevices`] produces for every request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceBehavior {
    Grant,
    DenyPermission,
    NoDevice,
}

/// In-process capture source producing synthetic tracks
pub struct SyntheticDevices {
    behavior: Mutex<DeviceBehavior>,
    delay: Option<Duration>,
    requests: AtomicUsize,
}

impl SyntheticDevices {
    #[must_use]
    pub fn new() -> Self {
        Self::with_behavior(DeviceBehavior::Grant)
    }

    #[must_use]
    pub fn with_behavior(behavior: DeviceBehavior) -> Self {
        Self {
            behavior: Mutex::new(behavior),
            delay: None,
            requests: AtomicUsize::new(0),
        }
    }

    /// Simulate a slow permission prompt
    #[must_use]
    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn set_behavior(&self, behavior: DeviceBehavior) {
        *self.behavior.lock() = behavior;
    }

    /// Number of capture requests received so far
    #[must_use]
    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

impl Default for SyntheticDevices {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaDevices for SyntheticDevices {
    async fn get_user_media(&self, constraints: MediaConstraints) -> Result<LocalMediaStream> {
        self.requests.fetch_add(1, Ordering::SeqCst);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let behavior = *self.behavior.lock();
        match behavior {
            DeviceBehavior::DenyPermission => Err(CallError::MediaAccessDenied(
                "permission dismissed by user".to_string(),
            )),
            DeviceBehavior::NoDevice => Err(CallError::MediaUnavailable(
                "no capture device present".to_string(),
            )),
            DeviceBehavior::Grant => {
                let mut tracks = Vec::new();
                if constraints.audio {
                    tracks.push(Arc::new(MediaTrack::new(TrackKind::Audio, "synthetic microphone")));
                }
                if constraints.video {
                    tracks.push(Arc::new(MediaTrack::new(TrackKind::Video, "synthetic camera")));
                }
                Ok(LocalMediaStream::new(tracks))
            }
        }
    }
}

enum AcquireState {
    Idle,
    Acquiring,
    Ready(LocalMediaStream),
    Released,
}

impl AcquireState {
    const fn name(&self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::Acquiring => "Acquiring",
            Self::Ready(_) => "Ready",
            Self::Released => "Released",
        }
    }
}

/// Resets an abandoned acquisition so a dropped future does not wedge the latch
struct AcquireGuard<'a> {
    state: &'a Mutex<AcquireState>,
    armed: bool,
}

impl Drop for AcquireGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut state = self.state.lock();
            if matches!(*state, AcquireState::Acquiring) {
                *state = AcquireState::Idle;
            }
        }
    }
}

/// Exclusive owner of the session's local stream
pub struct LocalMediaAcquirer {
    devices: Arc<dyn MediaDevices>,
    constraints: MediaConstraints,
    state: Mutex<AcquireState>,
}

impl LocalMediaAcquirer {
    pub fn new(devices: Arc<dyn MediaDevices>, constraints: MediaConstraints) -> Self {
        Self {
            devices,
            constraints,
            state: Mutex::new(AcquireState::Idle),
        }
    }

    /// Request combined capture.
    ///
    /// Returns the held stream if one was already acquired; a second request
    /// while the first is still pending is refused.
    pub async fn acquire(&self) -> Result<LocalMediaStream> {
        if !self.constraints.audio && !self.constraints.video {
            return Err(CallError::MediaUnavailable(
                "neither audio nor video requested".to_string(),
            ));
        }

        {
            let mut state = self.state.lock();
            match &*state {
                AcquireState::Idle => *state = AcquireState::Acquiring,
                AcquireState::Ready(stream) => {
                    debug!(stream_id = %stream.id(), "Local media already acquired");
                    return Ok(stream.clone());
                }
                other => {
                    return Err(CallError::invalid_transition(other.name(), "Acquiring"));
                }
            }
        }

        let mut guard = AcquireGuard {
            state: &self.state,
            armed: true,
        };

        let result = self.devices.get_user_media(self.constraints).await;
        guard.armed = false;

        let mut state = self.state.lock();
        match result {
            Ok(stream) => {
                if matches!(*state, AcquireState::Released) {
                    // Released while the prompt was open: the capture is not wanted anymore
                    stream.stop_all();
                    return Err(CallError::invalid_transition("Released", "Ready"));
                }
                info!(
                    stream_id = %stream.id(),
                    tracks = stream.tracks().len(),
                    "Local media acquired"
                );
                *state = AcquireState::Ready(stream.clone());
                Ok(stream)
            }
            Err(e) => {
                if matches!(*state, AcquireState::Acquiring) {
                    *state = AcquireState::Idle;
                }
                warn!(error = %e, "Local media acquisition failed");
                Err(e)
            }
        }
    }

    /// The held stream, if acquired and not yet released
    #[must_use]
    pub fn stream(&self) -> Option<LocalMediaStream> {
        match &*self.state.lock() {
            AcquireState::Ready(stream) => Some(stream.clone()),
            _ => None,
        }
    }

    pub fn set_audio_enabled(&self, enabled: bool) {
        self.set_kind_enabled(TrackKind::Audio, enabled);
    }

    pub fn set_video_enabled(&self, enabled: bool) {
        self.set_kind_enabled(TrackKind::Video, enabled);
    }

    fn set_kind_enabled(&self, kind: TrackKind, enabled: bool) {
        if let Some(stream) = self.stream() {
            for track in stream.tracks_of(kind) {
                track.set_enabled(enabled);
            }
            debug!(%kind, enabled, "Toggled local tracks");
        }
    }

    #[must_use]
    pub fn audio_enabled(&self) -> bool {
        self.kind_enabled(TrackKind::Audio)
    }

    #[must_use]
    pub fn video_enabled(&self) -> bool {
        self.kind_enabled(TrackKind::Video)
    }

    fn kind_enabled(&self, kind: TrackKind) -> bool {
        self.stream()
            .is_some_and(|s| s.tracks_of(kind).any(|t| t.is_enabled()))
    }

    /// Stop every track. Safe to call repeatedly and from any state.
    pub fn release(&self) {
        let previous = std::mem::replace(&mut *self.state.lock(), AcquireState::Released);
        if let AcquireState::Ready(stream) = previous {
            stream.stop_all();
            info!(stream_id = %stream.id(), "Local media released");
        }
    }
}

impl Drop for LocalMediaAcquirer {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn acquirer(devices: SyntheticDevices) -> LocalMediaAcquirer {
        LocalMediaAcquirer::new(Arc::new(devices), MediaConstraints::default())
    }

    #[tokio::test]
    async fn test_acquire_returns_audio_and_video() {
        let acquirer = acquirer(SyntheticDevices::new());
        let stream = acquirer.acquire().await.unwrap();

        assert_eq!(stream.audio_tracks().count(), 1);
        assert_eq!(stream.video_tracks().count(), 1);
        assert!(stream.is_live());
        assert!(acquirer.audio_enabled());
        assert!(acquirer.video_enabled());
    }

    #[tokio::test]
    async fn test_acquire_twice_returns_same_stream() {
        let devices = Arc::new(SyntheticDevices::new());
        let acquirer = LocalMediaAcquirer::new(devices.clone(), MediaConstraints::default());

        let first = acquirer.acquire().await.unwrap();
        let second = acquirer.acquire().await.unwrap();

        assert!(first.same_stream(&second));
        assert_eq!(devices.request_count(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_acquire_is_refused() {
        let devices = Arc::new(SyntheticDevices::new().with_delay(Duration::from_millis(50)));
        let acquirer = LocalMediaAcquirer::new(devices.clone(), MediaConstraints::default());

        let (a, b) = tokio::join!(acquirer.acquire(), acquirer.acquire());

        assert!(a.is_ok() ^ b.is_ok());
        assert_eq!(devices.request_count(), 1);
    }

    #[tokio::test]
    async fn test_denied_permission() {
        let acquirer = acquirer(SyntheticDevices::with_behavior(DeviceBehavior::DenyPermission));
        let err = acquirer.acquire().await.unwrap_err();

        assert!(matches!(err, CallError::MediaAccessDenied(_)));
        assert!(acquirer.stream().is_none());
    }

    #[tokio::test]
    async fn test_no_device() {
        let acquirer = acquirer(SyntheticDevices::with_behavior(DeviceBehavior::NoDevice));
        assert!(matches!(
            acquirer.acquire().await,
            Err(CallError::MediaUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_toggle_keeps_stream_identity() {
        let acquirer = acquirer(SyntheticDevices::new());
        let stream = acquirer.acquire().await.unwrap();

        acquirer.set_audio_enabled(false);
        assert!(!acquirer.audio_enabled());
        assert!(acquirer.video_enabled());

        acquirer.set_audio_enabled(true);
        assert!(acquirer.audio_enabled());

        let after = acquirer.stream().unwrap();
        assert!(after.same_stream(&stream));
        assert!(after.is_live());
    }

    #[tokio::test]
    async fn test_release_stops_every_track() {
        let acquirer = acquirer(SyntheticDevices::new());
        let stream = acquirer.acquire().await.unwrap();

        acquirer.release();
        acquirer.release();

        assert!(!stream.is_live());
        assert!(stream.tracks().iter().all(|t| !t.is_enabled()));
        assert!(acquirer.stream().is_none());

        // A stopped track cannot be re-enabled
        stream.tracks()[0].set_enabled(true);
        assert!(!stream.tracks()[0].is_enabled());
    }

    #[tokio::test]
    async fn test_drop_releases_tracks() {
        let stream = {
            let acquirer = acquirer(SyntheticDevices::new());
            acquirer.acquire().await.unwrap()
        };
        assert!(!stream.is_live());
    }

    #[tokio::test]
    async fn test_empty_constraints_are_unavailable() {
        let acquirer = LocalMediaAcquirer::new(
            Arc::new(SyntheticDevices::new()),
            MediaConstraints {
                audio: false,
                video: false,
            },
        );
        assert!(matches!(
            acquirer.acquire().await,
            Err(CallError::MediaUnavailable(_))
        ));
    }
}
