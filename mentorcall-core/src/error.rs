use thiserror::Error;

#[derive(Error, Debug)]
pub enum CallError {
    #[error("Camera/microphone access denied: {0}")]
    MediaAccessDenied(String),

    #[error("Camera/microphone unavailable: {0}")]
    MediaUnavailable(String),

    #[error("Signaling unavailable: {0}")]
    SignalingUnavailable(String),

    #[error("Negotiation failed: {0}")]
    NegotiationFailed(String),

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Session closed")]
    SessionClosed,

    #[error("Timed out: {0}")]
    Timeout(String),

    /// The caller hung up before an inbound call could be answered
    #[error("Call cancelled by caller")]
    CallCancelled,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl CallError {
    pub fn invalid_transition(from: impl std::fmt::Debug, to: impl std::fmt::Debug) -> Self {
        Self::InvalidTransition {
            from: format!("{from:?}"),
            to: format!("{to:?}"),
        }
    }

    /// Whether the error ends the current session attempt
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::MediaAccessDenied(_)
                | Self::MediaUnavailable(_)
                | Self::SignalingUnavailable(_)
                | Self::NegotiationFailed(_)
                | Self::SessionClosed
        )
    }

    /// Text for the non-blocking notification shown to the participant
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            Self::MediaAccessDenied(_) => {
                "Camera/microphone permission was refused. Allow access and rejoin the session."
                    .to_string()
            }
            Self::MediaUnavailable(_) => {
                "No usable camera or microphone was found.".to_string()
            }
            Self::SignalingUnavailable(_) => {
                "Could not reach the session room. Check your connection and rejoin.".to_string()
            }
            Self::NegotiationFailed(_) => {
                "Could not connect to your peer. Please re-enter the session.".to_string()
            }
            other => other.to_string(),
        }
    }
}

impl From<config::ConfigError> for CallError {
    fn from(err: config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CallError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_taxonomy_is_fatal() {
        assert!(CallError::MediaAccessDenied("denied".into()).is_fatal());
        assert!(CallError::SignalingUnavailable("down".into()).is_fatal());
        assert!(CallError::NegotiationFailed("ice".into()).is_fatal());
        assert!(!CallError::invalid_transition("Ended", "AwaitingPeer").is_fatal());
        assert!(!CallError::CallCancelled.is_fatal());
    }

    #[test]
    fn test_user_message_hides_internal_detail() {
        let err = CallError::NegotiationFailed("ice failed on 10.0.0.4".into());
        assert!(!err.user_message().contains("10.0.0.4"));
        assert!(err.to_string().contains("10.0.0.4"));
    }
}
