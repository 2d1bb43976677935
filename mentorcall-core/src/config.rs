use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{CallError, Result};
use crate::media::MediaConstraints;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub logging: LoggingConfig,
    pub call: CallConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

/// Relay / traversal helper endpoint handed to the negotiation layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

impl IceServerConfig {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }
}

/// Call session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    /// WebSocket URL of the room directory relay
    pub signaling_url: String,
    /// Reachable relay / traversal helpers (STUN/TURN)
    pub ice_servers: Vec<IceServerConfig>,
    /// Which devices to capture on session start
    pub media: MediaConstraints,
    /// Upper bound on one offer/answer exchange
    pub negotiation_timeout_ms: u64,
    /// Room capacity; calls are strictly one-to-one
    pub max_participants: usize,
    /// Peer name shown until the other participant is known
    pub peer_placeholder: String,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            signaling_url: "ws://127.0.0.1:5000/signal".to_string(),
            ice_servers: vec![
                IceServerConfig::stun("stun:stun.l.google.com:19302"),
                IceServerConfig::stun("stun:stun1.l.google.com:19302"),
            ],
            media: MediaConstraints::default(),
            negotiation_timeout_ms: 15_000,
            max_participants: 2,
            peer_placeholder: "Connecting...".to_string(),
        }
    }
}

impl CallConfig {
    #[must_use]
    pub const fn negotiation_timeout(&self) -> Duration {
        Duration::from_millis(self.negotiation_timeout_ms)
    }

    /// Reject settings the negotiator cannot honour
    pub fn validate(&self) -> Result<()> {
        if self.max_participants != 2 {
            return Err(CallError::Config(format!(
                "max_participants must be 2 for one-to-one calls, got {}",
                self.max_participants
            )));
        }
        if self.negotiation_timeout_ms == 0 {
            return Err(CallError::Config(
                "negotiation_timeout_ms must be positive".to_string(),
            ));
        }
        if !self.media.audio && !self.media.video {
            return Err(CallError::Config(
                "media must request audio, video or both".to_string(),
            ));
        }
        if self.ice_servers.iter().any(|s| s.urls.is_empty()) {
            return Err(CallError::Config(
                "every ice server needs at least one url".to_string(),
            ));
        }
        Ok(())
    }
}

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> std::result::Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // Override with environment variables (MENTORCALL_LOGGING__LEVEL,
        // MENTORCALL_CALL__NEGOTIATION_TIMEOUT_MS, ...). Nesting uses `__`
        // since field names such as `max_participants` contain `_` themselves.
        builder = builder.add_source(
            Environment::with_prefix("MENTORCALL")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load from environment variables only
    pub fn from_env() -> std::result::Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Load from file path
    pub fn from_file(path: &str) -> std::result::Result<Self, ConfigError> {
        Self::load(Some(path))
    }
}
