// Runtime configuration for the call core.
// Logging defaults differ between debug and release builds.

use crate::errors::ConfigError;
use crate::peer::state::{GRACE_PERIOD, MAX_PENDING_CANDIDATES, MAX_PENDING_SESSIONS};
use crate::peer::types::ServerConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[cfg(debug_assertions)]
pub const LOGGING_ENABLED: bool = true;

#[cfg(not(debug_assertions))]
pub const LOGGING_ENABLED: bool = false;

#[cfg(debug_assertions)]
pub const DEFAULT_LOG_FILTER: &str = "peercall=debug";

#[cfg(not(debug_assertions))]
pub const DEFAULT_LOG_FILTER: &str = "peercall=warn";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CallConfig {
    pub ice: IceConfig,
    pub session: SessionConfig,
    pub media: MediaConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct IceConfig {
    pub servers: Vec<ServerConfig>,
    pub candidate_pool_size: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Seconds a Disconnected session may take to recover before it fails.
    pub disconnect_grace_secs: u64,
    /// Capacity of the UI event broadcast channel.
    pub event_capacity: usize,
    /// Remote candidates kept per session that has not been accepted yet.
    pub max_pending_candidates: usize,
    /// Unknown sessions that may hold buffered candidates at the same time.
    pub max_pending_sessions: usize,
}

/// Devices opened by the `devices` capture backend.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MediaConfig {
    /// Input device name as the audio host reports it; the default input when unset.
    pub microphone: Option<String>,
    /// Camera index.
    pub camera: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    pub enabled: bool,
    /// `env_logger` filter; `RUST_LOG` wins when set.
    pub filter: String,
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            servers: vec![
                ServerConfig {
                    id: "default-stun".into(),
                    r#type: "stun".into(),
                    url: "stun:stun.l.google.com:19302".into(),
                    username: None,
                    credential: None,
                },
                ServerConfig {
                    id: "default-stun-1".into(),
                    r#type: "stun".into(),
                    url: "stun:stun1.l.google.com:19302".into(),
                    username: None,
                    credential: None,
                },
            ],
            candidate_pool_size: 10,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            disconnect_grace_secs: GRACE_PERIOD.as_secs(),
            event_capacity: 64,
            max_pending_candidates: MAX_PENDING_CANDIDATES,
            max_pending_sessions: MAX_PENDING_SESSIONS,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enabled: LOGGING_ENABLED,
            filter: DEFAULT_LOG_FILTER.into(),
        }
    }
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ice: IceConfig::default(),
            session: SessionConfig::default(),
            media: MediaConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl SessionConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.disconnect_grace_secs)
    }
}

impl CallConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: CallConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for server in &self.ice.servers {
            if server.url.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "ice server '{}' has an empty url",
                    server.id
                )));
            }
            if server.r#type == "turn" && (server.username.is_none() || server.credential.is_none()) {
                return Err(ConfigError::Invalid(format!(
                    "turn server '{}' requires username and credential",
                    server.id
                )));
            }
        }
        if self.session.event_capacity == 0 {
            return Err(ConfigError::Invalid("session.event_capacity must be > 0".into()));
        }
        if self.session.max_pending_sessions == 0 {
            return Err(ConfigError::Invalid(
                "session.max_pending_sessions must be > 0".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_use_ten_second_grace() {
        let config = CallConfig::default();
        assert_eq!(config.session.grace_period(), Duration::from_secs(10));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = CallConfig::from_toml_str(
            r#"
            [session]
            disconnect_grace_secs = 3
            "#,
        )
        .unwrap();
        assert_eq!(config.session.disconnect_grace_secs, 3);
        assert_eq!(config.session.event_capacity, 64);
        assert_eq!(config.session.max_pending_sessions, MAX_PENDING_SESSIONS);
        assert_eq!(config.ice.servers.len(), 2);
    }

    #[test]
    fn media_section_names_devices() {
        let config = CallConfig::from_toml_str(
            r#"
            [media]
            microphone = "USB Headset"
            camera = 1
            "#,
        )
        .unwrap();
        assert_eq!(config.media.microphone.as_deref(), Some("USB Headset"));
        assert_eq!(config.media.camera, 1);
        assert_eq!(CallConfig::default().media.camera, 0);
    }

    #[test]
    fn turn_without_credentials_is_rejected() {
        let err = CallConfig::from_toml_str(
            r#"
            [[ice.servers]]
            id = "relay"
            type = "turn"
            url = "relay.example.org:3478"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn garbage_is_a_parse_error() {
        assert!(matches!(
            CallConfig::from_toml_str("session = 5"),
            Err(ConfigError::Parse(_))
        ));
    }
}
