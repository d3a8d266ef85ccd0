use crate::peer::state::{NegotiationState, Transition};
use thiserror::Error;

/// Capture device failures. Never fatal: the call can be retried later.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    #[error("capture device unavailable: {0}")]
    Unavailable(String),
    #[error("capture permission denied: {0}")]
    PermissionDenied(String),
    #[error("capture device busy: {0}")]
    Busy(String),
}

impl DeviceError {
    /// Sorts an OS or driver message into not-found, denied or busy.
    pub fn from_os_message(device: &str, message: &str) -> Self {
        let lower = message.to_ascii_lowercase();
        let detail = format!("{device}: {message}");
        if ["permission", "denied", "not permitted", "not authorized", "eacces", "eperm"]
            .iter()
            .any(|m| lower.contains(m))
        {
            DeviceError::PermissionDenied(detail)
        } else if ["busy", "in use", "ebusy", "already open", "exclusive"]
            .iter()
            .any(|m| lower.contains(m))
        {
            DeviceError::Busy(detail)
        } else {
            DeviceError::Unavailable(detail)
        }
    }
}

/// Malformed or out-of-sequence negotiation input. Aborts the current session only.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NegotiationError {
    #[error("media tracks are not bound to the session")]
    TracksNotBound,
    #[error("malformed {what}: {reason}")]
    Malformed { what: &'static str, reason: String },
    #[error("{transition:?} is not allowed in state {state:?}")]
    OutOfSequence {
        state: NegotiationState,
        transition: Transition,
    },
    #[error("candidate not accepted in state {0:?}")]
    UnexpectedCandidate(NegotiationState),
    #[error("{0} description is already set")]
    AlreadySet(&'static str),
    #[error("cannot enter Connected without both descriptions")]
    MissingDescription,
    #[error("session is closed")]
    SessionClosed,
    #[error("transport rejected negotiation step: {0}")]
    Transport(#[from] TransportError),
}

/// Signaling or peer transport failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("signaling channel unreachable: {0}")]
    Unreachable(String),
    #[error("transport backend error: {0}")]
    Backend(String),
    #[error("transport is closed")]
    Closed,
}

impl From<webrtc::Error> for TransportError {
    fn from(e: webrtc::Error) -> Self {
        TransportError::Backend(e.to_string())
    }
}

/// Errors surfaced by [`crate::CallController`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    #[error("a call is already active")]
    AlreadyActive,
    #[error("no active call")]
    NoActiveCall,
    #[error("call setup was cancelled")]
    Cancelled,
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error(transparent)]
    Negotiation(#[from] NegotiationError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}
