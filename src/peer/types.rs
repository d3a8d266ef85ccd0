use crate::errors::NegotiationError;
use crate::peer::state::NegotiationState;
use serde::{Deserialize, Serialize};
use std::fmt;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Encoded samples a local track buffers for a slow sender before the oldest are skipped.
const SAMPLE_BACKLOG: usize = 32;

/// Side of the call this participant plays.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Caller,
    Callee,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

impl SdpKind {
    fn as_str(&self) -> &'static str {
        match self {
            SdpKind::Offer => "offer",
            SdpKind::Answer => "answer",
        }
    }
}

/// Session description exchanged during negotiation. The SDP body is opaque here.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }

    /// Checks that this is a well-formed description of the expected kind.
    pub fn validate(&self, expected: SdpKind) -> Result<(), NegotiationError> {
        if self.kind != expected {
            return Err(NegotiationError::Malformed {
                what: expected.as_str(),
                reason: format!("expected {} but got {}", expected.as_str(), self.kind.as_str()),
            });
        }
        if !self.sdp.trim_start().starts_with("v=0") {
            return Err(NegotiationError::Malformed {
                what: expected.as_str(),
                reason: "sdp does not start with v=0".into(),
            });
        }
        Ok(())
    }

    /// Whether the description negotiates a video stream.
    pub fn has_video(&self) -> bool {
        self.sdp.lines().any(|l| l.starts_with("m=video"))
    }
}

/// ICE candidate for the connection. Equality over all fields defines a duplicate.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct IceCandidate {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_mline_index: Option<u16>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
        }
    }

    /// "host", "srflx", "prflx" or "relay" when the line carries a `typ` field.
    pub fn candidate_type(&self) -> Option<&str> {
        let mut parts = self.candidate.split_whitespace();
        while let Some(p) = parts.next() {
            if p == "typ" {
                return parts.next();
            }
        }
        None
    }
}

/// ICE server entry as configured by the user.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub id: String,
    pub r#type: String, // 'stun' or 'turn'
    pub url: String,
    pub username: Option<String>,
    pub credential: Option<String>,
}

/// Who is on the other end, as supplied by the identity provider.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Participant {
    pub id: String,
    pub display_name: String,
    pub avatar_url: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", content = "payload", rename_all = "lowercase")]
pub enum SignalMessage {
    Offer(SessionDescription),
    Answer(SessionDescription),
    Candidate(IceCandidate),
}

/// Signal message addressed to one session.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SignalEnvelope {
    pub session_id: String,
    pub from: Participant,
    pub message: SignalMessage,
    pub ts: i64,
}

/// Offer received from a remote participant, waiting to be accepted.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct IncomingOffer {
    pub session_id: String,
    pub from: Participant,
    pub description: SessionDescription,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackKind::Audio => write!(f, "audio"),
            TrackKind::Video => write!(f, "video"),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TrackOrigin {
    Local,
    Remote,
}

/// One encoded media unit (an Opus packet, an H.264 access unit).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaSample {
    pub data: Bytes,
    pub duration: Duration,
}

/// Handle on one audio or video stream. Clones share the enabled flag and
/// the sample feed.
///
/// Local tracks are backed by a device handle owned by [`crate::media::MediaSource`];
/// the device pushes encoded samples and the transport forwards them.
/// Remote tracks only describe a stream owned by the transport.
#[derive(Debug, Clone)]
pub struct MediaTrack {
    id: String,
    kind: TrackKind,
    origin: TrackOrigin,
    enabled: Arc<AtomicBool>,
    samples: broadcast::Sender<MediaSample>,
}

impl MediaTrack {
    pub fn local(id: impl Into<String>, kind: TrackKind) -> Self {
        Self::with_origin(id.into(), kind, TrackOrigin::Local)
    }

    pub fn remote(id: impl Into<String>, kind: TrackKind) -> Self {
        Self::with_origin(id.into(), kind, TrackOrigin::Remote)
    }

    fn with_origin(id: String, kind: TrackKind, origin: TrackOrigin) -> Self {
        let (samples, _) = broadcast::channel(SAMPLE_BACKLOG);
        Self {
            id,
            kind,
            origin,
            enabled: Arc::new(AtomicBool::new(true)),
            samples,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn origin(&self) -> TrackOrigin {
        self.origin
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub(crate) fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Offers an encoded sample to whoever sends this track. Samples are
    /// dropped while the track is disabled. Returns whether anyone took it.
    pub fn push_sample(&self, sample: MediaSample) -> bool {
        if !self.is_enabled() {
            return false;
        }
        self.samples.send(sample).is_ok()
    }

    pub fn subscribe_samples(&self) -> broadcast::Receiver<MediaSample> {
        self.samples.subscribe()
    }
}

impl PartialEq for MediaTrack {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.kind == other.kind && self.origin == other.origin
    }
}

/// Why a call ended.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    Hangup,
    ConnectionFailed,
    NegotiationFailed(String),
    SetupFailed(String),
}

/// UI-facing notifications emitted by the controller.
#[derive(Debug, Clone)]
pub enum CallEvent {
    StateChanged(NegotiationState),
    LocalTrackReady(MediaTrack),
    RemoteTrackAvailable(MediaTrack),
    MediaStateChanged { kind: TrackKind, enabled: bool },
    IncomingCall(IncomingOffer),
    SignalingFailed(String),
    CallEnded(EndReason),
}
