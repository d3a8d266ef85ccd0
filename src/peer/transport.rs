use crate::errors::TransportError;
use crate::peer::types::{IceCandidate, MediaTrack, SessionDescription};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

/// What the peer connection reports back while a session is live.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    LocalCandidate(IceCandidate),
    GatheringComplete,
    PathEstablished,
    PathLost,
    PathFailed,
    RemoteTrack(MediaTrack),
}

pub type TransportEvents = mpsc::UnboundedReceiver<TransportEvent>;

/// Peer connection machinery: description generation, candidate gathering and
/// connectivity. Its wire protocol is not this crate's concern.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn add_local_track(&self, track: &MediaTrack) -> Result<(), TransportError>;

    /// Creates an offer and applies it as the local description.
    async fn create_offer(&self) -> Result<SessionDescription, TransportError>;

    /// Creates an answer to the applied remote offer and applies it locally.
    async fn create_answer(&self) -> Result<SessionDescription, TransportError>;

    async fn set_remote_description(&self, desc: &SessionDescription) -> Result<(), TransportError>;

    async fn add_remote_candidate(&self, candidate: &IceCandidate) -> Result<(), TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}

/// Opens one transport per session.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn open(
        &self,
        session_id: &str,
    ) -> Result<(Arc<dyn PeerTransport>, TransportEvents), TransportError>;
}
