//! Scripted in-memory transport for exercising the call flow without a network.
//!
//! [`FakeTransport`] produces well-formed descriptions, records what it is
//! asked to do and lets the caller inject [`TransportEvent`]s by hand.

use crate::errors::TransportError;
use crate::peer::transport::{PeerTransport, TransportEvent, TransportEvents, TransportFactory};
use crate::peer::types::{IceCandidate, MediaTrack, SdpKind, SessionDescription, TrackKind};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};

#[derive(Default)]
struct Recorded {
    tracks: Vec<MediaTrack>,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    applied: Vec<IceCandidate>,
    closed: bool,
}

pub struct FakeTransport {
    session_id: String,
    events: mpsc::UnboundedSender<TransportEvent>,
    recorded: Mutex<Recorded>,
    closes: AtomicUsize,
    fingerprint: String,
    offer_gate: Option<watch::Receiver<bool>>,
}

impl FakeTransport {
    fn new(
        session_id: &str,
        offer_gate: Option<watch::Receiver<bool>>,
    ) -> (Self, TransportEvents) {
        let (events, rx) = mpsc::unbounded_channel();
        let bytes: [u8; 8] = rand::random();
        let fingerprint = bytes
            .iter()
            .map(|b| format!("{b:02X}"))
            .collect::<Vec<_>>()
            .join(":");
        let transport = Self {
            session_id: session_id.to_string(),
            events,
            recorded: Mutex::new(Recorded::default()),
            closes: AtomicUsize::new(0),
            fingerprint,
            offer_gate,
        };
        (transport, rx)
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Pushes an event as if the connection produced it. Returns false once
    /// nobody listens any more.
    pub fn emit(&self, event: TransportEvent) -> bool {
        self.events.send(event).is_ok()
    }

    pub fn local_tracks(&self) -> Vec<MediaTrack> {
        self.recorded().tracks.clone()
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        self.recorded().local.clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.recorded().remote.clone()
    }

    /// Remote candidates handed to the connection, in order.
    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.recorded().applied.clone()
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    fn recorded(&self) -> std::sync::MutexGuard<'_, Recorded> {
        self.recorded.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.recorded().closed {
            return Err(TransportError::Closed);
        }
        Ok(())
    }

    fn sdp(&self, video: bool) -> String {
        let mut sdp = format!(
            "v=0\r\no=- {} 2 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\na=fingerprint:sha-256 {}\r\n",
            self.session_id, self.fingerprint
        );
        sdp.push_str("m=audio 9 UDP/TLS/RTP/SAVPF 111\r\na=mid:0\r\n");
        if video {
            sdp.push_str("m=video 9 UDP/TLS/RTP/SAVPF 96\r\na=mid:1\r\n");
        }
        sdp
    }
}

#[async_trait]
impl PeerTransport for FakeTransport {
    async fn add_local_track(&self, track: &MediaTrack) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.recorded().tracks.push(track.clone());
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        if let Some(gate) = &self.offer_gate {
            let mut gate = gate.clone();
            let released = gate.wait_for(|open| *open).await.is_ok();
            if !released {
                return Err(TransportError::Closed);
            }
        }
        self.ensure_open()?;
        let video = self
            .recorded()
            .tracks
            .iter()
            .any(|t| t.kind() == TrackKind::Video);
        let offer = SessionDescription::offer(self.sdp(video));
        self.recorded().local = Some(offer.clone());
        Ok(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        self.ensure_open()?;
        let video = match &self.recorded().remote {
            Some(remote) if remote.kind == SdpKind::Offer => remote.has_video(),
            _ => return Err(TransportError::Backend("no remote offer to answer".into())),
        };
        let answer = SessionDescription::answer(self.sdp(video));
        self.recorded().local = Some(answer.clone());
        Ok(answer)
    }

    async fn set_remote_description(&self, desc: &SessionDescription) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.recorded().remote = Some(desc.clone());
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: &IceCandidate) -> Result<(), TransportError> {
        self.ensure_open()?;
        let mut recorded = self.recorded();
        if recorded.remote.is_none() {
            return Err(TransportError::Backend("remote description not set".into()));
        }
        recorded.applied.push(candidate.clone());
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.recorded().closed = true;
        Ok(())
    }
}

/// Hands out [`FakeTransport`]s and keeps every one it opened.
#[derive(Default)]
pub struct FakeTransportFactory {
    opened: Mutex<Vec<Arc<FakeTransport>>>,
    fail_next: Mutex<Option<TransportError>>,
    offer_gate: Option<(watch::Sender<bool>, watch::Receiver<bool>)>,
}

impl FakeTransportFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transports from this factory block in `create_offer` until
    /// [`FakeTransportFactory::release_offers`] is called.
    pub fn with_offer_gate() -> Self {
        Self {
            offer_gate: Some(watch::channel(false)),
            ..Self::default()
        }
    }

    pub fn release_offers(&self) {
        if let Some((tx, _)) = &self.offer_gate {
            let _ = tx.send(true);
        }
    }

    /// The next `open` fails with `err`.
    pub fn fail_next_open(&self, err: TransportError) {
        *self.fail_next.lock().unwrap_or_else(|p| p.into_inner()) = Some(err);
    }

    pub fn opened(&self) -> Vec<Arc<FakeTransport>> {
        self.opened.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn last(&self) -> Option<Arc<FakeTransport>> {
        self.opened
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .last()
            .cloned()
    }
}

#[async_trait]
impl TransportFactory for FakeTransportFactory {
    async fn open(
        &self,
        session_id: &str,
    ) -> Result<(Arc<dyn PeerTransport>, TransportEvents), TransportError> {
        if let Some(err) = self.fail_next.lock().unwrap_or_else(|p| p.into_inner()).take() {
            return Err(err);
        }
        let gate = self.offer_gate.as_ref().map(|(_, rx)| rx.clone());
        let (transport, events) = FakeTransport::new(session_id, gate);
        let transport = Arc::new(transport);
        self.opened
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(transport.clone());
        Ok((transport, events))
    }
}
