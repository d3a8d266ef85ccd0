//! Out-of-band signaling seam plus two ready-made channels: an in-memory
//! loopback hub and a manual copy/paste channel built on a compact text codec.

use crate::errors::{NegotiationError, TransportError};
use crate::peer::types::SignalEnvelope;
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use std::io::{Read, Write};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Upper bound for an inflated signal blob.
const MAX_DECOMPRESSED_SIZE: u64 = 256 * 1024; // 256 KiB

pub type Subscription = mpsc::UnboundedReceiver<SignalEnvelope>;

/// Transport for offers, answers and candidates between the two participants.
///
/// Delivery must be at-least-once; ordering across message types is not required.
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    async fn send(&self, session_id: &str, envelope: SignalEnvelope) -> Result<(), TransportError>;

    /// Fresh subscription to inbound messages, independent of earlier ones.
    fn subscribe(&self) -> Subscription;
}

#[derive(Default)]
struct Subscribers {
    senders: Vec<mpsc::UnboundedSender<SignalEnvelope>>,
}

impl Subscribers {
    fn add(&mut self) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        self.senders.push(tx);
        rx
    }

    /// Returns the number of live subscribers that got the message.
    fn deliver(&mut self, env: &SignalEnvelope) -> usize {
        self.senders.retain(|tx| tx.send(env.clone()).is_ok());
        self.senders.len()
    }
}

#[derive(Default)]
struct HubInner {
    endpoints: Vec<Arc<Mutex<Subscribers>>>,
}

/// In-memory relay. Every endpoint receives what the other endpoints send.
#[derive(Clone, Default)]
pub struct LoopbackHub {
    inner: Arc<Mutex<HubInner>>,
}

impl LoopbackHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn endpoint(&self) -> LoopbackEndpoint {
        let subs = Arc::new(Mutex::new(Subscribers::default()));
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner.endpoints.push(subs.clone());
        LoopbackEndpoint {
            hub: self.clone(),
            subs,
        }
    }

    /// Convenience for the two-party case.
    pub fn pair() -> (LoopbackEndpoint, LoopbackEndpoint) {
        let hub = Self::new();
        (hub.endpoint(), hub.endpoint())
    }
}

pub struct LoopbackEndpoint {
    hub: LoopbackHub,
    subs: Arc<Mutex<Subscribers>>,
}

#[async_trait]
impl SignalingChannel for LoopbackEndpoint {
    async fn send(&self, session_id: &str, envelope: SignalEnvelope) -> Result<(), TransportError> {
        let peers: Vec<_> = {
            let inner = self.hub.inner.lock().unwrap_or_else(|p| p.into_inner());
            inner
                .endpoints
                .iter()
                .filter(|e| !Arc::ptr_eq(e, &self.subs))
                .cloned()
                .collect()
        };
        if peers.is_empty() {
            return Err(TransportError::Unreachable(format!(
                "no peer endpoint for session {session_id}"
            )));
        }
        for peer in peers {
            let delivered = peer.lock().unwrap_or_else(|p| p.into_inner()).deliver(&envelope);
            log::trace!("loopback: {session_id} delivered to {delivered} subscriber(s)");
        }
        Ok(())
    }

    fn subscribe(&self) -> Subscription {
        self.subs.lock().unwrap_or_else(|p| p.into_inner()).add()
    }
}

/// Signaling through a human or a side channel: outbound messages come out as
/// text blobs, inbound blobs are fed back with [`ManualSignaling::deliver_encoded`].
pub struct ManualSignaling {
    outbox: mpsc::UnboundedSender<String>,
    subs: Mutex<Subscribers>,
}

impl ManualSignaling {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (outbox, rx) = mpsc::unbounded_channel();
        (
            Self {
                outbox,
                subs: Mutex::new(Subscribers::default()),
            },
            rx,
        )
    }

    pub fn deliver_encoded(&self, blob: &str) -> Result<(), NegotiationError> {
        let env = decode_signal(blob)?;
        self.subs
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .deliver(&env);
        Ok(())
    }
}

#[async_trait]
impl SignalingChannel for ManualSignaling {
    async fn send(&self, _session_id: &str, envelope: SignalEnvelope) -> Result<(), TransportError> {
        let blob = encode_signal(&envelope)?;
        log::debug!("manual signaling: {} bytes ready for the peer", blob.len());
        self.outbox
            .send(blob)
            .map_err(|_| TransportError::Unreachable("manual outbox dropped".into()))
    }

    fn subscribe(&self) -> Subscription {
        self.subs.lock().unwrap_or_else(|p| p.into_inner()).add()
    }
}

/// JSON -> gzip -> base64.
pub fn encode_signal(env: &SignalEnvelope) -> Result<String, TransportError> {
    let json = serde_json::to_vec(env).map_err(|e| TransportError::Backend(e.to_string()))?;

    let mut gz = GzEncoder::new(Vec::new(), Compression::fast());
    gz.write_all(&json)
        .map_err(|e| TransportError::Backend(e.to_string()))?;
    let compressed = gz
        .finish()
        .map_err(|e| TransportError::Backend(e.to_string()))?;

    Ok(general_purpose::STANDARD.encode(compressed))
}

pub fn decode_signal(s: &str) -> Result<SignalEnvelope, NegotiationError> {
    let malformed = |reason: String| NegotiationError::Malformed {
        what: "signal",
        reason,
    };

    let compressed = general_purpose::STANDARD
        .decode(s.trim())
        .map_err(|e| malformed(e.to_string()))?;

    // size-limited to keep a hostile blob from inflating without bound
    let gz = GzDecoder::new(&compressed[..]);
    let mut json = Vec::new();
    gz.take(MAX_DECOMPRESSED_SIZE)
        .read_to_end(&mut json)
        .map_err(|e| malformed(e.to_string()))?;

    serde_json::from_slice(&json).map_err(|e| malformed(e.to_string()))
}
