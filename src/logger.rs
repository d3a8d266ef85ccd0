use crate::config::LoggingConfig;
use crate::peer::state::NegotiationState;
use crate::peer::types::{CallEvent, EndReason, IceCandidate, IncomingOffer, MediaTrack, TrackKind};
use std::io::Write;
use tokio::sync::broadcast;

/// Installs `env_logger` with local timestamps. Safe to call more than once.
pub fn init_logging(config: &LoggingConfig) {
    if !config.enabled {
        return;
    }
    let env = env_logger::Env::default().default_filter_or(config.filter.as_str());
    let _ = env_logger::Builder::from_env(env)
        .format(|buf, record| {
            let now = chrono::Local::now();
            writeln!(
                buf,
                "[{}] {:<5} {}: {}",
                now.format("%Y-%m-%d %H:%M:%S%.3f"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .try_init();
}

/// Trickle-ICE trace of one candidate.
pub fn dump_candidate(label: &str, cand: &IceCandidate) {
    log::debug!(
        "trickle {label}: candidate={} sdp_mid={:?} sdp_mline_index={:?}",
        cand.candidate,
        cand.sdp_mid,
        cand.sdp_mline_index
    );
}

/// Fan-out of [`CallEvent`]s to UI listeners. Emitting with no listener is fine.
#[derive(Clone)]
pub struct EventEmitter {
    tx: broadcast::Sender<CallEvent>,
}

impl EventEmitter {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.tx.subscribe()
    }

    fn emit(&self, event: CallEvent) {
        log::trace!("emit {:?}", event);
        if self.tx.send(event).is_err() {
            log::trace!("no event listeners");
        }
    }

    pub fn emit_state(&self, state: NegotiationState) {
        log::info!("state -> {:?}", state);
        self.emit(CallEvent::StateChanged(state));
    }

    pub fn emit_local_track(&self, track: &MediaTrack) {
        log::debug!("local {} track ready: {}", track.kind(), track.id());
        self.emit(CallEvent::LocalTrackReady(track.clone()));
    }

    pub fn emit_remote_track(&self, track: &MediaTrack) {
        log::info!("remote {} track available: {}", track.kind(), track.id());
        self.emit(CallEvent::RemoteTrackAvailable(track.clone()));
    }

    pub fn emit_media_state(&self, kind: TrackKind, enabled: bool) {
        self.emit(CallEvent::MediaStateChanged { kind, enabled });
    }

    pub fn emit_incoming(&self, offer: IncomingOffer) {
        log::info!(
            "incoming call {} from {}",
            offer.session_id,
            offer.from.display_name
        );
        self.emit(CallEvent::IncomingCall(offer));
    }

    pub fn emit_signaling_failed(&self, reason: String) {
        log::warn!("signaling failed: {reason}");
        self.emit(CallEvent::SignalingFailed(reason));
    }

    pub fn emit_ended(&self, reason: EndReason) {
        log::info!("call ended: {:?}", reason);
        self.emit(CallEvent::CallEnded(reason));
    }
}
