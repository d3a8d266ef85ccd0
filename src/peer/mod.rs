pub mod connection;
pub mod fingerprint;
pub mod ice;
pub mod negotiator;
pub mod state;
pub mod transport;
pub mod types;

pub use connection::{WebRtcTransport, WebRtcTransportFactory};
pub use negotiator::SessionNegotiator;
pub use state::{
    next_state, NegotiationState, Transition, GRACE_PERIOD, MAX_PENDING_CANDIDATES,
    MAX_PENDING_SESSIONS,
};
pub use transport::{PeerTransport, TransportEvent, TransportEvents, TransportFactory};
pub use types::{
    CallEvent, EndReason, IceCandidate, IncomingOffer, MediaTrack, Participant, Role, SdpKind,
    MediaSample, ServerConfig, SessionDescription, SignalEnvelope, SignalMessage, TrackKind,
    TrackOrigin,
};
