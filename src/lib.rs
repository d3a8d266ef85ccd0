//! Peer-to-peer audio/video call core: local capture, offer/answer
//! negotiation with trickle ICE, and a controller that owns one call at a time.

pub mod config;
pub mod controller;
#[cfg(feature = "devices")]
pub mod device;
pub mod errors;
pub mod identity;
pub mod logger;
pub mod media;
pub mod peer;
pub mod session;
pub mod signaling;
pub mod testing;
pub mod utils;

pub use config::CallConfig;
pub use controller::CallController;
#[cfg(feature = "devices")]
pub use device::DeviceCapture;
pub use errors::{CallError, ConfigError, DeviceError, NegotiationError, TransportError};
pub use identity::{IdentityProvider, StaticIdentity};
pub use logger::{init_logging, EventEmitter};
pub use media::{CaptureBackend, DeviceHandle, MediaLease, MediaSource, SyntheticCapture};
pub use peer::{
    CallEvent, EndReason, IceCandidate, IncomingOffer, MediaSample, MediaTrack, NegotiationState,
    Participant, Role, SessionDescription, SignalEnvelope, SignalMessage, TrackKind,
};
pub use session::Session;
pub use signaling::{
    decode_signal, encode_signal, LoopbackEndpoint, LoopbackHub, ManualSignaling,
    SignalingChannel,
};
