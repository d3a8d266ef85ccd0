use crate::peer::types::Role;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// ========== CONSTANTS ==========

/// Period a Disconnected session waits for the path to come back before failing.
pub const GRACE_PERIOD: Duration = Duration::from_secs(10);

/// Candidates buffered per unknown session before an offer is accepted.
pub const MAX_PENDING_CANDIDATES: usize = 64;

/// Unknown sessions holding buffered candidates at once; the oldest is evicted.
pub const MAX_PENDING_SESSIONS: usize = 8;

/// ========== STATE MACHINE ==========

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NegotiationState {
    Idle,
    OfferCreated,
    OfferSent,
    AnswerReceived,
    Connected,
    Disconnected,
    Closed,
    Failed,
}

impl NegotiationState {
    /// Closed and Failed accept no further negotiation input.
    pub fn is_terminal(&self) -> bool {
        matches!(self, NegotiationState::Closed | NegotiationState::Failed)
    }

    /// States in which candidates may be exchanged.
    pub fn accepts_candidates(&self) -> bool {
        !matches!(self, NegotiationState::Idle) && !self.is_terminal()
    }
}

/// Inputs that drive [`NegotiationState`].
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transition {
    CreateOffer,
    SendOffer,
    ReceiveAnswer,
    ReceiveOffer,
    CreateAnswer,
    PathEstablished,
    PathLost,
    GraceExpired,
    Fail,
    Close,
}

/// Transition table. `None` means the input is not allowed in `from`.
pub fn next_state(role: Role, from: NegotiationState, t: Transition) -> Option<NegotiationState> {
    use NegotiationState::*;
    use Transition::*;

    match (role, from, t) {
        (_, Closed, _) => None,
        (_, _, Close) => Some(Closed),
        (_, Failed, _) => None,
        (_, _, Fail) => Some(Failed),

        (Role::Caller, Idle, CreateOffer) => Some(OfferCreated),
        (Role::Caller, OfferCreated, SendOffer) => Some(OfferSent),
        (Role::Caller, OfferSent, ReceiveAnswer) => Some(AnswerReceived),
        (Role::Caller, AnswerReceived, PathEstablished) => Some(Connected),

        (Role::Callee, Idle, ReceiveOffer) => Some(OfferCreated),
        (Role::Callee, OfferCreated, CreateAnswer) => Some(OfferSent),
        (Role::Callee, OfferSent, PathEstablished) => Some(Connected),

        (_, Connected, PathLost) => Some(Disconnected),
        (_, Disconnected, PathEstablished) => Some(Connected),
        (_, Disconnected, GraceExpired) => Some(Failed),

        _ => None,
    }
}
