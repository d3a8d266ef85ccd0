//! Per-session negotiation: drives the description exchange through the
//! transition table and keeps the trickle-ICE bookkeeping on both sides.

use crate::errors::{NegotiationError, TransportError};
use crate::logger::dump_candidate;
use crate::peer::fingerprint::verification_code;
use crate::peer::ice::analyze_candidates;
use crate::peer::state::{NegotiationState, Transition};
use crate::peer::transport::PeerTransport;
use crate::peer::types::{
    IceCandidate, MediaTrack, Participant, SdpKind, SessionDescription, SignalEnvelope,
    SignalMessage,
};
use crate::session::Session;
use crate::signaling::SignalingChannel;
use std::sync::Arc;

pub struct SessionNegotiator {
    session: Session,
    local: Participant,
    transport: Arc<dyn PeerTransport>,
    signaling: Arc<dyn SignalingChannel>,
    /// Local candidates found before there was anything to send them with.
    unsent_local: Vec<IceCandidate>,
    /// Remote candidates waiting for the remote description.
    unapplied_remote: Vec<IceCandidate>,
    tracks_bound: bool,
}

impl SessionNegotiator {
    pub fn new(
        session: Session,
        local: Participant,
        transport: Arc<dyn PeerTransport>,
        signaling: Arc<dyn SignalingChannel>,
    ) -> Self {
        Self {
            session,
            local,
            transport,
            signaling,
            unsent_local: Vec::new(),
            unapplied_remote: Vec::new(),
            tracks_bound: false,
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn state(&self) -> NegotiationState {
        self.session.state()
    }

    pub fn verification_code(&self) -> Option<String> {
        match (self.session.local_description(), self.session.remote_description()) {
            (Some(l), Some(r)) => verification_code(l, r),
            _ => None,
        }
    }

    pub async fn bind_tracks(&mut self, tracks: &[MediaTrack]) -> Result<(), NegotiationError> {
        if self.state() != NegotiationState::Idle {
            return Err(NegotiationError::OutOfSequence {
                state: self.state(),
                transition: Transition::CreateOffer,
            });
        }
        for track in tracks {
            self.transport.add_local_track(track).await?;
        }
        self.session.bind_local_tracks(tracks);
        self.tracks_bound = !tracks.is_empty();
        Ok(())
    }

    /// Caller: Idle -> OfferCreated.
    pub async fn create_offer(&mut self) -> Result<NegotiationState, NegotiationError> {
        self.session.check(Transition::CreateOffer)?;
        if !self.tracks_bound {
            return Err(NegotiationError::TracksNotBound);
        }
        let offer = self.transport.create_offer().await?;
        self.session.set_local_description(offer)?;
        let state = self.session.apply(Transition::CreateOffer)?;
        self.flush_local().await;
        Ok(state)
    }

    /// Caller: OfferCreated -> OfferSent.
    pub async fn send_offer(&mut self) -> Result<NegotiationState, NegotiationError> {
        self.session.check(Transition::SendOffer)?;
        let offer = self
            .session
            .local_description()
            .cloned()
            .ok_or(NegotiationError::MissingDescription)?;
        self.send(SignalMessage::Offer(offer)).await?;
        self.session.apply(Transition::SendOffer)
    }

    /// Caller: OfferSent -> AnswerReceived.
    pub async fn receive_answer(
        &mut self,
        answer: SessionDescription,
    ) -> Result<NegotiationState, NegotiationError> {
        self.session.check(Transition::ReceiveAnswer)?;
        answer.validate(SdpKind::Answer)?;
        self.transport.set_remote_description(&answer).await?;
        self.session.set_remote_description(answer)?;
        let state = self.session.apply(Transition::ReceiveAnswer)?;
        self.flush_remote().await;
        Ok(state)
    }

    /// Callee: Idle -> OfferCreated (remote description set).
    pub async fn receive_offer(
        &mut self,
        offer: SessionDescription,
    ) -> Result<NegotiationState, NegotiationError> {
        self.session.check(Transition::ReceiveOffer)?;
        offer.validate(SdpKind::Offer)?;
        self.transport.set_remote_description(&offer).await?;
        self.session.set_remote_description(offer)?;
        let state = self.session.apply(Transition::ReceiveOffer)?;
        self.flush_remote().await;
        self.flush_local().await;
        Ok(state)
    }

    /// Callee: OfferCreated -> OfferSent. Sets the local answer and sends it.
    pub async fn create_answer(&mut self) -> Result<NegotiationState, NegotiationError> {
        self.session.check(Transition::CreateAnswer)?;
        if !self.tracks_bound {
            return Err(NegotiationError::TracksNotBound);
        }
        let answer = self.transport.create_answer().await?;
        self.session.set_local_description(answer.clone())?;
        self.send(SignalMessage::Answer(answer)).await?;
        self.session.apply(Transition::CreateAnswer)
    }

    /// Records a locally gathered candidate and trickles it right away from
    /// OfferCreated on. Returns false for duplicates and finished sessions.
    pub async fn on_local_candidate(&mut self, c: IceCandidate) -> Result<bool, TransportError> {
        if self.state().is_terminal() {
            return Ok(false);
        }
        if !self.session.add_local_candidate(c.clone()) {
            return Ok(false);
        }
        dump_candidate("LOCAL", &c);
        if self.state().accepts_candidates() {
            self.send(SignalMessage::Candidate(c)).await?;
        } else {
            self.unsent_local.push(c);
        }
        Ok(true)
    }

    /// Applies a candidate from the peer. Idempotent: a repeat returns `Ok(false)`.
    pub async fn apply_remote_candidate(&mut self, c: IceCandidate) -> Result<bool, NegotiationError> {
        let state = self.state();
        if state.is_terminal() {
            return Err(NegotiationError::SessionClosed);
        }
        if !state.accepts_candidates() {
            return Err(NegotiationError::UnexpectedCandidate(state));
        }
        if c.candidate.trim().is_empty() {
            return Err(NegotiationError::Malformed {
                what: "candidate",
                reason: "empty candidate line".into(),
            });
        }
        if !self.session.add_remote_candidate(c.clone()) {
            log::debug!("duplicate remote candidate ignored: {}", c.candidate);
            return Ok(false);
        }
        dump_candidate("REMOTE", &c);
        if self.session.remote_description().is_some() {
            self.transport.add_remote_candidate(&c).await?;
        } else {
            log::debug!("remote description not set yet, queuing candidate");
            self.unapplied_remote.push(c);
        }
        Ok(true)
    }

    pub fn gathering_complete(&self) {
        log::debug!(
            "gathering complete for {} with {} local candidate(s)",
            self.session.id(),
            self.session.local_candidates().len()
        );
        analyze_candidates(self.session.local_candidates());
    }

    pub fn path_established(&mut self) -> Result<NegotiationState, NegotiationError> {
        self.session.apply(Transition::PathEstablished)
    }

    pub fn path_lost(&mut self) -> Result<NegotiationState, NegotiationError> {
        self.session.apply(Transition::PathLost)
    }

    pub fn grace_expired(&mut self) -> Result<NegotiationState, NegotiationError> {
        self.session.apply(Transition::GraceExpired)
    }

    pub fn fail(&mut self) -> Result<NegotiationState, NegotiationError> {
        self.session.apply(Transition::Fail)
    }

    pub fn set_remote_track(&mut self, track: MediaTrack) -> Result<(), NegotiationError> {
        if self.state().is_terminal() {
            return Err(NegotiationError::SessionClosed);
        }
        self.session.set_remote_track(track);
        Ok(())
    }

    /// Moves to Closed and shuts the transport. Returns false if already closed.
    pub async fn close(&mut self) -> bool {
        if self.session.apply(Transition::Close).is_err() {
            return false;
        }
        self.session.clear_remote_track();
        self.unsent_local.clear();
        self.unapplied_remote.clear();
        if let Err(e) = self.transport.close().await {
            log::warn!("closing transport for {} failed: {e}", self.session.id());
        }
        true
    }

    async fn send(&self, message: SignalMessage) -> Result<(), TransportError> {
        let envelope = SignalEnvelope {
            session_id: self.session.id().to_string(),
            from: self.local.clone(),
            message,
            ts: chrono::Utc::now().timestamp(),
        };
        self.signaling.send(self.session.id(), envelope).await
    }

    async fn flush_local(&mut self) {
        for c in std::mem::take(&mut self.unsent_local) {
            if let Err(e) = self.send(SignalMessage::Candidate(c)).await {
                log::warn!("failed to trickle queued candidate: {e}");
            }
        }
    }

    async fn flush_remote(&mut self) {
        for c in std::mem::take(&mut self.unapplied_remote) {
            log::debug!("applying pending candidate: {}", c.candidate);
            if let Err(e) = self.transport.add_remote_candidate(&c).await {
                log::warn!("failed to apply pending candidate: {e}");
            }
        }
    }
}
