use crate::errors::NegotiationError;
use crate::peer::state::{next_state, NegotiationState, Transition};
use crate::peer::types::{IceCandidate, MediaTrack, Role, SessionDescription};
use chrono::{DateTime, Utc};

/// One call attempt. Owned by the negotiator, which is owned by the controller.
#[derive(Debug, Clone)]
pub struct Session {
    id: String,
    generation: u64,
    role: Role,
    state: NegotiationState,
    local_description: Option<SessionDescription>,
    remote_description: Option<SessionDescription>,
    local_candidates: Vec<IceCandidate>,
    remote_candidates: Vec<IceCandidate>,
    local_tracks: Vec<MediaTrack>,
    remote_track: Option<MediaTrack>,
    started_at: DateTime<Utc>,
}

impl Session {
    pub fn new(id: String, generation: u64, role: Role) -> Self {
        Self {
            id,
            generation,
            role,
            state: NegotiationState::Idle,
            local_description: None,
            remote_description: None,
            local_candidates: Vec::new(),
            remote_candidates: Vec::new(),
            local_tracks: Vec::new(),
            remote_track: None,
            started_at: Utc::now(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn local_description(&self) -> Option<&SessionDescription> {
        self.local_description.as_ref()
    }

    pub fn remote_description(&self) -> Option<&SessionDescription> {
        self.remote_description.as_ref()
    }

    pub fn local_candidates(&self) -> &[IceCandidate] {
        &self.local_candidates
    }

    pub fn remote_candidates(&self) -> &[IceCandidate] {
        &self.remote_candidates
    }

    pub fn local_tracks(&self) -> &[MediaTrack] {
        &self.local_tracks
    }

    pub fn remote_track(&self) -> Option<&MediaTrack> {
        self.remote_track.as_ref()
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Checks a transition against the table without applying it.
    pub fn check(&self, t: Transition) -> Result<NegotiationState, NegotiationError> {
        if self.state == NegotiationState::Closed {
            return Err(NegotiationError::SessionClosed);
        }
        next_state(self.role, self.state, t).ok_or(NegotiationError::OutOfSequence {
            state: self.state,
            transition: t,
        })
    }

    pub fn apply(&mut self, t: Transition) -> Result<NegotiationState, NegotiationError> {
        let next = self.check(t)?;
        if next == NegotiationState::Connected
            && (self.local_description.is_none() || self.remote_description.is_none())
        {
            return Err(NegotiationError::MissingDescription);
        }
        self.state = next;
        Ok(next)
    }

    pub fn set_local_description(&mut self, d: SessionDescription) -> Result<(), NegotiationError> {
        if self.local_description.is_some() {
            return Err(NegotiationError::AlreadySet("local"));
        }
        self.local_description = Some(d);
        Ok(())
    }

    pub fn set_remote_description(&mut self, d: SessionDescription) -> Result<(), NegotiationError> {
        if self.remote_description.is_some() {
            return Err(NegotiationError::AlreadySet("remote"));
        }
        self.remote_description = Some(d);
        Ok(())
    }

    /// Returns false when the candidate was already known.
    pub fn add_local_candidate(&mut self, c: IceCandidate) -> bool {
        if self.local_candidates.contains(&c) {
            return false;
        }
        self.local_candidates.push(c);
        true
    }

    /// Returns false when the candidate was already known.
    pub fn add_remote_candidate(&mut self, c: IceCandidate) -> bool {
        if self.remote_candidates.contains(&c) {
            return false;
        }
        self.remote_candidates.push(c);
        true
    }

    pub fn bind_local_tracks(&mut self, tracks: &[MediaTrack]) {
        self.local_tracks = tracks.to_vec();
    }

    pub fn set_remote_track(&mut self, track: MediaTrack) {
        self.remote_track = Some(track);
    }

    pub fn clear_remote_track(&mut self) {
        self.remote_track = None;
    }
}
