use crate::peer::types::IceCandidate;
use std::collections::{HashMap, VecDeque};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;

impl From<&IceCandidate> for RTCIceCandidateInit {
    fn from(c: &IceCandidate) -> Self {
        RTCIceCandidateInit {
            candidate: c.candidate.clone(),
            sdp_mid: c.sdp_mid.clone(),
            sdp_mline_index: c.sdp_mline_index,
            username_fragment: None,
        }
    }
}

impl From<RTCIceCandidateInit> for IceCandidate {
    fn from(init: RTCIceCandidateInit) -> Self {
        IceCandidate {
            candidate: init.candidate,
            sdp_mid: init.sdp_mid,
            sdp_mline_index: init.sdp_mline_index,
        }
    }
}

/// Ended sessions remembered so their late trickle is not buffered again.
const ENDED_SESSIONS: usize = 16;

#[derive(Debug, Default)]
struct Pending {
    candidates: Vec<IceCandidate>,
    // an IncomingCall was surfaced for this id
    offered: bool,
}

/// Remote candidates that arrived for a session nobody has accepted yet.
///
/// Bounded twice: `limit` candidates per session and `max_sessions` session
/// ids. When full, the oldest id without a surfaced offer is evicted first.
#[derive(Debug)]
pub struct PendingCandidates {
    limit: usize,
    max_sessions: usize,
    by_session: HashMap<String, Pending>,
    // insertion order of the keys in `by_session`
    order: VecDeque<String>,
    ended: VecDeque<String>,
}

impl PendingCandidates {
    pub fn new(limit: usize, max_sessions: usize) -> Self {
        Self {
            limit,
            max_sessions: max_sessions.max(1),
            by_session: HashMap::new(),
            order: VecDeque::new(),
            ended: VecDeque::new(),
        }
    }

    /// Returns false if the candidate was dropped (ended session, duplicate or
    /// over the limit).
    pub fn push(&mut self, session_id: &str, c: IceCandidate) -> bool {
        if self.ended.iter().any(|id| id == session_id) {
            log::debug!("dropping late candidate for ended session {session_id}");
            return false;
        }
        let limit = self.limit;
        let entry = self.entry(session_id);
        if entry.candidates.contains(&c) {
            return false;
        }
        if entry.candidates.len() >= limit {
            log::warn!("pending candidate buffer full for {session_id}, dropping");
            return false;
        }
        entry.candidates.push(c);
        true
    }

    /// Records that an offer for `session_id` was surfaced. Its candidates
    /// outlive those of ids nobody offered, and an id that ended earlier is
    /// accepted again.
    pub fn offered(&mut self, session_id: &str) {
        self.ended.retain(|id| id != session_id);
        self.entry(session_id).offered = true;
    }

    pub fn take(&mut self, session_id: &str) -> Vec<IceCandidate> {
        self.order.retain(|id| id != session_id);
        self.by_session
            .remove(session_id)
            .map(|p| p.candidates)
            .unwrap_or_default()
    }

    /// Drops what is held for an ended session and refuses its later candidates.
    pub fn forget(&mut self, session_id: &str) {
        let dropped = self.take(session_id).len();
        if dropped > 0 {
            log::debug!("discarded {dropped} buffered candidate(s) for {session_id}");
        }
        if !self.ended.iter().any(|id| id == session_id) {
            if self.ended.len() >= ENDED_SESSIONS {
                self.ended.pop_front();
            }
            self.ended.push_back(session_id.to_string());
        }
    }

    pub fn len(&self, session_id: &str) -> usize {
        self.by_session
            .get(session_id)
            .map_or(0, |p| p.candidates.len())
    }

    /// Number of session ids currently tracked.
    pub fn sessions(&self) -> usize {
        self.by_session.len()
    }

    fn entry(&mut self, session_id: &str) -> &mut Pending {
        if !self.by_session.contains_key(session_id) {
            while self.by_session.len() >= self.max_sessions {
                if !self.evict_one() {
                    break;
                }
            }
            self.order.push_back(session_id.to_string());
        }
        self.by_session.entry(session_id.to_string()).or_default()
    }

    fn evict_one(&mut self) -> bool {
        let victim = self
            .order
            .iter()
            .position(|id| self.by_session.get(id).is_some_and(|p| !p.offered))
            .or(if self.order.is_empty() { None } else { Some(0) });
        let Some(at) = victim else { return false };
        let Some(id) = self.order.remove(at) else { return false };
        log::warn!("pending candidate sessions full, evicting {id}");
        self.by_session.remove(&id);
        true
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CandidateSummary {
    pub host: usize,
    pub srflx: usize,
    pub relay: usize,
    pub other: usize,
}

pub fn analyze_candidates(candidates: &[IceCandidate]) -> CandidateSummary {
    let mut summary = CandidateSummary::default();
    for candidate in candidates {
        match candidate.candidate_type() {
            Some("host") => summary.host += 1,
            Some("srflx") => summary.srflx += 1,
            Some("relay") => summary.relay += 1,
            _ => summary.other += 1,
        }
    }

    log::debug!(
        "candidate analysis: {} host, {} srflx, {} relay",
        summary.host,
        summary.srflx,
        summary.relay
    );
    if summary.relay == 0 {
        log::debug!("no TURN relay candidates; connection through symmetric NAT may fail");
    }
    summary
}
