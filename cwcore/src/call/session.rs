use super::state::{CallRole, CallState, CallTransition, InvalidTransition, TransportMode};
use crate::crypto::sha256;
use crate::messages::IceCandidate;
use crate::types::{MediaMode, PeerId};
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::time::{Duration, Instant};

/// Digest of an offer's type and SDP, used to drop repeated deliveries.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct OfferFingerprint([u8; 16]);

impl OfferFingerprint {
    pub fn of(kind: &str, sdp: &str) -> Self {
        let digest = sha256(&[kind.as_bytes(), &[0], sdp.as_bytes()]);
        let mut out = [0u8; 16];
        out.copy_from_slice(&digest[..16]);
        Self(out)
    }
}

impl fmt::Debug for OfferFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OfferFingerprint({})", hex::encode(&self.0[..4]))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    /// We have our own outbound offer pending.
    LocalCaller,
    /// Already negotiating or connected.
    InProgress,
    /// Inside a post-decline or post-teardown cooldown.
    Suppressed,
    Duplicate,
    /// Another inbound offer is already ringing.
    Busy,
    Terminal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OfferDecision {
    /// Session moved to `Ringing`; surface the accept/decline prompt.
    Ring,
    /// A restart offer for the established call; answer it without prompting.
    Renegotiate,
    Ignore(IgnoreReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnswerDecision {
    Apply,
    Ignore,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IceDecision {
    Apply(IceCandidate),
    Queued,
    Ignore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    Attempt(u32),
    Exhausted,
}

/// State of one call with one remote peer.
#[derive(Debug, Clone)]
pub struct CallSession {
    peer_id: PeerId,
    role: Option<CallRole>,
    media_mode: MediaMode,
    state: CallState,
    local_offer: Option<String>,
    local_answer: Option<String>,
    remote_offer: Option<String>,
    remote_answer: Option<String>,
    remote_description_set: bool,
    restart_pending: bool,
    pending_ice: VecDeque<IceCandidate>,
    seen_candidates: HashSet<String>,
    /// Candidates of the previous call; late copies of them are dropped.
    retired_candidates: HashSet<String>,
    last_offer_fingerprint: Option<OfferFingerprint>,
    reconnect_attempts: u32,
    suppress_until: Option<Instant>,
    transport_mode: TransportMode,
}

impl CallSession {
    pub fn new(peer_id: PeerId) -> Self {
        Self {
            peer_id,
            role: None,
            media_mode: MediaMode::default(),
            state: CallState::Idle,
            local_offer: None,
            local_answer: None,
            remote_offer: None,
            remote_answer: None,
            remote_description_set: false,
            restart_pending: false,
            pending_ice: VecDeque::new(),
            seen_candidates: HashSet::new(),
            retired_candidates: HashSet::new(),
            last_offer_fingerprint: None,
            reconnect_attempts: 0,
            suppress_until: None,
            transport_mode: TransportMode::Primary,
        }
    }

    /// A fresh `Idle` session for the same peer that still honors this
    /// session's cooldown and remembers the last offer and candidates it saw.
    pub fn successor(&self) -> Self {
        let mut next = Self::new(self.peer_id.clone());
        next.suppress_until = self.suppress_until;
        next.last_offer_fingerprint = self.last_offer_fingerprint;
        next.retired_candidates = self.retired_candidates.clone();
        next
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn role(&self) -> Option<CallRole> {
        self.role
    }

    pub fn media_mode(&self) -> MediaMode {
        self.media_mode
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn transport_mode(&self) -> TransportMode {
        self.transport_mode
    }

    pub fn local_offer(&self) -> Option<&str> {
        self.local_offer.as_deref()
    }

    pub fn local_answer(&self) -> Option<&str> {
        self.local_answer.as_deref()
    }

    pub fn remote_offer(&self) -> Option<&str> {
        self.remote_offer.as_deref()
    }

    pub fn remote_answer(&self) -> Option<&str> {
        self.remote_answer.as_deref()
    }

    pub fn pending_ice_len(&self) -> usize {
        self.pending_ice.len()
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts
    }

    pub fn suppress_until(&self) -> Option<Instant> {
        self.suppress_until
    }

    pub fn is_suppressed(&self, now: Instant) -> bool {
        self.suppress_until.is_some_and(|until| now < until)
    }

    fn apply(&mut self, transition: CallTransition) -> Result<CallState, InvalidTransition> {
        self.state = self.state.transition(transition)?;
        Ok(self.state)
    }

    fn suppress_for(&mut self, now: Instant, cooldown: Duration) {
        let until = now + cooldown;
        self.suppress_until = Some(self.suppress_until.map_or(until, |u| u.max(until)));
    }

    /// Caller: `Idle -> Notifying`.
    pub fn begin_outgoing(&mut self, media_mode: MediaMode) -> Result<(), InvalidTransition> {
        self.apply(CallTransition::StartCall)?;
        self.role = Some(CallRole::Caller);
        self.media_mode = media_mode;
        Ok(())
    }

    /// Caller: records the local offer and moves to `Offering`.
    pub fn offer_sent(&mut self, sdp: String) -> Result<(), InvalidTransition> {
        self.apply(CallTransition::OfferSent)?;
        self.local_offer = Some(sdp);
        Ok(())
    }

    /// Caller: records a renegotiation offer for the established call.
    pub fn restart_offer_sent(&mut self, sdp: String) {
        self.local_offer = Some(sdp);
        self.restart_pending = true;
    }

    pub fn evaluate_offer(
        &mut self,
        sdp: &str,
        media_mode: MediaMode,
        restart: bool,
        now: Instant,
    ) -> OfferDecision {
        if self.state.is_terminal() {
            return OfferDecision::Ignore(IgnoreReason::Terminal);
        }
        let fingerprint = OfferFingerprint::of("offer", sdp);

        if restart
            && self.role == Some(CallRole::Callee)
            && matches!(self.state, CallState::Negotiating | CallState::Connected)
        {
            if self.last_offer_fingerprint == Some(fingerprint) {
                return OfferDecision::Ignore(IgnoreReason::Duplicate);
            }
            self.last_offer_fingerprint = Some(fingerprint);
            self.remote_offer = Some(sdp.to_string());
            return OfferDecision::Renegotiate;
        }

        if self.role == Some(CallRole::Caller) {
            return OfferDecision::Ignore(IgnoreReason::LocalCaller);
        }
        if matches!(self.state, CallState::Negotiating | CallState::Connected) {
            return OfferDecision::Ignore(IgnoreReason::InProgress);
        }
        if self.is_suppressed(now) {
            return OfferDecision::Ignore(IgnoreReason::Suppressed);
        }
        if self.last_offer_fingerprint == Some(fingerprint) {
            return OfferDecision::Ignore(IgnoreReason::Duplicate);
        }
        if self.state != CallState::Idle {
            return OfferDecision::Ignore(IgnoreReason::Busy);
        }

        match self.apply(CallTransition::OfferReceived) {
            Ok(_) => {
                self.role = Some(CallRole::Callee);
                self.media_mode = media_mode;
                self.remote_offer = Some(sdp.to_string());
                self.last_offer_fingerprint = Some(fingerprint);
                OfferDecision::Ring
            }
            Err(_) => OfferDecision::Ignore(IgnoreReason::Busy),
        }
    }

    /// Callee: records the answer and moves `Ringing -> Negotiating`.
    pub fn answer_sent(&mut self, sdp: String) -> Result<(), InvalidTransition> {
        if self.state == CallState::Ringing {
            self.apply(CallTransition::Accept)?;
        }
        self.local_answer = Some(sdp);
        Ok(())
    }

    /// Callee: `Ringing -> Idle`, starting the decline cooldown.
    pub fn decline(&mut self, now: Instant, cooldown: Duration) -> Result<(), InvalidTransition> {
        self.apply(CallTransition::Decline)?;
        self.suppress_for(now, cooldown);
        self.role = None;
        self.remote_offer = None;
        self.remote_description_set = false;
        self.retire_candidates();
        Ok(())
    }

    pub fn evaluate_answer(&mut self, sdp: &str) -> AnswerDecision {
        if self.role != Some(CallRole::Caller) {
            return AnswerDecision::Ignore;
        }
        let expected = match self.state {
            CallState::Offering => self.remote_answer.is_none(),
            CallState::Connected => self.restart_pending,
            _ => false,
        };
        if !expected || self.remote_answer.as_deref() == Some(sdp) {
            return AnswerDecision::Ignore;
        }
        self.remote_answer = Some(sdp.to_string());
        self.restart_pending = false;
        AnswerDecision::Apply
    }

    /// Marks the remote description as set and hands back every queued
    /// candidate, oldest first. Each is returned exactly once.
    pub fn remote_description_applied(&mut self) -> Vec<IceCandidate> {
        self.remote_description_set = true;
        self.pending_ice.drain(..).collect()
    }

    pub fn has_remote_description(&self) -> bool {
        self.remote_description_set
    }

    pub fn evaluate_ice(&mut self, candidate: IceCandidate, now: Instant) -> IceDecision {
        if self.state.is_terminal() {
            return IceDecision::Ignore;
        }
        if self.state == CallState::Idle && self.is_suppressed(now) {
            return IceDecision::Ignore;
        }
        if self.retired_candidates.contains(&candidate.candidate)
            || !self.seen_candidates.insert(candidate.candidate.clone())
        {
            return IceDecision::Ignore;
        }
        if self.remote_description_set {
            return IceDecision::Apply(candidate);
        }
        self.pending_ice.push_back(candidate);
        IceDecision::Queued
    }

    /// `Offering | Negotiating | Connected -> Connected`; clears the
    /// reconnect counter.
    pub fn media_connected(&mut self) -> Result<bool, InvalidTransition> {
        let was_connected = self.state == CallState::Connected;
        self.apply(CallTransition::MediaConnected)?;
        self.reconnect_attempts = 0;
        Ok(!was_connected)
    }

    pub fn begin_reconnect(&mut self, max_attempts: u32) -> ReconnectDecision {
        if self.reconnect_attempts >= max_attempts {
            return ReconnectDecision::Exhausted;
        }
        self.reconnect_attempts += 1;
        ReconnectDecision::Attempt(self.reconnect_attempts)
    }

    /// Returns `true` only on the first switch.
    pub fn latch_fallback(&mut self) -> bool {
        if self.transport_mode == TransportMode::Fallback {
            return false;
        }
        self.transport_mode = TransportMode::Fallback;
        true
    }

    pub fn end(&mut self, now: Instant, cooldown: Duration) -> Result<(), InvalidTransition> {
        self.apply(CallTransition::End)?;
        self.teardown(now, cooldown);
        Ok(())
    }

    pub fn fail(&mut self, now: Instant, cooldown: Duration) -> Result<(), InvalidTransition> {
        self.apply(CallTransition::Fail)?;
        self.teardown(now, cooldown);
        Ok(())
    }

    fn teardown(&mut self, now: Instant, cooldown: Duration) {
        self.suppress_for(now, cooldown);
        self.local_offer = None;
        self.local_answer = None;
        self.remote_offer = None;
        self.remote_answer = None;
        self.remote_description_set = false;
        self.restart_pending = false;
        self.retire_candidates();
        self.reconnect_attempts = 0;
    }

    fn retire_candidates(&mut self) {
        self.pending_ice.clear();
        self.retired_candidates = std::mem::take(&mut self.seen_candidates);
    }
}
