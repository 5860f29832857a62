//! The media engine capability a session drives, plus an in-process
//! loopback engine.
//!
//! A real engine encodes media and gathers network paths; sessions only
//! see offers, answers, candidates and connection-state changes.

use super::error::NegotiationError;
use async_trait::async_trait;
use cwcore::messages::IceCandidate;
use cwcore::types::{MediaMode, PeerId, SessionId};
use dashmap::DashMap;
use log::debug;
use rand::RngCore;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpKind {
    Offer,
    Answer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaConnectionState {
    New,
    Checking,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaEvent {
    LocalCandidate(IceCandidate),
    ConnectionState(MediaConnectionState),
}

#[async_trait]
pub trait MediaEngine: Send + Sync {
    async fn acquire_local_media(&self, mode: MediaMode) -> Result<(), NegotiationError>;
    async fn create_offer(&self, ice_restart: bool) -> Result<String, NegotiationError>;
    async fn create_answer(&self) -> Result<String, NegotiationError>;
    async fn set_remote_description(&self, kind: SdpKind, sdp: &str)
    -> Result<(), NegotiationError>;
    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), NegotiationError>;
    /// Releases local media and network resources.
    async fn close(&self);
}

/// Creates one engine per session actor, along with its event stream.
pub trait MediaEngineFactory: Send + Sync {
    fn create_engine(
        &self,
        session_id: &SessionId,
        peer_id: &PeerId,
    ) -> (Arc<dyn MediaEngine>, mpsc::UnboundedReceiver<MediaEvent>);
}

#[derive(Debug, Clone, Copy)]
pub struct LoopbackOptions {
    pub deny_media: bool,
    /// Report `Connected` once both descriptions and one remote candidate are in.
    pub auto_connect: bool,
}

impl Default for LoopbackOptions {
    fn default() -> Self {
        Self {
            deny_media: false,
            auto_connect: true,
        }
    }
}

#[derive(Default)]
struct LoopbackState {
    media: Option<MediaMode>,
    ufrag: String,
    version: u64,
    local: Option<SdpKind>,
    remote: Option<String>,
    last_offer: Option<String>,
    applied: Vec<IceCandidate>,
    gathered: u32,
    offers_created: u32,
    restart_offers: u32,
    connected: bool,
    closed: bool,
}

/// Engine that produces synthetic descriptions and candidates and reports
/// connectivity from the negotiation it observes.
pub struct LoopbackMediaEngine {
    label: String,
    options: LoopbackOptions,
    state: Mutex<LoopbackState>,
    events: mpsc::UnboundedSender<MediaEvent>,
}

fn new_ufrag() -> String {
    let mut raw = [0u8; 4];
    rand::rng().fill_bytes(&mut raw);
    hex::encode(raw)
}

impl LoopbackMediaEngine {
    pub fn new(
        label: impl Into<String>,
        options: LoopbackOptions,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<MediaEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let engine = Arc::new(Self {
            label: label.into(),
            options,
            state: Mutex::new(LoopbackState {
                ufrag: new_ufrag(),
                ..Default::default()
            }),
            events,
        });
        (engine, rx)
    }

    fn state(&self) -> MutexGuard<'_, LoopbackState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: MediaEvent) {
        let _ = self.events.send(event);
    }

    fn describe(&self, state: &LoopbackState) -> String {
        let mut sdp = format!(
            "v=0\r\no=callwire-{} {} {} IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\na=ice-ufrag:{}\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\n",
            self.label, state.ufrag, state.version, state.ufrag
        );
        if state.media.is_some_and(MediaMode::has_video) {
            sdp.push_str("m=video 9 UDP/TLS/RTP/SAVPF 96\r\n");
        }
        sdp
    }

    fn gather(&self, state: &mut LoopbackState) {
        state.gathered += 1;
        let candidate = IceCandidate::new(format!(
            "candidate:{n} 1 UDP 2130706431 127.0.0.1 {port} typ host ufrag {ufrag}",
            n = state.gathered,
            port = 50_000 + state.gathered,
            ufrag = state.ufrag,
        ))
        .with_sdp_mid("0")
        .with_sdp_m_line_index(0);
        self.emit(MediaEvent::LocalCandidate(candidate));
    }

    fn maybe_connect(&self, state: &mut LoopbackState) {
        if self.options.auto_connect
            && !state.connected
            && !state.closed
            && state.local.is_some()
            && state.remote.is_some()
            && !state.applied.is_empty()
        {
            state.connected = true;
            debug!(target: "Call/Media", "[{}] loopback media connected", self.label);
            self.emit(MediaEvent::ConnectionState(MediaConnectionState::Connected));
        }
    }

    /// Reports a connection-state change as if the network produced it.
    pub fn inject_state(&self, new_state: MediaConnectionState) {
        {
            let mut state = self.state();
            state.connected = new_state == MediaConnectionState::Connected;
        }
        self.emit(MediaEvent::ConnectionState(new_state));
    }

    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.state().applied.clone()
    }

    pub fn offers_created(&self) -> u32 {
        self.state().offers_created
    }

    pub fn restart_offers(&self) -> u32 {
        self.state().restart_offers
    }

    pub fn local_media(&self) -> Option<MediaMode> {
        self.state().media
    }

    pub fn last_offer(&self) -> Option<String> {
        self.state().last_offer.clone()
    }

    pub fn remote_description(&self) -> Option<String> {
        self.state().remote.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }
}

#[async_trait]
impl MediaEngine for LoopbackMediaEngine {
    async fn acquire_local_media(&self, mode: MediaMode) -> Result<(), NegotiationError> {
        if self.options.deny_media {
            return Err(NegotiationError::MediaDenied(format!(
                "{mode} capture not permitted"
            )));
        }
        self.state().media = Some(mode);
        Ok(())
    }

    async fn create_offer(&self, ice_restart: bool) -> Result<String, NegotiationError> {
        let mut state = self.state();
        if state.media.is_none() {
            return Err(NegotiationError::Engine("no local media".into()));
        }
        if ice_restart {
            state.ufrag = new_ufrag();
            state.connected = false;
            state.restart_offers += 1;
        }
        state.version += 1;
        state.offers_created += 1;
        state.local = Some(SdpKind::Offer);
        let sdp = self.describe(&state);
        state.last_offer = Some(sdp.clone());
        self.gather(&mut state);
        Ok(sdp)
    }

    async fn create_answer(&self) -> Result<String, NegotiationError> {
        let mut state = self.state();
        if state.remote.is_none() {
            return Err(NegotiationError::Engine("no remote offer".into()));
        }
        if state.media.is_none() {
            return Err(NegotiationError::Engine("no local media".into()));
        }
        state.version += 1;
        state.local = Some(SdpKind::Answer);
        let sdp = self.describe(&state);
        self.gather(&mut state);
        self.maybe_connect(&mut state);
        Ok(sdp)
    }

    async fn set_remote_description(
        &self,
        kind: SdpKind,
        sdp: &str,
    ) -> Result<(), NegotiationError> {
        if !sdp.starts_with("v=0") {
            return Err(NegotiationError::MalformedSdp(format!(
                "{kind:?} does not start with a version line"
            )));
        }
        let mut state = self.state();
        if state.remote.as_deref() != Some(sdp) {
            state.connected = false;
        }
        state.remote = Some(sdp.to_string());
        self.maybe_connect(&mut state);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), NegotiationError> {
        let mut state = self.state();
        if state.remote.is_none() {
            return Err(NegotiationError::Engine(
                "candidate before remote description".into(),
            ));
        }
        state.applied.push(candidate.clone());
        self.maybe_connect(&mut state);
        Ok(())
    }

    async fn close(&self) {
        let mut state = self.state();
        if !state.closed {
            state.closed = true;
            state.connected = false;
            state.media = None;
        }
    }
}

/// Hands out [`LoopbackMediaEngine`]s and keeps the latest one per peer so
/// callers can inspect or steer it.
pub struct LoopbackMediaFactory {
    label: String,
    options: LoopbackOptions,
    engines: DashMap<(SessionId, PeerId), Arc<LoopbackMediaEngine>>,
}

impl LoopbackMediaFactory {
    pub fn new(label: impl Into<String>, options: LoopbackOptions) -> Self {
        Self {
            label: label.into(),
            options,
            engines: DashMap::new(),
        }
    }

    pub fn engine(&self, session_id: &SessionId, peer_id: &PeerId) -> Option<Arc<LoopbackMediaEngine>> {
        self.engines
            .get(&(session_id.clone(), peer_id.clone()))
            .map(|entry| entry.value().clone())
    }
}

impl MediaEngineFactory for LoopbackMediaFactory {
    fn create_engine(
        &self,
        session_id: &SessionId,
        peer_id: &PeerId,
    ) -> (Arc<dyn MediaEngine>, mpsc::UnboundedReceiver<MediaEvent>) {
        let (engine, rx) = LoopbackMediaEngine::new(self.label.clone(), self.options);
        self.engines
            .insert((session_id.clone(), peer_id.clone()), engine.clone());
        (engine, rx)
    }
}
