//! The actor that runs one call session with one remote peer.
//!
//! An actor owns its [`CallSession`], a [`TransportSelector`] and, once a
//! call needs one, a media engine. Commands, timers, selector output and
//! media events are handled one at a time from a single loop, so the
//! session is never mutated concurrently.

use super::engine::{MediaConnectionState, MediaEngine, MediaEngineFactory, MediaEvent, SdpKind};
use super::error::{CallError, ConnectivityError, NegotiationError};
use super::events::CallEvent;
use super::monitor::{ConnectivityAction, ConnectivityMonitor};
use super::task::ScheduledTask;
use crate::clock;
use crate::config::CallConfig;
use crate::selector::{Inbound, SelectorEvent, SelectorNotice, TransportSelector};
use crate::store::SignalStore;
use crate::transport::TransportFactory;
use cwcore::call::{
    AnswerDecision, CallRole, CallSession, CallState, CallTransition, IceDecision,
    InvalidTransition, OfferDecision, TransportMode,
};
use cwcore::messages::{IceCandidate, SignalMessage};
use cwcore::types::{MediaMode, PeerId, SessionId};
use log::{debug, info, trace, warn};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

pub type Reply<T> = oneshot::Sender<T>;

/// Requests a caller can make of a session.
#[derive(Debug)]
pub enum SessionCommand {
    StartCall {
        media_mode: MediaMode,
        reply: Reply<Result<(), CallError>>,
    },
    Accept {
        reply: Reply<Result<(), CallError>>,
    },
    Decline {
        reply: Reply<Result<(), CallError>>,
    },
    HangUp {
        reply: Reply<Result<(), CallError>>,
    },
    Snapshot {
        reply: Reply<SessionSnapshot>,
    },
}

#[derive(Debug)]
pub enum SessionInput {
    Command(SessionCommand),
    ResendOffer,
    RingTimeout,
    ConnectivityTimer { generation: u64 },
    Shutdown,
}

/// Point-in-time view of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    pub session_id: SessionId,
    pub peer_id: PeerId,
    pub state: CallState,
    pub role: Option<CallRole>,
    pub media_mode: MediaMode,
    pub transport_mode: TransportMode,
    pub reconnect_attempts: u32,
    pub pending_ice: usize,
    pub suppressed: bool,
}

/// Everything needed to build an actor, shared by every actor a
/// supervisor runs for the same peer.
#[derive(Clone)]
pub struct SessionContext {
    pub session_id: SessionId,
    pub local_id: PeerId,
    pub peer_id: PeerId,
    pub store: Arc<dyn SignalStore>,
    pub connector: Arc<dyn TransportFactory>,
    pub media_factory: Arc<dyn MediaEngineFactory>,
    pub config: CallConfig,
    pub events: mpsc::UnboundedSender<CallEvent>,
    pub inputs: mpsc::UnboundedSender<SessionInput>,
}

pub struct ActorExit {
    pub session: CallSession,
    pub inputs: mpsc::UnboundedReceiver<SessionInput>,
    pub shutdown: bool,
}

pub struct SessionActor {
    ctx: SessionContext,
    session: CallSession,
    selector: TransportSelector,
    selector_rx: mpsc::UnboundedReceiver<SelectorEvent>,
    media: Option<Arc<dyn MediaEngine>>,
    media_rx: Option<mpsc::UnboundedReceiver<MediaEvent>>,
    monitor: ConnectivityMonitor,
    resend_task: Option<ScheduledTask>,
    ring_task: Option<ScheduledTask>,
    connectivity_task: Option<ScheduledTask>,
    resends: u32,
}

async fn next_media(rx: &mut Option<mpsc::UnboundedReceiver<MediaEvent>>) -> Option<MediaEvent> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

impl SessionActor {
    pub fn new(ctx: SessionContext, session: CallSession) -> Self {
        let (selector, selector_rx) = TransportSelector::new(
            ctx.session_id.clone(),
            ctx.local_id.clone(),
            ctx.peer_id.clone(),
            ctx.store.clone(),
            ctx.connector.clone(),
            ctx.config.clone(),
        );
        let monitor = ConnectivityMonitor::new(ctx.config.max_reconnect_attempts);
        Self {
            ctx,
            session,
            selector,
            selector_rx,
            media: None,
            media_rx: None,
            monitor,
            resend_task: None,
            ring_task: None,
            connectivity_task: None,
            resends: 0,
        }
    }

    /// Runs until the call ends or fails, or a shutdown is requested.
    pub async fn run(mut self, mut inputs: mpsc::UnboundedReceiver<SessionInput>) -> ActorExit {
        self.selector.start();
        let mut shutdown = false;

        loop {
            tokio::select! {
                input = inputs.recv() => match input {
                    Some(SessionInput::Shutdown) | None => {
                        shutdown = true;
                        break;
                    }
                    Some(input) => self.handle_input(input).await,
                },
                Some(event) = self.selector_rx.recv() => {
                    let inbound = self.selector.handle_event(event).await;
                    for msg in inbound {
                        self.handle_inbound(msg).await;
                    }
                }
                Some(event) = next_media(&mut self.media_rx) => self.handle_media_event(event).await,
            }
            self.process_notices().await;
            if self.session.state().is_terminal() {
                break;
            }
        }

        self.resend_task = None;
        self.ring_task = None;
        self.connectivity_task = None;
        self.selector.shutdown().await;
        if let Some(media) = self.media.take() {
            media.close().await;
        }
        debug!(
            target: "Call/Session",
            "[{}] Actor for {} stopped in {}",
            self.ctx.session_id,
            self.ctx.peer_id,
            self.session.state()
        );
        ActorExit {
            session: self.session,
            inputs,
            shutdown,
        }
    }

    fn emit(&self, event: CallEvent) {
        let _ = self.ctx.events.send(event);
    }

    fn after_transition(&self, from: CallState) {
        let to = self.session.state();
        if from == to {
            return;
        }
        info!(
            target: "Call/Session",
            "[{}] {} -> {} with {}",
            self.ctx.session_id, from, to, self.ctx.peer_id
        );
        self.emit(CallEvent::StateChanged {
            session_id: self.ctx.session_id.clone(),
            peer_id: self.ctx.peer_id.clone(),
            from,
            to,
        });
    }

    fn ringback(&self, active: bool) {
        self.emit(CallEvent::Ringback {
            session_id: self.ctx.session_id.clone(),
            peer_id: self.ctx.peer_id.clone(),
            active,
        });
    }

    fn ensure_media(&mut self) -> Arc<dyn MediaEngine> {
        if let Some(media) = &self.media {
            return media.clone();
        }
        let (media, rx) = self
            .ctx
            .media_factory
            .create_engine(&self.ctx.session_id, &self.ctx.peer_id);
        self.media = Some(media.clone());
        self.media_rx = Some(rx);
        media
    }

    fn clear_timers(&mut self) {
        self.resend_task = None;
        self.ring_task = None;
        self.connectivity_task = None;
    }

    async fn handle_input(&mut self, input: SessionInput) {
        match input {
            SessionInput::Command(command) => self.handle_command(command).await,
            SessionInput::ResendOffer => self.resend_offer().await,
            SessionInput::RingTimeout => self.ring_timeout().await,
            SessionInput::ConnectivityTimer { generation } => {
                if self.session.state() != CallState::Connected {
                    return;
                }
                if let Some(action) = self.monitor.timer_fired(generation, &mut self.session) {
                    self.apply_connectivity(action).await;
                }
            }
            SessionInput::Shutdown => {}
        }
    }

    async fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::StartCall { media_mode, reply } => {
                let result = self.start_call(media_mode).await;
                let _ = reply.send(result);
            }
            SessionCommand::Accept { reply } => {
                let result = self.accept().await;
                let _ = reply.send(result);
            }
            SessionCommand::Decline { reply } => {
                let result = self.decline().await;
                let _ = reply.send(result);
            }
            SessionCommand::HangUp { reply } => {
                let result = self.hang_up().await;
                let _ = reply.send(result);
            }
            SessionCommand::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
        }
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.ctx.session_id.clone(),
            peer_id: self.ctx.peer_id.clone(),
            state: self.session.state(),
            role: self.session.role(),
            media_mode: self.session.media_mode(),
            transport_mode: self.session.transport_mode(),
            reconnect_attempts: self.session.reconnect_attempts(),
            pending_ice: self.session.pending_ice_len(),
            suppressed: self.session.is_suppressed(clock::now()),
        }
    }

    async fn start_call(&mut self, media_mode: MediaMode) -> Result<(), CallError> {
        let from = self.session.state();
        self.session.begin_outgoing(media_mode)?;
        self.after_transition(from);

        let media = self.ensure_media();
        let offer = match Self::prepare_offer(media.as_ref(), media_mode).await {
            Ok(sdp) => sdp,
            Err(e) => {
                let err = CallError::from(e);
                self.fail_call(&err).await;
                return Err(err);
            }
        };

        self.selector
            .send(&SignalMessage::offer(offer.clone(), media_mode))
            .await;
        let from = self.session.state();
        self.session.offer_sent(offer)?;
        self.after_transition(from);
        self.ringback(true);

        let config = &self.ctx.config;
        self.resends = 0;
        self.resend_task = Some(ScheduledTask::every_after(
            config.offer_resend_interval,
            self.ctx.inputs.clone(),
            || SessionInput::ResendOffer,
        ));
        self.ring_task = Some(ScheduledTask::after(
            config.ring_timeout,
            self.ctx.inputs.clone(),
            SessionInput::RingTimeout,
        ));
        Ok(())
    }

    async fn prepare_offer(
        media: &dyn MediaEngine,
        media_mode: MediaMode,
    ) -> Result<String, NegotiationError> {
        media.acquire_local_media(media_mode).await?;
        media.create_offer(false).await
    }

    async fn resend_offer(&mut self) {
        let waiting =
            self.session.state() == CallState::Offering && self.session.remote_answer().is_none();
        if !waiting || self.resends >= self.ctx.config.offer_resend_max {
            self.resend_task = None;
            return;
        }
        let Some(sdp) = self.session.local_offer().map(str::to_owned) else {
            self.resend_task = None;
            return;
        };
        self.resends += 1;
        debug!(
            target: "Call/Session",
            "[{}] Re-sending offer to {} ({}/{})",
            self.ctx.session_id, self.ctx.peer_id, self.resends, self.ctx.config.offer_resend_max
        );
        let offer = SignalMessage::offer(sdp, self.session.media_mode());
        self.selector.send(&offer).await;
    }

    async fn ring_timeout(&mut self) {
        let state = self.session.state();
        if !state.is_ringing() {
            return;
        }
        info!(
            target: "Call/Session",
            "[{}] Call with {} unanswered, ending it",
            self.ctx.session_id, self.ctx.peer_id
        );
        self.selector.send(&SignalMessage::End {}).await;
        if self.session.end(clock::now(), self.ctx.config.teardown_cooldown).is_ok() {
            self.after_transition(state);
            if state == CallState::Offering {
                self.ringback(false);
            }
        }
        self.clear_timers();
    }

    async fn accept(&mut self) -> Result<(), CallError> {
        let state = self.session.state();
        if !state.can_accept() {
            return Err(InvalidTransition {
                current: state,
                attempted: CallTransition::Accept,
            }
            .into());
        }
        let Some(offer) = self.session.remote_offer().map(str::to_owned) else {
            return Err(CallError::NoActiveCall);
        };

        let media = self.ensure_media();
        let answer = match self.prepare_answer(media.as_ref(), &offer).await {
            Ok(sdp) => sdp,
            Err(e) => {
                let err = CallError::from(e);
                self.fail_call(&err).await;
                return Err(err);
            }
        };

        self.selector
            .send(&SignalMessage::Answer {
                sdp: answer.clone(),
            })
            .await;
        self.session.answer_sent(answer)?;
        self.ring_task = None;
        self.after_transition(state);
        Ok(())
    }

    /// Applies the remote offer, then every candidate that arrived before
    /// it in arrival order, then builds the answer.
    async fn prepare_answer(
        &mut self,
        media: &dyn MediaEngine,
        offer: &str,
    ) -> Result<String, NegotiationError> {
        media.acquire_local_media(self.session.media_mode()).await?;
        media.set_remote_description(SdpKind::Offer, offer).await?;
        for candidate in self.session.remote_description_applied() {
            Self::apply_candidate(media, &candidate).await;
        }
        media.create_answer().await
    }

    async fn apply_candidate(media: &dyn MediaEngine, candidate: &IceCandidate) {
        if let Err(e) = media.add_ice_candidate(candidate).await {
            warn!(target: "Call/Session", "Ignoring unusable candidate: {e}");
        }
    }

    async fn decline(&mut self) -> Result<(), CallError> {
        let state = self.session.state();
        if !state.can_accept() {
            return Err(InvalidTransition {
                current: state,
                attempted: CallTransition::Decline,
            }
            .into());
        }
        self.selector.send(&SignalMessage::End {}).await;
        self.session
            .decline(clock::now(), self.ctx.config.decline_cooldown)?;
        self.ring_task = None;
        self.after_transition(state);
        Ok(())
    }

    async fn hang_up(&mut self) -> Result<(), CallError> {
        let state = self.session.state();
        if !state.is_active() {
            return Err(CallError::NoActiveCall);
        }
        self.selector.send(&SignalMessage::End {}).await;
        self.session
            .end(clock::now(), self.ctx.config.teardown_cooldown)?;
        self.clear_timers();
        self.after_transition(state);
        if state == CallState::Offering {
            self.ringback(false);
        }
        Ok(())
    }

    async fn fail_call(&mut self, error: &CallError) {
        let state = self.session.state();
        warn!(
            target: "Call/Session",
            "[{}] Call with {} failed: {error}",
            self.ctx.session_id, self.ctx.peer_id
        );
        self.emit(CallEvent::CallFailed {
            session_id: self.ctx.session_id.clone(),
            peer_id: self.ctx.peer_id.clone(),
            error: error.to_string(),
        });
        if state.is_active() && self.session.role().is_some() {
            self.selector.send(&SignalMessage::End {}).await;
        }
        if self
            .session
            .fail(clock::now(), self.ctx.config.teardown_cooldown)
            .is_ok()
        {
            self.after_transition(state);
            if state == CallState::Offering {
                self.ringback(false);
            }
        }
        self.clear_timers();
    }

    async fn handle_inbound(&mut self, inbound: Inbound) {
        trace!(
            target: "Call/Session",
            "[{}] <-- {} from {} via {:?}",
            self.ctx.session_id,
            inbound.message.kind(),
            inbound.from,
            inbound.via
        );
        match inbound.message {
            SignalMessage::Offer {
                sdp,
                media_mode,
                restart,
            } => self.on_offer(sdp, media_mode, restart).await,
            SignalMessage::Answer { sdp } => self.on_answer(sdp).await,
            SignalMessage::Ice { candidate } => self.on_ice(candidate).await,
            SignalMessage::End {} => self.on_end(),
        }
    }

    async fn on_offer(&mut self, sdp: String, media_mode: MediaMode, restart: bool) {
        let state = self.session.state();
        match self
            .session
            .evaluate_offer(&sdp, media_mode, restart, clock::now())
        {
            OfferDecision::Ring => {
                self.after_transition(state);
                self.emit(CallEvent::IncomingCall {
                    session_id: self.ctx.session_id.clone(),
                    peer_id: self.ctx.peer_id.clone(),
                    media_mode,
                });
                self.ring_task = Some(ScheduledTask::after(
                    self.ctx.config.ring_timeout,
                    self.ctx.inputs.clone(),
                    SessionInput::RingTimeout,
                ));
            }
            OfferDecision::Renegotiate => {
                let Some(media) = self.media.clone() else {
                    debug!(target: "Call/Session", "Restart offer without media, ignoring");
                    return;
                };
                let answer = async {
                    media.set_remote_description(SdpKind::Offer, &sdp).await?;
                    media.create_answer().await
                };
                match answer.await {
                    Ok(answer) => {
                        self.selector
                            .send(&SignalMessage::Answer {
                                sdp: answer.clone(),
                            })
                            .await;
                        if let Err(e) = self.session.answer_sent(answer) {
                            debug!(target: "Call/Session", "Renegotiation answer not recorded: {e}");
                        }
                    }
                    Err(e) => self.fail_call(&e.into()).await,
                }
            }
            OfferDecision::Ignore(reason) => {
                debug!(
                    target: "Call/Session",
                    "[{}] Ignoring offer from {}: {reason:?}",
                    self.ctx.session_id, self.ctx.peer_id
                );
            }
        }
    }

    async fn on_answer(&mut self, sdp: String) {
        if self.session.evaluate_answer(&sdp) != AnswerDecision::Apply {
            debug!(target: "Call/Session", "[{}] Ignoring answer", self.ctx.session_id);
            return;
        }
        let Some(media) = self.media.clone() else {
            return;
        };
        if let Err(e) = media.set_remote_description(SdpKind::Answer, &sdp).await {
            self.fail_call(&e.into()).await;
            return;
        }
        for candidate in self.session.remote_description_applied() {
            Self::apply_candidate(media.as_ref(), &candidate).await;
        }
        if self.resend_task.take().is_some() && self.session.state() == CallState::Offering {
            self.ringback(false);
        }
    }

    async fn on_ice(&mut self, candidate: IceCandidate) {
        match self.session.evaluate_ice(candidate, clock::now()) {
            IceDecision::Apply(candidate) => {
                if let Some(media) = self.media.clone() {
                    Self::apply_candidate(media.as_ref(), &candidate).await;
                }
            }
            IceDecision::Queued => {
                trace!(target: "Call/Session", "Candidate queued until the remote description is set");
            }
            IceDecision::Ignore => {}
        }
    }

    fn on_end(&mut self) {
        let state = self.session.state();
        if !state.is_active() {
            return;
        }
        info!(
            target: "Call/Session",
            "[{}] {} ended the call",
            self.ctx.session_id, self.ctx.peer_id
        );
        if self
            .session
            .end(clock::now(), self.ctx.config.teardown_cooldown)
            .is_ok()
        {
            self.after_transition(state);
            if state == CallState::Offering {
                self.ringback(false);
            }
        }
        self.clear_timers();
    }

    async fn handle_media_event(&mut self, event: MediaEvent) {
        match event {
            MediaEvent::LocalCandidate(candidate) => {
                if self.session.state().is_active() {
                    self.selector.send(&SignalMessage::Ice { candidate }).await;
                }
            }
            MediaEvent::ConnectionState(state) => self.on_connection_state(state).await,
        }
    }

    async fn on_connection_state(&mut self, media_state: MediaConnectionState) {
        let state = self.session.state();
        let relevant = match media_state {
            MediaConnectionState::Connected => state.is_active(),
            MediaConnectionState::Disconnected | MediaConnectionState::Failed => {
                state == CallState::Connected
            }
            _ => false,
        };
        if !relevant {
            if media_state == MediaConnectionState::Failed
                && matches!(state, CallState::Offering | CallState::Negotiating)
            {
                let err = NegotiationError::Engine("media failed before connecting".into());
                self.fail_call(&err.into()).await;
            }
            return;
        }
        if let Some(action) = self.monitor.observe(media_state, &mut self.session) {
            self.apply_connectivity(action).await;
        }
    }

    async fn apply_connectivity(&mut self, action: ConnectivityAction) {
        let config = &self.ctx.config;
        match action {
            ConnectivityAction::Connected => {
                let from = self.session.state();
                match self.session.media_connected() {
                    Ok(_) => self.after_transition(from),
                    Err(e) => debug!(target: "Call/Session", "Media up out of turn: {e}"),
                }
                self.clear_timers();
                if from == CallState::Offering {
                    self.ringback(false);
                }
            }
            ConnectivityAction::StartGrace { generation } => {
                self.connectivity_task = Some(ScheduledTask::after(
                    config.disconnected_grace,
                    self.ctx.inputs.clone(),
                    SessionInput::ConnectivityTimer { generation },
                ));
            }
            ConnectivityAction::Renegotiate {
                attempt,
                generation,
            } => {
                self.connectivity_task = Some(ScheduledTask::after(
                    config.reconnect_timeout,
                    self.ctx.inputs.clone(),
                    SessionInput::ConnectivityTimer { generation },
                ));
                if self.session.role() != Some(CallRole::Caller) {
                    debug!(target: "Call/Session", "Waiting for the caller to renegotiate (attempt {attempt})");
                    return;
                }
                let Some(media) = self.media.clone() else {
                    return;
                };
                match media.create_offer(true).await {
                    Ok(sdp) => {
                        self.session.restart_offer_sent(sdp.clone());
                        let offer = SignalMessage::restart_offer(sdp, self.session.media_mode());
                        self.selector.send(&offer).await;
                    }
                    Err(e) => self.fail_call(&e.into()).await,
                }
            }
            ConnectivityAction::Exhausted { attempts } => {
                let err = CallError::from(ConnectivityError::Exhausted { attempts });
                self.fail_call(&err).await;
            }
        }
    }

    async fn process_notices(&mut self) {
        for notice in self.selector.drain_notices() {
            match notice {
                SelectorNotice::ChannelReady { auth_key_id } => {
                    debug!(
                        target: "Call/Session",
                        "[{}] Secure channel up (key {auth_key_id})",
                        self.ctx.session_id
                    );
                }
                SelectorNotice::Latched { reason } => {
                    if self.session.latch_fallback() {
                        self.emit(CallEvent::TransportLatched {
                            session_id: self.ctx.session_id.clone(),
                            peer_id: self.ctx.peer_id.clone(),
                            reason,
                        });
                    }
                }
                SelectorNotice::CodecFailure { failures } => {
                    self.fail_call(&CallError::Codec(failures)).await;
                }
            }
        }
    }
}
