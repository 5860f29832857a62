//! Call manager: the registry of session actors.

use super::engine::MediaEngineFactory;
use super::error::CallError;
use super::events::CallEvent;
use super::session::{
    SessionActor, SessionCommand, SessionContext, SessionInput, SessionSnapshot,
};
use crate::config::CallConfig;
use crate::store::SignalStore;
use crate::transport::TransportFactory;
use cwcore::call::CallSession;
use cwcore::types::{MediaMode, PeerId, SessionId};
use log::{debug, info};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{RwLock, mpsc, oneshot};
use tokio::task::JoinHandle;

type SessionKey = (SessionId, PeerId);

struct SessionHandle {
    inputs: mpsc::UnboundedSender<SessionInput>,
    task: JoinHandle<()>,
}

/// Owns one supervised actor per watched `(session, peer)`.
///
/// An actor handles a single call. When that call ends or fails, the
/// supervisor replaces it with a fresh actor that keeps the cooldown of the
/// previous one, so the peer can call again. Commands queued in between are
/// picked up by the new actor.
pub struct CallManager {
    local_id: PeerId,
    store: Arc<dyn SignalStore>,
    media_factory: Arc<dyn MediaEngineFactory>,
    config: CallConfig,
    events: mpsc::UnboundedSender<CallEvent>,
    sessions: RwLock<HashMap<SessionKey, SessionHandle>>,
}

impl CallManager {
    pub fn new(
        local_id: PeerId,
        store: Arc<dyn SignalStore>,
        media_factory: Arc<dyn MediaEngineFactory>,
        config: CallConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<CallEvent>), CallError> {
        config.validate()?;
        let (events, events_rx) = mpsc::unbounded_channel();
        let manager = Self {
            local_id,
            store,
            media_factory,
            config,
            events,
            sessions: RwLock::new(HashMap::new()),
        };
        Ok((manager, events_rx))
    }

    pub fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    pub fn config(&self) -> &CallConfig {
        &self.config
    }

    /// Starts listening for calls with `peer_id` in `session_id`. The
    /// `connector` dials the duplex channel for this peer.
    ///
    /// A session carries calls with a single peer; watching a second peer
    /// in the same session is refused.
    pub async fn watch(
        &self,
        session_id: SessionId,
        peer_id: PeerId,
        connector: Arc<dyn TransportFactory>,
    ) -> Result<(), CallError> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&(session_id.clone(), peer_id.clone())) {
            return Ok(());
        }
        if sessions.keys().any(|(sid, _)| sid == &session_id) {
            return Err(CallError::SessionTaken(session_id));
        }

        let (inputs, inputs_rx) = mpsc::unbounded_channel();
        let ctx = SessionContext {
            session_id: session_id.clone(),
            local_id: self.local_id.clone(),
            peer_id: peer_id.clone(),
            store: self.store.clone(),
            connector,
            media_factory: self.media_factory.clone(),
            config: self.config.clone(),
            events: self.events.clone(),
            inputs: inputs.clone(),
        };
        let task = tokio::spawn(supervise(ctx, inputs_rx));
        info!(
            target: "Call/Manager",
            "[{session_id}] {} watching for calls with {peer_id}",
            self.local_id
        );
        sessions.insert((session_id, peer_id), SessionHandle { inputs, task });
        Ok(())
    }

    /// Stops the actor for one peer, ending any call it holds locally.
    pub async fn unwatch(&self, session_id: &SessionId, peer_id: &PeerId) -> Result<(), CallError> {
        let handle = self
            .sessions
            .write()
            .await
            .remove(&(session_id.clone(), peer_id.clone()))
            .ok_or_else(|| CallError::NotFound(peer_id.clone()))?;
        let _ = handle.inputs.send(SessionInput::Shutdown);
        let _ = handle.task.await;
        Ok(())
    }

    pub async fn start_call(
        &self,
        session_id: &SessionId,
        peer_id: &PeerId,
        media_mode: MediaMode,
    ) -> Result<(), CallError> {
        self.request(session_id, peer_id, |reply| SessionCommand::StartCall {
            media_mode,
            reply,
        })
        .await?
    }

    pub async fn accept(&self, session_id: &SessionId, peer_id: &PeerId) -> Result<(), CallError> {
        self.request(session_id, peer_id, |reply| SessionCommand::Accept { reply })
            .await?
    }

    pub async fn decline(&self, session_id: &SessionId, peer_id: &PeerId) -> Result<(), CallError> {
        self.request(session_id, peer_id, |reply| SessionCommand::Decline { reply })
            .await?
    }

    pub async fn hang_up(&self, session_id: &SessionId, peer_id: &PeerId) -> Result<(), CallError> {
        self.request(session_id, peer_id, |reply| SessionCommand::HangUp { reply })
            .await?
    }

    pub async fn snapshot(
        &self,
        session_id: &SessionId,
        peer_id: &PeerId,
    ) -> Result<SessionSnapshot, CallError> {
        self.request(session_id, peer_id, |reply| SessionCommand::Snapshot { reply })
            .await
    }

    pub async fn watched(&self) -> Vec<(SessionId, PeerId)> {
        self.sessions.read().await.keys().cloned().collect()
    }

    /// Stops every actor and waits for them to release their resources.
    pub async fn shutdown(&self) {
        let handles: Vec<_> = self.sessions.write().await.drain().collect();
        for (_, handle) in &handles {
            let _ = handle.inputs.send(SessionInput::Shutdown);
        }
        for ((session_id, peer_id), handle) in handles {
            let _ = handle.task.await;
            debug!(target: "Call/Manager", "[{session_id}] Stopped session with {peer_id}");
        }
    }

    async fn request<T>(
        &self,
        session_id: &SessionId,
        peer_id: &PeerId,
        make: impl FnOnce(oneshot::Sender<T>) -> SessionCommand,
    ) -> Result<T, CallError> {
        let inputs = self
            .sessions
            .read()
            .await
            .get(&(session_id.clone(), peer_id.clone()))
            .map(|handle| handle.inputs.clone())
            .ok_or_else(|| CallError::NotFound(peer_id.clone()))?;
        let (tx, rx) = oneshot::channel();
        inputs
            .send(SessionInput::Command(make(tx)))
            .map_err(|_| CallError::SessionClosed)?;
        rx.await.map_err(|_| CallError::SessionClosed)
    }
}

async fn supervise(ctx: SessionContext, mut inputs: mpsc::UnboundedReceiver<SessionInput>) {
    let mut session = CallSession::new(ctx.peer_id.clone());
    loop {
        let actor = SessionActor::new(ctx.clone(), session);
        let exit = actor.run(inputs).await;
        if exit.shutdown {
            return;
        }
        debug!(
            target: "Call/Manager",
            "[{}] Call with {} finished in {}, ready for the next one",
            ctx.session_id,
            ctx.peer_id,
            exit.session.state()
        );
        session = exit.session.successor();
        inputs = exit.inputs;
    }
}
