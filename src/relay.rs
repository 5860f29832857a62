//! In-process relay that both ends of a session dial for the duplex path.
//!
//! Each connection runs the responding side of the key exchange, so every
//! participant has its own key with the relay. A decoded signal is first
//! written to the signal store as a broadcast, then re-sealed and forwarded
//! to every other connected participant of the same session.

use crate::config::CallConfig;
use crate::handshake::accept_handshake;
use crate::socket::SecureSocket;
use crate::store::SignalStore;
use crate::transport::{Transport, TransportEvent};
use cwcore::handshake::DhParams;
use cwcore::types::{PeerId, SessionId};
use dashmap::DashMap;
use log::{debug, info, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;

struct Participant {
    connection_id: u64,
    peer_id: PeerId,
    socket: Arc<SecureSocket>,
}

struct HubInner {
    store: Arc<dyn SignalStore>,
    config: CallConfig,
    params: DhParams,
    sessions: DashMap<SessionId, Vec<Participant>>,
    next_connection: AtomicU64,
}

#[derive(Clone)]
pub struct RelayHub {
    inner: Arc<HubInner>,
}

impl RelayHub {
    pub fn new(store: Arc<dyn SignalStore>, config: CallConfig) -> Self {
        Self::with_params(store, config, DhParams::default())
    }

    pub fn with_params(store: Arc<dyn SignalStore>, config: CallConfig, params: DhParams) -> Self {
        Self {
            inner: Arc::new(HubInner {
                store,
                config,
                params,
                sessions: DashMap::new(),
                next_connection: AtomicU64::new(1),
            }),
        }
    }

    /// Peers currently connected to `session_id`.
    pub fn participants(&self, session_id: &SessionId) -> Vec<PeerId> {
        self.inner
            .sessions
            .get(session_id)
            .map(|list| list.iter().map(|p| p.peer_id.clone()).collect())
            .unwrap_or_default()
    }

    /// Serves one inbound connection in the background.
    pub fn accept(
        &self,
        session_id: SessionId,
        peer_id: PeerId,
        transport: Arc<dyn Transport>,
        events: mpsc::Receiver<TransportEvent>,
    ) {
        let hub = self.clone();
        tokio::spawn(async move {
            hub.serve(session_id, peer_id, transport, events).await;
        });
    }

    async fn serve(
        &self,
        session_id: SessionId,
        peer_id: PeerId,
        transport: Arc<dyn Transport>,
        mut events: mpsc::Receiver<TransportEvent>,
    ) {
        let inner = &self.inner;
        let socket = match accept_handshake(
            transport.clone(),
            &mut events,
            inner.params.clone(),
            &inner.config,
        )
        .await
        {
            Ok(socket) => Arc::new(socket),
            Err(e) => {
                warn!(target: "Call/Relay", "[{session_id}] Handshake with {peer_id} failed: {e}");
                transport.disconnect().await;
                return;
            }
        };

        let connection_id = inner.next_connection.fetch_add(1, Ordering::Relaxed);
        self.register(&session_id, connection_id, &peer_id, socket.clone());
        info!(
            target: "Call/Relay",
            "[{session_id}] {peer_id} joined (key {})",
            socket.auth_key_id_hex()
        );

        while let Some(event) = events.recv().await {
            match event {
                TransportEvent::DataReceived(data) => match socket.open_frame(&data) {
                    Ok(payload) => self.route(&session_id, &peer_id, payload).await,
                    Err(e) if e.is_discardable() => {
                        if socket.tolerance_exceeded() {
                            warn!(
                                target: "Call/Relay",
                                "[{session_id}] Dropping {peer_id} after {} bad frames",
                                socket.codec_failures()
                            );
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(target: "Call/Relay", "[{session_id}] {peer_id}: {e}");
                        break;
                    }
                },
                TransportEvent::Connected => {}
                TransportEvent::Disconnected => break,
            }
        }

        self.unregister(&session_id, connection_id);
        socket.close().await;
        debug!(target: "Call/Relay", "[{session_id}] {peer_id} left");
    }

    fn register(
        &self,
        session_id: &SessionId,
        connection_id: u64,
        peer_id: &PeerId,
        socket: Arc<SecureSocket>,
    ) {
        let mut list = self.inner.sessions.entry(session_id.clone()).or_default();
        list.retain(|p| &p.peer_id != peer_id);
        list.push(Participant {
            connection_id,
            peer_id: peer_id.clone(),
            socket,
        });
    }

    fn unregister(&self, session_id: &SessionId, connection_id: u64) {
        if let Some(mut list) = self.inner.sessions.get_mut(session_id) {
            list.retain(|p| p.connection_id != connection_id);
        }
        self.inner
            .sessions
            .remove_if(session_id, |_, list| list.is_empty());
    }

    async fn route(&self, session_id: &SessionId, sender: &PeerId, payload: Vec<u8>) {
        if let Err(e) = self
            .inner
            .store
            .put(session_id, sender, None, payload.clone())
            .await
        {
            warn!(target: "Call/Relay", "[{session_id}] Could not persist signal from {sender}: {e}");
        }

        // Collect first: the map guard must not be held across an await.
        let recipients: Vec<(PeerId, Arc<SecureSocket>)> = self
            .inner
            .sessions
            .get(session_id)
            .map(|list| {
                list.iter()
                    .filter(|p| &p.peer_id != sender)
                    .map(|p| (p.peer_id.clone(), p.socket.clone()))
                    .collect()
            })
            .unwrap_or_default();

        for (peer_id, socket) in recipients {
            if let Err(e) = socket.send_payload(&payload).await {
                warn!(target: "Call/Relay", "[{session_id}] Forward to {peer_id} failed: {e}");
            }
        }
    }
}
