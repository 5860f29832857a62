//! Chooses how signals travel between two peers.
//!
//! A selector starts on the encrypted duplex channel. When the channel
//! cannot be established within the handshake bound, fails to send, or goes
//! away, the selector latches to the signal store for the rest of the
//! session and polls it on a fixed interval. The latch never reverts.
//!
//! The store is read on the same interval while the channel is open too,
//! so a peer that latched on its own side still reaches this one. Reading
//! twice is harmless: the store consumes once per receiver and the session
//! drops repeated offers and candidates.

use crate::calls::task::ScheduledTask;
use crate::config::CallConfig;
use crate::handshake::{HandshakeError, do_handshake_until};
use crate::socket::{SecureSocket, SocketError};
use crate::store::{SignalStore, SignalStoreError};
use crate::transport::{TransportEvent, TransportFactory};
use cwcore::call::TransportMode;
use cwcore::messages::SignalMessage;
use cwcore::types::{PeerId, SessionId};
use log::{debug, error, info, warn};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{Instant, timeout_at};

/// Why the duplex channel could not be used. Always absorbed by latching.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(anyhow::Error),
    #[error("connect timed out")]
    ConnectTimeout,
    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),
    #[error("channel send failed: {0}")]
    Send(#[from] SocketError),
    #[error("channel closed")]
    Closed,
}

/// Output of the selector's background work, fed back through
/// [`TransportSelector::handle_event`].
pub enum SelectorEvent {
    ChannelReady(Arc<SecureSocket>),
    ChannelMessage(SignalMessage),
    ChannelFailed(TransportError),
    CodecToleranceExceeded(u32),
    PollTick,
}

impl fmt::Debug for SelectorEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ChannelReady(socket) => f
                .debug_tuple("ChannelReady")
                .field(&socket.auth_key_id_hex())
                .finish(),
            Self::ChannelMessage(msg) => f.debug_tuple("ChannelMessage").field(msg).finish(),
            Self::ChannelFailed(reason) => f.debug_tuple("ChannelFailed").field(reason).finish(),
            Self::CodecToleranceExceeded(n) => {
                f.debug_tuple("CodecToleranceExceeded").field(n).finish()
            }
            Self::PollTick => f.write_str("PollTick"),
        }
    }
}

/// Things the owner of a selector has to react to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectorNotice {
    ChannelReady { auth_key_id: String },
    Latched { reason: String },
    CodecFailure { failures: u32 },
}

/// A signal that arrived from the remote peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inbound {
    pub from: PeerId,
    pub message: SignalMessage,
    pub via: TransportMode,
}

enum Channel {
    Connecting,
    Open(Arc<SecureSocket>),
    Closed,
}

pub struct TransportSelector {
    session_id: SessionId,
    local_id: PeerId,
    remote_id: PeerId,
    store: Arc<dyn SignalStore>,
    connector: Arc<dyn TransportFactory>,
    config: CallConfig,
    mode: TransportMode,
    channel: Channel,
    /// Messages sent while the handshake is in flight, in send order.
    pending: VecDeque<SignalMessage>,
    /// Serialized messages the store could not take yet, in send order.
    outbox: VecDeque<Vec<u8>>,
    channel_task: Option<ScheduledTask>,
    poll_task: Option<ScheduledTask>,
    events_tx: mpsc::UnboundedSender<SelectorEvent>,
    notices: Vec<SelectorNotice>,
}

impl TransportSelector {
    pub fn new(
        session_id: SessionId,
        local_id: PeerId,
        remote_id: PeerId,
        store: Arc<dyn SignalStore>,
        connector: Arc<dyn TransportFactory>,
        config: CallConfig,
    ) -> (Self, mpsc::UnboundedReceiver<SelectorEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let selector = Self {
            session_id,
            local_id,
            remote_id,
            store,
            connector,
            config,
            mode: TransportMode::Primary,
            channel: Channel::Connecting,
            pending: VecDeque::new(),
            outbox: VecDeque::new(),
            channel_task: None,
            poll_task: None,
            events_tx,
            notices: Vec::new(),
        };
        (selector, events_rx)
    }

    pub fn mode(&self) -> TransportMode {
        self.mode
    }

    pub fn is_channel_open(&self) -> bool {
        matches!(self.channel, Channel::Open(_))
    }

    pub fn outbox_len(&self) -> usize {
        self.outbox.len()
    }

    /// Dials the duplex channel in the background.
    pub fn start(&mut self) {
        if self.mode == TransportMode::Fallback || self.channel_task.is_some() {
            return;
        }
        debug!(
            target: "Call/Selector",
            "[{}] Opening channel to {}",
            self.session_id, self.remote_id
        );
        self.channel = Channel::Connecting;
        self.channel_task = Some(ScheduledTask::spawn(run_channel(
            self.connector.clone(),
            self.config.clone(),
            self.events_tx.clone(),
        )));
    }

    pub fn drain_notices(&mut self) -> Vec<SelectorNotice> {
        std::mem::take(&mut self.notices)
    }

    pub async fn send(&mut self, msg: &SignalMessage) {
        if self.mode == TransportMode::Fallback {
            self.send_fallback(msg).await;
            return;
        }
        match &self.channel {
            Channel::Open(socket) => {
                let socket = socket.clone();
                if let Err(e) = socket.send_message(msg).await {
                    warn!(
                        target: "Call/Selector",
                        "[{}] Channel send of {} failed: {e}",
                        self.session_id,
                        msg.kind()
                    );
                    self.pending.push_back(msg.clone());
                    self.latch(e.into()).await;
                }
            }
            Channel::Connecting => {
                debug!(
                    target: "Call/Selector",
                    "[{}] Queueing {} until the channel is up",
                    self.session_id,
                    msg.kind()
                );
                self.pending.push_back(msg.clone());
            }
            Channel::Closed => {
                self.pending.push_back(msg.clone());
                self.latch(TransportError::Closed).await;
            }
        }
    }

    async fn send_fallback(&mut self, msg: &SignalMessage) {
        let payload = match msg.to_json() {
            Ok(payload) => payload,
            Err(e) => {
                error!(target: "Call/Selector", "Failed to serialize {}: {e}", msg.kind());
                return;
            }
        };
        self.outbox.push_back(payload);
        self.flush_outbox().await;
    }

    /// Puts queued payloads in order until the store refuses one.
    async fn flush_outbox(&mut self) {
        while let Some(payload) = self.outbox.pop_front() {
            let result = self
                .store
                .put(
                    &self.session_id,
                    &self.local_id,
                    Some(&self.remote_id),
                    payload.clone(),
                )
                .await;
            match result {
                Ok(_) => {}
                Err(e) if e.is_transient() => {
                    warn!(
                        target: "Call/Selector",
                        "[{}] Store unavailable, keeping {} queued: {e}",
                        self.session_id,
                        self.outbox.len() + 1
                    );
                    self.outbox.push_front(payload);
                    return;
                }
                Err(e) => {
                    error!(
                        target: "Call/Selector",
                        "[{}] Store rejected a signal, dropping it: {e}",
                        self.session_id
                    );
                }
            }
        }
    }

    /// Switches to the store for good. Returns `false` if already latched.
    pub async fn latch(&mut self, error: TransportError) -> bool {
        if self.mode == TransportMode::Fallback {
            return false;
        }
        self.mode = TransportMode::Fallback;
        let reason = error.to_string();
        info!(
            target: "Call/Selector",
            "[{}] Latching to store-and-forward with {}: {reason}",
            self.session_id, self.remote_id
        );

        self.channel_task = None;
        if let Channel::Open(socket) = std::mem::replace(&mut self.channel, Channel::Closed) {
            socket.close().await;
        }
        let queued: Vec<_> = self.pending.drain(..).collect();
        for msg in &queued {
            self.send_fallback(msg).await;
        }

        self.poll_task = Some(ScheduledTask::every(
            self.config.poll_interval,
            self.events_tx.clone(),
            || SelectorEvent::PollTick,
        ));
        self.notices.push(SelectorNotice::Latched { reason });
        true
    }

    pub async fn handle_event(&mut self, event: SelectorEvent) -> Vec<Inbound> {
        match event {
            SelectorEvent::ChannelReady(socket) => {
                if self.mode == TransportMode::Fallback {
                    debug!(target: "Call/Selector", "Channel came up after latching, closing it");
                    socket.close().await;
                    return Vec::new();
                }
                self.notices.push(SelectorNotice::ChannelReady {
                    auth_key_id: socket.auth_key_id_hex(),
                });
                self.channel = Channel::Open(socket.clone());
                while let Some(msg) = self.pending.pop_front() {
                    if let Err(e) = socket.send_message(&msg).await {
                        self.pending.push_front(msg);
                        self.latch(e.into()).await;
                        break;
                    }
                }
                if self.mode == TransportMode::Primary {
                    self.poll_task = Some(ScheduledTask::every_after(
                        self.config.poll_interval,
                        self.events_tx.clone(),
                        || SelectorEvent::PollTick,
                    ));
                }
                // The relay persists what it could not forward yet; pick up
                // anything sent before this channel was registered.
                self.poll_store().await
            }
            SelectorEvent::ChannelMessage(message) => {
                if self.mode == TransportMode::Fallback {
                    return Vec::new();
                }
                vec![Inbound {
                    from: self.remote_id.clone(),
                    message,
                    via: TransportMode::Primary,
                }]
            }
            SelectorEvent::ChannelFailed(error) => {
                self.latch(error).await;
                Vec::new()
            }
            SelectorEvent::CodecToleranceExceeded(failures) => {
                self.channel_task = None;
                self.channel = Channel::Closed;
                self.notices.push(SelectorNotice::CodecFailure { failures });
                Vec::new()
            }
            SelectorEvent::PollTick => self.poll_store().await,
        }
    }

    async fn poll_store(&mut self) -> Vec<Inbound> {
        self.flush_outbox().await;
        let delivered = match self.store.poll(&self.session_id, &self.local_id).await {
            Ok(delivered) => delivered,
            Err(e @ SignalStoreError::Unavailable(_)) => {
                debug!(target: "Call/Selector", "[{}] Poll skipped: {e}", self.session_id);
                return Vec::new();
            }
            Err(e) => {
                warn!(target: "Call/Selector", "[{}] Poll failed: {e}", self.session_id);
                return Vec::new();
            }
        };

        let mut inbound = Vec::with_capacity(delivered.len());
        for signal in delivered {
            if signal.sender_id != self.remote_id {
                warn!(
                    target: "Call/Selector",
                    "[{}] Dropping signal {} from unexpected sender {}",
                    self.session_id, signal.signal_id, signal.sender_id
                );
                continue;
            }
            match SignalMessage::from_json(&signal.payload) {
                Ok(message) => inbound.push(Inbound {
                    from: signal.sender_id,
                    message,
                    via: TransportMode::Fallback,
                }),
                Err(e) => warn!(
                    target: "Call/Selector",
                    "[{}] Dropping unparseable signal {}: {e}",
                    self.session_id, signal.signal_id
                ),
            }
        }
        inbound
    }

    /// Stops background work and closes the channel. Queued store writes
    /// get one last attempt.
    pub async fn shutdown(&mut self) {
        self.channel_task = None;
        self.poll_task = None;
        if let Channel::Open(socket) = std::mem::replace(&mut self.channel, Channel::Closed) {
            socket.close().await;
        }
        if self.mode == TransportMode::Fallback {
            self.flush_outbox().await;
        }
    }
}

async fn run_channel(
    connector: Arc<dyn TransportFactory>,
    config: CallConfig,
    events_tx: mpsc::UnboundedSender<SelectorEvent>,
) {
    let deadline = Instant::now() + config.handshake_timeout;
    let (transport, mut events) =
        match timeout_at(deadline, connector.create_transport()).await {
            Ok(Ok(half)) => half,
            Ok(Err(e)) => {
                let _ = events_tx.send(SelectorEvent::ChannelFailed(TransportError::Connect(e)));
                return;
            }
            Err(_) => {
                let _ = events_tx.send(SelectorEvent::ChannelFailed(TransportError::ConnectTimeout));
                return;
            }
        };

    let socket = match do_handshake_until(transport.clone(), &mut events, &config, deadline).await {
        Ok(socket) => Arc::new(socket),
        Err(e) => {
            transport.disconnect().await;
            let _ = events_tx.send(SelectorEvent::ChannelFailed(e.into()));
            return;
        }
    };
    if events_tx
        .send(SelectorEvent::ChannelReady(socket.clone()))
        .is_err()
    {
        socket.close().await;
        return;
    }

    while let Some(event) = events.recv().await {
        match event {
            TransportEvent::DataReceived(data) => match socket.decode_message(&data) {
                Ok(msg) => {
                    if events_tx.send(SelectorEvent::ChannelMessage(msg)).is_err() {
                        return;
                    }
                }
                Err(e) if e.is_discardable() => {
                    if socket.tolerance_exceeded() {
                        let failures = socket.codec_failures();
                        socket.close().await;
                        let _ = events_tx.send(SelectorEvent::CodecToleranceExceeded(failures));
                        return;
                    }
                }
                Err(e) => {
                    let _ = events_tx.send(SelectorEvent::ChannelFailed(e.into()));
                    return;
                }
            },
            TransportEvent::Connected => {}
            TransportEvent::Disconnected => break,
        }
    }
    let _ = events_tx.send(SelectorEvent::ChannelFailed(TransportError::Closed));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::RelayHub;
    use crate::store::MemorySignalStore;
    use crate::transport::{RelayConnector, StalledConnector, UnreachableConnector, memory_pair};
    use cwcore::handshake::AuthKey;
    use cwcore::types::MediaMode;
    use std::time::Duration;

    fn config() -> CallConfig {
        CallConfig {
            handshake_timeout: Duration::from_secs(3),
            poll_interval: Duration::from_millis(1500),
            ..Default::default()
        }
    }

    fn selector(
        store: Arc<MemorySignalStore>,
        connector: Arc<dyn TransportFactory>,
        local: &str,
        remote: &str,
    ) -> (TransportSelector, mpsc::UnboundedReceiver<SelectorEvent>) {
        TransportSelector::new(
            SessionId::new("chat-1"),
            PeerId::new(local),
            PeerId::new(remote),
            store,
            connector,
            config(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_handshake_latches_and_stores_queued_messages() {
        let store = Arc::new(MemorySignalStore::new());
        let (mut alice, mut events) =
            selector(store.clone(), Arc::new(StalledConnector), "alice", "bob");
        alice.start();

        let offer = SignalMessage::offer("v=0 offer", MediaMode::AudioOnly);
        alice.send(&offer).await;
        assert_eq!(store.record_count(), 0);

        let started = tokio::time::Instant::now();
        let event = events.recv().await.unwrap();
        assert!(matches!(event, SelectorEvent::ChannelFailed(_)));
        assert!(started.elapsed() >= Duration::from_secs(3));

        alice.handle_event(event).await;
        assert_eq!(alice.mode(), TransportMode::Fallback);
        assert!(matches!(
            alice.drain_notices().as_slice(),
            [SelectorNotice::Latched { .. }]
        ));

        let delivered = store
            .poll(&SessionId::new("chat-1"), &PeerId::new("bob"))
            .await
            .unwrap();
        assert_eq!(delivered.len(), 1);
        assert_eq!(SignalMessage::from_json(&delivered[0].payload).unwrap(), offer);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_relay_latches_immediately() {
        let store = Arc::new(MemorySignalStore::new());
        let (mut alice, mut events) =
            selector(store, Arc::new(UnreachableConnector), "alice", "bob");
        alice.start();
        let event = events.recv().await.unwrap();
        alice.handle_event(event).await;
        assert_eq!(alice.mode(), TransportMode::Fallback);
    }

    #[tokio::test]
    async fn test_latch_is_one_way() {
        let store = Arc::new(MemorySignalStore::new());
        let (mut alice, _events) =
            selector(store, Arc::new(StalledConnector), "alice", "bob");
        assert!(alice.latch(TransportError::Closed).await);
        assert!(!alice.latch(TransportError::ConnectTimeout).await);

        let ((a, _a_rx), (_b, _b_rx)) = memory_pair();
        let late = Arc::new(SecureSocket::new(a, AuthKey::from_bytes([1; 32]), 3));
        alice
            .handle_event(SelectorEvent::ChannelReady(late.clone()))
            .await;
        assert!(late.is_closed());
        assert_eq!(alice.mode(), TransportMode::Fallback);
        assert!(!alice.is_channel_open());
    }

    #[tokio::test]
    async fn test_poll_delivers_only_from_remote_peer() {
        let store = Arc::new(MemorySignalStore::new());
        let session = SessionId::new("chat-1");
        let (mut alice, _events) =
            selector(store.clone(), Arc::new(StalledConnector), "alice", "bob");
        alice.latch(TransportError::Closed).await;

        let end = SignalMessage::End {}.to_json().unwrap();
        store
            .put(&session, &PeerId::new("mallory"), None, end.clone())
            .await
            .unwrap();
        store
            .put(&session, &PeerId::new("bob"), Some(&PeerId::new("alice")), end)
            .await
            .unwrap();

        let inbound = alice.handle_event(SelectorEvent::PollTick).await;
        assert_eq!(inbound.len(), 1);
        assert_eq!(inbound[0].from, PeerId::new("bob"));
        assert_eq!(inbound[0].via, TransportMode::Fallback);
        assert!(alice.handle_event(SelectorEvent::PollTick).await.is_empty());
    }

    #[tokio::test]
    async fn test_outbox_survives_store_outage() {
        let store = Arc::new(MemorySignalStore::new());
        let session = SessionId::new("chat-1");
        let (mut alice, _events) =
            selector(store.clone(), Arc::new(StalledConnector), "alice", "bob");
        alice.latch(TransportError::Closed).await;

        store.set_available(false);
        alice
            .send(&SignalMessage::offer("v=0 first", MediaMode::AudioOnly))
            .await;
        alice.send(&SignalMessage::End {}).await;
        assert_eq!(alice.outbox_len(), 2);

        store.set_available(true);
        alice.handle_event(SelectorEvent::PollTick).await;
        assert_eq!(alice.outbox_len(), 0);

        let delivered = store.poll(&session, &PeerId::new("bob")).await.unwrap();
        let kinds: Vec<_> = delivered
            .iter()
            .map(|s| SignalMessage::from_json(&s.payload).unwrap().kind())
            .collect();
        assert_eq!(kinds, vec!["offer", "end"]);
    }

    #[tokio::test]
    async fn test_relay_channel_carries_messages() {
        let _ = env_logger::builder().is_test(true).try_init();
        let store = Arc::new(MemorySignalStore::new());
        let hub = RelayHub::new(store.clone(), config());
        let session = SessionId::new("chat-1");
        let connect = |peer: &str| -> Arc<dyn TransportFactory> {
            Arc::new(RelayConnector::new(
                hub.clone(),
                session.clone(),
                PeerId::new(peer),
            ))
        };

        let (mut alice, mut alice_events) = selector(store.clone(), connect("alice"), "alice", "bob");
        let (mut bob, mut bob_events) = selector(store.clone(), connect("bob"), "bob", "alice");
        alice.start();
        bob.start();

        let ready = alice_events.recv().await.unwrap();
        assert!(matches!(ready, SelectorEvent::ChannelReady(_)));
        alice.handle_event(ready).await;
        let ready = bob_events.recv().await.unwrap();
        bob.handle_event(ready).await;
        assert!(alice.is_channel_open() && bob.is_channel_open());

        let offer = SignalMessage::offer("v=0 over relay", MediaMode::AudioOnly);
        alice.send(&offer).await;

        let inbound = loop {
            let event = bob_events.recv().await.unwrap();
            if matches!(event, SelectorEvent::ChannelMessage(_)) {
                break bob.handle_event(event).await;
            }
        };
        assert_eq!(
            inbound,
            vec![Inbound {
                from: PeerId::new("alice"),
                message: offer,
                via: TransportMode::Primary,
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_channel_keeps_reading_the_store() {
        let store = Arc::new(MemorySignalStore::new());
        let hub = RelayHub::new(store.clone(), config());
        let session = SessionId::new("chat-1");
        let connector = Arc::new(RelayConnector::new(
            hub,
            session.clone(),
            PeerId::new("alice"),
        ));
        let (mut alice, mut events) = selector(store.clone(), connector, "alice", "bob");
        alice.start();
        let ready = events.recv().await.unwrap();
        assert!(alice.handle_event(ready).await.is_empty());
        assert!(alice.is_channel_open());

        // Bob latched on his side and writes to the store directly.
        let answer = SignalMessage::Answer {
            sdp: "v=0 from the store".into(),
        };
        store
            .put(
                &session,
                &PeerId::new("bob"),
                Some(&PeerId::new("alice")),
                answer.to_json().unwrap(),
            )
            .await
            .unwrap();

        let started = tokio::time::Instant::now();
        let inbound = loop {
            let event = events.recv().await.unwrap();
            let inbound = alice.handle_event(event).await;
            if !inbound.is_empty() {
                break inbound;
            }
        };
        assert!(started.elapsed() <= Duration::from_millis(1500));
        assert_eq!(inbound[0].message, answer);
        assert_eq!(inbound[0].via, TransportMode::Fallback);
        assert_eq!(alice.mode(), TransportMode::Primary);
    }

    struct SlowStalledConnector;

    #[async_trait::async_trait]
    impl TransportFactory for SlowStalledConnector {
        async fn create_transport(
            &self,
        ) -> Result<crate::transport::TransportHalf, anyhow::Error> {
            tokio::time::sleep(Duration::from_secs(2)).await;
            StalledConnector.create_transport().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_dial_and_handshake_share_one_bound() {
        let store = Arc::new(MemorySignalStore::new());
        let (mut alice, mut events) =
            selector(store, Arc::new(SlowStalledConnector), "alice", "bob");
        let started = tokio::time::Instant::now();
        alice.start();

        let event = events.recv().await.unwrap();
        let elapsed = started.elapsed();
        assert!(
            matches!(
                event,
                SelectorEvent::ChannelFailed(TransportError::Handshake(HandshakeError::Timeout))
            ),
            "{event:?}"
        );
        assert!(
            elapsed >= Duration::from_secs(3) && elapsed < Duration::from_millis(3100),
            "{elapsed:?}"
        );
    }
}
