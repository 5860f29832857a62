// Integration tests: two peers negotiating calls over the relay channel and
// over the store-and-forward path, with loopback media.

use async_trait::async_trait;
use callwire::calls::{
    CallError, CallEvent, CallManager, LoopbackMediaEngine, LoopbackMediaFactory,
    LoopbackOptions, MediaConnectionState,
};
use callwire::config::CallConfig;
use callwire::handshake::accept_handshake;
use callwire::relay::RelayHub;
use callwire::store::{MemorySignalStore, SignalStore};
use callwire::transport::{
    RelayConnector, StalledConnector, Transport, TransportFactory, TransportHalf, memory_pair,
};
use callwire::{MediaMode, PeerId, SessionId};
use cwcore::call::{CallRole, CallState, TransportMode};
use cwcore::handshake::DhParams;
use cwcore::messages::{IceCandidate, SignalMessage};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{Instant, sleep, timeout};

fn config() -> CallConfig {
    CallConfig {
        handshake_timeout: Duration::from_secs(3),
        poll_interval: Duration::from_millis(1500),
        ..Default::default()
    }
}

struct Peer {
    id: PeerId,
    manager: CallManager,
    events: UnboundedReceiver<CallEvent>,
    media: Arc<LoopbackMediaFactory>,
}

fn peer(name: &str, store: &Arc<MemorySignalStore>, options: LoopbackOptions) -> Peer {
    let media = Arc::new(LoopbackMediaFactory::new(name, options));
    let (manager, events) =
        CallManager::new(PeerId::new(name), store.clone(), media.clone(), config()).unwrap();
    Peer {
        id: PeerId::new(name),
        manager,
        events,
        media,
    }
}

impl Peer {
    async fn watch(&self, session: &SessionId, remote: &Peer, connector: Arc<dyn TransportFactory>) {
        self.manager
            .watch(session.clone(), remote.id.clone(), connector)
            .await
            .unwrap();
    }

    async fn next_event(&mut self, pred: impl Fn(&CallEvent) -> bool) -> CallEvent {
        let events = &mut self.events;
        timeout(Duration::from_secs(300), async {
            loop {
                let event = events.recv().await.expect("event stream closed");
                if pred(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("timed out waiting for an event")
    }

    async fn reached(&mut self, state: CallState) {
        self.next_event(|e| matches!(e, CallEvent::StateChanged { to, .. } if *to == state))
            .await;
    }

    fn engine_for(&self, session: &SessionId, remote: &PeerId) -> Arc<LoopbackMediaEngine> {
        self.media.engine(session, remote).expect("no media engine yet")
    }
}

fn is_incoming(event: &CallEvent) -> bool {
    matches!(event, CallEvent::IncomingCall { .. })
}

async fn inject(store: &MemorySignalStore, session: &SessionId, from: &PeerId, to: &PeerId, msg: SignalMessage) {
    store
        .put(session, from, Some(to), msg.to_json().unwrap())
        .await
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_stalled_handshake_falls_back_and_rings() {
    let _ = env_logger::builder().is_test(true).try_init();
    let store = Arc::new(MemorySignalStore::new());
    let session = SessionId::new("chat-1");
    let mut alice = peer("alice", &store, LoopbackOptions::default());
    let mut bob = peer("bob", &store, LoopbackOptions::default());
    alice.watch(&session, &bob, Arc::new(StalledConnector)).await;
    bob.watch(&session, &alice, Arc::new(StalledConnector)).await;

    let started = Instant::now();
    alice
        .manager
        .start_call(&session, &bob.id, MediaMode::AudioOnly)
        .await
        .unwrap();

    let latched = alice
        .next_event(|e| matches!(e, CallEvent::TransportLatched { .. }))
        .await;
    assert!(started.elapsed() >= Duration::from_secs(3));
    assert!(matches!(latched, CallEvent::TransportLatched { .. }));

    let ring = bob.next_event(is_incoming).await;
    assert!(
        started.elapsed() <= Duration::from_millis(4600),
        "offer took {:?}",
        started.elapsed()
    );
    assert!(matches!(
        ring,
        CallEvent::IncomingCall {
            media_mode: MediaMode::AudioOnly,
            ..
        }
    ));

    let snapshot = bob.manager.snapshot(&session, &alice.id).await.unwrap();
    assert_eq!(snapshot.state, CallState::Ringing);
    assert_eq!(snapshot.transport_mode, TransportMode::Fallback);

    alice.manager.shutdown().await;
    bob.manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_relay_call_connects_and_hangs_up() {
    let _ = env_logger::builder().is_test(true).try_init();
    let store = Arc::new(MemorySignalStore::new());
    let hub = RelayHub::new(store.clone(), config());
    let session = SessionId::new("chat-1");
    let mut alice = peer("alice", &store, LoopbackOptions::default());
    let mut bob = peer("bob", &store, LoopbackOptions::default());
    let relay = |me: &Peer| -> Arc<dyn TransportFactory> {
        Arc::new(RelayConnector::new(hub.clone(), session.clone(), me.id.clone()))
    };
    alice.watch(&session, &bob, relay(&alice)).await;
    bob.watch(&session, &alice, relay(&bob)).await;

    alice
        .manager
        .start_call(&session, &bob.id, MediaMode::AudioVideo)
        .await
        .unwrap();
    alice
        .next_event(|e| matches!(e, CallEvent::Ringback { active: true, .. }))
        .await;

    bob.next_event(is_incoming).await;
    bob.manager.accept(&session, &alice.id).await.unwrap();
    bob.reached(CallState::Connected).await;
    alice.reached(CallState::Connected).await;

    let snapshot = alice.manager.snapshot(&session, &bob.id).await.unwrap();
    assert_eq!(snapshot.transport_mode, TransportMode::Primary);
    assert_eq!(snapshot.role, Some(CallRole::Caller));
    assert_eq!(snapshot.media_mode, MediaMode::AudioVideo);
    let bob_engine = bob.engine_for(&session, &alice.id);
    assert_eq!(bob_engine.local_media(), Some(MediaMode::AudioVideo));

    alice.manager.hang_up(&session, &bob.id).await.unwrap();
    bob.reached(CallState::Ended).await;

    // The registry replaced both finished sessions with idle ones.
    let snapshot = bob.manager.snapshot(&session, &alice.id).await.unwrap();
    assert_eq!(snapshot.state, CallState::Idle);
    assert!(bob_engine.is_closed());
    assert!(matches!(
        alice.manager.hang_up(&session, &bob.id).await,
        Err(CallError::NoActiveCall)
    ));

    alice.manager.shutdown().await;
    bob.manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_decline_suppresses_resent_offer() {
    let _ = env_logger::builder().is_test(true).try_init();
    let store = Arc::new(MemorySignalStore::new());
    let session = SessionId::new("chat-1");
    let mut alice = peer("alice", &store, LoopbackOptions::default());
    let mut bob = peer("bob", &store, LoopbackOptions::default());
    alice.watch(&session, &bob, Arc::new(StalledConnector)).await;
    bob.watch(&session, &alice, Arc::new(StalledConnector)).await;

    alice
        .manager
        .start_call(&session, &bob.id, MediaMode::AudioOnly)
        .await
        .unwrap();
    let offer_sdp = alice
        .engine_for(&session, &bob.id)
        .last_offer()
        .expect("offer was created");

    bob.next_event(is_incoming).await;
    bob.manager.decline(&session, &alice.id).await.unwrap();
    alice.reached(CallState::Ended).await;

    let snapshot = bob.manager.snapshot(&session, &alice.id).await.unwrap();
    assert_eq!(snapshot.state, CallState::Idle);
    assert!(snapshot.suppressed);

    // A straggling copy of the same offer inside the cooldown.
    inject(
        &store,
        &session,
        &alice.id,
        &bob.id,
        SignalMessage::offer(offer_sdp, MediaMode::AudioOnly),
    )
    .await;
    sleep(Duration::from_secs(4)).await;
    while let Ok(event) = bob.events.try_recv() {
        assert!(!is_incoming(&event), "suppressed offer rang: {event:?}");
    }
    assert!(store.poll(&session, &bob.id).await.unwrap().is_empty());

    // Once the cooldown is over a new call rings again.
    sleep(Duration::from_secs(20)).await;
    assert!(!bob.manager.snapshot(&session, &alice.id).await.unwrap().suppressed);
    alice
        .manager
        .start_call(&session, &bob.id, MediaMode::AudioOnly)
        .await
        .unwrap();
    bob.next_event(is_incoming).await;

    alice.manager.shutdown().await;
    bob.manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_offer_rings_once() {
    let _ = env_logger::builder().is_test(true).try_init();
    let store = Arc::new(MemorySignalStore::new());
    let session = SessionId::new("chat-1");
    let alice = PeerId::new("alice");
    let mut bob = peer("bob", &store, LoopbackOptions::default());
    bob.manager
        .watch(session.clone(), alice.clone(), Arc::new(StalledConnector))
        .await
        .unwrap();

    let offer = SignalMessage::offer("v=0\r\no=alice 1 1 IN IP4 127.0.0.1\r\n", MediaMode::AudioOnly);
    inject(&store, &session, &alice, &bob.id, offer.clone()).await;
    inject(&store, &session, &alice, &bob.id, offer.clone()).await;

    bob.next_event(is_incoming).await;
    inject(&store, &session, &alice, &bob.id, offer).await;
    sleep(Duration::from_secs(5)).await;

    let mut rings = 0;
    while let Ok(event) = bob.events.try_recv() {
        if is_incoming(&event) {
            rings += 1;
        }
    }
    assert_eq!(rings, 0);
    let snapshot = bob.manager.snapshot(&session, &alice).await.unwrap();
    assert_eq!(snapshot.state, CallState::Ringing);

    bob.manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_early_candidates_applied_in_arrival_order() {
    let _ = env_logger::builder().is_test(true).try_init();
    let store = Arc::new(MemorySignalStore::new());
    let session = SessionId::new("chat-1");
    let alice = PeerId::new("alice");
    let mut bob = peer("bob", &store, LoopbackOptions::default());
    bob.manager
        .watch(session.clone(), alice.clone(), Arc::new(StalledConnector))
        .await
        .unwrap();

    let candidate = |n: u32| IceCandidate::new(format!("candidate:{n} 1 UDP 2130706431 10.0.0.{n} 9 typ host"));
    let ice = |n: u32| SignalMessage::Ice {
        candidate: candidate(n),
    };
    let offer = SignalMessage::offer("v=0\r\no=alice 7 1 IN IP4 10.0.0.1\r\n", MediaMode::AudioOnly);
    for msg in [ice(1), ice(2), offer, ice(3)] {
        inject(&store, &session, &alice, &bob.id, msg).await;
    }

    bob.next_event(is_incoming).await;
    assert_eq!(
        bob.manager.snapshot(&session, &alice).await.unwrap().pending_ice,
        3
    );
    bob.manager.accept(&session, &alice).await.unwrap();
    let engine = bob.engine_for(&session, &alice);
    assert_eq!(
        engine.applied_candidates(),
        vec![candidate(1), candidate(2), candidate(3)]
    );

    // A repeat is dropped; a new one is applied right away.
    inject(&store, &session, &alice, &bob.id, ice(2)).await;
    inject(&store, &session, &alice, &bob.id, ice(4)).await;
    sleep(Duration::from_secs(2)).await;
    assert_eq!(
        engine.applied_candidates(),
        vec![candidate(1), candidate(2), candidate(3), candidate(4)]
    );
    assert_eq!(
        bob.manager.snapshot(&session, &alice).await.unwrap().pending_ice,
        0
    );

    bob.manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_exhaustion_fails_the_call() {
    let _ = env_logger::builder().is_test(true).try_init();
    let store = Arc::new(MemorySignalStore::new());
    let session = SessionId::new("chat-1");
    let manual = LoopbackOptions {
        auto_connect: false,
        ..Default::default()
    };
    let mut alice = peer("alice", &store, manual);
    let mut bob = peer("bob", &store, LoopbackOptions::default());
    alice.watch(&session, &bob, Arc::new(StalledConnector)).await;
    bob.watch(&session, &alice, Arc::new(StalledConnector)).await;

    alice
        .manager
        .start_call(&session, &bob.id, MediaMode::AudioOnly)
        .await
        .unwrap();
    let engine = alice.engine_for(&session, &bob.id);
    bob.next_event(is_incoming).await;
    bob.manager.accept(&session, &alice.id).await.unwrap();

    while engine.remote_description().is_none() {
        sleep(Duration::from_millis(250)).await;
    }
    engine.inject_state(MediaConnectionState::Connected);
    alice.reached(CallState::Connected).await;

    engine.inject_state(MediaConnectionState::Failed);
    let failed = alice
        .next_event(|e| matches!(e, CallEvent::CallFailed { .. }))
        .await;
    let CallEvent::CallFailed { error, .. } = failed else {
        unreachable!()
    };
    assert!(error.contains("3 renegotiation attempts"), "{error}");
    alice.reached(CallState::Failed).await;

    assert_eq!(engine.restart_offers(), 3);
    sleep(Duration::from_secs(60)).await;
    assert_eq!(engine.restart_offers(), 3);
    assert!(engine.is_closed());

    bob.reached(CallState::Ended).await;

    alice.manager.shutdown().await;
    bob.manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_store_outage_is_retried() {
    let _ = env_logger::builder().is_test(true).try_init();
    let store = Arc::new(MemorySignalStore::new());
    let session = SessionId::new("chat-1");
    let alice = peer("alice", &store, LoopbackOptions::default());
    let mut bob = peer("bob", &store, LoopbackOptions::default());
    alice.watch(&session, &bob, Arc::new(StalledConnector)).await;
    bob.watch(&session, &alice, Arc::new(StalledConnector)).await;

    store.set_available(false);
    alice
        .manager
        .start_call(&session, &bob.id, MediaMode::AudioOnly)
        .await
        .unwrap();
    sleep(Duration::from_secs(6)).await;
    assert_eq!(store.record_count(), 0);
    assert_eq!(
        alice.manager.snapshot(&session, &bob.id).await.unwrap().state,
        CallState::Offering
    );

    store.set_available(true);
    bob.next_event(is_incoming).await;

    alice.manager.shutdown().await;
    bob.manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_call_times_out() {
    let _ = env_logger::builder().is_test(true).try_init();
    let store = Arc::new(MemorySignalStore::new());
    let session = SessionId::new("chat-1");
    let mut alice = peer("alice", &store, LoopbackOptions::default());
    let mut bob = peer("bob", &store, LoopbackOptions::default());
    alice.watch(&session, &bob, Arc::new(StalledConnector)).await;
    bob.watch(&session, &alice, Arc::new(StalledConnector)).await;

    let started = Instant::now();
    alice
        .manager
        .start_call(&session, &bob.id, MediaMode::AudioOnly)
        .await
        .unwrap();
    bob.next_event(is_incoming).await;

    alice.reached(CallState::Ended).await;
    assert!(started.elapsed() >= config().ring_timeout);
    alice
        .next_event(|e| matches!(e, CallEvent::Ringback { active: false, .. }))
        .await;
    bob.reached(CallState::Ended).await;

    alice.manager.shutdown().await;
    bob.manager.shutdown().await;
}

#[tokio::test]
async fn test_denied_media_fails_synchronously() {
    let store = Arc::new(MemorySignalStore::new());
    let session = SessionId::new("chat-1");
    let denied = LoopbackOptions {
        deny_media: true,
        ..Default::default()
    };
    let mut alice = peer("alice", &store, denied);
    let bob = PeerId::new("bob");
    alice
        .manager
        .watch(session.clone(), bob.clone(), Arc::new(StalledConnector))
        .await
        .unwrap();

    let err = alice
        .manager
        .start_call(&session, &bob, MediaMode::AudioVideo)
        .await
        .unwrap_err();
    assert!(matches!(err, CallError::Negotiation(_)));
    alice.reached(CallState::Failed).await;

    alice.manager.shutdown().await;
}

/// Places a call where only one side's handshake stalls; the other side
/// keeps its relay channel and still has to hear everything sent through
/// the store.
async fn call_with_one_side_stalled(caller_stalled: bool) {
    let _ = env_logger::builder().is_test(true).try_init();
    let store = Arc::new(MemorySignalStore::new());
    let hub = RelayHub::new(store.clone(), config());
    let session = SessionId::new("chat-1");
    let mut alice = peer("alice", &store, LoopbackOptions::default());
    let mut bob = peer("bob", &store, LoopbackOptions::default());
    let connector = |me: &Peer, stalled: bool| -> Arc<dyn TransportFactory> {
        if stalled {
            Arc::new(StalledConnector)
        } else {
            Arc::new(RelayConnector::new(hub.clone(), session.clone(), me.id.clone()))
        }
    };
    alice.watch(&session, &bob, connector(&alice, caller_stalled)).await;
    bob.watch(&session, &alice, connector(&bob, !caller_stalled)).await;

    alice
        .manager
        .start_call(&session, &bob.id, MediaMode::AudioOnly)
        .await
        .unwrap();
    bob.next_event(is_incoming).await;
    bob.manager.accept(&session, &alice.id).await.unwrap();
    bob.reached(CallState::Connected).await;
    alice.reached(CallState::Connected).await;

    let (stalled_mode, relayed_mode) = if caller_stalled {
        (TransportMode::Fallback, TransportMode::Primary)
    } else {
        (TransportMode::Primary, TransportMode::Fallback)
    };
    let caller = alice.manager.snapshot(&session, &bob.id).await.unwrap();
    let callee = bob.manager.snapshot(&session, &alice.id).await.unwrap();
    assert_eq!(caller.transport_mode, stalled_mode);
    assert_eq!(callee.transport_mode, relayed_mode);

    bob.manager.hang_up(&session, &alice.id).await.unwrap();
    alice.reached(CallState::Ended).await;

    alice.manager.shutdown().await;
    bob.manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_stalled_caller_reaches_relayed_callee() {
    call_with_one_side_stalled(true).await;
}

#[tokio::test(start_paused = true)]
async fn test_relayed_caller_reaches_stalled_callee() {
    call_with_one_side_stalled(false).await;
}

/// A relay endpoint that completes the key exchange and then, on the first
/// dial only, sends frames that cannot be decrypted.
struct GarblingRelay {
    config: CallConfig,
    garbage_frames: u32,
    dials: AtomicU32,
}

#[async_trait]
impl TransportFactory for GarblingRelay {
    async fn create_transport(&self) -> Result<TransportHalf, anyhow::Error> {
        let garbage = if self.dials.fetch_add(1, Ordering::SeqCst) == 0 {
            self.garbage_frames
        } else {
            0
        };
        let (client, (server, mut server_rx)) = memory_pair();
        let config = self.config.clone();
        tokio::spawn(async move {
            let Ok(_socket) =
                accept_handshake(server.clone(), &mut server_rx, DhParams::default(), &config).await
            else {
                return;
            };
            for _ in 0..garbage {
                if server.send(b"not an envelope").await.is_err() {
                    return;
                }
            }
            while server_rx.recv().await.is_some() {}
        });
        Ok(client)
    }
}

#[tokio::test(start_paused = true)]
async fn test_undecryptable_frames_fail_the_session() {
    let _ = env_logger::builder().is_test(true).try_init();
    let store = Arc::new(MemorySignalStore::new());
    let session = SessionId::new("chat-1");
    let mut alice = peer("alice", &store, LoopbackOptions::default());
    let bob = PeerId::new("bob");
    let tolerance = config().codec_failure_tolerance;
    let relay = Arc::new(GarblingRelay {
        config: config(),
        garbage_frames: tolerance + 1,
        dials: AtomicU32::new(0),
    });
    alice
        .manager
        .watch(session.clone(), bob.clone(), relay.clone())
        .await
        .unwrap();

    let failed = alice
        .next_event(|e| matches!(e, CallEvent::CallFailed { .. }))
        .await;
    let CallEvent::CallFailed { error, .. } = failed else {
        unreachable!()
    };
    assert_eq!(error, CallError::Codec(tolerance + 1).to_string());
    alice.reached(CallState::Failed).await;

    // The replacement session dials again and starts out idle.
    let snapshot = alice.manager.snapshot(&session, &bob).await.unwrap();
    assert_eq!(snapshot.state, CallState::Idle);
    assert_eq!(snapshot.transport_mode, TransportMode::Primary);
    while relay.dials.load(Ordering::SeqCst) < 2 {
        sleep(Duration::from_millis(100)).await;
    }

    alice.manager.shutdown().await;
}
