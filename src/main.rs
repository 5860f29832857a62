use anyhow::{Context, Result};
use callwire::calls::{CallEvent, CallManager, LoopbackMediaFactory, LoopbackOptions};
use callwire::config::CallConfig;
use callwire::handshake::do_handshake;
use callwire::relay::RelayHub;
use callwire::store::MemorySignalStore;
use callwire::transport::{
    RelayConnector, StalledConnector, TokioWebSocketTransportFactory, TransportFactory,
};
use callwire::{MediaMode, PeerId, SessionId};
use chrono::Local;
use clap::{Parser, Subcommand};
use cwcore::call::CallState;
use log::{info, warn};
use std::sync::Arc;
use std::time::Duration;

// Usage:
//   cargo run -- demo                          # two peers, relay path
//   cargo run -- demo --fail-primary           # relay unreachable, store path
//   cargo run -- demo --decline --video
//   cargo run -- handshake --url ws://127.0.0.1:8080/relay

#[derive(Parser, Debug)]
#[command(name = "callwire", about = "Dual-path call signaling")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the key exchange against a WebSocket relay and print the key id.
    Handshake {
        #[arg(long)]
        url: String,
        #[arg(long, default_value_t = 8000)]
        handshake_timeout_ms: u64,
    },
    /// Place a call between two in-process peers and print every event.
    Demo {
        /// Make the relay unreachable so both peers latch to the store.
        #[arg(long)]
        fail_primary: bool,
        /// Have the callee decline instead of accepting.
        #[arg(long)]
        decline: bool,
        #[arg(long)]
        video: bool,
        #[arg(long, default_value_t = 3000)]
        handshake_timeout_ms: u64,
        #[arg(long, default_value_t = 1500)]
        poll_interval_ms: u64,
        /// How long to stay connected before hanging up.
        #[arg(long, default_value_t = 2000)]
        hold_ms: u64,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            use std::io::Write;
            writeln!(
                buf,
                "{} [{:<5}] [{}] - {}",
                Local::now().format("%H:%M:%S"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    rt.block_on(async {
        match cli.command {
            Command::Handshake {
                url,
                handshake_timeout_ms,
            } => run_handshake(url, handshake_timeout_ms).await,
            Command::Demo {
                fail_primary,
                decline,
                video,
                handshake_timeout_ms,
                poll_interval_ms,
                hold_ms,
            } => {
                let config = CallConfig {
                    handshake_timeout: Duration::from_millis(handshake_timeout_ms),
                    poll_interval: Duration::from_millis(poll_interval_ms),
                    ..Default::default()
                };
                let media_mode = if video {
                    MediaMode::AudioVideo
                } else {
                    MediaMode::AudioOnly
                };
                run_demo(config, fail_primary, decline, media_mode, hold_ms).await
            }
        }
    })
}

async fn run_handshake(url: String, handshake_timeout_ms: u64) -> Result<()> {
    let config = CallConfig {
        handshake_timeout: Duration::from_millis(handshake_timeout_ms),
        ..Default::default()
    };
    config.validate()?;
    let factory = TokioWebSocketTransportFactory::new(url);
    let (transport, mut events) = factory.create_transport().await?;
    let socket = do_handshake(transport, &mut events, &config).await?;
    println!("{}", socket.auth_key_id_hex());
    socket.close().await;
    Ok(())
}

fn print_event(side: &str, event: &CallEvent) {
    match serde_json::to_string(event) {
        Ok(json) => println!("{side}: {json}"),
        Err(e) => warn!("Could not render event: {e}"),
    }
}

async fn run_demo(
    config: CallConfig,
    fail_primary: bool,
    decline: bool,
    media_mode: MediaMode,
    hold_ms: u64,
) -> Result<()> {
    let store = Arc::new(MemorySignalStore::new());
    let hub = RelayHub::new(store.clone(), config.clone());
    let session = SessionId::new("demo-chat");
    let alice_id = PeerId::new("alice");
    let bob_id = PeerId::new("bob");

    let connector = |local: &PeerId| -> Arc<dyn TransportFactory> {
        if fail_primary {
            Arc::new(StalledConnector)
        } else {
            Arc::new(RelayConnector::new(
                hub.clone(),
                session.clone(),
                local.clone(),
            ))
        }
    };

    let (alice, mut alice_events) = CallManager::new(
        alice_id.clone(),
        store.clone(),
        Arc::new(LoopbackMediaFactory::new("alice", LoopbackOptions::default())),
        config.clone(),
    )?;
    let (bob, mut bob_events) = CallManager::new(
        bob_id.clone(),
        store.clone(),
        Arc::new(LoopbackMediaFactory::new("bob", LoopbackOptions::default())),
        config,
    )?;
    alice
        .watch(session.clone(), bob_id.clone(), connector(&alice_id))
        .await?;
    bob.watch(session.clone(), alice_id.clone(), connector(&bob_id))
        .await?;

    info!("alice is calling bob ({media_mode})");
    alice.start_call(&session, &bob_id, media_mode).await?;

    let deadline = tokio::time::sleep(Duration::from_secs(60));
    tokio::pin!(deadline);
    let mut hold: Option<std::pin::Pin<Box<tokio::time::Sleep>>> = None;

    let outcome = loop {
        tokio::select! {
            Some(event) = alice_events.recv() => {
                print_event("alice", &event);
                match event {
                    CallEvent::StateChanged { to: CallState::Connected, .. } if hold.is_none() => {
                        hold = Some(Box::pin(tokio::time::sleep(Duration::from_millis(hold_ms))));
                    }
                    CallEvent::StateChanged { to: CallState::Ended | CallState::Failed, .. } => {
                        break Ok(());
                    }
                    _ => {}
                }
            }
            Some(event) = bob_events.recv() => {
                print_event("bob", &event);
                if let CallEvent::IncomingCall { .. } = event {
                    if decline {
                        bob.decline(&session, &alice_id).await?;
                    } else {
                        bob.accept(&session, &alice_id).await?;
                    }
                }
            }
            _ = async { if let Some(h) = hold.as_mut() { h.await } else { std::future::pending().await } } => {
                info!("alice hangs up");
                alice.hang_up(&session, &bob_id).await?;
                hold = None;
            }
            _ = &mut deadline => break Err(anyhow::anyhow!("demo did not finish in time")),
        }
    };

    // Let the far side observe the end before tearing everything down.
    tokio::time::sleep(Duration::from_millis(200)).await;
    while let Ok(event) = bob_events.try_recv() {
        print_event("bob", &event);
    }
    alice.shutdown().await;
    bob.shutdown().await;

    outcome
}
