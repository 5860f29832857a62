use crate::clock;
use crate::config::CallConfig;
use crate::socket::SecureSocket;
use crate::transport::{Transport, TransportEvent};
use cwcore::handshake::{
    DhParams, HandshakeError as CoreHandshakeError, HandshakeMessage, HandshakeState,
    HandshakeStep, ResponderState, ResponderStep,
};
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{Instant, timeout, timeout_at};

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("Transport error: {0}")]
    Transport(#[from] anyhow::Error),
    #[error("Core handshake error: {0}")]
    Core(#[from] CoreHandshakeError),
    #[error("Timed out waiting for handshake response")]
    Timeout,
    #[error("Unexpected event during handshake: {0}")]
    UnexpectedEvent(String),
}

type Result<T> = std::result::Result<T, HandshakeError>;

async fn send_message(transport: &Arc<dyn Transport>, msg: &HandshakeMessage) -> Result<()> {
    let bytes = msg.to_json()?;
    debug!(target: "Call/Handshake", "--> {}", msg.kind());
    transport.send(&bytes).await?;
    Ok(())
}

async fn next_message(
    transport_events: &mut mpsc::Receiver<TransportEvent>,
) -> Result<HandshakeMessage> {
    loop {
        match transport_events.recv().await {
            Some(TransportEvent::DataReceived(data)) => {
                let msg = HandshakeMessage::from_json(&data)?;
                debug!(target: "Call/Handshake", "<-- {}", msg.kind());
                return Ok(msg);
            }
            Some(TransportEvent::Connected) => continue,
            Some(TransportEvent::Disconnected) | None => {
                return Err(HandshakeError::UnexpectedEvent(
                    "Disconnected during handshake".to_string(),
                ));
            }
        }
    }
}

/// Runs the initiating side of the key exchange. The whole exchange races
/// `config.handshake_timeout`; whichever finishes first wins.
pub async fn do_handshake(
    transport: Arc<dyn Transport>,
    transport_events: &mut mpsc::Receiver<TransportEvent>,
    config: &CallConfig,
) -> Result<SecureSocket> {
    let deadline = Instant::now() + config.handshake_timeout;
    do_handshake_until(transport, transport_events, config, deadline).await
}

/// Like [`do_handshake`], but bounded by a deadline that may already have
/// been partly spent, for example on dialing.
pub async fn do_handshake_until(
    transport: Arc<dyn Transport>,
    transport_events: &mut mpsc::Receiver<TransportEvent>,
    config: &CallConfig,
    deadline: Instant,
) -> Result<SecureSocket> {
    let remaining = deadline.saturating_duration_since(Instant::now());
    let run = run_initiator(&transport, transport_events, remaining);
    let auth_key = match timeout_at(deadline, run).await {
        Ok(result) => result?,
        Err(_) => return Err(HandshakeError::Timeout),
    };

    info!(
        target: "Call/Handshake",
        "Handshake complete, auth key id {}",
        auth_key.id_hex()
    );
    Ok(SecureSocket::new(
        transport,
        auth_key,
        config.codec_failure_tolerance,
    ))
}

async fn run_initiator(
    transport: &Arc<dyn Transport>,
    transport_events: &mut mpsc::Receiver<TransportEvent>,
    bound: Duration,
) -> Result<cwcore::handshake::AuthKey> {
    let mut state = HandshakeState::initiate(bound, clock::now());
    send_message(transport, &state.build_req_dh_params()).await?;

    loop {
        let msg = next_message(transport_events).await?;
        match state.handle_message(msg, clock::now())? {
            HandshakeStep::Send(reply) => send_message(transport, &reply).await?,
            HandshakeStep::Complete(auth_key) => return Ok(auth_key),
        }
    }
}

/// Runs the responding side of the key exchange, bounded the same way.
/// Failures are answered with an `error` message before returning.
pub async fn accept_handshake(
    transport: Arc<dyn Transport>,
    transport_events: &mut mpsc::Receiver<TransportEvent>,
    params: DhParams,
    config: &CallConfig,
) -> Result<SecureSocket> {
    let run = run_responder(&transport, transport_events, params);
    let auth_key = match timeout(config.handshake_timeout, run).await {
        Ok(result) => result?,
        Err(_) => return Err(HandshakeError::Timeout),
    };
    Ok(SecureSocket::new(
        transport,
        auth_key,
        config.codec_failure_tolerance,
    ))
}

async fn run_responder(
    transport: &Arc<dyn Transport>,
    transport_events: &mut mpsc::Receiver<TransportEvent>,
    params: DhParams,
) -> Result<cwcore::handshake::AuthKey> {
    let mut state = ResponderState::new(params);
    loop {
        let step = match next_message(transport_events).await {
            Ok(msg) => state.handle_message(msg).map_err(HandshakeError::from),
            Err(e) => Err(e),
        };
        match step {
            Ok(ResponderStep::Reply(reply)) => send_message(transport, &reply).await?,
            Ok(ResponderStep::Complete { reply, auth_key }) => {
                send_message(transport, &reply).await?;
                return Ok(auth_key);
            }
            Err(HandshakeError::Core(e)) => {
                warn!(target: "Call/Handshake", "Rejecting handshake: {e}");
                let _ = send_message(transport, &ResponderState::error_reply(&e)).await;
                return Err(e.into());
            }
            Err(e) => return Err(e),
        }
    }
}
