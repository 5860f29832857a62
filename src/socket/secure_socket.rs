use crate::socket::error::{Result, SocketError};
use crate::transport::Transport;
use chrono::Utc;
use cwcore::codec::{self, MessageSequencer, WireEnvelope};
use cwcore::handshake::AuthKey;
use cwcore::messages::SignalMessage;
use log::{trace, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use tokio::sync::Mutex;

/// An established duplex channel bound to the key of one handshake.
///
/// Outbound frames are sealed in send order: the sequencer lock is held
/// across the transport write.
pub struct SecureSocket {
    transport: Arc<dyn Transport>,
    auth_key: AuthKey,
    sequencer: Mutex<MessageSequencer>,
    codec_failures: AtomicU32,
    codec_failure_tolerance: u32,
    closed: AtomicBool,
}

impl SecureSocket {
    pub fn new(
        transport: Arc<dyn Transport>,
        auth_key: AuthKey,
        codec_failure_tolerance: u32,
    ) -> Self {
        Self {
            transport,
            auth_key,
            sequencer: Mutex::new(MessageSequencer::new()),
            codec_failures: AtomicU32::new(0),
            codec_failure_tolerance,
            closed: AtomicBool::new(false),
        }
    }

    pub fn auth_key_id_hex(&self) -> String {
        self.auth_key.id_hex()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub async fn send_message(&self, msg: &SignalMessage) -> Result<()> {
        let payload = msg.to_json()?;
        self.send_payload(&payload).await
    }

    pub async fn send_payload(&self, payload: &[u8]) -> Result<()> {
        if self.is_closed() {
            return Err(SocketError::SocketClosed);
        }
        let mut sequencer = self.sequencer.lock().await;
        let header = sequencer.next_header(Utc::now());
        let envelope = codec::encrypt(&self.auth_key, header, payload)?;
        trace!(
            target: "Call/Socket",
            "--> frame seq={} msg_id={:#x} ({} bytes)",
            header.sequence,
            header.message_id,
            payload.len()
        );
        self.transport.send(envelope.to_text().as_bytes()).await?;
        Ok(())
    }

    /// Unwraps one inbound frame. Codec failures are counted; any success
    /// resets the count.
    pub fn open_frame(&self, data: &[u8]) -> Result<Vec<u8>> {
        let opened =
            WireEnvelope::from_text(data).and_then(|env| codec::decrypt(&self.auth_key, &env));
        match opened {
            Ok(frame) => {
                self.codec_failures.store(0, Ordering::Release);
                Ok(frame.payload)
            }
            Err(e) => {
                let failures = self.codec_failures.fetch_add(1, Ordering::AcqRel) + 1;
                warn!(
                    target: "Call/Socket",
                    "Discarding undecryptable frame ({failures}/{}): {e}",
                    self.codec_failure_tolerance
                );
                Err(e.into())
            }
        }
    }

    pub fn decode_message(&self, data: &[u8]) -> Result<SignalMessage> {
        let payload = self.open_frame(data)?;
        Ok(SignalMessage::from_json(&payload)?)
    }

    pub fn codec_failures(&self) -> u32 {
        self.codec_failures.load(Ordering::Acquire)
    }

    /// True once consecutive codec failures went past the tolerance.
    pub fn tolerance_exceeded(&self) -> bool {
        self.codec_failures() > self.codec_failure_tolerance
    }

    pub async fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.transport.disconnect().await;
        }
    }
}
