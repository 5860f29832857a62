use super::dh::DhParams;
use super::messages::{HandshakeMessage, Nonce};
use super::utils::{
    AuthKey, HandshakeError, NONCE_LEN, Result, decode_biguint, encode_biguint, nonces_match,
};
use num_bigint::BigUint;
use rand::RngCore;
use std::time::{Duration, Instant};

/// Outcome of feeding one server message into the handshake.
#[derive(Debug)]
pub enum HandshakeStep {
    /// A message to send back to the server; the handshake continues.
    Send(HandshakeMessage),
    /// The key is established. The state cannot produce another one.
    Complete(AuthKey),
}

enum Phase {
    AwaitingServerParams,
    AwaitingGenOk {
        server_nonce: Nonce,
        params: DhParams,
        private_exponent: BigUint,
    },
    Complete,
    Failed,
}

/// Initiating side of the DH key exchange for one connection attempt.
///
/// A new connection attempt must build a new state; the derived key is handed
/// out exactly once and a failed state never yields key material.
pub struct HandshakeState {
    client_nonce: Nonce,
    started_at: Instant,
    timeout: Duration,
    phase: Phase,
}

impl HandshakeState {
    /// Starts a handshake with a fresh random nonce, bounded by `timeout`
    /// measured from `now`.
    pub fn initiate(timeout: Duration, now: Instant) -> Self {
        let mut client_nonce = [0u8; NONCE_LEN];
        rand::rng().fill_bytes(&mut client_nonce);
        Self {
            client_nonce,
            started_at: now,
            timeout,
            phase: Phase::AwaitingServerParams,
        }
    }

    pub fn client_nonce(&self) -> &Nonce {
        &self.client_nonce
    }

    pub fn build_req_dh_params(&self) -> HandshakeMessage {
        HandshakeMessage::ReqDhParams {
            nonce: self.client_nonce,
        }
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.started_at) > self.timeout
    }

    pub fn is_complete(&self) -> bool {
        matches!(self.phase, Phase::Complete)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.phase, Phase::Failed)
    }

    /// Validates the server's group and public value, draws our private
    /// exponent and returns `g^a mod p`.
    pub fn process_server_params(
        &mut self,
        nonce: &Nonce,
        server_nonce: Nonce,
        modulus: BigUint,
        generator: BigUint,
        server_public: &BigUint,
        now: Instant,
    ) -> Result<BigUint> {
        let result = self.process_server_params_inner(
            nonce,
            server_nonce,
            modulus,
            generator,
            server_public,
            now,
        );
        self.fail_on_error(result)
    }

    fn process_server_params_inner(
        &mut self,
        nonce: &Nonce,
        server_nonce: Nonce,
        modulus: BigUint,
        generator: BigUint,
        server_public: &BigUint,
        now: Instant,
    ) -> Result<BigUint> {
        self.check_deadline(now)?;
        if !matches!(self.phase, Phase::AwaitingServerParams) {
            return Err(HandshakeError::UnexpectedMessage(
                "server params already processed".into(),
            ));
        }
        if !nonces_match(nonce, &self.client_nonce) {
            return Err(HandshakeError::Mismatch("res_dh_params nonce"));
        }

        let params = DhParams::new(modulus, generator)?;
        params.check_public(server_public)?;

        let private_exponent = params.generate_private_exponent();
        let client_public = params.public_value(&private_exponent);
        self.phase = Phase::AwaitingGenOk {
            server_nonce,
            params,
            private_exponent,
        };
        Ok(client_public)
    }

    /// Derives the shared secret from the server's final public value and
    /// returns the auth key.
    pub fn finalize(
        &mut self,
        server_nonce: &Nonce,
        server_public_final: &BigUint,
        now: Instant,
    ) -> Result<AuthKey> {
        let result = self.finalize_inner(server_nonce, server_public_final, now);
        self.fail_on_error(result)
    }

    fn finalize_inner(
        &mut self,
        server_nonce: &Nonce,
        server_public_final: &BigUint,
        now: Instant,
    ) -> Result<AuthKey> {
        self.check_deadline(now)?;
        let Phase::AwaitingGenOk {
            server_nonce: expected_nonce,
            params,
            private_exponent,
        } = &self.phase
        else {
            return Err(HandshakeError::UnexpectedMessage(
                "dh_gen_ok before res_dh_params".into(),
            ));
        };
        if !nonces_match(server_nonce, expected_nonce) {
            return Err(HandshakeError::Mismatch("dh_gen_ok server_nonce"));
        }

        let shared = params.shared_secret(server_public_final, private_exponent)?;
        let auth_key = AuthKey::from_shared_secret(&shared);
        self.phase = Phase::Complete;
        Ok(auth_key)
    }

    /// Feeds one decoded server message through the state machine.
    pub fn handle_message(&mut self, msg: HandshakeMessage, now: Instant) -> Result<HandshakeStep> {
        match msg {
            HandshakeMessage::ResDhParams {
                nonce,
                server_nonce,
                modulus,
                generator,
                server_public,
            } => {
                let decoded = decode_biguint("modulus", &modulus).and_then(|m| {
                    decode_biguint("server_public", &server_public).map(|y| (m, y))
                });
                let (modulus, server_public) = self.fail_on_error(decoded)?;
                let client_public = self.process_server_params(
                    &nonce,
                    server_nonce,
                    modulus,
                    BigUint::from(generator),
                    &server_public,
                    now,
                )?;
                Ok(HandshakeStep::Send(HandshakeMessage::SetClientDhParams {
                    nonce,
                    server_nonce,
                    client_public: encode_biguint(&client_public),
                }))
            }
            HandshakeMessage::DhGenOk {
                server_nonce,
                server_public,
            } => {
                let decoded = decode_biguint("server_public", &server_public);
                let server_public = self.fail_on_error(decoded)?;
                let auth_key = self.finalize(&server_nonce, &server_public, now)?;
                Ok(HandshakeStep::Complete(auth_key))
            }
            HandshakeMessage::Error { message } => {
                self.fail_on_error(Err(HandshakeError::Remote(message)))
            }
            other => self.fail_on_error(Err(HandshakeError::UnexpectedMessage(
                other.kind().to_string(),
            ))),
        }
    }

    fn check_deadline(&self, now: Instant) -> Result<()> {
        if matches!(self.phase, Phase::Failed) {
            return Err(HandshakeError::UnexpectedMessage(
                "handshake already failed".into(),
            ));
        }
        if matches!(self.phase, Phase::Complete) {
            return Err(HandshakeError::UnexpectedMessage(
                "handshake already complete".into(),
            ));
        }
        if self.is_expired(now) {
            return Err(HandshakeError::Timeout);
        }
        Ok(())
    }

    fn fail_on_error<T>(&mut self, result: Result<T>) -> Result<T> {
        if result.is_err() && !matches!(self.phase, Phase::Complete) {
            // Drops the private exponent along with the phase.
            self.phase = Phase::Failed;
        }
        result
    }
}
