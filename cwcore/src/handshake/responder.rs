use super::dh::DhParams;
use super::messages::{HandshakeMessage, Nonce};
use super::utils::{
    AuthKey, HandshakeError, NONCE_LEN, Result, decode_biguint, encode_biguint, nonces_match,
};
use num_bigint::BigUint;
use rand::RngCore;

/// Outcome of feeding one client message into the responder.
#[derive(Debug)]
pub enum ResponderStep {
    Reply(HandshakeMessage),
    Complete {
        reply: HandshakeMessage,
        auth_key: AuthKey,
    },
}

enum Phase {
    AwaitingRequest,
    AwaitingClientParams {
        client_nonce: Nonce,
        server_nonce: Nonce,
        private_exponent: BigUint,
        server_public: BigUint,
    },
    Complete,
    Failed,
}

/// Accepting side of the DH key exchange, used by the relay.
pub struct ResponderState {
    params: DhParams,
    phase: Phase,
}

impl ResponderState {
    pub fn new(params: DhParams) -> Self {
        Self {
            params,
            phase: Phase::AwaitingRequest,
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self.phase, Phase::Complete)
    }

    pub fn handle_message(&mut self, msg: HandshakeMessage) -> Result<ResponderStep> {
        let result = self.handle_inner(msg);
        if result.is_err() {
            self.phase = Phase::Failed;
        }
        result
    }

    /// The message to send back when [`handle_message`](Self::handle_message) fails.
    pub fn error_reply(err: &HandshakeError) -> HandshakeMessage {
        HandshakeMessage::Error {
            message: format!("Handshake error: {err}"),
        }
    }

    fn handle_inner(&mut self, msg: HandshakeMessage) -> Result<ResponderStep> {
        // Any early return leaves the responder failed.
        let phase = std::mem::replace(&mut self.phase, Phase::Failed);
        match (phase, msg) {
            (Phase::AwaitingRequest, HandshakeMessage::ReqDhParams { nonce }) => {
                let mut server_nonce = [0u8; NONCE_LEN];
                rand::rng().fill_bytes(&mut server_nonce);
                let private_exponent = self.params.generate_private_exponent();
                let server_public = self.params.public_value(&private_exponent);

                let reply = HandshakeMessage::ResDhParams {
                    nonce,
                    server_nonce,
                    modulus: encode_biguint(self.params.modulus()),
                    generator: self.generator_u32()?,
                    server_public: encode_biguint(&server_public),
                };
                self.phase = Phase::AwaitingClientParams {
                    client_nonce: nonce,
                    server_nonce,
                    private_exponent,
                    server_public,
                };
                Ok(ResponderStep::Reply(reply))
            }
            (
                Phase::AwaitingClientParams {
                    client_nonce,
                    server_nonce,
                    private_exponent,
                    server_public,
                },
                HandshakeMessage::SetClientDhParams {
                    nonce,
                    server_nonce: echoed_server_nonce,
                    client_public,
                },
            ) => {
                if !nonces_match(&nonce, &client_nonce) {
                    return Err(HandshakeError::Mismatch("set_client_dh_params nonce"));
                }
                if !nonces_match(&echoed_server_nonce, &server_nonce) {
                    return Err(HandshakeError::Mismatch("set_client_dh_params server_nonce"));
                }
                let client_public = decode_biguint("client_public", &client_public)?;
                let shared = self.params.shared_secret(&client_public, &private_exponent)?;
                let auth_key = AuthKey::from_shared_secret(&shared);
                let reply = HandshakeMessage::DhGenOk {
                    server_nonce,
                    server_public: encode_biguint(&server_public),
                };
                self.phase = Phase::Complete;
                Ok(ResponderStep::Complete { reply, auth_key })
            }
            (_, msg) => Err(HandshakeError::UnexpectedMessage(msg.kind().to_string())),
        }
    }

    fn generator_u32(&self) -> Result<u32> {
        u32::try_from(self.params.generator())
            .map_err(|_| HandshakeError::InvalidParams("generator does not fit in u32".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_params_before_request() {
        let mut responder = ResponderState::new(DhParams::default());
        let err = responder
            .handle_message(HandshakeMessage::SetClientDhParams {
                nonce: [0; NONCE_LEN],
                server_nonce: [0; NONCE_LEN],
                client_public: "10".into(),
            })
            .unwrap_err();
        assert_eq!(
            err,
            HandshakeError::UnexpectedMessage("set_client_dh_params".into())
        );
    }

    #[test]
    fn test_checks_echoed_nonces() {
        let mut responder = ResponderState::new(DhParams::default());
        let ResponderStep::Reply(HandshakeMessage::ResDhParams { server_nonce, .. }) = responder
            .handle_message(HandshakeMessage::ReqDhParams { nonce: [5; NONCE_LEN] })
            .unwrap()
        else {
            panic!("expected res_dh_params");
        };

        let err = responder
            .handle_message(HandshakeMessage::SetClientDhParams {
                nonce: [5; NONCE_LEN],
                server_nonce: [server_nonce[0].wrapping_add(1); NONCE_LEN],
                client_public: "1234".into(),
            })
            .unwrap_err();
        assert_eq!(
            err,
            HandshakeError::Mismatch("set_client_dh_params server_nonce")
        );
    }

    #[test]
    fn test_error_reply_carries_reason() {
        let reply = ResponderState::error_reply(&HandshakeError::Mismatch("x"));
        assert_eq!(
            reply,
            HandshakeMessage::Error {
                message: "Handshake error: nonce mismatch in x".into()
            }
        );
    }
}
