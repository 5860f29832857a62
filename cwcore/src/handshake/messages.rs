//! Plaintext messages exchanged before a key is established.

use super::utils::{HandshakeError, Result};
use serde::{Deserialize, Serialize};

pub type Nonce = [u8; super::utils::NONCE_LEN];

/// Handshake message set. Serialized as JSON objects tagged by `type`;
/// nonces travel as arrays of byte values and big integers as lowercase hex.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HandshakeMessage {
    ReqDhParams {
        nonce: Nonce,
    },
    ResDhParams {
        nonce: Nonce,
        server_nonce: Nonce,
        modulus: String,
        generator: u32,
        server_public: String,
    },
    SetClientDhParams {
        nonce: Nonce,
        server_nonce: Nonce,
        client_public: String,
    },
    DhGenOk {
        server_nonce: Nonce,
        server_public: String,
    },
    Error {
        message: String,
    },
}

impl HandshakeMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ReqDhParams { .. } => "req_dh_params",
            Self::ResDhParams { .. } => "res_dh_params",
            Self::SetClientDhParams { .. } => "set_client_dh_params",
            Self::DhGenOk { .. } => "dh_gen_ok",
            Self::Error { .. } => "error",
        }
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| HandshakeError::Encoding(e.to_string()))
    }

    pub fn from_json(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).map_err(|e| HandshakeError::Encoding(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_req_dh_params_wire_shape() {
        let msg = HandshakeMessage::ReqDhParams { nonce: [1; 16] };
        let value: serde_json::Value = serde_json::from_slice(&msg.to_json().unwrap()).unwrap();
        assert_eq!(value, json!({"type": "req_dh_params", "nonce": vec![1u8; 16]}));
    }

    #[test]
    fn test_parses_error_message() {
        let msg =
            HandshakeMessage::from_json(br#"{"type":"error","message":"bad step"}"#).unwrap();
        assert_eq!(
            msg,
            HandshakeMessage::Error {
                message: "bad step".into()
            }
        );
        assert_eq!(msg.kind(), "error");
    }

    #[test]
    fn test_rejects_short_nonce() {
        let err = HandshakeMessage::from_json(br#"{"type":"req_dh_params","nonce":[1,2,3]}"#)
            .unwrap_err();
        assert!(matches!(err, HandshakeError::Encoding(_)));
    }
}
