//! Application messages carried inside an envelope on the duplex channel,
//! or as the plaintext payload of a store record on the fallback path.

use crate::types::MediaMode;
use serde::{Deserialize, Serialize};

/// A network path proposed by the local media engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    /// e.g. "candidate:1 1 UDP 2130706431 192.168.1.1 8888 typ host"
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        default,
        rename = "sdpMLineIndex",
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_m_line_index: Option<u16>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_m_line_index: None,
        }
    }

    pub fn with_sdp_mid(mut self, sdp_mid: impl Into<String>) -> Self {
        self.sdp_mid = Some(sdp_mid.into());
        self
    }

    pub fn with_sdp_m_line_index(mut self, index: u16) -> Self {
        self.sdp_m_line_index = Some(index);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalMessage {
    #[serde(rename_all = "camelCase")]
    Offer {
        sdp: String,
        #[serde(default)]
        media_mode: MediaMode,
        /// Set on renegotiation offers sent after connectivity was lost.
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        restart: bool,
    },
    Answer {
        sdp: String,
    },
    Ice {
        candidate: IceCandidate,
    },
    End {},
}

impl SignalMessage {
    pub fn offer(sdp: impl Into<String>, media_mode: MediaMode) -> Self {
        Self::Offer {
            sdp: sdp.into(),
            media_mode,
            restart: false,
        }
    }

    pub fn restart_offer(sdp: impl Into<String>, media_mode: MediaMode) -> Self {
        Self::Offer {
            sdp: sdp.into(),
            media_mode,
            restart: true,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::Ice { .. } => "ice",
            Self::End {} => "end",
        }
    }

    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_json(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_offer_wire_shape() {
        let msg = SignalMessage::offer("v=0", MediaMode::AudioVideo);
        let value: serde_json::Value = serde_json::from_slice(&msg.to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"type": "offer", "sdp": "v=0", "mediaMode": "audio_video"})
        );
    }

    #[test]
    fn test_offer_defaults() {
        let msg = SignalMessage::from_json(br#"{"type":"offer","sdp":"v=0"}"#).unwrap();
        assert_eq!(msg, SignalMessage::offer("v=0", MediaMode::AudioOnly));

        let restart =
            SignalMessage::from_json(br#"{"type":"offer","sdp":"v=0","restart":true}"#).unwrap();
        assert!(matches!(restart, SignalMessage::Offer { restart: true, .. }));
    }

    #[test]
    fn test_ice_and_end() {
        let ice = SignalMessage::Ice {
            candidate: IceCandidate::new("candidate:1 1 UDP 1 10.0.0.1 9 typ host")
                .with_sdp_mid("0")
                .with_sdp_m_line_index(0),
        };
        let value: serde_json::Value = serde_json::from_slice(&ice.to_json().unwrap()).unwrap();
        assert_eq!(value["candidate"]["sdpMLineIndex"], 0);
        assert_eq!(value["candidate"]["sdpMid"], "0");
        assert_eq!(SignalMessage::from_json(&ice.to_json().unwrap()).unwrap(), ice);

        assert_eq!(
            SignalMessage::from_json(br#"{"type":"end"}"#).unwrap(),
            SignalMessage::End {}
        );
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        assert!(SignalMessage::from_json(br#"{"type":"hangup"}"#).is_err());
    }
}
