//! Wire format for call signaling payloads
//!
//! Messages are tagged JSON. Decoding is total: malformed input becomes a
//! [`Error::SignalingDecode`] for the caller to log and drop, it never
//! panics or leaves partial state behind.

use serde::{Deserialize, Serialize};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use super::SdpKind;
use crate::error::{Error, Result};

/// One signaling payload on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireMessage {
    /// SDP offer
    Offer {
        /// Raw SDP text
        sdp: String,
    },
    /// SDP answer
    Answer {
        /// Raw SDP text
        sdp: String,
    },
    /// Trickled ICE candidate
    Candidate {
        /// Candidate attribute line
        candidate: String,
        /// Media section id
        #[serde(default)]
        sdp_mid: Option<String>,
        /// Media section index
        #[serde(default)]
        sdp_mline_index: Option<u16>,
    },
}

impl WireMessage {
    /// Build an offer or answer message
    pub fn sdp(kind: SdpKind, sdp: impl Into<String>) -> Self {
        match kind {
            SdpKind::Offer => WireMessage::Offer { sdp: sdp.into() },
            SdpKind::Answer => WireMessage::Answer { sdp: sdp.into() },
        }
    }

    /// Build a candidate message from a library candidate
    pub fn from_candidate(init: &RTCIceCandidateInit) -> Self {
        WireMessage::Candidate {
            candidate: init.candidate.clone(),
            sdp_mid: init.sdp_mid.clone(),
            sdp_mline_index: init.sdp_mline_index,
        }
    }

    /// Encode to JSON
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| Error::SignalingDecode(format!("failed to encode message: {}", e)))
    }

    /// Decode from JSON
    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw)
            .map_err(|e| Error::SignalingDecode(format!("malformed message: {}", e)))
    }
}

/// Parse and validate SDP as a remote offer
pub fn offer_description(sdp: &str) -> Result<RTCSessionDescription> {
    RTCSessionDescription::offer(sdp.to_string())
        .map_err(|e| Error::SignalingDecode(format!("invalid offer sdp: {}", e)))
}

/// Parse and validate SDP as a remote answer
pub fn answer_description(sdp: &str) -> Result<RTCSessionDescription> {
    RTCSessionDescription::answer(sdp.to_string())
        .map_err(|e| Error::SignalingDecode(format!("invalid answer sdp: {}", e)))
}

/// Build a candidate init from wire fields
pub fn candidate_init(
    candidate: &str,
    sdp_mid: Option<String>,
    sdp_mline_index: Option<u16>,
) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: candidate.to_string(),
        sdp_mid,
        sdp_mline_index,
        username_fragment: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offer_round_trip() {
        let message = WireMessage::sdp(SdpKind::Offer, "v=0\r\n");
        let json = message.to_json().unwrap();
        assert!(json.contains("\"type\":\"offer\""));
        let decoded = WireMessage::from_json(&json).unwrap();
        assert_eq!(message, decoded);
    }

    #[test]
    fn test_candidate_round_trip() {
        let message = WireMessage::Candidate {
            candidate: "candidate:1 1 udp 2130706431 192.0.2.1 54321 typ host".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        };
        let json = message.to_json().unwrap();
        let decoded = WireMessage::from_json(&json).unwrap();
        assert_eq!(message, decoded);
    }

    #[test]
    fn test_candidate_missing_mid_defaults_to_none() {
        let json = r#"{"type":"candidate","candidate":"candidate:1 1 udp 1 192.0.2.1 1 typ host"}"#;
        let decoded = WireMessage::from_json(json).unwrap();
        match decoded {
            WireMessage::Candidate {
                sdp_mid,
                sdp_mline_index,
                ..
            } => {
                assert!(sdp_mid.is_none());
                assert!(sdp_mline_index.is_none());
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_malformed_json_is_decode_error() {
        let err = WireMessage::from_json("{not json").unwrap_err();
        assert!(matches!(err, Error::SignalingDecode(_)));
    }

    #[test]
    fn test_unknown_type_is_decode_error() {
        let err = WireMessage::from_json(r#"{"type":"bye"}"#).unwrap_err();
        assert!(matches!(err, Error::SignalingDecode(_)));
    }

    #[test]
    fn test_garbage_sdp_is_rejected() {
        assert!(offer_description("this is not sdp").is_err());
        assert!(answer_description("").is_err());
    }

    #[test]
    fn test_candidate_init_fields() {
        let init = candidate_init("candidate:1", Some("0".to_string()), Some(0));
        assert_eq!(init.candidate, "candidate:1");
        assert_eq!(init.sdp_mid.as_deref(), Some("0"));
        assert_eq!(init.sdp_mline_index, Some(0));
        assert!(init.username_fragment.is_none());
    }
}
