//! Signaling wire messages
//!
//! JSON records exchanged with the signaling server. Message types use the
//! server's SCREAMING-KEBAB strings; payload fields are camelCase.

use crate::types::{ConnectionId, PeerId};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServerMessageType {
    #[serde(rename = "OPEN")]
    Open,
    #[serde(rename = "ERROR")]
    Error,
    #[serde(rename = "ID-TAKEN")]
    IdTaken,
    #[serde(rename = "INVALID-KEY")]
    InvalidKey,
    #[serde(rename = "LEAVE")]
    Leave,
    #[serde(rename = "EXPIRE")]
    Expire,
    #[serde(rename = "OFFER")]
    Offer,
    #[serde(rename = "ANSWER")]
    Answer,
    #[serde(rename = "CANDIDATE")]
    Candidate,
    #[serde(rename = "HEARTBEAT")]
    Heartbeat,
}

/// An SDP blob plus its role.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionDescription {
    /// `offer` or `answer`.
    #[serde(rename = "type")]
    pub sdp_type: String,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: "offer".to_string(),
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: "answer".to_string(),
            sdp: sdp.into(),
        }
    }

    pub fn is_offer(&self) -> bool {
        self.sdp_type.eq_ignore_ascii_case("offer")
    }
}

/// An ICE candidate in its JSON form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceCandidateJson {
    pub candidate: String,
    #[serde(rename = "sdpMid", skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u16>,
}

/// Payload of OFFER / ANSWER / CANDIDATE / ERROR messages.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SignalPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sdp: Option<SessionDescription>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub candidate: Option<IceCandidateJson>,
    #[serde(rename = "connectionId", skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<ConnectionId>,
    /// Connection type discriminator; always `data` here.
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reliable: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub serialization: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    /// Server-supplied message on ERROR.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub msg: Option<String>,
}

/// A message to or from the signaling server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerMessage {
    #[serde(rename = "type")]
    pub kind: ServerMessageType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub src: Option<PeerId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dst: Option<PeerId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<SignalPayload>,
}

impl ServerMessage {
    pub fn heartbeat() -> Self {
        Self {
            kind: ServerMessageType::Heartbeat,
            src: None,
            dst: None,
            payload: None,
        }
    }

    pub fn offer(dst: PeerId, payload: SignalPayload) -> Self {
        Self {
            kind: ServerMessageType::Offer,
            src: None,
            dst: Some(dst),
            payload: Some(payload),
        }
    }

    pub fn answer(dst: PeerId, payload: SignalPayload) -> Self {
        Self {
            kind: ServerMessageType::Answer,
            src: None,
            dst: Some(dst),
            payload: Some(payload),
        }
    }

    pub fn candidate(dst: PeerId, payload: SignalPayload) -> Self {
        Self {
            kind: ServerMessageType::Candidate,
            src: None,
            dst: Some(dst),
            payload: Some(payload),
        }
    }

    /// The connection this message belongs to, when it carries one.
    pub fn connection_id(&self) -> Option<&ConnectionId> {
        self.payload.as_ref().and_then(|p| p.connection_id.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_strings_match_wire() {
        let json = serde_json::to_string(&ServerMessageType::IdTaken).unwrap();
        assert_eq!(json, "\"ID-TAKEN\"");
        let parsed: ServerMessageType = serde_json::from_str("\"INVALID-KEY\"").unwrap();
        assert_eq!(parsed, ServerMessageType::InvalidKey);
    }

    #[test]
    fn offer_payload_roundtrip() {
        let payload = SignalPayload {
            sdp: Some(SessionDescription::offer("v=0...")),
            connection_id: Some(ConnectionId::new("mc_1")),
            kind: Some("data".to_string()),
            label: Some("reliable".to_string()),
            reliable: Some(true),
            serialization: Some("binary".to_string()),
            metadata: Some(serde_json::json!({"name": "alice"})),
            ..Default::default()
        };
        let msg = ServerMessage::offer(PeerId::new("bob").unwrap(), payload);
        let text = serde_json::to_string(&msg).unwrap();
        assert!(text.contains("\"type\":\"OFFER\""));
        assert!(text.contains("\"connectionId\":\"mc_1\""));

        let back: ServerMessage = serde_json::from_str(&text).unwrap();
        assert_eq!(back.kind, ServerMessageType::Offer);
        assert_eq!(back.connection_id().unwrap().as_str(), "mc_1");
        assert!(back.payload.unwrap().sdp.unwrap().is_offer());
    }

    #[test]
    fn candidate_json_field_names() {
        let c = IceCandidateJson {
            candidate: "candidate:1 1 udp ...".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_m_line_index: Some(0),
        };
        let text = serde_json::to_string(&c).unwrap();
        assert!(text.contains("sdpMid"));
        assert!(text.contains("sdpMLineIndex"));
    }

    #[test]
    fn unknown_type_fails_parse() {
        let text = r#"{"type":"WAT","src":"a"}"#;
        assert!(serde_json::from_str::<ServerMessage>(text).is_err());
    }
}
