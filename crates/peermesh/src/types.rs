//! Core identifier and payload types

use crate::error::{MeshError, MeshErrorKind};
use serde::{Deserialize, Serialize};

/// Identifier of a peer in the mesh.
///
/// Either assigned by the signaling server or chosen by the client; chosen
/// ids are validated to alphanumerics plus dashes and underscores.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    /// Validate and wrap a client-chosen id.
    pub fn new(id: impl Into<String>) -> Result<Self, MeshError> {
        let id = id.into();
        if Self::is_valid(&id) {
            Ok(Self(id))
        } else {
            Err(MeshError::new(
                MeshErrorKind::InvalidId,
                format!("invalid peer id: {id:?}"),
            ))
        }
    }

    /// Wrap a server-assigned id without validation.
    pub(crate) fn assigned(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn is_valid(id: &str) -> bool {
        !id.is_empty()
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of a single data-channel connection, locally generated.
///
/// Correlates out-of-order signaling messages with the connection they
/// belong to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Kind of data channel between two peers.
///
/// `Reliable` channels are ordered and retransmitted; `Realtime` channels
/// are unordered and never retransmit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    Reliable,
    Realtime,
}

impl ChannelKind {
    pub fn from_reliable(reliable: bool) -> Self {
        if reliable {
            ChannelKind::Reliable
        } else {
            ChannelKind::Realtime
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        match label {
            "reliable" => Some(ChannelKind::Reliable),
            "realtime" => Some(ChannelKind::Realtime),
            _ => None,
        }
    }

    /// The label carried on the underlying data channel.
    pub fn label(&self) -> &'static str {
        match self {
            ChannelKind::Reliable => "reliable",
            ChannelKind::Realtime => "realtime",
        }
    }

    pub fn reliable(&self) -> bool {
        matches!(self, ChannelKind::Reliable)
    }
}

impl std::fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// An opaque application payload.
///
/// The built-in serializers move either raw bytes or JSON values; custom
/// serializers may interpret these however they like.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Bytes(Vec<u8>),
    Json(serde_json::Value),
}

impl Payload {
    pub fn text(s: impl Into<String>) -> Self {
        Payload::Json(serde_json::Value::String(s.into()))
    }

    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Payload::Json(v) => Some(v),
            Payload::Bytes(_) => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Payload::Bytes(b) => Some(b),
            Payload::Json(_) => None,
        }
    }
}

impl From<serde_json::Value> for Payload {
    fn from(v: serde_json::Value) -> Self {
        Payload::Json(v)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(b: Vec<u8>) -> Self {
        Payload::Bytes(b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_id_validation() {
        assert!(PeerId::new("alice-01_x").is_ok());
        assert!(PeerId::new("").is_err());
        assert!(PeerId::new("has space").is_err());
        assert!(PeerId::new("semi;colon").is_err());
    }

    #[test]
    fn channel_kind_labels() {
        assert_eq!(ChannelKind::Reliable.label(), "reliable");
        assert_eq!(ChannelKind::Realtime.label(), "realtime");
        assert_eq!(ChannelKind::from_label("reliable"), Some(ChannelKind::Reliable));
        assert_eq!(ChannelKind::from_label("bogus"), None);
        assert!(ChannelKind::from_reliable(true).reliable());
        assert!(!ChannelKind::from_reliable(false).reliable());
    }

    #[test]
    fn peer_id_ordering_is_lexicographic() {
        let a = PeerId::new("a").unwrap();
        let z = PeerId::new("z").unwrap();
        assert!(z > a);
    }
}
