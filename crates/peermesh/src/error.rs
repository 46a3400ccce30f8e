//! Error types surfaced by the mesh client
//!
//! Every error carries a kind whose wire string matches the ecosystem's
//! kebab-case error types, so applications can match on `kind()` regardless
//! of which component produced the error.

use thiserror::Error;

/// Classification of a mesh error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MeshErrorKind {
    /// The runtime lacks the required WebRTC capabilities
    BrowserIncompatible,
    /// A client-supplied peer id failed validation
    InvalidId,
    /// The API key was rejected by the signaling server
    InvalidKey,
    /// The requested peer id is already taken
    UnavailableId,
    /// Operation requires a live signaling session
    Disconnected,
    /// The client has been destroyed
    Destroyed,
    /// WebSocket-level failure
    SocketError,
    /// The signaling socket closed unexpectedly
    SocketClosed,
    /// The signaling server reported an error
    ServerError,
    /// Generic connectivity failure to the signaling server
    Network,
    /// The remote peer could not be reached
    PeerUnavailable,
    /// A WebRTC operation failed
    Webrtc,
    /// ICE negotiation failed
    NegotiationFailed,
    /// The underlying connection was closed
    ConnectionClosed,
    /// Send attempted before the connection opened
    NotOpenYet,
    /// No open connection was available for a send
    NoOpenConnection,
    /// Payload exceeds the serializer's message size limit
    MessageTooBig,
}

impl MeshErrorKind {
    /// Kebab-case wire string for this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            MeshErrorKind::BrowserIncompatible => "browser-incompatible",
            MeshErrorKind::InvalidId => "invalid-id",
            MeshErrorKind::InvalidKey => "invalid-key",
            MeshErrorKind::UnavailableId => "unavailable-id",
            MeshErrorKind::Disconnected => "disconnected",
            MeshErrorKind::Destroyed => "destroyed",
            MeshErrorKind::SocketError => "socket-error",
            MeshErrorKind::SocketClosed => "socket-closed",
            MeshErrorKind::ServerError => "server-error",
            MeshErrorKind::Network => "network",
            MeshErrorKind::PeerUnavailable => "peer-unavailable",
            MeshErrorKind::Webrtc => "webrtc",
            MeshErrorKind::NegotiationFailed => "negotiation-failed",
            MeshErrorKind::ConnectionClosed => "connection-closed",
            MeshErrorKind::NotOpenYet => "not-open-yet",
            MeshErrorKind::NoOpenConnection => "no-open-connection",
            MeshErrorKind::MessageTooBig => "message-too-big",
        }
    }

    /// Whether this kind aborts the signaling session when raised on the
    /// client (emit, then destroy or disconnect depending on whether an id
    /// was ever issued).
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            MeshErrorKind::InvalidKey
                | MeshErrorKind::UnavailableId
                | MeshErrorKind::SocketClosed
                | MeshErrorKind::SocketError
                | MeshErrorKind::ServerError
        )
    }
}

impl std::fmt::Display for MeshErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A mesh error: a kind plus a human-readable message.
///
/// Sources are stringified so the error stays `Clone` and can travel through
/// event channels.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct MeshError {
    kind: MeshErrorKind,
    message: String,
}

impl MeshError {
    pub fn new(kind: MeshErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> MeshErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn webrtc(err: impl std::fmt::Display) -> Self {
        Self::new(MeshErrorKind::Webrtc, err.to_string())
    }

    pub fn not_open_yet() -> Self {
        Self::new(
            MeshErrorKind::NotOpenYet,
            "connection is not open yet",
        )
    }

    pub fn destroyed(what: &str) -> Self {
        Self::new(MeshErrorKind::Destroyed, format!("{what} has been destroyed"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_wire_strings() {
        assert_eq!(MeshErrorKind::PeerUnavailable.as_str(), "peer-unavailable");
        assert_eq!(MeshErrorKind::MessageTooBig.as_str(), "message-too-big");
        assert_eq!(MeshErrorKind::Webrtc.as_str(), "webrtc");
    }

    #[test]
    fn fatal_kinds() {
        assert!(MeshErrorKind::InvalidKey.is_fatal());
        assert!(MeshErrorKind::ServerError.is_fatal());
        assert!(!MeshErrorKind::NotOpenYet.is_fatal());
        assert!(!MeshErrorKind::PeerUnavailable.is_fatal());
    }

    #[test]
    fn error_display() {
        let err = MeshError::new(MeshErrorKind::NotOpenYet, "send before open");
        assert_eq!(err.to_string(), "not-open-yet: send before open");
        assert_eq!(err.kind(), MeshErrorKind::NotOpenYet);
    }
}
