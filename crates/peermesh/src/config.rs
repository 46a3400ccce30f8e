//! Client configuration
//!
//! `MeshOptions` carries everything the client needs to reach its signaling
//! server and open peer connections. Defaults point at the public cloud
//! endpoint; tests swap in mock backends instead.

use crate::serializer::{self, Serializer};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Client version advertised during id retrieval.
pub const CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// An ICE server entry handed to the WebRTC stack.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }
}

/// Source of random tokens for session tokens and connection ids.
///
/// Injectable so tests can use a deterministic sequence.
pub trait TokenSource: Send + Sync {
    fn token(&self) -> String;
}

/// Default token source backed by the thread-local RNG.
pub struct RandomTokens;

impl TokenSource for RandomTokens {
    fn token(&self) -> String {
        use rand::Rng;
        let mut rng = rand::thread_rng();
        (0..12)
            .map(|_| char::from_digit(rng.gen_range(0..36), 36).unwrap())
            .collect()
    }
}

/// Deterministic token source for tests: yields `prefix0`, `prefix1`, ...
pub struct SequenceTokens {
    prefix: String,
    counter: std::sync::atomic::AtomicU64,
}

impl SequenceTokens {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            counter: std::sync::atomic::AtomicU64::new(0),
        }
    }
}

impl TokenSource for SequenceTokens {
    fn token(&self) -> String {
        let n = self
            .counter
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        format!("{}{}", self.prefix, n)
    }
}

/// Hook applied to locally-generated SDP before it is used.
pub type SdpTransform = Arc<dyn Fn(String) -> String + Send + Sync>;

/// Options for `MeshClient`.
#[derive(Clone)]
pub struct MeshOptions {
    /// Signaling server host.
    pub host: String,
    /// Signaling server port.
    pub port: u16,
    /// Mount path of the signaling endpoints, with leading and trailing `/`.
    pub path: String,
    /// API key expected by the server.
    pub key: String,
    /// Use https/wss instead of http/ws.
    pub secure: bool,
    /// Session token; generated when absent.
    pub token: Option<String>,
    /// ICE servers for every peer connection.
    pub ice_servers: Vec<IceServer>,
    /// Heartbeat period on the signaling socket; also the latency-probe
    /// period on open nodes.
    pub ping_interval: Duration,
    /// Optional `Referrer-Policy` header value for the id request.
    pub referrer_policy: Option<String>,
    /// Serializer registry; starts with the three built-ins.
    pub serializers: HashMap<String, Arc<dyn Serializer>>,
    /// Token generator.
    pub tokens: Arc<dyn TokenSource>,
}

impl MeshOptions {
    /// Scheme for the HTTP id endpoint.
    pub fn http_scheme(&self) -> &'static str {
        if self.secure {
            "https"
        } else {
            "http"
        }
    }

    /// Scheme for the signaling WebSocket.
    pub fn ws_scheme(&self) -> &'static str {
        if self.secure {
            "wss"
        } else {
            "ws"
        }
    }

    /// Look up a serializer by name, falling back to the default (`binary`).
    pub fn serializer(&self, name: &str) -> Option<Arc<dyn Serializer>> {
        self.serializers.get(name).cloned()
    }
}

impl Default for MeshOptions {
    fn default() -> Self {
        Self {
            host: "0.peerjs.com".to_string(),
            port: 443,
            path: "/".to_string(),
            key: "peerjs".to_string(),
            secure: true,
            token: None,
            ice_servers: vec![
                IceServer::stun("stun:stun.l.google.com:19302"),
                IceServer::stun("stun:stun.cloudflare.com:3478"),
            ],
            ping_interval: Duration::from_secs(5),
            referrer_policy: None,
            serializers: serializer::builtin_serializers(),
            tokens: Arc::new(RandomTokens),
        }
    }
}

impl std::fmt::Debug for MeshOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeshOptions")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("path", &self.path)
            .field("key", &self.key)
            .field("secure", &self.secure)
            .field("ping_interval", &self.ping_interval)
            .finish_non_exhaustive()
    }
}

/// Per-connect options.
#[derive(Clone, Default)]
pub struct ConnectOptions {
    /// Ordered + retransmitted channel when true (the default).
    pub reliable: Option<bool>,
    /// Opaque metadata delivered to the remote side with the offer.
    pub metadata: Option<serde_json::Value>,
    /// Serializer name; `binary` when absent.
    pub serialization: Option<String>,
    /// SDP rewrite hook for this connection.
    pub sdp_transform: Option<SdpTransform>,
}

/// Options for `send`/`broadcast`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SendOptions {
    /// Prefer the reliable channel when true (the default).
    pub reliable: Option<bool>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_have_builtin_serializers() {
        let opts = MeshOptions::default();
        assert!(opts.serializer("raw").is_some());
        assert!(opts.serializer("json").is_some());
        assert!(opts.serializer("binary").is_some());
        assert!(opts.serializer("carrier-pigeon").is_none());
    }

    #[test]
    fn schemes_follow_secure_flag() {
        let mut opts = MeshOptions::default();
        assert_eq!(opts.http_scheme(), "https");
        assert_eq!(opts.ws_scheme(), "wss");
        opts.secure = false;
        assert_eq!(opts.http_scheme(), "http");
        assert_eq!(opts.ws_scheme(), "ws");
    }

    #[test]
    fn sequence_tokens_are_deterministic() {
        let tokens = SequenceTokens::new("t");
        assert_eq!(tokens.token(), "t0");
        assert_eq!(tokens.token(), "t1");
    }

    #[test]
    fn random_tokens_differ() {
        let tokens = RandomTokens;
        assert_ne!(tokens.token(), tokens.token());
        assert_eq!(tokens.token().len(), 12);
    }
}
