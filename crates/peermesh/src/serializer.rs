//! Payload serializers for data channels
//!
//! Three built-in framings:
//! - `raw`: bytes pass through untouched
//! - `json`: UTF-8 JSON text, capped at the channel MTU
//! - `binary`: [u32 BE length][msgpack body], round-trips bytes and JSON
//!
//! Custom serializers plug in through the `Serializer` trait and the
//! `serializers` option on the client.

use crate::error::{MeshError, MeshErrorKind};
use crate::types::Payload;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Maximum encoded size accepted by the JSON serializer.
///
/// Matches the safe single-message limit of browser data channels.
pub const JSON_MTU: usize = 16_300;

/// Encodes outgoing payloads into data-channel frames and decodes incoming
/// frames back into payloads.
pub trait Serializer: Send + Sync {
    /// Registry name (`raw`, `json`, `binary`, ...).
    fn name(&self) -> &'static str;

    fn encode(&self, payload: &Payload) -> Result<Bytes, MeshError>;

    fn decode(&self, frame: &[u8]) -> Result<Payload, MeshError>;
}

/// The default registry with the three built-ins.
pub fn builtin_serializers() -> HashMap<String, Arc<dyn Serializer>> {
    let mut map: HashMap<String, Arc<dyn Serializer>> = HashMap::new();
    map.insert("raw".to_string(), Arc::new(RawSerializer));
    map.insert("json".to_string(), Arc::new(JsonSerializer));
    map.insert("binary".to_string(), Arc::new(BinarySerializer));
    map
}

/// Bytes in, bytes out. JSON payloads are flattened to their UTF-8 encoding.
pub struct RawSerializer;

impl Serializer for RawSerializer {
    fn name(&self) -> &'static str {
        "raw"
    }

    fn encode(&self, payload: &Payload) -> Result<Bytes, MeshError> {
        match payload {
            Payload::Bytes(b) => Ok(Bytes::from(b.clone())),
            Payload::Json(v) => {
                let encoded = serde_json::to_vec(v)
                    .map_err(|e| MeshError::new(MeshErrorKind::Webrtc, e.to_string()))?;
                Ok(Bytes::from(encoded))
            }
        }
    }

    fn decode(&self, frame: &[u8]) -> Result<Payload, MeshError> {
        Ok(Payload::Bytes(frame.to_vec()))
    }
}

/// UTF-8 JSON text frames.
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn name(&self) -> &'static str {
        "json"
    }

    fn encode(&self, payload: &Payload) -> Result<Bytes, MeshError> {
        let encoded = match payload {
            Payload::Json(v) => serde_json::to_vec(v)
                .map_err(|e| MeshError::new(MeshErrorKind::Webrtc, e.to_string()))?,
            // Already-encoded JSON text is passed through unchanged.
            Payload::Bytes(b) => b.clone(),
        };
        if encoded.len() >= JSON_MTU {
            return Err(MeshError::new(
                MeshErrorKind::MessageTooBig,
                format!("encoded message is {} bytes, limit {}", encoded.len(), JSON_MTU),
            ));
        }
        Ok(Bytes::from(encoded))
    }

    fn decode(&self, frame: &[u8]) -> Result<Payload, MeshError> {
        let value: serde_json::Value = serde_json::from_slice(frame)
            .map_err(|e| MeshError::new(MeshErrorKind::Webrtc, format!("malformed json frame: {e}")))?;
        Ok(Payload::Json(value))
    }
}

/// MessagePack body behind a u32 big-endian length prefix.
#[derive(Serialize, Deserialize)]
enum BinaryFrame {
    #[serde(rename = "b")]
    Bytes(#[serde(with = "serde_bytes")] Vec<u8>),
    #[serde(rename = "j")]
    Json(serde_json::Value),
}

pub struct BinarySerializer;

impl Serializer for BinarySerializer {
    fn name(&self) -> &'static str {
        "binary"
    }

    fn encode(&self, payload: &Payload) -> Result<Bytes, MeshError> {
        let body = match payload {
            Payload::Bytes(b) => BinaryFrame::Bytes(b.clone()),
            Payload::Json(v) => BinaryFrame::Json(v.clone()),
        };
        let encoded = rmp_serde::to_vec_named(&body)
            .map_err(|e| MeshError::new(MeshErrorKind::Webrtc, e.to_string()))?;
        let mut frame = Vec::with_capacity(4 + encoded.len());
        frame.extend_from_slice(&(encoded.len() as u32).to_be_bytes());
        frame.extend_from_slice(&encoded);
        Ok(Bytes::from(frame))
    }

    fn decode(&self, frame: &[u8]) -> Result<Payload, MeshError> {
        if frame.len() < 4 {
            return Err(MeshError::new(
                MeshErrorKind::Webrtc,
                "binary frame shorter than its length prefix",
            ));
        }
        let declared = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        let body = &frame[4..];
        if body.len() != declared {
            return Err(MeshError::new(
                MeshErrorKind::Webrtc,
                format!("binary frame length mismatch: declared {declared}, got {}", body.len()),
            ));
        }
        let decoded: BinaryFrame = rmp_serde::from_slice(body)
            .map_err(|e| MeshError::new(MeshErrorKind::Webrtc, format!("malformed binary frame: {e}")))?;
        Ok(match decoded {
            BinaryFrame::Bytes(b) => Payload::Bytes(b),
            BinaryFrame::Json(v) => Payload::Json(v),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn raw_roundtrip() {
        let s = RawSerializer;
        let frame = s.encode(&Payload::Bytes(vec![1, 2, 3])).unwrap();
        assert_eq!(s.decode(&frame).unwrap(), Payload::Bytes(vec![1, 2, 3]));
    }

    #[test]
    fn json_roundtrip() {
        let s = JsonSerializer;
        let value = json!({"hello": "world", "n": 42});
        let frame = s.encode(&Payload::Json(value.clone())).unwrap();
        assert_eq!(s.decode(&frame).unwrap(), Payload::Json(value));
    }

    #[test]
    fn json_rejects_at_mtu() {
        let s = JsonSerializer;
        // A string payload of JSON_MTU bytes encodes to more than the limit
        // once quoted.
        let big = "x".repeat(JSON_MTU);
        let err = s.encode(&Payload::Json(json!(big))).unwrap_err();
        assert_eq!(err.kind(), MeshErrorKind::MessageTooBig);

        // Just below the limit passes.
        let small = "x".repeat(JSON_MTU - 3);
        assert!(s.encode(&Payload::Json(json!(small))).is_ok());
    }

    #[test]
    fn binary_roundtrip_bytes_and_json() {
        let s = BinarySerializer;

        let frame = s.encode(&Payload::Bytes(vec![0, 255, 7])).unwrap();
        assert_eq!(s.decode(&frame).unwrap(), Payload::Bytes(vec![0, 255, 7]));

        let value = json!({"__peerJSInternal": true, "type": "mesh-peers"});
        let frame = s.encode(&Payload::Json(value.clone())).unwrap();
        assert_eq!(s.decode(&frame).unwrap(), Payload::Json(value));
    }

    #[test]
    fn binary_rejects_truncated_frames() {
        let s = BinarySerializer;
        let frame = s.encode(&Payload::Bytes(vec![1, 2, 3, 4])).unwrap();
        assert!(s.decode(&frame[..frame.len() - 1]).is_err());
        assert!(s.decode(&frame[..2]).is_err());
    }
}
