//! Mesh discovery
//!
//! When a node opens, the manager sends it the list of currently-open peers
//! over the reliable channel and expects an acknowledgement; unacknowledged
//! handshakes are retried with exponential back-off and then silently
//! abandoned. Received peer lists trigger transitive connection attempts on
//! the owning client.

use crate::client::ClientCore;
use crate::node::RemoteNode;
use crate::types::PeerId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const HANDSHAKE_BASE_DELAY: Duration = Duration::from_secs(1);
const HANDSHAKE_MAX_RETRIES: u32 = 3;

/// Control messages carried in-band on data channels. The envelope's
/// sentinel field keeps them apart from application traffic.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum MeshControl {
    #[serde(rename = "mesh-peers")]
    Peers {
        peers: Vec<PeerId>,
        timestamp: u64,
        #[serde(rename = "requiresAck", default)]
        requires_ack: bool,
    },
    #[serde(rename = "mesh-peers-ack")]
    Ack { timestamp: u64 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlEnvelope {
    #[serde(rename = "__peerJSInternal")]
    pub internal: bool,
    #[serde(flatten)]
    pub control: MeshControl,
}

impl ControlEnvelope {
    pub fn new(control: MeshControl) -> Self {
        Self {
            internal: true,
            control,
        }
    }

    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).expect("mesh control is always serializable")
    }
}

struct Handshake {
    sent_at: u64,
    retry_count: u32,
    timer: Option<JoinHandle<()>>,
}

pub(crate) struct NetworkManager {
    client: Weak<ClientCore>,
    handshakes: Mutex<HashMap<PeerId, Handshake>>,
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Delay before retry number `attempt + 1`.
pub(crate) fn backoff_delay(attempt: u32) -> Duration {
    HANDSHAKE_BASE_DELAY * 2u32.saturating_pow(attempt)
}

impl NetworkManager {
    pub fn new(client: Weak<ClientCore>) -> Self {
        Self {
            client,
            handshakes: Mutex::new(HashMap::new()),
        }
    }

    /// Handshakes still waiting for an acknowledgement.
    pub fn pending_count(&self) -> usize {
        self.handshakes.lock().unwrap().len()
    }

    /// A node opened: start its mesh handshake. The peer list is always
    /// sent, even when empty.
    pub fn on_node_open(&self, node: &Arc<RemoteNode>) {
        let Some(client) = self.client.upgrade() else {
            return;
        };
        let peers: Vec<PeerId> = client
            .open_peer_ids()
            .into_iter()
            .filter(|p| p != node.peer())
            .collect();
        let timestamp = now_ms();

        self.handshakes.lock().unwrap().insert(
            node.peer().clone(),
            Handshake {
                sent_at: timestamp,
                retry_count: 0,
                timer: None,
            },
        );
        self.send_attempt(node.clone(), peers, timestamp, 0);
    }

    fn send_attempt(&self, node: Arc<RemoteNode>, peers: Vec<PeerId>, timestamp: u64, attempt: u32) {
        let envelope = ControlEnvelope::new(MeshControl::Peers {
            peers,
            timestamp,
            requires_ack: true,
        });

        let send_node = node.clone();
        tokio::spawn(async move {
            if let Err(e) = send_node.send_internal(envelope.to_value()).await {
                debug!(
                    "mesh-peers send to {} (attempt {attempt}) failed: {e}",
                    send_node.peer()
                );
            }
        });

        // Arm the retry timer for this attempt.
        let client = self.client.clone();
        let peer = node.peer().clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(backoff_delay(attempt)).await;
            let Some(client) = client.upgrade() else {
                return;
            };
            client.network().retry(&peer, timestamp);
        });
        if let Some(handshake) = self.handshakes.lock().unwrap().get_mut(node.peer()) {
            if let Some(previous) = handshake.timer.replace(timer) {
                previous.abort();
            }
        } else {
            timer.abort();
        }
    }

    /// Retry timer fired for `peer`; resend or abandon.
    fn retry(&self, peer: &PeerId, timestamp: u64) {
        let attempt = {
            let mut handshakes = self.handshakes.lock().unwrap();
            let Some(handshake) = handshakes.get_mut(peer) else {
                return; // Acknowledged or dropped in the meantime.
            };
            if handshake.sent_at != timestamp {
                return; // A newer handshake superseded this timer.
            }
            if handshake.retry_count >= HANDSHAKE_MAX_RETRIES {
                debug!("mesh handshake with {peer} abandoned after {} retries", handshake.retry_count);
                handshakes.remove(peer);
                return;
            }
            handshake.retry_count += 1;
            handshake.retry_count
        };

        let Some(client) = self.client.upgrade() else {
            return;
        };
        let Some(node) = client.node(peer) else {
            self.handshakes.lock().unwrap().remove(peer);
            return;
        };
        let peers: Vec<PeerId> = client
            .open_peer_ids()
            .into_iter()
            .filter(|p| p != peer)
            .collect();
        debug!("retrying mesh handshake with {peer} (retry {attempt})");
        self.send_attempt(node, peers, timestamp, attempt);
    }

    /// A control payload arrived from `node`.
    pub async fn handle_control(&self, node: &Arc<RemoteNode>, value: serde_json::Value) {
        let envelope: ControlEnvelope = match serde_json::from_value(value) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("undecodable mesh control from {}: {e}", node.peer());
                return;
            }
        };
        match envelope.control {
            MeshControl::Peers {
                peers,
                timestamp,
                requires_ack,
            } => {
                debug!(
                    "mesh-peers from {}: {} peers",
                    node.peer(),
                    peers.len()
                );
                if requires_ack {
                    let ack = ControlEnvelope::new(MeshControl::Ack { timestamp });
                    if let Err(e) = node.send_internal(ack.to_value()).await {
                        debug!("mesh-peers-ack to {} failed: {e}", node.peer());
                    }
                }
                if let Some(client) = self.client.upgrade() {
                    client.connect_to_peers(peers).await;
                }
            }
            MeshControl::Ack { timestamp } => {
                let mut handshakes = self.handshakes.lock().unwrap();
                if let Some(handshake) = handshakes.get(node.peer()) {
                    if handshake.sent_at == timestamp {
                        if let Some(handshake) = handshakes.remove(node.peer()) {
                            if let Some(timer) = handshake.timer {
                                timer.abort();
                            }
                        }
                        debug!("mesh handshake with {} complete", node.peer());
                    } else {
                        debug!("stale mesh-peers-ack from {}", node.peer());
                    }
                }
            }
        }
    }

    /// A node closed: drop its handshake state.
    pub fn on_node_close(&self, peer: &PeerId) {
        if let Some(handshake) = self.handshakes.lock().unwrap().remove(peer) {
            if let Some(timer) = handshake.timer {
                timer.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_schedule_doubles_from_one_second() {
        assert_eq!(backoff_delay(0), Duration::from_secs(1));
        assert_eq!(backoff_delay(1), Duration::from_secs(2));
        assert_eq!(backoff_delay(2), Duration::from_secs(4));
        assert_eq!(backoff_delay(3), Duration::from_secs(8));
    }

    #[test]
    fn control_envelope_wire_shape() {
        let envelope = ControlEnvelope::new(MeshControl::Peers {
            peers: vec![PeerId::new("c").unwrap()],
            timestamp: 17,
            requires_ack: true,
        });
        let value = envelope.to_value();
        assert_eq!(value["__peerJSInternal"], true);
        assert_eq!(value["type"], "mesh-peers");
        assert_eq!(value["requiresAck"], true);
        assert_eq!(value["peers"][0], "c");

        let back: ControlEnvelope = serde_json::from_value(value).unwrap();
        assert!(matches!(back.control, MeshControl::Peers { .. }));
    }

    #[test]
    fn ack_echoes_timestamp() {
        let envelope = ControlEnvelope::new(MeshControl::Ack { timestamp: 99 });
        let value = envelope.to_value();
        assert_eq!(value["type"], "mesh-peers-ack");
        assert_eq!(value["timestamp"], 99);
    }
}
