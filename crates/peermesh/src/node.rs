//! A logical remote peer
//!
//! A node aggregates one or more data-channel connections to the same peer:
//! it latches `open` on the first connection that opens, fans sends out to
//! the channel selected by label, converges concurrent duplicate
//! connections onto one survivor, replays signaling messages that arrived
//! early, and probes link latency while open.

use crate::client::ClientCore;
use crate::config::SendOptions;
use crate::connection::DataConnection;
use crate::emitter::Emitter;
use crate::error::{MeshError, MeshErrorKind};
use crate::signaling::message::ServerMessage;
use crate::types::{ChannelKind, ConnectionId, Payload, PeerId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

/// Settle window before duplicate connections are closed, letting in-flight
/// messages drain on both sides.
pub(crate) const DEDUP_SETTLE: Duration = Duration::from_millis(100);

/// Events emitted by a node.
#[derive(Debug, Clone)]
pub enum NodeEvent {
    Open,
    Data(Payload),
    Close,
    Error(MeshError),
    /// Measured round-trip latency in milliseconds.
    Ping(u32),
}

pub struct RemoteNode {
    peer: PeerId,
    local_id: PeerId,
    metadata: Option<serde_json::Value>,
    connections: Mutex<Vec<Arc<DataConnection>>>,
    channel_map: Mutex<HashMap<&'static str, Arc<DataConnection>>>,
    open: AtomicBool,
    ever_opened: AtomicBool,
    destroyed: AtomicBool,
    lost_messages: Mutex<HashMap<ConnectionId, Vec<ServerMessage>>>,
    ping: Mutex<Option<u32>>,
    ping_task: Mutex<Option<JoinHandle<()>>>,
    dedup_task: Mutex<Option<JoinHandle<()>>>,
    events: Emitter<NodeEvent>,
    client: Weak<ClientCore>,
    ping_interval: Duration,
}

impl RemoteNode {
    pub(crate) fn new(
        peer: PeerId,
        local_id: PeerId,
        metadata: Option<serde_json::Value>,
        client: Weak<ClientCore>,
        ping_interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            peer,
            local_id,
            metadata,
            connections: Mutex::new(Vec::new()),
            channel_map: Mutex::new(HashMap::new()),
            open: AtomicBool::new(false),
            ever_opened: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            lost_messages: Mutex::new(HashMap::new()),
            ping: Mutex::new(None),
            ping_task: Mutex::new(None),
            dedup_task: Mutex::new(None),
            events: Emitter::new(),
            client,
            ping_interval,
        })
    }

    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    pub fn metadata(&self) -> Option<&serde_json::Value> {
        self.metadata.as_ref()
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Last measured latency, unset until a candidate pair reports one.
    pub fn ping(&self) -> Option<u32> {
        *self.ping.lock().unwrap()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    pub fn open_connection_count(&self) -> usize {
        self.connections
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.is_open())
            .count()
    }

    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.connections
            .lock()
            .unwrap()
            .iter()
            .map(|c| c.connection_id().clone())
            .collect()
    }

    /// Labels with a mapped channel, sorted for stable assertions.
    pub fn channel_labels(&self) -> Vec<String> {
        let mut labels: Vec<String> = self
            .channel_map
            .lock()
            .unwrap()
            .keys()
            .map(|l| l.to_string())
            .collect();
        labels.sort();
        labels
    }

    pub fn subscribe(&self) -> tokio::sync::mpsc::UnboundedReceiver<NodeEvent> {
        self.events.subscribe()
    }

    /// Send a payload over the channel selected by `options`.
    ///
    /// Falls back to any open connection when the labeled channel does not
    /// exist yet, and lazily starts a connection carrying the missing label.
    pub async fn send(
        self: &Arc<Self>,
        payload: Payload,
        options: SendOptions,
    ) -> Result<(), MeshError> {
        if self.is_destroyed() {
            return Err(MeshError::destroyed("node"));
        }
        if !self.is_open() {
            return Err(MeshError::not_open_yet());
        }
        let kind = ChannelKind::from_reliable(options.reliable.unwrap_or(true));

        let labeled = self
            .channel_map
            .lock()
            .unwrap()
            .get(kind.label())
            .filter(|c| c.is_open())
            .cloned();

        let conn = match labeled {
            Some(conn) => conn,
            None => {
                self.request_missing_channel(kind);
                self.any_open_connection().ok_or_else(|| {
                    MeshError::new(
                        MeshErrorKind::NoOpenConnection,
                        format!("no open connection to {}", self.peer),
                    )
                })?
            }
        };
        conn.send(&payload).await
    }

    fn any_open_connection(&self) -> Option<Arc<DataConnection>> {
        self.connections
            .lock()
            .unwrap()
            .iter()
            .find(|c| c.is_open())
            .cloned()
    }

    /// Ask the client to open a connection with the missing label, once.
    fn request_missing_channel(self: &Arc<Self>, kind: ChannelKind) {
        let already_requested = self
            .connections
            .lock()
            .unwrap()
            .iter()
            .any(|c| c.kind() == kind);
        if already_requested {
            return;
        }
        if let Some(client) = self.client.upgrade() {
            let peer = self.peer.clone();
            tokio::spawn(async move {
                if let Err(e) = client.ensure_channel(&peer, kind).await {
                    debug!("could not open {kind} channel to {peer}: {e}");
                }
            });
        }
    }

    /// Send a mesh control value over the reliable channel.
    pub(crate) async fn send_internal(
        self: &Arc<Self>,
        value: serde_json::Value,
    ) -> Result<(), MeshError> {
        let conn = {
            let map = self.channel_map.lock().unwrap();
            map.get(ChannelKind::Reliable.label())
                .filter(|c| c.is_open())
                .cloned()
        }
        .or_else(|| {
            self.connections
                .lock()
                .unwrap()
                .iter()
                .find(|c| c.reliable() && c.is_open())
                .cloned()
        })
        .ok_or_else(|| {
            MeshError::new(
                MeshErrorKind::NoOpenConnection,
                format!("no reliable channel to {}", self.peer),
            )
        })?;
        conn.send(&Payload::Json(value)).await
    }

    pub(crate) fn add_connection(self: &Arc<Self>, conn: Arc<DataConnection>) {
        if self.is_destroyed() {
            tokio::spawn(async move {
                conn.close_for_node_shutdown().await;
            });
            return;
        }
        let mut connections = self.connections.lock().unwrap();
        if connections
            .iter()
            .any(|c| c.connection_id() == conn.connection_id())
        {
            return;
        }
        connections.push(conn);
    }

    pub(crate) fn connection_by_id(&self, id: &ConnectionId) -> Option<Arc<DataConnection>> {
        self.connections
            .lock()
            .unwrap()
            .iter()
            .find(|c| c.connection_id() == id)
            .cloned()
    }

    /// Remove a connection without triggering the empty-node close; used
    /// when the caller is about to replace it.
    pub(crate) fn detach_connection(&self, id: &ConnectionId) -> Option<Arc<DataConnection>> {
        let mut connections = self.connections.lock().unwrap();
        let index = connections.iter().position(|c| c.connection_id() == id)?;
        let conn = connections.remove(index);
        drop(connections);
        let mut map = self.channel_map.lock().unwrap();
        if map
            .get(conn.label())
            .map(|c| c.connection_id() == id)
            .unwrap_or(false)
        {
            map.remove(conn.label());
        }
        Some(conn)
    }

    pub(crate) fn has_connection_kind(&self, kind: ChannelKind) -> bool {
        self.connections
            .lock()
            .unwrap()
            .iter()
            .any(|c| c.kind() == kind)
    }

    /// Hold a signaling message for a connection that does not exist yet.
    pub(crate) fn store_lost(&self, id: ConnectionId, msg: ServerMessage) {
        self.lost_messages
            .lock()
            .unwrap()
            .entry(id)
            .or_default()
            .push(msg);
    }

    /// Remove and return messages held for `id`.
    pub(crate) fn take_lost(&self, id: &ConnectionId) -> Vec<ServerMessage> {
        self.lost_messages
            .lock()
            .unwrap()
            .remove(id)
            .unwrap_or_default()
    }

    pub(crate) fn lost_message_count(&self) -> usize {
        self.lost_messages.lock().unwrap().values().map(Vec::len).sum()
    }

    /// A connection reached open: latch node open, map the label, and check
    /// for duplicates.
    pub(crate) fn connection_opened(self: &Arc<Self>, conn: &Arc<DataConnection>) {
        if self.is_destroyed() {
            return;
        }
        if let Some(client) = self.client.upgrade() {
            client.clear_attempt(&self.peer);
        }

        self.channel_map
            .lock()
            .unwrap()
            .entry(conn.label())
            .or_insert_with(|| conn.clone());

        self.open.store(true, Ordering::SeqCst);
        if !self.ever_opened.swap(true, Ordering::SeqCst) {
            debug!("node {} open", self.peer);
            self.events.emit(NodeEvent::Open);
            self.start_ping();
            if let Some(client) = self.client.upgrade() {
                client.on_node_open(self);
            }
        }

        let duplicate_labels = {
            let connections = self.connections.lock().unwrap();
            connections
                .iter()
                .filter(|c| c.is_open() && c.kind() == conn.kind())
                .count()
                > 1
        };
        if duplicate_labels {
            self.schedule_dedup();
        }
    }

    /// After the settle delay, keep the open connection with the smallest
    /// id and close the rest. Only the side with the greater peer id closes;
    /// both sides sort identically, so they converge on the same survivor.
    fn schedule_dedup(self: &Arc<Self>) {
        let mut task = self.dedup_task.lock().unwrap();
        if task.as_ref().map(|t| !t.is_finished()).unwrap_or(false) {
            return;
        }
        let node = self.clone();
        *task = Some(tokio::spawn(async move {
            tokio::time::sleep(DEDUP_SETTLE).await;
            node.resolve_duplicates().await;
        }));
    }

    async fn resolve_duplicates(self: &Arc<Self>) {
        if self.is_destroyed() {
            return;
        }
        if self.local_id <= self.peer {
            // The other side is the closer.
            return;
        }
        for kind in [ChannelKind::Reliable, ChannelKind::Realtime] {
            let mut open: Vec<_> = {
                let connections = self.connections.lock().unwrap();
                connections
                    .iter()
                    .filter(|c| c.is_open() && c.kind() == kind)
                    .cloned()
                    .collect()
            };
            if open.len() <= 1 {
                continue;
            }
            open.sort_by(|a, b| a.connection_id().cmp(b.connection_id()));
            let survivor = open[0].clone();
            debug!(
                "deduplicating {} {kind} connections to {}; keeping {}",
                open.len(),
                self.peer,
                survivor.connection_id()
            );
            for conn in open.into_iter().skip(1) {
                conn.close().await;
            }
            // Make sure the survivor owns its label.
            self.channel_map
                .lock()
                .unwrap()
                .insert(survivor.label(), survivor);
        }
    }

    pub(crate) fn remove_connection(self: &Arc<Self>, conn: &Arc<DataConnection>) {
        {
            let mut connections = self.connections.lock().unwrap();
            connections.retain(|c| c.connection_id() != conn.connection_id());
        }
        let was_mapped = {
            let mut map = self.channel_map.lock().unwrap();
            if map
                .get(conn.label())
                .map(|c| c.connection_id() == conn.connection_id())
                .unwrap_or(false)
            {
                map.remove(conn.label());
                true
            } else {
                false
            }
        };
        if was_mapped {
            // Re-point the label at another open connection of the same
            // kind, if one survived.
            let replacement = self
                .connections
                .lock()
                .unwrap()
                .iter()
                .find(|c| c.kind() == conn.kind() && c.is_open())
                .cloned();
            if let Some(replacement) = replacement {
                self.channel_map
                    .lock()
                    .unwrap()
                    .insert(replacement.label(), replacement);
            }
        }
        if self.connection_count() == 0 && !self.is_destroyed() {
            let node = self.clone();
            tokio::spawn(async move {
                node.close().await;
            });
        }
    }

    /// Mesh control payload from any of this node's connections.
    pub(crate) fn handle_internal(self: &Arc<Self>, value: serde_json::Value) {
        if let Some(client) = self.client.upgrade() {
            let node = self.clone();
            tokio::spawn(async move {
                client.network().handle_control(&node, value).await;
            });
        }
    }

    pub(crate) fn emit_data(&self, payload: Payload) {
        self.events.emit(NodeEvent::Data(payload));
    }

    pub(crate) fn emit_error(&self, err: MeshError) {
        self.events.emit(NodeEvent::Error(err));
    }

    /// Close every connection, clear timers, detach from the client, and
    /// emit `Close` exactly once. Terminal.
    pub async fn close(self: &Arc<Self>) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.open.store(false, Ordering::SeqCst);
        self.stop_ping();
        if let Some(task) = self.dedup_task.lock().unwrap().take() {
            task.abort();
        }

        let connections: Vec<_> = {
            let mut guard = self.connections.lock().unwrap();
            guard.drain(..).collect()
        };
        self.channel_map.lock().unwrap().clear();
        for conn in connections {
            conn.close_for_node_shutdown().await;
        }
        self.lost_messages.lock().unwrap().clear();

        if let Some(client) = self.client.upgrade() {
            client.remove_node(&self.peer);
        }
        debug!("node {} closed", self.peer);
        self.events.emit(NodeEvent::Close);
    }

    /// Start the latency probe. Idempotent while a probe is running.
    fn start_ping(self: &Arc<Self>) {
        let mut task = self.ping_task.lock().unwrap();
        if task.as_ref().map(|t| !t.is_finished()).unwrap_or(false) {
            return;
        }
        let node = self.clone();
        let period = self.ping_interval;
        *task = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                if node.is_destroyed() {
                    break;
                }
                node.measure_ping().await;
            }
        }));
    }

    fn stop_ping(&self) {
        if let Some(task) = self.ping_task.lock().unwrap().take() {
            task.abort();
        }
    }

    /// Average the round-trip time of every succeeded candidate pair that
    /// reports one. Failures leave the previous value in place.
    async fn measure_ping(self: &Arc<Self>) {
        let pc = {
            let connections = self.connections.lock().unwrap();
            connections
                .iter()
                .filter(|c| c.is_open())
                .find_map(|c| c.peer_connection())
        };
        let Some(pc) = pc else {
            return;
        };
        match pc.candidate_pair_stats().await {
            Ok(pairs) => {
                let rtts: Vec<f64> = pairs
                    .iter()
                    .filter(|p| p.succeeded)
                    .filter_map(|p| p.current_round_trip_time)
                    .collect();
                if rtts.is_empty() {
                    return;
                }
                let avg_ms = (rtts.iter().sum::<f64>() / rtts.len() as f64) * 1000.0;
                let ms = avg_ms.round() as u32;
                *self.ping.lock().unwrap() = Some(ms);
                self.events.emit(NodeEvent::Ping(ms));
            }
            Err(e) => {
                debug!("latency probe for {} failed, keeping last value: {e}", self.peer);
            }
        }
    }
}

impl std::fmt::Debug for RemoteNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteNode")
            .field("peer", &self.peer)
            .field("open", &self.is_open())
            .field("destroyed", &self.is_destroyed())
            .field("connections", &self.connection_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup_keeps_smallest_connection_id() {
        // The ordering rule itself: ids sort lexicographically and the
        // survivor is the first.
        let mut ids = vec![
            ConnectionId::new("mc_z9"),
            ConnectionId::new("mc_a1"),
            ConnectionId::new("mc_m5"),
        ];
        ids.sort();
        assert_eq!(ids[0].as_str(), "mc_a1");
    }
}
