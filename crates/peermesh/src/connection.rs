//! A single data-channel connection to a peer
//!
//! Thin adapter over one WebRTC data channel plus a serializer: binds the
//! channel's open/message/close handlers, intercepts the in-band close
//! control, and buffers outgoing frames when the channel backs up.

use crate::client::ClientEvent;
use crate::config::{IceServer, SdpTransform};
use crate::emitter::Emitter;
use crate::error::{MeshError, MeshErrorKind};
use crate::negotiator::{NegotiationState, Negotiator};
use crate::node::RemoteNode;
use crate::serializer::Serializer;
use crate::signaling::message::{ServerMessage, ServerMessageType, SessionDescription};
use crate::signaling::ServerManager;
use crate::transport::{DataChannel, PeerConnection, PeerConnectionFactory};
use crate::types::{ChannelKind, ConnectionId, Payload, PeerId};
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, warn};

/// Outgoing bytes queue locally once the channel buffers this much.
pub const MAX_BUFFERED_AMOUNT: usize = 8 * 1024 * 1024;

/// Flush resumes when the channel drains below this.
const BUFFERED_AMOUNT_LOW_THRESHOLD: usize = 64 * 1024;

pub struct DataConnection {
    peer: PeerId,
    connection_id: ConnectionId,
    kind: ChannelKind,
    serialization: String,
    metadata: Option<serde_json::Value>,
    serializer: Arc<dyn Serializer>,
    negotiator: Negotiator,
    channel: Mutex<Option<Arc<dyn DataChannel>>>,
    open: AtomicBool,
    destroyed: AtomicBool,
    buffer: Mutex<VecDeque<Bytes>>,
    buffering: AtomicBool,
    node: Weak<RemoteNode>,
}

impl DataConnection {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        peer: PeerId,
        connection_id: ConnectionId,
        kind: ChannelKind,
        serialization: String,
        metadata: Option<serde_json::Value>,
        serializer: Arc<dyn Serializer>,
        signaling: Arc<ServerManager>,
        client_events: Arc<Emitter<ClientEvent>>,
        sdp_transform: Option<SdpTransform>,
        node: Weak<RemoteNode>,
    ) -> Arc<Self> {
        let negotiator = Negotiator::new(
            peer.clone(),
            connection_id.clone(),
            signaling,
            client_events,
            sdp_transform,
        );
        Arc::new(Self {
            peer,
            connection_id,
            kind,
            serialization,
            metadata,
            serializer,
            negotiator,
            channel: Mutex::new(None),
            open: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            buffer: Mutex::new(VecDeque::new()),
            buffering: AtomicBool::new(false),
            node,
        })
    }

    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    pub fn connection_id(&self) -> &ConnectionId {
        &self.connection_id
    }

    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    pub fn label(&self) -> &'static str {
        self.kind.label()
    }

    pub fn reliable(&self) -> bool {
        self.kind.reliable()
    }

    pub fn serialization(&self) -> &str {
        &self.serialization
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

    pub fn negotiation_state(&self) -> NegotiationState {
        self.negotiator.state()
    }

    pub(crate) fn peer_connection(&self) -> Option<Arc<dyn PeerConnection>> {
        self.negotiator.peer_connection()
    }

    /// Begin negotiation. The originator opens the data channel and offers;
    /// the answerer waits for `handle_offer`.
    pub(crate) async fn start(
        self: &Arc<Self>,
        factory: &Arc<dyn PeerConnectionFactory>,
        ice_servers: &[IceServer],
        originator: bool,
    ) -> Result<(), MeshError> {
        self.negotiator
            .startup(self, factory, ice_servers, originator)
            .await
    }

    /// Apply a remote offer (answerer path).
    pub(crate) async fn handle_offer(self: &Arc<Self>, offer: SessionDescription) {
        self.negotiator.handle_sdp(offer).await;
    }

    /// Route a signaling message for this connection.
    pub(crate) async fn handle_message(self: &Arc<Self>, msg: ServerMessage) {
        let payload = msg.payload.unwrap_or_default();
        match msg.kind {
            ServerMessageType::Answer => {
                if let Some(sdp) = payload.sdp {
                    self.negotiator.handle_sdp(sdp).await;
                } else {
                    warn!("answer without sdp on connection {}", self.connection_id);
                }
            }
            ServerMessageType::Candidate => {
                if let Some(candidate) = payload.candidate {
                    self.negotiator.handle_candidate(candidate).await;
                } else {
                    warn!("candidate message without candidate on {}", self.connection_id);
                }
            }
            other => {
                debug!(
                    "ignoring {other:?} routed to connection {}",
                    self.connection_id
                );
            }
        }
    }

    /// Bind the channel's handlers and adopt it.
    pub(crate) async fn initialize_channel(self: &Arc<Self>, channel: Arc<dyn DataChannel>) {
        if self.destroyed.load(Ordering::SeqCst) {
            channel.close().await;
            return;
        }
        // Adopt the channel before binding handlers: the open callback can
        // fire during registration and sends may follow immediately.
        *self.channel.lock().unwrap() = Some(channel.clone());
        channel
            .set_buffered_amount_low_threshold(BUFFERED_AMOUNT_LOW_THRESHOLD)
            .await;

        let weak = Arc::downgrade(self);
        channel.on_open(Box::new(move || {
            if let Some(conn) = weak.upgrade() {
                conn.handle_channel_open();
            }
        }));

        let weak = Arc::downgrade(self);
        channel.on_message(Box::new(move |data| {
            if let Some(conn) = weak.upgrade() {
                conn.handle_frame(&data);
            }
        }));

        let weak = Arc::downgrade(self);
        channel.on_close(Box::new(move || {
            if let Some(conn) = weak.upgrade() {
                tokio::spawn(async move {
                    conn.shutdown(false, true).await;
                });
            }
        }));

        let weak = Arc::downgrade(self);
        channel
            .on_buffered_amount_low(Box::new(move || {
                if let Some(conn) = weak.upgrade() {
                    tokio::spawn(async move {
                        conn.flush_buffer().await;
                    });
                }
            }))
            .await;
    }

    fn handle_channel_open(self: &Arc<Self>) {
        if self.destroyed.load(Ordering::SeqCst) {
            return;
        }
        self.open.store(true, Ordering::SeqCst);
        self.negotiator.mark_established();
        debug!("connection {} to {} open", self.connection_id, self.peer);
        if let Some(node) = self.node.upgrade() {
            node.connection_opened(self);
        }
    }

    fn handle_frame(self: &Arc<Self>, frame: &[u8]) {
        let payload = match self.serializer.decode(frame) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(
                    "dropping undecodable frame on connection {}: {e}",
                    self.connection_id
                );
                return;
            }
        };

        if let Payload::Json(value) = &payload {
            // In-band close request.
            if value
                .get("__peerData")
                .and_then(|d| d.get("type"))
                .and_then(|t| t.as_str())
                == Some("close")
            {
                debug!("remote requested close of connection {}", self.connection_id);
                let conn = self.clone();
                tokio::spawn(async move {
                    conn.shutdown(false, true).await;
                });
                return;
            }
            // Mesh control traffic.
            if value.get("__peerJSInternal").and_then(|v| v.as_bool()) == Some(true) {
                if let Some(node) = self.node.upgrade() {
                    node.handle_internal(value.clone());
                }
                return;
            }
        }

        if let Some(node) = self.node.upgrade() {
            node.emit_data(payload);
        }
    }

    /// Serialize and send one payload, honoring the backpressure buffer.
    pub async fn send(&self, payload: &Payload) -> Result<(), MeshError> {
        if !self.is_open() || self.is_destroyed() {
            return Err(MeshError::not_open_yet());
        }
        let frame = self.serializer.encode(payload)?;
        let channel = self
            .channel
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(MeshError::not_open_yet)?;

        if self.buffering.load(Ordering::SeqCst)
            || channel.buffered_amount().await + frame.len() > MAX_BUFFERED_AMOUNT
        {
            self.buffer.lock().unwrap().push_back(frame);
            self.buffering.store(true, Ordering::SeqCst);
            return Ok(());
        }
        channel.send(frame).await
    }

    /// Drain the local queue after a buffered-amount-low signal.
    async fn flush_buffer(self: &Arc<Self>) {
        let channel = match self.channel.lock().unwrap().clone() {
            Some(channel) => channel,
            None => return,
        };
        loop {
            let frame = match self.buffer.lock().unwrap().pop_front() {
                Some(frame) => frame,
                None => {
                    self.buffering.store(false, Ordering::SeqCst);
                    return;
                }
            };
            if let Err(e) = channel.send(frame).await {
                debug!("flush on connection {} stopped: {e}", self.connection_id);
                return;
            }
            if channel.buffered_amount().await > MAX_BUFFERED_AMOUNT {
                // Still saturated; wait for the next low signal.
                return;
            }
        }
    }

    /// Negotiation failed: surface on the node, then tear down.
    pub(crate) async fn fail(self: &Arc<Self>, err: MeshError) {
        if self.destroyed.load(Ordering::SeqCst) {
            return;
        }
        if let Some(node) = self.node.upgrade() {
            node.emit_error(err);
        }
        self.shutdown(false, true).await;
    }

    /// Gracefully close: tell the remote, then tear down.
    pub async fn close(self: &Arc<Self>) {
        self.shutdown(true, true).await;
    }

    /// Tear down without detaching from the node (the node is dropping us).
    pub(crate) async fn close_for_node_shutdown(self: &Arc<Self>) {
        self.shutdown(true, false).await;
    }

    async fn shutdown(self: &Arc<Self>, send_close_control: bool, notify_node: bool) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        if send_close_control && self.open.load(Ordering::SeqCst) {
            let control = Payload::Json(serde_json::json!({
                "__peerData": {"type": "close"}
            }));
            let channel = self.channel.lock().unwrap().clone();
            if let Some(channel) = channel {
                if let Ok(frame) = self.serializer.encode(&control) {
                    let _ = channel.send(frame).await;
                }
            }
        }
        self.open.store(false, Ordering::SeqCst);
        self.buffer.lock().unwrap().clear();
        self.buffering.store(false, Ordering::SeqCst);

        self.negotiator.cleanup().await;
        let channel = self.channel.lock().unwrap().take();
        if let Some(channel) = channel {
            channel.close().await;
        }

        if notify_node {
            if let Some(node) = self.node.upgrade() {
                node.remove_connection(self);
            }
        }
        debug!("connection {} to {} destroyed", self.connection_id, self.peer);
    }
}
