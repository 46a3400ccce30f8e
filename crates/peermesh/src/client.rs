//! The mesh client
//!
//! Owns the signaling session and the set of remote nodes: allocates or
//! validates the local id, routes every incoming signaling message, guards
//! against duplicate connection attempts, and reacts to mesh discovery by
//! connecting to newly-learned peers.

use crate::config::{ConnectOptions, MeshOptions, SendOptions};
use crate::connection::DataConnection;
use crate::emitter::Emitter;
use crate::error::{MeshError, MeshErrorKind};
use crate::network::NetworkManager;
use crate::node::RemoteNode;
use crate::signaling::message::{ServerMessage, ServerMessageType};
use crate::signaling::socket::WsConnector;
use crate::signaling::{ServerManager, SignalingConnector, SocketEvent};
use crate::transport::real::RealConnectionFactory;
use crate::transport::PeerConnectionFactory;
use crate::types::{ChannelKind, ConnectionId, Payload, PeerId};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Events emitted by the client.
#[derive(Clone)]
pub enum ClientEvent {
    /// The signaling session opened with the given id.
    Open(PeerId),
    /// A remote peer initiated a connection to us.
    Connection(Arc<RemoteNode>),
    /// The signaling session ended; P2P links stay up.
    Disconnected(PeerId),
    /// The client is destroyed.
    Close,
    Error(MeshError),
}

impl std::fmt::Debug for ClientEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientEvent::Open(id) => write!(f, "Open({id})"),
            ClientEvent::Connection(node) => write!(f, "Connection({})", node.peer()),
            ClientEvent::Disconnected(id) => write!(f, "Disconnected({id})"),
            ClientEvent::Close => write!(f, "Close"),
            ClientEvent::Error(e) => write!(f, "Error({e})"),
        }
    }
}

pub struct MeshClient {
    core: Arc<ClientCore>,
}

pub struct ClientCore {
    options: MeshOptions,
    token: String,
    server: Arc<ServerManager>,
    factory: Arc<dyn PeerConnectionFactory>,
    id: Mutex<Option<PeerId>>,
    nodes: Mutex<HashMap<PeerId, Arc<RemoteNode>>>,
    connection_attempts: Mutex<HashSet<PeerId>>,
    lost_messages: Mutex<HashMap<ConnectionId, Vec<ServerMessage>>>,
    open: AtomicBool,
    /// Whether the server ever issued a session (first OPEN latches this).
    ever_opened: AtomicBool,
    disconnected: AtomicBool,
    destroyed: AtomicBool,
    close_emitted: AtomicBool,
    events: Arc<Emitter<ClientEvent>>,
    network: NetworkManager,
    route_task: Mutex<Option<JoinHandle<()>>>,
}

impl MeshClient {
    /// Create a client with a server-assigned id.
    pub fn new(options: MeshOptions) -> Self {
        Self::with_backends(None, options, Arc::new(WsConnector::new()), RealConnectionFactory::new())
    }

    /// Create a client with a chosen id.
    pub fn with_id(id: PeerId, options: MeshOptions) -> Self {
        Self::with_backends(
            Some(id),
            options,
            Arc::new(WsConnector::new()),
            RealConnectionFactory::new(),
        )
    }

    /// Create a client against explicit signaling and transport backends.
    pub fn with_backends(
        id: Option<PeerId>,
        options: MeshOptions,
        connector: Arc<dyn SignalingConnector>,
        factory: Arc<dyn PeerConnectionFactory>,
    ) -> Self {
        let token = options
            .token
            .clone()
            .unwrap_or_else(|| options.tokens.token());
        let server = Arc::new(ServerManager::new(connector, options.clone()));

        let core = Arc::new_cyclic(|weak| ClientCore {
            options,
            token,
            server,
            factory,
            id: Mutex::new(None),
            nodes: Mutex::new(HashMap::new()),
            connection_attempts: Mutex::new(HashSet::new()),
            lost_messages: Mutex::new(HashMap::new()),
            open: AtomicBool::new(false),
            ever_opened: AtomicBool::new(false),
            disconnected: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            close_emitted: AtomicBool::new(false),
            events: Arc::new(Emitter::new()),
            network: NetworkManager::new(weak.clone()),
            route_task: Mutex::new(None),
        });

        let startup = core.clone();
        tokio::spawn(async move {
            ClientCore::start(startup, id).await;
        });

        Self { core }
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ClientEvent> {
        self.core.events.subscribe()
    }

    /// The id assigned for this session, once known.
    pub fn id(&self) -> Option<PeerId> {
        self.core.id.lock().unwrap().clone()
    }

    pub fn is_open(&self) -> bool {
        self.core.open.load(Ordering::SeqCst)
    }

    pub fn is_disconnected(&self) -> bool {
        self.core.disconnected.load(Ordering::SeqCst)
    }

    pub fn is_destroyed(&self) -> bool {
        self.core.destroyed.load(Ordering::SeqCst)
    }

    /// Connect to a peer. Idempotent per peer: a pending or open node is
    /// returned as-is.
    pub async fn connect(
        &self,
        peer: PeerId,
        options: ConnectOptions,
    ) -> Result<Arc<RemoteNode>, MeshError> {
        self.core.connect(peer, options).await
    }

    /// Send to every open node; returns how many sends succeeded.
    pub async fn broadcast(&self, payload: Payload, options: SendOptions) -> usize {
        self.core.broadcast(payload, options).await
    }

    pub fn node(&self, peer: &PeerId) -> Option<Arc<RemoteNode>> {
        self.core.node(peer)
    }

    /// Peers with a node, open or not.
    pub fn peers(&self) -> Vec<PeerId> {
        self.core.nodes.lock().unwrap().keys().cloned().collect()
    }

    /// Sever the signaling session, keeping open P2P links. Idempotent.
    pub fn disconnect(&self) {
        if self.core.destroyed.load(Ordering::SeqCst) {
            return;
        }
        self.core.disconnect_internal();
    }

    /// Re-establish signaling with the previously-assigned id. Only valid
    /// while disconnected and not destroyed.
    pub async fn reconnect(&self) -> Result<(), MeshError> {
        self.core.reconnect().await
    }

    /// Close everything. Terminal.
    pub async fn destroy(&self) {
        self.core.destroy().await;
    }

    /// Signaling messages held for connections that do not exist yet.
    pub fn lost_message_count(&self) -> usize {
        let client_scoped: usize = self
            .core
            .lost_messages
            .lock()
            .unwrap()
            .values()
            .map(Vec::len)
            .sum();
        let node_scoped: usize = self
            .core
            .nodes
            .lock()
            .unwrap()
            .values()
            .map(|n| n.lost_message_count())
            .sum();
        client_scoped + node_scoped
    }

    /// Mesh handshakes still waiting for an acknowledgement.
    pub fn pending_handshakes(&self) -> usize {
        self.core.network.pending_count()
    }

    /// Outgoing connection attempts still in flight.
    pub fn pending_connection_attempts(&self) -> usize {
        self.core.connection_attempts.lock().unwrap().len()
    }
}

impl ClientCore {
    async fn start(core: Arc<ClientCore>, requested_id: Option<PeerId>) {
        let id = match requested_id {
            Some(id) => id,
            None => match core.server.retrieve_id().await {
                Ok(id) => id,
                Err(e) => {
                    core.abort(e.kind(), e.message().to_string()).await;
                    return;
                }
            },
        };
        *core.id.lock().unwrap() = Some(id.clone());

        match core.server.connect(&id, &core.token).await {
            Ok(events) => core.spawn_route_loop(events),
            Err(e) => core.abort(e.kind(), e.message().to_string()).await,
        }
    }

    fn spawn_route_loop(self: &Arc<Self>, mut events: mpsc::UnboundedReceiver<SocketEvent>) {
        let core = self.clone();
        let handle = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    SocketEvent::Message(msg) => core.handle_message(msg).await,
                    SocketEvent::Closed => {
                        core.handle_socket_closed().await;
                        break;
                    }
                }
            }
        });
        if let Some(previous) = self.route_task.lock().unwrap().replace(handle) {
            previous.abort();
        }
    }

    pub(crate) fn network(&self) -> &NetworkManager {
        &self.network
    }

    pub(crate) fn node(&self, peer: &PeerId) -> Option<Arc<RemoteNode>> {
        self.nodes.lock().unwrap().get(peer).cloned()
    }

    pub(crate) fn id(&self) -> Option<PeerId> {
        self.id.lock().unwrap().clone()
    }

    fn local_id(&self) -> PeerId {
        self.id().unwrap_or_else(|| PeerId::assigned(""))
    }

    pub(crate) fn clear_attempt(&self, peer: &PeerId) {
        self.connection_attempts.lock().unwrap().remove(peer);
    }

    pub(crate) fn remove_node(&self, peer: &PeerId) {
        self.nodes.lock().unwrap().remove(peer);
        self.clear_attempt(peer);
        self.network.on_node_close(peer);
    }

    pub(crate) fn open_peer_ids(&self) -> Vec<PeerId> {
        self.nodes
            .lock()
            .unwrap()
            .values()
            .filter(|n| n.is_open())
            .map(|n| n.peer().clone())
            .collect()
    }

    /// A node latched open; kick off mesh discovery toward it.
    pub(crate) fn on_node_open(&self, node: &Arc<RemoteNode>) {
        self.network.on_node_open(node);
    }

    fn take_lost(&self, id: &ConnectionId) -> Vec<ServerMessage> {
        self.lost_messages
            .lock()
            .unwrap()
            .remove(id)
            .unwrap_or_default()
    }

    fn ensure_node(
        self: &Arc<Self>,
        peer: &PeerId,
        metadata: Option<serde_json::Value>,
    ) -> (Arc<RemoteNode>, bool) {
        let mut nodes = self.nodes.lock().unwrap();
        if let Some(node) = nodes.get(peer) {
            return (node.clone(), false);
        }
        let node = RemoteNode::new(
            peer.clone(),
            self.local_id(),
            metadata,
            Arc::downgrade(self),
            self.options.ping_interval,
        );
        nodes.insert(peer.clone(), node.clone());
        (node, true)
    }

    async fn open_channel(
        self: &Arc<Self>,
        node: &Arc<RemoteNode>,
        kind: ChannelKind,
        options: ConnectOptions,
    ) -> Result<Arc<DataConnection>, MeshError> {
        let serialization = options
            .serialization
            .unwrap_or_else(|| "binary".to_string());
        let serializer = self.options.serializer(&serialization).ok_or_else(|| {
            MeshError::new(
                MeshErrorKind::Webrtc,
                format!("unknown serialization {serialization:?}"),
            )
        })?;
        let connection_id = ConnectionId::new(format!("mc_{}", self.options.tokens.token()));
        let conn = DataConnection::new(
            node.peer().clone(),
            connection_id,
            kind,
            serialization,
            options.metadata,
            serializer,
            self.server.clone(),
            self.events.clone(),
            options.sdp_transform,
            Arc::downgrade(node),
        );
        node.add_connection(conn.clone());
        conn.start(&self.factory, &self.options.ice_servers, true)
            .await?;
        Ok(conn)
    }

    pub(crate) async fn connect(
        self: &Arc<Self>,
        peer: PeerId,
        options: ConnectOptions,
    ) -> Result<Arc<RemoteNode>, MeshError> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(MeshError::destroyed("client"));
        }
        if self.disconnected.load(Ordering::SeqCst) {
            return Err(MeshError::new(
                MeshErrorKind::Disconnected,
                "cannot connect while the signaling session is down",
            ));
        }

        {
            let nodes = self.nodes.lock().unwrap();
            if let Some(node) = nodes.get(&peer) {
                let pending = self.connection_attempts.lock().unwrap().contains(&peer);
                if node.is_open() || pending {
                    return Ok(node.clone());
                }
            }
        }

        self.connection_attempts.lock().unwrap().insert(peer.clone());
        let (node, _) = self.ensure_node(&peer, None);
        let kind = ChannelKind::from_reliable(options.reliable.unwrap_or(true));

        match self.open_channel(&node, kind, options).await {
            Ok(_) => Ok(node),
            Err(e) => {
                self.clear_attempt(&peer);
                if node.connection_count() == 0 {
                    node.close().await;
                }
                Err(e)
            }
        }
    }

    /// Open an additional channel with the given label on an existing open
    /// node (lazy label creation from `RemoteNode::send`).
    pub(crate) async fn ensure_channel(
        self: &Arc<Self>,
        peer: &PeerId,
        kind: ChannelKind,
    ) -> Result<(), MeshError> {
        let Some(node) = self.node(peer) else {
            return Ok(());
        };
        if !node.is_open() || node.is_destroyed() {
            return Ok(());
        }
        if node.has_connection_kind(kind) {
            return Ok(());
        }
        debug!("opening {kind} channel to {peer}");
        self.open_channel(
            &node,
            kind,
            ConnectOptions {
                reliable: Some(kind.reliable()),
                ..Default::default()
            },
        )
        .await
        .map(|_| ())
    }

    pub(crate) async fn broadcast(self: &Arc<Self>, payload: Payload, options: SendOptions) -> usize {
        let nodes: Vec<_> = self
            .nodes
            .lock()
            .unwrap()
            .values()
            .filter(|n| n.is_open())
            .cloned()
            .collect();
        let mut delivered = 0;
        for node in nodes {
            match node.send(payload.clone(), options).await {
                Ok(()) => delivered += 1,
                Err(e) => warn!("broadcast to {} failed: {e}", node.peer()),
            }
        }
        delivered
    }

    /// React to a received peer list: connect to everyone we do not already
    /// know. Individual failures are logged and do not abort the batch.
    pub(crate) async fn connect_to_peers(self: &Arc<Self>, peers: Vec<PeerId>) {
        let own = self.id();
        for peer in peers {
            if Some(&peer) == own.as_ref() {
                continue;
            }
            if self.nodes.lock().unwrap().contains_key(&peer) {
                continue;
            }
            if self.connection_attempts.lock().unwrap().contains(&peer) {
                continue;
            }
            debug!("transitive connect to {peer}");
            if let Err(e) = self.connect(peer.clone(), ConnectOptions::default()).await {
                warn!("transitive connect to {peer} failed: {e}");
            }
        }
    }

    async fn handle_message(self: &Arc<Self>, msg: ServerMessage) {
        match msg.kind {
            ServerMessageType::Open => {
                self.disconnected.store(false, Ordering::SeqCst);
                self.ever_opened.store(true, Ordering::SeqCst);
                if !self.open.swap(true, Ordering::SeqCst) {
                    if let Some(id) = self.id() {
                        debug!("signaling session open as {id}");
                        self.events.emit(ClientEvent::Open(id));
                    }
                }
            }
            ServerMessageType::Error => {
                let message = msg
                    .payload
                    .and_then(|p| p.msg)
                    .unwrap_or_else(|| "signaling server error".to_string());
                self.abort(MeshErrorKind::ServerError, message).await;
            }
            ServerMessageType::IdTaken => {
                let id = self.local_id();
                self.abort(
                    MeshErrorKind::UnavailableId,
                    format!("id {id} is already taken"),
                )
                .await;
            }
            ServerMessageType::InvalidKey => {
                self.abort(
                    MeshErrorKind::InvalidKey,
                    format!("api key {:?} is invalid", self.options.key),
                )
                .await;
            }
            ServerMessageType::Expire => {
                let Some(src) = msg.src else {
                    return;
                };
                self.events.emit(ClientEvent::Error(MeshError::new(
                    MeshErrorKind::PeerUnavailable,
                    format!("could not connect to peer {src}"),
                )));
                self.clear_attempt(&src);
                let stale = self.node(&src).filter(|n| !n.is_open());
                if let Some(node) = stale {
                    node.close().await;
                }
            }
            ServerMessageType::Leave => {
                let Some(src) = msg.src else {
                    return;
                };
                debug!("peer {src} left");
                if let Some(node) = self.node(&src) {
                    node.close().await;
                }
            }
            ServerMessageType::Offer => {
                self.handle_offer(msg).await;
            }
            ServerMessageType::Answer | ServerMessageType::Candidate => {
                self.route_to_connection(msg).await;
            }
            ServerMessageType::Heartbeat => {}
        }
    }

    async fn handle_offer(self: &Arc<Self>, msg: ServerMessage) {
        let Some(src) = msg.src.clone() else {
            warn!("offer without src");
            return;
        };
        let payload = msg.payload.unwrap_or_default();
        let (Some(connection_id), Some(sdp)) = (payload.connection_id.clone(), payload.sdp.clone())
        else {
            warn!("offer from {src} missing connectionId or sdp");
            return;
        };

        let (node, created) = self.ensure_node(&src, payload.metadata.clone());
        if created {
            self.events.emit(ClientEvent::Connection(node.clone()));
        }

        // A colliding connection id means stale state on our side: drop the
        // old connection and take the fresh offer.
        if let Some(existing) = node.detach_connection(&connection_id) {
            debug!("recreating connection {connection_id} to {src} for new offer");
            existing.close_for_node_shutdown().await;
        }

        let kind = ChannelKind::from_reliable(payload.reliable.unwrap_or(true));
        let serialization = payload
            .serialization
            .clone()
            .unwrap_or_else(|| "binary".to_string());
        let Some(serializer) = self.options.serializer(&serialization) else {
            warn!("offer from {src} uses unknown serialization {serialization:?}");
            return;
        };

        let conn = DataConnection::new(
            src.clone(),
            connection_id.clone(),
            kind,
            serialization,
            payload.metadata.clone(),
            serializer,
            self.server.clone(),
            self.events.clone(),
            None,
            Arc::downgrade(&node),
        );
        node.add_connection(conn.clone());

        if let Err(e) = conn
            .start(&self.factory, &self.options.ice_servers, false)
            .await
        {
            self.events.emit(ClientEvent::Error(MeshError::new(
                MeshErrorKind::Webrtc,
                format!("failed to accept connection from {src}: {e}"),
            )));
            if let Some(conn) = node.detach_connection(&connection_id) {
                conn.close_for_node_shutdown().await;
            }
            return;
        }

        // Replay anything that overtook the offer, then apply the offer.
        for held in node.take_lost(&connection_id) {
            conn.handle_message(held).await;
        }
        for held in self.take_lost(&connection_id) {
            conn.handle_message(held).await;
        }
        conn.handle_offer(sdp).await;
    }

    async fn route_to_connection(self: &Arc<Self>, msg: ServerMessage) {
        let Some(src) = msg.src.clone() else {
            warn!("{:?} without src", msg.kind);
            return;
        };
        let Some(connection_id) = msg.connection_id().cloned() else {
            warn!("{:?} from {src} without connectionId", msg.kind);
            return;
        };

        let node = self.node(&src);
        match node {
            None => {
                debug!(
                    "holding {:?} for unknown peer {src} (connection {connection_id})",
                    msg.kind
                );
                self.lost_messages
                    .lock()
                    .unwrap()
                    .entry(connection_id)
                    .or_default()
                    .push(msg);
            }
            Some(node) => match node.connection_by_id(&connection_id) {
                Some(conn) => conn.handle_message(msg).await,
                None => {
                    debug!(
                        "holding {:?} for missing connection {connection_id} to {src}",
                        msg.kind
                    );
                    node.store_lost(connection_id, msg);
                }
            },
        }
    }

    async fn handle_socket_closed(self: &Arc<Self>) {
        if self.destroyed.load(Ordering::SeqCst) || self.disconnected.load(Ordering::SeqCst) {
            return;
        }
        if self.open.load(Ordering::SeqCst) {
            self.events.emit(ClientEvent::Error(MeshError::new(
                MeshErrorKind::Network,
                "lost connection to the signaling server",
            )));
            self.disconnect_internal();
        } else {
            self.abort(
                MeshErrorKind::SocketClosed,
                "the signaling socket closed before the session opened",
            )
            .await;
        }
    }

    /// Fatal-error path: emit, then destroy when the server never issued a
    /// session, else merely disconnect (preserving open P2P links).
    async fn abort(self: &Arc<Self>, kind: MeshErrorKind, message: impl Into<String>) {
        let err = MeshError::new(kind, message);
        error!("aborting signaling session: {err}");
        self.events.emit(ClientEvent::Error(err));
        if !self.ever_opened.load(Ordering::SeqCst) {
            self.destroy().await;
        } else {
            self.disconnect_internal();
        }
    }

    pub(crate) fn disconnect_internal(&self) {
        if self.disconnected.swap(true, Ordering::SeqCst) {
            return;
        }
        self.open.store(false, Ordering::SeqCst);
        if let Some(task) = self.route_task.lock().unwrap().take() {
            task.abort();
        }
        self.server.disconnect();
        if let Some(id) = self.id() {
            debug!("disconnected from signaling as {id}");
            self.events.emit(ClientEvent::Disconnected(id));
        }
    }

    pub(crate) async fn reconnect(self: &Arc<Self>) -> Result<(), MeshError> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(MeshError::destroyed("client"));
        }
        if !self.disconnected.load(Ordering::SeqCst) {
            return Err(MeshError::new(
                MeshErrorKind::Network,
                "reconnect is only valid on a disconnected client",
            ));
        }
        let id = self.id().ok_or_else(|| {
            MeshError::new(
                MeshErrorKind::Network,
                "cannot reconnect before an id was assigned",
            )
        })?;
        debug!("reconnecting to signaling as {id}");
        let events = self.server.connect(&id, &self.token).await?;
        self.disconnected.store(false, Ordering::SeqCst);
        self.spawn_route_loop(events);
        Ok(())
    }

    pub(crate) async fn destroy(self: &Arc<Self>) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.disconnect_internal();

        let nodes: Vec<_> = {
            let mut guard = self.nodes.lock().unwrap();
            guard.drain().map(|(_, node)| node).collect()
        };
        for node in nodes {
            node.close().await;
        }
        self.connection_attempts.lock().unwrap().clear();
        self.lost_messages.lock().unwrap().clear();

        if !self.close_emitted.swap(true, Ordering::SeqCst) {
            debug!("client destroyed");
            self.events.emit(ClientEvent::Close);
        }
    }
}

impl Drop for ClientCore {
    fn drop(&mut self) {
        if let Ok(mut task) = self.route_task.lock() {
            if let Some(task) = task.take() {
                task.abort();
            }
        }
    }
}
