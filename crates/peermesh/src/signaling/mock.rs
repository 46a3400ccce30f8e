//! In-memory signaling server for tests
//!
//! Routes OFFER / ANSWER / CANDIDATE between registered sessions the way the
//! real server does: src is stamped by the server, unknown destinations get
//! an EXPIRE back. Per-type delivery delays let tests reorder signaling
//! traffic deliberately.

use super::message::{ServerMessage, ServerMessageType};
use super::{SignalingConnector, SignalingSession, SocketEvent};
use crate::config::MeshOptions;
use crate::error::MeshError;
use crate::types::PeerId;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

struct ServerInner {
    clients: Mutex<HashMap<PeerId, mpsc::UnboundedSender<SocketEvent>>>,
    delays: Mutex<HashMap<ServerMessageType, Duration>>,
    next_id: AtomicU64,
}

impl ServerInner {
    fn deliver(&self, dst: &PeerId, msg: ServerMessage) -> bool {
        let delay = self.delays.lock().unwrap().get(&msg.kind).copied();
        let clients = self.clients.lock().unwrap();
        let Some(tx) = clients.get(dst) else {
            return false;
        };
        match delay {
            Some(delay) => {
                let tx = tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = tx.send(SocketEvent::Message(msg));
                });
                true
            }
            None => tx.send(SocketEvent::Message(msg)).is_ok(),
        }
    }

    fn route(&self, src: &PeerId, mut msg: ServerMessage) {
        match msg.kind {
            ServerMessageType::Offer
            | ServerMessageType::Answer
            | ServerMessageType::Candidate
            | ServerMessageType::Leave => {
                let Some(dst) = msg.dst.clone() else {
                    debug!("dropping {:?} without dst from {src}", msg.kind);
                    return;
                };
                msg.src = Some(src.clone());
                if !self.deliver(&dst, msg) {
                    // Destination is gone: tell the sender its peer expired.
                    let expire = ServerMessage {
                        kind: ServerMessageType::Expire,
                        src: Some(dst),
                        dst: Some(src.clone()),
                        payload: None,
                    };
                    self.deliver(src, expire);
                }
            }
            ServerMessageType::Heartbeat => {}
            other => debug!("mock server ignoring {other:?} from {src}"),
        }
    }

    fn unregister(&self, id: &PeerId) {
        self.clients.lock().unwrap().remove(id);
    }
}

/// The mock server. Clone-cheap handle around shared state.
#[derive(Clone)]
pub struct MockSignalingServer {
    inner: Arc<ServerInner>,
}

impl MockSignalingServer {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ServerInner {
                clients: Mutex::new(HashMap::new()),
                delays: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// A connector for clients under test.
    pub fn connector(&self) -> Arc<dyn SignalingConnector> {
        Arc::new(MockConnector {
            server: self.inner.clone(),
        })
    }

    /// Delay every delivered message of `kind`, letting other traffic
    /// overtake it.
    pub fn set_delivery_delay(&self, kind: ServerMessageType, delay: Duration) {
        self.inner.delays.lock().unwrap().insert(kind, delay);
    }

    /// Inject a message as if the server produced it. Returns false when the
    /// destination is not registered.
    pub fn send_to(&self, dst: &PeerId, msg: ServerMessage) -> bool {
        self.inner.deliver(dst, msg)
    }

    pub fn is_registered(&self, id: &PeerId) -> bool {
        self.inner.clients.lock().unwrap().contains_key(id)
    }
}

impl Default for MockSignalingServer {
    fn default() -> Self {
        Self::new()
    }
}

struct MockConnector {
    server: Arc<ServerInner>,
}

#[async_trait]
impl SignalingConnector for MockConnector {
    async fn retrieve_id(&self, _options: &MeshOptions) -> Result<PeerId, MeshError> {
        let n = self.server.next_id.fetch_add(1, Ordering::Relaxed);
        Ok(PeerId::assigned(format!("mock-{n}")))
    }

    async fn open_session(
        &self,
        _options: &MeshOptions,
        id: &PeerId,
        _token: &str,
    ) -> Result<Box<dyn SignalingSession>, MeshError> {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ServerMessage>();

        {
            let mut clients = self.server.clients.lock().unwrap();
            if clients.contains_key(id) {
                // Same behavior as the real server: ID-TAKEN, then the
                // session is cut.
                let _ = event_tx.send(SocketEvent::Message(ServerMessage {
                    kind: ServerMessageType::IdTaken,
                    src: None,
                    dst: None,
                    payload: None,
                }));
                let _ = event_tx.send(SocketEvent::Closed);
                return Ok(Box::new(MockSession {
                    id: id.clone(),
                    registered: false,
                    server: self.server.clone(),
                    tx: out_tx,
                    events: event_rx,
                    router: None,
                }));
            }
            clients.insert(id.clone(), event_tx.clone());
        }

        let _ = event_tx.send(SocketEvent::Message(ServerMessage {
            kind: ServerMessageType::Open,
            src: None,
            dst: None,
            payload: None,
        }));

        let server = self.server.clone();
        let src = id.clone();
        let router = tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                server.route(&src, msg);
            }
        });

        Ok(Box::new(MockSession {
            id: id.clone(),
            registered: true,
            server: self.server.clone(),
            tx: out_tx,
            events: event_rx,
            router: Some(router),
        }))
    }
}

struct MockSession {
    id: PeerId,
    registered: bool,
    server: Arc<ServerInner>,
    tx: mpsc::UnboundedSender<ServerMessage>,
    events: mpsc::UnboundedReceiver<SocketEvent>,
    router: Option<JoinHandle<()>>,
}

#[async_trait]
impl SignalingSession for MockSession {
    fn sender(&self) -> mpsc::UnboundedSender<ServerMessage> {
        self.tx.clone()
    }

    async fn recv(&mut self) -> Option<SocketEvent> {
        self.events.recv().await
    }

    async fn close(&mut self) {
        if self.registered {
            self.server.unregister(&self.id);
            self.registered = false;
        }
        if let Some(router) = self.router.take() {
            router.abort();
        }
    }
}

impl Drop for MockSession {
    fn drop(&mut self) {
        if self.registered {
            self.server.unregister(&self.id);
        }
        if let Some(router) = self.router.take() {
            router.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(id: &str) -> PeerId {
        PeerId::new(id).unwrap()
    }

    #[tokio::test]
    async fn routes_between_sessions_and_stamps_src() {
        let server = MockSignalingServer::new();
        let connector = server.connector();
        let options = MeshOptions::default();

        let mut a = connector.open_session(&options, &peer("a"), "t").await.unwrap();
        let mut b = connector.open_session(&options, &peer("b"), "t").await.unwrap();
        // Drain OPEN events.
        assert!(matches!(a.recv().await, Some(SocketEvent::Message(_))));
        assert!(matches!(b.recv().await, Some(SocketEvent::Message(_))));

        a.sender()
            .send(ServerMessage::offer(peer("b"), Default::default()))
            .unwrap();

        match b.recv().await {
            Some(SocketEvent::Message(msg)) => {
                assert_eq!(msg.kind, ServerMessageType::Offer);
                assert_eq!(msg.src, Some(peer("a")));
            }
            other => panic!("expected routed offer, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_destination_expires() {
        let server = MockSignalingServer::new();
        let connector = server.connector();
        let options = MeshOptions::default();

        let mut a = connector.open_session(&options, &peer("a"), "t").await.unwrap();
        assert!(matches!(a.recv().await, Some(SocketEvent::Message(_))));

        a.sender()
            .send(ServerMessage::offer(peer("ghost"), Default::default()))
            .unwrap();

        match a.recv().await {
            Some(SocketEvent::Message(msg)) => {
                assert_eq!(msg.kind, ServerMessageType::Expire);
                assert_eq!(msg.src, Some(peer("ghost")));
            }
            other => panic!("expected EXPIRE, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn duplicate_id_is_taken() {
        let server = MockSignalingServer::new();
        let connector = server.connector();
        let options = MeshOptions::default();

        let _a = connector.open_session(&options, &peer("a"), "t").await.unwrap();
        let mut dup = connector.open_session(&options, &peer("a"), "t").await.unwrap();

        match dup.recv().await {
            Some(SocketEvent::Message(msg)) => assert_eq!(msg.kind, ServerMessageType::IdTaken),
            other => panic!("expected ID-TAKEN, got {other:?}"),
        }
        assert!(matches!(dup.recv().await, Some(SocketEvent::Closed)));
    }
}
