//! Signaling transport
//!
//! The client reaches its signaling server through the `SignalingConnector`
//! / `SignalingSession` pair so the same routing logic runs against the real
//! WebSocket endpoint and the in-memory mock server used in tests.
//! `ServerManager` owns the live session: it pumps incoming messages to the
//! client and keeps the heartbeat running.

pub mod api;
pub mod message;
pub mod mock;
pub mod socket;

use crate::config::MeshOptions;
use crate::error::{MeshError, MeshErrorKind};
use async_trait::async_trait;
use message::ServerMessage;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub use crate::types::PeerId;

/// Something the signaling session can hand to the client.
#[derive(Debug, Clone)]
pub enum SocketEvent {
    Message(ServerMessage),
    /// The transport closed from the remote side.
    Closed,
}

/// Allocates ids and opens signaling sessions.
#[async_trait]
pub trait SignalingConnector: Send + Sync {
    async fn retrieve_id(&self, options: &MeshOptions) -> Result<PeerId, MeshError>;

    async fn open_session(
        &self,
        options: &MeshOptions,
        id: &PeerId,
        token: &str,
    ) -> Result<Box<dyn SignalingSession>, MeshError>;
}

/// A live signaling session.
///
/// Outgoing messages go through the cloned sender (writes are serialized by
/// the session's own writer task); incoming traffic is pulled with `recv`.
#[async_trait]
pub trait SignalingSession: Send {
    fn sender(&self) -> mpsc::UnboundedSender<ServerMessage>;

    async fn recv(&mut self) -> Option<SocketEvent>;

    async fn close(&mut self);
}

struct ActiveSession {
    tx: mpsc::UnboundedSender<ServerMessage>,
    shutdown: watch::Sender<bool>,
    pump: JoinHandle<()>,
    heartbeat: JoinHandle<()>,
}

/// Owns the signaling session on behalf of the client.
///
/// There is no socket-level auto-reconnect: when the session dies the client
/// decides whether to rebuild it (`MeshClient::reconnect`).
pub struct ServerManager {
    connector: Arc<dyn SignalingConnector>,
    options: MeshOptions,
    active: std::sync::Mutex<Option<ActiveSession>>,
}

impl ServerManager {
    pub fn new(connector: Arc<dyn SignalingConnector>, options: MeshOptions) -> Self {
        Self {
            connector,
            options,
            active: std::sync::Mutex::new(None),
        }
    }

    pub async fn retrieve_id(&self) -> Result<PeerId, MeshError> {
        self.connector.retrieve_id(&self.options).await
    }

    /// Open a session and start the pump and heartbeat tasks.
    ///
    /// Returns the stream of socket events for the client to route.
    pub async fn connect(
        &self,
        id: &PeerId,
        token: &str,
    ) -> Result<mpsc::UnboundedReceiver<SocketEvent>, MeshError> {
        let mut session = self
            .connector
            .open_session(&self.options, id, token)
            .await?;
        let tx = session.sender();

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let pump = tokio::spawn(async move {
            loop {
                tokio::select! {
                    // The watch only ever flips to true; any change (or a
                    // dropped sender) means shutdown.
                    _ = shutdown_rx.changed() => {
                        session.close().await;
                        break;
                    }
                    event = session.recv() => {
                        match event {
                            Some(SocketEvent::Closed) | None => {
                                let _ = event_tx.send(SocketEvent::Closed);
                                break;
                            }
                            Some(event) => {
                                let _ = event_tx.send(event);
                            }
                        }
                    }
                }
            }
            debug!("signaling pump terminated");
        });

        let heartbeat_tx = tx.clone();
        let period = self.options.ping_interval;
        let heartbeat = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                if heartbeat_tx.send(ServerMessage::heartbeat()).is_err() {
                    break;
                }
            }
        });

        let previous = self.active.lock().unwrap().replace(ActiveSession {
            tx,
            shutdown: shutdown_tx,
            pump,
            heartbeat,
        });
        if let Some(previous) = previous {
            Self::teardown(previous);
        }

        Ok(event_rx)
    }

    /// Queue a message for the server.
    pub fn send(&self, msg: ServerMessage) -> Result<(), MeshError> {
        let active = self.active.lock().unwrap();
        match active.as_ref() {
            Some(session) if session.tx.send(msg).is_ok() => Ok(()),
            _ => Err(MeshError::new(
                MeshErrorKind::Disconnected,
                "signaling session is not connected",
            )),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.active.lock().unwrap().is_some()
    }

    /// Tear down the session. Idempotent.
    pub fn disconnect(&self) {
        if let Some(session) = self.active.lock().unwrap().take() {
            Self::teardown(session);
        }
    }

    fn teardown(session: ActiveSession) {
        session.heartbeat.abort();
        if session.shutdown.send(true).is_err() {
            // Pump already gone; make sure it is not stuck.
            session.pump.abort();
        }
    }
}

impl Drop for ServerManager {
    fn drop(&mut self) {
        if let Ok(mut active) = self.active.lock() {
            if let Some(session) = active.take() {
                session.heartbeat.abort();
                session.pump.abort();
                let _ = session.shutdown.send(true);
            }
        } else {
            warn!("server manager lock poisoned during drop");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockSignalingServer;
    use super::*;
    use crate::signaling::message::ServerMessageType;
    use std::time::Duration;

    #[tokio::test]
    async fn connect_receives_open_and_heartbeats_flow() {
        let server = MockSignalingServer::new();
        let mut options = MeshOptions::default();
        options.ping_interval = Duration::from_millis(20);
        let manager = ServerManager::new(server.connector(), options);

        let id = manager.retrieve_id().await.unwrap();
        let mut events = manager.connect(&id, "tok").await.unwrap();

        match events.recv().await {
            Some(SocketEvent::Message(msg)) => assert_eq!(msg.kind, ServerMessageType::Open),
            other => panic!("expected OPEN, got {other:?}"),
        }
        assert!(manager.is_connected());

        manager.disconnect();
        assert!(!manager.is_connected());
        assert!(manager.send(ServerMessage::heartbeat()).is_err());
    }

    #[tokio::test]
    async fn disconnect_is_idempotent() {
        let server = MockSignalingServer::new();
        let manager = ServerManager::new(server.connector(), MeshOptions::default());
        let id = manager.retrieve_id().await.unwrap();
        let _events = manager.connect(&id, "tok").await.unwrap();

        manager.disconnect();
        manager.disconnect();
        assert!(!manager.is_connected());
    }
}
