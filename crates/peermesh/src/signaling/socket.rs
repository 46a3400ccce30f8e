//! WebSocket signaling session
//!
//! A persistent socket to the server's `peerjs` endpoint. The stream is
//! split into a writer task fed by an unbounded channel and a reader task
//! that parses frames and forwards socket events.

use super::api::HttpApi;
use super::message::ServerMessage;
use super::{SignalingConnector, SignalingSession, SocketEvent};
use crate::config::MeshOptions;
use crate::error::{MeshError, MeshErrorKind};
use crate::types::PeerId;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, warn};

/// Production connector: HTTP id retrieval + WebSocket sessions.
pub struct WsConnector {
    api: HttpApi,
}

impl WsConnector {
    pub fn new() -> Self {
        Self { api: HttpApi::new() }
    }
}

impl Default for WsConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SignalingConnector for WsConnector {
    async fn retrieve_id(&self, options: &MeshOptions) -> Result<PeerId, MeshError> {
        self.api.retrieve_id(options).await
    }

    async fn open_session(
        &self,
        options: &MeshOptions,
        id: &PeerId,
        token: &str,
    ) -> Result<Box<dyn SignalingSession>, MeshError> {
        let url = format!(
            "{}://{}:{}{}peerjs?key={}&id={}&token={}",
            options.ws_scheme(),
            options.host,
            options.port,
            options.path,
            options.key,
            id,
            token,
        );
        debug!(%url, "opening signaling socket");

        let (stream, _) = connect_async(&url).await.map_err(|e| {
            MeshError::new(
                MeshErrorKind::Network,
                format!("cannot establish a connection to the signaling server: {e}"),
            )
        })?;

        let (mut write, mut read) = stream.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ServerMessage>();
        let (event_tx, event_rx) = mpsc::unbounded_channel::<SocketEvent>();

        let writer: JoinHandle<()> = tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let text = match serde_json::to_string(&msg) {
                    Ok(text) => text,
                    Err(e) => {
                        error!("failed to encode signaling message: {e}");
                        continue;
                    }
                };
                if let Err(e) = write.send(Message::Text(text)).await {
                    error!("signaling socket write failed: {e}");
                    break;
                }
            }
        });

        let reader: JoinHandle<()> = tokio::spawn(async move {
            while let Some(frame) = read.next().await {
                match frame {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ServerMessage>(&text) {
                        Ok(msg) => {
                            if event_tx.send(SocketEvent::Message(msg)).is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            warn!("ignoring unparseable signaling message ({e}): {text}");
                        }
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!("signaling socket read failed: {e}");
                        break;
                    }
                }
            }
            let _ = event_tx.send(SocketEvent::Closed);
        });

        Ok(Box::new(WsSession {
            tx: out_tx,
            events: event_rx,
            tasks: vec![writer, reader],
        }))
    }
}

pub struct WsSession {
    tx: mpsc::UnboundedSender<ServerMessage>,
    events: mpsc::UnboundedReceiver<SocketEvent>,
    tasks: Vec<JoinHandle<()>>,
}

#[async_trait]
impl SignalingSession for WsSession {
    fn sender(&self) -> mpsc::UnboundedSender<ServerMessage> {
        self.tx.clone()
    }

    async fn recv(&mut self) -> Option<SocketEvent> {
        self.events.recv().await
    }

    async fn close(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for WsSession {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
