//! WebRTC partial-mesh client
//!
//! peermesh brokers peer connections through a central signaling server and
//! then forms a partial mesh among all reachable peers over WebRTC data
//! channels.
//!
//! # Overview
//!
//! - **Signaling**: id allocation over HTTP plus a persistent WebSocket for
//!   SDP/ICE exchange and heartbeats
//! - **Peers**: each remote peer is a [`RemoteNode`] aggregating one or more
//!   labeled data channels (`reliable` / `realtime`)
//! - **Discovery**: open nodes exchange `mesh-peers` lists in-band and the
//!   client transitively connects to newly-learned peers
//!
//! # Example
//!
//! ```rust,no_run
//! use peermesh::{ClientEvent, ConnectOptions, MeshClient, MeshOptions, Payload, PeerId};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = MeshClient::new(MeshOptions::default());
//!     let mut events = client.subscribe();
//!
//!     while let Some(event) = events.recv().await {
//!         match event {
//!             ClientEvent::Open(id) => {
//!                 println!("online as {id}");
//!                 let node = client
//!                     .connect(PeerId::new("some-peer")?, ConnectOptions::default())
//!                     .await?;
//!                 let mut node_events = node.subscribe();
//!                 tokio::spawn(async move {
//!                     while let Some(event) = node_events.recv().await {
//!                         println!("node event: {event:?}");
//!                     }
//!                 });
//!             }
//!             ClientEvent::Connection(node) => println!("incoming: {}", node.peer()),
//!             ClientEvent::Close => break,
//!             _ => {}
//!         }
//!     }
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod config;
pub mod connection;
pub mod emitter;
pub mod error;
pub mod negotiator;
pub mod network;
pub mod node;
pub mod serializer;
pub mod signaling;
pub mod transport;
pub mod types;

pub use client::{ClientEvent, MeshClient};
pub use config::{
    ConnectOptions, IceServer, MeshOptions, RandomTokens, SendOptions, SequenceTokens,
    TokenSource,
};
pub use connection::DataConnection;
pub use error::{MeshError, MeshErrorKind};
pub use negotiator::NegotiationState;
pub use network::{ControlEnvelope, MeshControl};
pub use node::{NodeEvent, RemoteNode};
pub use serializer::{
    builtin_serializers, BinarySerializer, JsonSerializer, RawSerializer, Serializer, JSON_MTU,
};
pub use signaling::message::{
    IceCandidateJson, ServerMessage, ServerMessageType, SessionDescription, SignalPayload,
};
pub use signaling::mock::MockSignalingServer;
pub use signaling::{ServerManager, SignalingConnector, SignalingSession, SocketEvent};
pub use transport::mock::{MockConnectionFactory, MockNetwork};
pub use transport::real::RealConnectionFactory;
pub use transport::{
    CandidatePairStats, ChannelState, DataChannel, IceState, PeerConnection,
    PeerConnectionFactory,
};
pub use types::{ChannelKind, ConnectionId, Payload, PeerId};
