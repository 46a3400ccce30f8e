//! WebRTC transport seam
//!
//! The negotiator and data connections drive peer connections through these
//! traits. `real` wires them to the webrtc crate; `mock` pairs connections
//! in memory with synthetic SDP and candidates so the full negotiation path
//! runs deterministically in tests.

pub mod mock;
pub mod real;

use crate::config::IceServer;
use crate::error::MeshError;
use crate::signaling::message::{IceCandidateJson, SessionDescription};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;

/// ICE connection states surfaced to the negotiator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

/// Data-channel ready states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// One ICE candidate pair as reported by transport statistics.
#[derive(Debug, Clone, Copy, Default)]
pub struct CandidatePairStats {
    pub succeeded: bool,
    /// Seconds, when the pair has reported a round-trip time.
    pub current_round_trip_time: Option<f64>,
}

/// `None` marks end-of-candidates.
pub type CandidateHandler = Box<dyn Fn(Option<IceCandidateJson>) + Send + Sync>;
pub type IceStateHandler = Box<dyn Fn(IceState) + Send + Sync>;
pub type IncomingChannelHandler = Box<dyn Fn(Arc<dyn DataChannel>) + Send + Sync>;
pub type ChannelOpenHandler = Box<dyn Fn() + Send + Sync>;
pub type ChannelMessageHandler = Box<dyn Fn(Bytes) + Send + Sync>;
pub type ChannelCloseHandler = Box<dyn Fn() + Send + Sync>;
pub type BufferedAmountLowHandler = Box<dyn Fn() + Send + Sync>;

/// Creates peer connections against a given ICE server set.
#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    async fn create_peer_connection(
        &self,
        ice_servers: &[IceServer],
    ) -> Result<Arc<dyn PeerConnection>, MeshError>;
}

/// One WebRTC peer connection.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn create_data_channel(
        &self,
        label: &str,
        ordered: bool,
    ) -> Result<Arc<dyn DataChannel>, MeshError>;

    async fn create_offer(&self) -> Result<SessionDescription, MeshError>;

    async fn create_answer(&self) -> Result<SessionDescription, MeshError>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), MeshError>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), MeshError>;

    async fn add_ice_candidate(&self, candidate: IceCandidateJson) -> Result<(), MeshError>;

    /// Snapshot of the current ICE candidate pairs.
    async fn candidate_pair_stats(&self) -> Result<Vec<CandidatePairStats>, MeshError>;

    fn on_ice_candidate(&self, handler: CandidateHandler);

    fn on_ice_state_change(&self, handler: IceStateHandler);

    fn on_data_channel(&self, handler: IncomingChannelHandler);

    async fn close(&self);

    fn is_closed(&self) -> bool;
}

/// One data channel on a peer connection.
#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> String;

    fn state(&self) -> ChannelState;

    async fn buffered_amount(&self) -> usize;

    async fn set_buffered_amount_low_threshold(&self, threshold: usize);

    async fn send(&self, data: Bytes) -> Result<(), MeshError>;

    /// Fires when the channel opens. Implementations invoke the handler
    /// immediately when the channel is already open at registration time.
    fn on_open(&self, handler: ChannelOpenHandler);

    fn on_message(&self, handler: ChannelMessageHandler);

    fn on_close(&self, handler: ChannelCloseHandler);

    async fn on_buffered_amount_low(&self, handler: BufferedAmountLowHandler);

    async fn close(&self);
}
