//! webrtc-crate transport backend

use super::{
    BufferedAmountLowHandler, CandidateHandler, CandidatePairStats, ChannelCloseHandler,
    ChannelMessageHandler, ChannelOpenHandler, ChannelState, DataChannel, IceState,
    IceStateHandler, IncomingChannelHandler, PeerConnection, PeerConnectionFactory,
};
use crate::config::IceServer;
use crate::error::{MeshError, MeshErrorKind};
use crate::signaling::message::{IceCandidateJson, SessionDescription};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;

use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::stats::StatsReportType;

fn webrtc_err(e: impl std::fmt::Display) -> MeshError {
    MeshError::new(MeshErrorKind::Webrtc, e.to_string())
}

/// Production factory building connections from the webrtc crate.
pub struct RealConnectionFactory;

impl RealConnectionFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

#[async_trait]
impl PeerConnectionFactory for RealConnectionFactory {
    async fn create_peer_connection(
        &self,
        ice_servers: &[IceServer],
    ) -> Result<Arc<dyn PeerConnection>, MeshError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(webrtc_err)?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(webrtc_err)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: ice_servers
                .iter()
                .map(|server| RTCIceServer {
                    urls: server.urls.clone(),
                    username: server.username.clone().unwrap_or_default(),
                    credential: server.credential.clone().unwrap_or_default(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };

        let pc = api
            .new_peer_connection(config)
            .await
            .map(Arc::new)
            .map_err(webrtc_err)?;

        Ok(Arc::new(RealPeerConnection { pc }))
    }
}

pub struct RealPeerConnection {
    pc: Arc<RTCPeerConnection>,
}

fn to_session_description(desc: RTCSessionDescription) -> SessionDescription {
    let sdp_type = match desc.sdp_type {
        RTCSdpType::Offer => "offer",
        RTCSdpType::Answer => "answer",
        RTCSdpType::Pranswer => "pranswer",
        RTCSdpType::Rollback => "rollback",
        RTCSdpType::Unspecified => "offer",
    };
    SessionDescription {
        sdp_type: sdp_type.to_string(),
        sdp: desc.sdp,
    }
}

fn from_session_description(desc: SessionDescription) -> Result<RTCSessionDescription, MeshError> {
    if desc.is_offer() {
        RTCSessionDescription::offer(desc.sdp).map_err(webrtc_err)
    } else {
        RTCSessionDescription::answer(desc.sdp).map_err(webrtc_err)
    }
}

fn map_ice_state(state: RTCIceConnectionState) -> IceState {
    match state {
        RTCIceConnectionState::New | RTCIceConnectionState::Unspecified => IceState::New,
        RTCIceConnectionState::Checking => IceState::Checking,
        RTCIceConnectionState::Connected => IceState::Connected,
        RTCIceConnectionState::Completed => IceState::Completed,
        RTCIceConnectionState::Disconnected => IceState::Disconnected,
        RTCIceConnectionState::Failed => IceState::Failed,
        RTCIceConnectionState::Closed => IceState::Closed,
    }
}

#[async_trait]
impl PeerConnection for RealPeerConnection {
    async fn create_data_channel(
        &self,
        label: &str,
        ordered: bool,
    ) -> Result<Arc<dyn DataChannel>, MeshError> {
        let init = RTCDataChannelInit {
            ordered: Some(ordered),
            max_retransmits: if ordered { None } else { Some(0) },
            ..Default::default()
        };
        let dc = self
            .pc
            .create_data_channel(label, Some(init))
            .await
            .map_err(webrtc_err)?;
        Ok(Arc::new(RealDataChannel { dc }))
    }

    async fn create_offer(&self) -> Result<SessionDescription, MeshError> {
        self.pc
            .create_offer(None)
            .await
            .map(to_session_description)
            .map_err(webrtc_err)
    }

    async fn create_answer(&self) -> Result<SessionDescription, MeshError> {
        self.pc
            .create_answer(None)
            .await
            .map(to_session_description)
            .map_err(webrtc_err)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), MeshError> {
        let desc = from_session_description(desc)?;
        self.pc.set_local_description(desc).await.map_err(webrtc_err)
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), MeshError> {
        let desc = from_session_description(desc)?;
        self.pc.set_remote_description(desc).await.map_err(webrtc_err)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidateJson) -> Result<(), MeshError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_m_line_index,
            ..Default::default()
        };
        self.pc.add_ice_candidate(init).await.map_err(webrtc_err)
    }

    async fn candidate_pair_stats(&self) -> Result<Vec<CandidatePairStats>, MeshError> {
        let report = self.pc.get_stats().await;
        let mut pairs = Vec::new();
        for stat in report.reports.into_values() {
            if let StatsReportType::CandidatePair(pair) = stat {
                let state = format!("{:?}", pair.state).to_ascii_lowercase();
                let rtt = pair.current_round_trip_time;
                pairs.push(CandidatePairStats {
                    succeeded: state == "succeeded",
                    current_round_trip_time: if rtt > 0.0 { Some(rtt) } else { None },
                });
            }
        }
        Ok(pairs)
    }

    fn on_ice_candidate(&self, handler: CandidateHandler) {
        let handler: Arc<dyn Fn(Option<IceCandidateJson>) + Send + Sync> = Arc::from(handler);
        self.pc
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let handler = handler.clone();
                Box::pin(async move {
                    let json = candidate.and_then(|c| c.to_json().ok()).map(|init| {
                        IceCandidateJson {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_m_line_index: init.sdp_mline_index,
                        }
                    });
                    handler(json);
                })
            }));
    }

    fn on_ice_state_change(&self, handler: IceStateHandler) {
        let handler: Arc<dyn Fn(IceState) + Send + Sync> = Arc::from(handler);
        self.pc
            .on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
                let handler = handler.clone();
                Box::pin(async move {
                    handler(map_ice_state(state));
                })
            }));
    }

    fn on_data_channel(&self, handler: IncomingChannelHandler) {
        let handler: Arc<dyn Fn(Arc<dyn DataChannel>) + Send + Sync> = Arc::from(handler);
        self.pc
            .on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                let handler = handler.clone();
                Box::pin(async move {
                    handler(Arc::new(RealDataChannel { dc }));
                })
            }));
    }

    async fn close(&self) {
        let _ = self.pc.close().await;
    }

    fn is_closed(&self) -> bool {
        self.pc.connection_state() == RTCPeerConnectionState::Closed
    }
}

pub struct RealDataChannel {
    dc: Arc<RTCDataChannel>,
}

#[async_trait]
impl DataChannel for RealDataChannel {
    fn label(&self) -> String {
        self.dc.label().to_string()
    }

    fn state(&self) -> ChannelState {
        match self.dc.ready_state() {
            RTCDataChannelState::Connecting | RTCDataChannelState::Unspecified => {
                ChannelState::Connecting
            }
            RTCDataChannelState::Open => ChannelState::Open,
            RTCDataChannelState::Closing => ChannelState::Closing,
            RTCDataChannelState::Closed => ChannelState::Closed,
        }
    }

    async fn buffered_amount(&self) -> usize {
        self.dc.buffered_amount().await
    }

    async fn set_buffered_amount_low_threshold(&self, threshold: usize) {
        self.dc.set_buffered_amount_low_threshold(threshold).await;
    }

    async fn send(&self, data: Bytes) -> Result<(), MeshError> {
        self.dc.send(&data).await.map(|_| ()).map_err(webrtc_err)
    }

    fn on_open(&self, handler: ChannelOpenHandler) {
        let handler: Arc<dyn Fn() + Send + Sync> = Arc::from(handler);
        self.dc.on_open(Box::new(move || {
            let handler = handler.clone();
            Box::pin(async move {
                handler();
            })
        }));
    }

    fn on_message(&self, handler: ChannelMessageHandler) {
        let handler: Arc<dyn Fn(Bytes) + Send + Sync> = Arc::from(handler);
        self.dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let handler = handler.clone();
            Box::pin(async move {
                handler(msg.data);
            })
        }));
    }

    fn on_close(&self, handler: ChannelCloseHandler) {
        let handler: Arc<dyn Fn() + Send + Sync> = Arc::from(handler);
        self.dc.on_close(Box::new(move || {
            let handler = handler.clone();
            Box::pin(async move {
                handler();
            })
        }));
    }

    async fn on_buffered_amount_low(&self, handler: BufferedAmountLowHandler) {
        let handler: Arc<dyn Fn() + Send + Sync> = Arc::from(handler);
        self.dc
            .on_buffered_amount_low(Box::new(move || {
                let handler = handler.clone();
                Box::pin(async move {
                    handler();
                })
            }))
            .await;
    }

    async fn close(&self) {
        let _ = self.dc.close().await;
    }
}
