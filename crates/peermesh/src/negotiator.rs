//! Per-connection SDP/ICE negotiation
//!
//! Drives one peer connection from offer/answer exchange to an open data
//! channel. The originator creates the channel and sends the offer; the
//! answerer applies the remote offer, answers, and receives the channel
//! through the transport's incoming-channel callback. Candidates that arrive
//! before the remote description are queued and drained once it is set.

use crate::client::ClientEvent;
use crate::config::{IceServer, SdpTransform};
use crate::connection::DataConnection;
use crate::emitter::Emitter;
use crate::error::{MeshError, MeshErrorKind};
use crate::signaling::message::{
    IceCandidateJson, ServerMessage, SessionDescription, SignalPayload,
};
use crate::signaling::ServerManager;
use crate::transport::{IceState, PeerConnection, PeerConnectionFactory};
use crate::types::{ConnectionId, PeerId};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Idle,
    Offering,
    OfferReceived,
    Answering,
    Answered,
    Established,
    Closed,
}

pub(crate) struct Negotiator {
    peer: PeerId,
    connection_id: ConnectionId,
    state: Mutex<NegotiationState>,
    pc: Mutex<Option<Arc<dyn PeerConnection>>>,
    pending_candidates: Mutex<Vec<IceCandidateJson>>,
    remote_set: AtomicBool,
    suppress_candidates: Arc<AtomicBool>,
    destroyed: AtomicBool,
    signaling: Arc<ServerManager>,
    client_events: Arc<Emitter<ClientEvent>>,
    sdp_transform: Option<SdpTransform>,
}

impl Negotiator {
    pub fn new(
        peer: PeerId,
        connection_id: ConnectionId,
        signaling: Arc<ServerManager>,
        client_events: Arc<Emitter<ClientEvent>>,
        sdp_transform: Option<SdpTransform>,
    ) -> Self {
        Self {
            peer,
            connection_id,
            state: Mutex::new(NegotiationState::Idle),
            pc: Mutex::new(None),
            pending_candidates: Mutex::new(Vec::new()),
            remote_set: AtomicBool::new(false),
            suppress_candidates: Arc::new(AtomicBool::new(false)),
            destroyed: AtomicBool::new(false),
            signaling,
            client_events,
            sdp_transform,
        }
    }

    pub fn state(&self) -> NegotiationState {
        *self.state.lock().unwrap()
    }

    fn set_state(&self, state: NegotiationState) {
        *self.state.lock().unwrap() = state;
    }

    pub fn peer_connection(&self) -> Option<Arc<dyn PeerConnection>> {
        self.pc.lock().unwrap().clone()
    }

    /// Create the peer connection, attach listeners, and (as originator)
    /// open the data channel and send the offer.
    pub async fn startup(
        &self,
        conn: &Arc<DataConnection>,
        factory: &Arc<dyn PeerConnectionFactory>,
        ice_servers: &[IceServer],
        originator: bool,
    ) -> Result<(), MeshError> {
        let pc = factory.create_peer_connection(ice_servers).await?;
        *self.pc.lock().unwrap() = Some(pc.clone());
        self.attach_listeners(conn, &pc, originator);

        if originator {
            let channel = pc
                .create_data_channel(conn.label(), conn.reliable())
                .await?;
            conn.initialize_channel(channel).await;
            self.make_offer(conn, &pc).await?;
        }
        Ok(())
    }

    fn attach_listeners(
        &self,
        conn: &Arc<DataConnection>,
        pc: &Arc<dyn PeerConnection>,
        originator: bool,
    ) {
        let signaling = self.signaling.clone();
        let peer = self.peer.clone();
        let connection_id = self.connection_id.clone();
        let suppress = self.suppress_candidates.clone();
        pc.on_ice_candidate(Box::new(move |candidate| {
            let Some(candidate) = candidate else {
                return;
            };
            if suppress.load(Ordering::Relaxed) {
                return;
            }
            let payload = SignalPayload {
                candidate: Some(candidate),
                connection_id: Some(connection_id.clone()),
                kind: Some("data".to_string()),
                ..Default::default()
            };
            if let Err(e) = signaling.send(ServerMessage::candidate(peer.clone(), payload)) {
                debug!("dropping ice candidate for {peer}: {e}");
            }
        }));

        let weak = Arc::downgrade(conn);
        let suppress = self.suppress_candidates.clone();
        let peer = self.peer.clone();
        pc.on_ice_state_change(Box::new(move |state| {
            match state {
                IceState::Failed => {
                    Self::fail_connection(
                        &weak,
                        MeshError::new(
                            MeshErrorKind::NegotiationFailed,
                            format!("negotiation of connection to {peer} failed"),
                        ),
                    );
                }
                IceState::Closed => {
                    Self::fail_connection(
                        &weak,
                        MeshError::new(
                            MeshErrorKind::ConnectionClosed,
                            format!("connection to {peer} closed"),
                        ),
                    );
                }
                IceState::Disconnected => {
                    debug!("ice state for {peer}: disconnected; waiting for recovery");
                }
                IceState::Completed => {
                    suppress.store(true, Ordering::Relaxed);
                }
                _ => {}
            }
        }));

        if !originator {
            let weak = Arc::downgrade(conn);
            pc.on_data_channel(Box::new(move |channel| {
                if let Some(conn) = weak.upgrade() {
                    tokio::spawn(async move {
                        conn.initialize_channel(channel).await;
                    });
                }
            }));
        }
    }

    fn fail_connection(weak: &Weak<DataConnection>, err: MeshError) {
        let Some(conn) = weak.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            conn.fail(err).await;
        });
    }

    fn transform_sdp(&self, mut desc: SessionDescription) -> SessionDescription {
        if let Some(transform) = &self.sdp_transform {
            desc.sdp = transform(desc.sdp);
        }
        desc
    }

    async fn make_offer(
        &self,
        conn: &Arc<DataConnection>,
        pc: &Arc<dyn PeerConnection>,
    ) -> Result<(), MeshError> {
        self.set_state(NegotiationState::Offering);
        let offer = self.transform_sdp(pc.create_offer().await?);
        pc.set_local_description(offer.clone()).await?;

        let payload = SignalPayload {
            sdp: Some(offer),
            connection_id: Some(self.connection_id.clone()),
            kind: Some("data".to_string()),
            label: Some(conn.label().to_string()),
            reliable: Some(conn.reliable()),
            serialization: Some(conn.serialization().to_string()),
            metadata: conn.metadata().cloned(),
            ..Default::default()
        };
        self.signaling
            .send(ServerMessage::offer(self.peer.clone(), payload))?;
        debug!(
            "sent offer for connection {} to {}",
            self.connection_id, self.peer
        );
        Ok(())
    }

    /// Apply a remote description. Offers additionally produce and send the
    /// answer.
    pub async fn handle_sdp(&self, desc: SessionDescription) {
        if self.destroyed.load(Ordering::Relaxed) {
            return;
        }
        let Some(pc) = self.peer_connection() else {
            warn!(
                "no peer connection for sdp on connection {}",
                self.connection_id
            );
            return;
        };
        let is_offer = desc.is_offer();
        if is_offer {
            self.set_state(NegotiationState::OfferReceived);
        }

        if let Err(e) = pc.set_remote_description(desc).await {
            self.surface_error(e);
            return;
        }
        self.remote_set.store(true, Ordering::SeqCst);
        self.drain_pending_candidates(&pc).await;

        if is_offer {
            self.set_state(NegotiationState::Answering);
            if let Err(e) = self.make_answer(&pc).await {
                self.surface_error(e);
            }
        } else {
            self.set_state(NegotiationState::Answered);
        }
    }

    async fn make_answer(&self, pc: &Arc<dyn PeerConnection>) -> Result<(), MeshError> {
        let answer = self.transform_sdp(pc.create_answer().await?);
        pc.set_local_description(answer.clone()).await?;

        let payload = SignalPayload {
            sdp: Some(answer),
            connection_id: Some(self.connection_id.clone()),
            kind: Some("data".to_string()),
            ..Default::default()
        };
        self.signaling
            .send(ServerMessage::answer(self.peer.clone(), payload))?;
        debug!(
            "sent answer for connection {} to {}",
            self.connection_id, self.peer
        );
        Ok(())
    }

    /// Apply a remote ICE candidate, queueing it when the remote description
    /// has not arrived yet.
    pub async fn handle_candidate(&self, candidate: IceCandidateJson) {
        if self.destroyed.load(Ordering::Relaxed) {
            return;
        }
        if !self.remote_set.load(Ordering::SeqCst) {
            self.pending_candidates.lock().unwrap().push(candidate);
            return;
        }
        let Some(pc) = self.peer_connection() else {
            self.pending_candidates.lock().unwrap().push(candidate);
            return;
        };
        if let Err(e) = pc.add_ice_candidate(candidate).await {
            self.surface_error(e);
        }
    }

    async fn drain_pending_candidates(&self, pc: &Arc<dyn PeerConnection>) {
        let pending: Vec<_> = self.pending_candidates.lock().unwrap().drain(..).collect();
        if !pending.is_empty() {
            debug!(
                "adding {} queued candidates on connection {}",
                pending.len(),
                self.connection_id
            );
        }
        for candidate in pending {
            if let Err(e) = pc.add_ice_candidate(candidate).await {
                self.surface_error(e);
            }
        }
    }

    /// The data channel opened; negotiation is done.
    pub fn mark_established(&self) {
        self.set_state(NegotiationState::Established);
    }

    /// Surface a failure on the owning client without tearing anything down.
    fn surface_error(&self, err: MeshError) {
        warn!(
            "negotiation error on connection {} to {}: {err}",
            self.connection_id, self.peer
        );
        self.client_events.emit(ClientEvent::Error(MeshError::new(
            MeshErrorKind::Webrtc,
            err.to_string(),
        )));
    }

    /// Detach listeners and close the peer connection. Safe to call more
    /// than once.
    pub async fn cleanup(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.set_state(NegotiationState::Closed);
        let pc = self.pc.lock().unwrap().take();
        if let Some(pc) = pc {
            pc.on_ice_candidate(Box::new(|_| {}));
            pc.on_ice_state_change(Box::new(|_| {}));
            pc.on_data_channel(Box::new(|_| {}));
            if !pc.is_closed() {
                pc.close().await;
            }
        }
        self.pending_candidates.lock().unwrap().clear();
    }
}
