//! In-memory transport for tests
//!
//! Peer connections pair up through a shared `MockNetwork`: the synthetic
//! SDP of an offer or answer carries the originating connection's id, and
//! the link is completed when the offerer applies the remote answer. Data
//! channels are mpsc pairs pumped in order, so reliable-channel ordering
//! matches the real transport.

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
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::mpsc;
use tracing::debug;

const SDP_MARKER: &str = "mock-pc ";

struct NetInner {
    connections: Mutex<HashMap<u64, Arc<MockPeerConnection>>>,
    next_id: AtomicU64,
    /// Round-trip time reported by established pairs, in seconds.
    default_rtt: Mutex<Option<f64>>,
}

/// Shared fabric linking the mock connections of one test.
#[derive(Clone)]
pub struct MockNetwork {
    inner: Arc<NetInner>,
}

impl MockNetwork {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(NetInner {
                connections: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                default_rtt: Mutex::new(Some(0.042)),
            }),
        }
    }

    /// Set the RTT reported by candidate-pair stats; `None` reports no RTT
    /// at all (pings stay unset).
    pub fn set_default_rtt(&self, rtt: Option<f64>) {
        *self.inner.default_rtt.lock().unwrap() = rtt;
    }

    pub fn factory(&self) -> Arc<MockConnectionFactory> {
        Arc::new(MockConnectionFactory {
            net: self.inner.clone(),
            drop_incoming: Arc::new(AtomicBool::new(false)),
        })
    }
}

impl Default for MockNetwork {
    fn default() -> Self {
        Self::new()
    }
}

pub struct MockConnectionFactory {
    net: Arc<NetInner>,
    drop_incoming: Arc<AtomicBool>,
}

impl MockConnectionFactory {
    /// Silently discard data frames delivered to channels created by this
    /// factory. Lets tests simulate a peer that never answers.
    pub fn set_drop_incoming(&self, drop: bool) {
        self.drop_incoming.store(drop, Ordering::Relaxed);
    }
}

#[async_trait]
impl PeerConnectionFactory for MockConnectionFactory {
    async fn create_peer_connection(
        &self,
        _ice_servers: &[IceServer],
    ) -> Result<Arc<dyn PeerConnection>, MeshError> {
        let id = self.net.next_id.fetch_add(1, Ordering::Relaxed);
        let pc = Arc::new(MockPeerConnection {
            id,
            net: self.net.clone(),
            drop_incoming: self.drop_incoming.clone(),
            local_desc: Mutex::new(None),
            remote_desc: Mutex::new(None),
            remote_pc: Mutex::new(None),
            channels: Mutex::new(Vec::new()),
            established: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            candidates_added: AtomicUsize::new(0),
            candidate_handler: Mutex::new(None),
            ice_handler: Mutex::new(None),
            channel_handler: Mutex::new(None),
        });
        self.net
            .connections
            .lock()
            .unwrap()
            .insert(id, pc.clone());
        Ok(pc)
    }
}

pub struct MockPeerConnection {
    id: u64,
    net: Arc<NetInner>,
    drop_incoming: Arc<AtomicBool>,
    local_desc: Mutex<Option<SessionDescription>>,
    remote_desc: Mutex<Option<SessionDescription>>,
    remote_pc: Mutex<Option<u64>>,
    channels: Mutex<Vec<Arc<MockDataChannel>>>,
    established: AtomicBool,
    closed: AtomicBool,
    candidates_added: AtomicUsize,
    candidate_handler: Mutex<Option<Arc<dyn Fn(Option<IceCandidateJson>) + Send + Sync>>>,
    ice_handler: Mutex<Option<Arc<dyn Fn(IceState) + Send + Sync>>>,
    channel_handler: Mutex<Option<Arc<dyn Fn(Arc<dyn DataChannel>) + Send + Sync>>>,
}

impl MockPeerConnection {
    /// How many remote candidates were applied; lets tests confirm the
    /// candidate relay ran.
    pub fn candidates_added(&self) -> usize {
        self.candidates_added.load(Ordering::Relaxed)
    }

    fn sdp(&self) -> String {
        format!("v=0\r\nm=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\na={}{}", SDP_MARKER, self.id)
    }

    fn peer_id_from_sdp(sdp: &str) -> Option<u64> {
        let idx = sdp.find(SDP_MARKER)?;
        sdp[idx + SDP_MARKER.len()..]
            .split_whitespace()
            .next()?
            .parse()
            .ok()
    }

    fn fire_ice(&self, state: IceState) {
        let handler = self.ice_handler.lock().unwrap().clone();
        if let Some(handler) = handler {
            handler(state);
        }
    }

    /// Complete the link between the offerer (`self`) and the answerer:
    /// mirror every locally-created channel to the remote side and open both
    /// ends.
    fn establish(self: &Arc<Self>, remote: &Arc<MockPeerConnection>) {
        if self.established.swap(true, Ordering::SeqCst) {
            return;
        }
        remote.established.store(true, Ordering::SeqCst);
        *remote.remote_pc.lock().unwrap() = Some(self.id);

        let channels: Vec<_> = self.channels.lock().unwrap().clone();
        for channel in channels {
            let counterpart = MockDataChannel::new(
                channel.label.clone(),
                channel.ordered,
                remote.drop_incoming.clone(),
            );
            remote.channels.lock().unwrap().push(counterpart.clone());
            channel.link(&counterpart);
            counterpart.link(&channel);
            channel.start_pump();
            counterpart.start_pump();

            // Hand the mirrored channel to the remote before either end
            // opens, so handlers can bind first.
            let handler = remote.channel_handler.lock().unwrap().clone();
            if let Some(handler) = handler {
                handler(counterpart.clone() as Arc<dyn DataChannel>);
            }

            channel.mark_open();
            counterpart.mark_open();
        }

        self.fire_ice(IceState::Connected);
        remote.fire_ice(IceState::Connected);
        self.fire_ice(IceState::Completed);
        remote.fire_ice(IceState::Completed);
    }
}

#[async_trait]
impl PeerConnection for MockPeerConnection {
    async fn create_data_channel(
        &self,
        label: &str,
        ordered: bool,
    ) -> Result<Arc<dyn DataChannel>, MeshError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MeshError::new(
                MeshErrorKind::ConnectionClosed,
                "peer connection is closed",
            ));
        }
        let channel = MockDataChannel::new(
            label.to_string(),
            ordered,
            self.drop_incoming.clone(),
        );
        self.channels.lock().unwrap().push(channel.clone());
        Ok(channel)
    }

    async fn create_offer(&self) -> Result<SessionDescription, MeshError> {
        Ok(SessionDescription::offer(self.sdp()))
    }

    async fn create_answer(&self) -> Result<SessionDescription, MeshError> {
        if self.remote_desc.lock().unwrap().is_none() {
            return Err(MeshError::new(
                MeshErrorKind::Webrtc,
                "create_answer before remote description",
            ));
        }
        Ok(SessionDescription::answer(self.sdp()))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), MeshError> {
        *self.local_desc.lock().unwrap() = Some(desc);

        // Synthetic ICE gathering: one host candidate, then end-of-candidates.
        let handler = self.candidate_handler.lock().unwrap().clone();
        if let Some(handler) = handler {
            let id = self.id;
            tokio::spawn(async move {
                handler(Some(IceCandidateJson {
                    candidate: format!(
                        "candidate:{id} 1 udp 2122260223 198.51.100.{} 50000 typ host",
                        id % 254 + 1
                    ),
                    sdp_mid: Some("0".to_string()),
                    sdp_m_line_index: Some(0),
                }));
                handler(None);
            });
        }
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), MeshError> {
        let peer_id = Self::peer_id_from_sdp(&desc.sdp).ok_or_else(|| {
            MeshError::new(MeshErrorKind::Webrtc, "unrecognized mock sdp")
        })?;
        let is_answer = !desc.is_offer();
        *self.remote_desc.lock().unwrap() = Some(desc);
        *self.remote_pc.lock().unwrap() = Some(peer_id);

        if is_answer {
            // We are the offerer and the answer has arrived: wire the pair.
            let me = {
                let connections = self.net.connections.lock().unwrap();
                connections.get(&self.id).cloned()
            };
            let remote = {
                let connections = self.net.connections.lock().unwrap();
                connections.get(&peer_id).cloned()
            };
            match (me, remote) {
                (Some(me), Some(remote)) => me.establish(&remote),
                _ => {
                    return Err(MeshError::new(
                        MeshErrorKind::Webrtc,
                        "mock peer connection vanished before establishment",
                    ))
                }
            }
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, _candidate: IceCandidateJson) -> Result<(), MeshError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MeshError::new(
                MeshErrorKind::Webrtc,
                "add_ice_candidate on closed connection",
            ));
        }
        self.candidates_added.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn candidate_pair_stats(&self) -> Result<Vec<CandidatePairStats>, MeshError> {
        if !self.established.load(Ordering::SeqCst) {
            return Ok(Vec::new());
        }
        let rtt = *self.net.default_rtt.lock().unwrap();
        Ok(vec![CandidatePairStats {
            succeeded: true,
            current_round_trip_time: rtt,
        }])
    }

    fn on_ice_candidate(&self, handler: CandidateHandler) {
        *self.candidate_handler.lock().unwrap() = Some(Arc::from(handler));
    }

    fn on_ice_state_change(&self, handler: IceStateHandler) {
        *self.ice_handler.lock().unwrap() = Some(Arc::from(handler));
    }

    fn on_data_channel(&self, handler: IncomingChannelHandler) {
        *self.channel_handler.lock().unwrap() = Some(Arc::from(handler));
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(pc = self.id, "closing mock peer connection");
        let channels: Vec<_> = self.channels.lock().unwrap().clone();
        for channel in channels {
            channel.close_internal();
        }
        self.net.connections.lock().unwrap().remove(&self.id);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

enum Frame {
    Data(Bytes),
    Close,
}

pub struct MockDataChannel {
    label: String,
    ordered: bool,
    drop_incoming: Arc<AtomicBool>,
    state: Mutex<ChannelState>,
    peer: Mutex<Weak<MockDataChannel>>,
    inbox_tx: mpsc::UnboundedSender<Frame>,
    inbox_rx: Mutex<Option<mpsc::UnboundedReceiver<Frame>>>,
    threshold: AtomicUsize,
    open_handler: Mutex<Option<Arc<dyn Fn() + Send + Sync>>>,
    message_handler: Arc<Mutex<Option<Arc<dyn Fn(Bytes) + Send + Sync>>>>,
    close_handler: Arc<Mutex<Option<Arc<dyn Fn() + Send + Sync>>>>,
    handler_ready: Arc<tokio::sync::Notify>,
    pump_started: AtomicBool,
    closed_fired: Arc<AtomicBool>,
}

impl MockDataChannel {
    fn new(label: String, ordered: bool, drop_incoming: Arc<AtomicBool>) -> Arc<Self> {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            label,
            ordered,
            drop_incoming,
            state: Mutex::new(ChannelState::Connecting),
            peer: Mutex::new(Weak::new()),
            inbox_tx,
            inbox_rx: Mutex::new(Some(inbox_rx)),
            threshold: AtomicUsize::new(0),
            open_handler: Mutex::new(None),
            message_handler: Arc::new(Mutex::new(None)),
            close_handler: Arc::new(Mutex::new(None)),
            handler_ready: Arc::new(tokio::sync::Notify::new()),
            pump_started: AtomicBool::new(false),
            closed_fired: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn buffered_amount_low_threshold(&self) -> usize {
        self.threshold.load(Ordering::Relaxed)
    }

    fn link(&self, peer: &Arc<MockDataChannel>) {
        *self.peer.lock().unwrap() = Arc::downgrade(peer);
    }

    fn mark_open(&self) {
        *self.state.lock().unwrap() = ChannelState::Open;
        let handler = self.open_handler.lock().unwrap().clone();
        if let Some(handler) = handler {
            handler();
        }
    }

    /// Deliver frames to the registered handler in arrival order. Frames
    /// received before a handler is registered wait for it.
    fn start_pump(self: &Arc<Self>) {
        if self.pump_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(mut rx) = self.inbox_rx.lock().unwrap().take() else {
            return;
        };
        let message_handler = self.message_handler.clone();
        let close_handler = self.close_handler.clone();
        let handler_ready = self.handler_ready.clone();
        let closed_fired = self.closed_fired.clone();
        let this = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                match frame {
                    Frame::Data(data) => {
                        let handler = loop {
                            let registered = handler_ready.notified();
                            if let Some(handler) = message_handler.lock().unwrap().clone() {
                                break handler;
                            }
                            registered.await;
                        };
                        handler(data);
                    }
                    Frame::Close => {
                        if let Some(this) = this.upgrade() {
                            *this.state.lock().unwrap() = ChannelState::Closed;
                        }
                        if !closed_fired.swap(true, Ordering::SeqCst) {
                            let handler = close_handler.lock().unwrap().clone();
                            if let Some(handler) = handler {
                                handler();
                            }
                        }
                        break;
                    }
                }
            }
        });
    }

    /// Close without notifying the peer (used when the owning connection is
    /// torn down wholesale).
    fn close_internal(&self) {
        let mut state = self.state.lock().unwrap();
        if matches!(*state, ChannelState::Closed) {
            return;
        }
        *state = ChannelState::Closed;
        drop(state);

        if let Some(peer) = self.peer.lock().unwrap().upgrade() {
            let _ = peer.inbox_tx.send(Frame::Close);
        }
        if !self.closed_fired.swap(true, Ordering::SeqCst) {
            let handler = self.close_handler.lock().unwrap().clone();
            if let Some(handler) = handler {
                handler();
            }
        }
    }
}

#[async_trait]
impl DataChannel for MockDataChannel {
    fn label(&self) -> String {
        self.label.clone()
    }

    fn state(&self) -> ChannelState {
        *self.state.lock().unwrap()
    }

    async fn buffered_amount(&self) -> usize {
        0
    }

    async fn set_buffered_amount_low_threshold(&self, threshold: usize) {
        self.threshold.store(threshold, Ordering::Relaxed);
    }

    async fn send(&self, data: Bytes) -> Result<(), MeshError> {
        if !matches!(*self.state.lock().unwrap(), ChannelState::Open) {
            return Err(MeshError::new(
                MeshErrorKind::ConnectionClosed,
                "mock data channel is not open",
            ));
        }
        let Some(peer) = self.peer.lock().unwrap().upgrade() else {
            return Err(MeshError::new(
                MeshErrorKind::ConnectionClosed,
                "mock data channel peer is gone",
            ));
        };
        if peer.drop_incoming.load(Ordering::Relaxed) {
            return Ok(());
        }
        peer.inbox_tx
            .send(Frame::Data(data))
            .map_err(|_| MeshError::new(MeshErrorKind::ConnectionClosed, "peer inbox closed"))
    }

    fn on_open(&self, handler: ChannelOpenHandler) {
        let handler: Arc<dyn Fn() + Send + Sync> = Arc::from(handler);
        let already_open = matches!(*self.state.lock().unwrap(), ChannelState::Open);
        *self.open_handler.lock().unwrap() = Some(handler.clone());
        if already_open {
            handler();
        }
    }

    fn on_message(&self, handler: ChannelMessageHandler) {
        *self.message_handler.lock().unwrap() = Some(Arc::from(handler));
        self.handler_ready.notify_waiters();
    }

    fn on_close(&self, handler: ChannelCloseHandler) {
        *self.close_handler.lock().unwrap() = Some(Arc::from(handler));
    }

    async fn on_buffered_amount_low(&self, _handler: BufferedAmountLowHandler) {
        // The mock fabric has no backpressure; the buffer never fills.
    }

    async fn close(&self) {
        self.close_internal();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    async fn linked_pair() -> (Arc<dyn PeerConnection>, Arc<dyn PeerConnection>, Arc<dyn DataChannel>, Arc<dyn DataChannel>) {
        let net = MockNetwork::new();
        let factory = net.factory();
        let a = factory.create_peer_connection(&[]).await.unwrap();
        let b = factory.create_peer_connection(&[]).await.unwrap();

        let (incoming_tx, mut incoming_rx) = mpsc::unbounded_channel();
        b.on_data_channel(Box::new(move |dc| {
            let _ = incoming_tx.send(dc);
        }));

        let dc_a = a.create_data_channel("reliable", true).await.unwrap();

        let offer = a.create_offer().await.unwrap();
        a.set_local_description(offer.clone()).await.unwrap();
        b.set_remote_description(offer).await.unwrap();
        let answer = b.create_answer().await.unwrap();
        b.set_local_description(answer.clone()).await.unwrap();
        a.set_remote_description(answer).await.unwrap();

        let dc_b = incoming_rx.recv().await.unwrap();
        (a, b, dc_a, dc_b)
    }

    #[tokio::test]
    async fn offer_answer_opens_mirrored_channels() {
        let (_a, _b, dc_a, dc_b) = linked_pair().await;
        assert_eq!(dc_a.state(), ChannelState::Open);
        assert_eq!(dc_b.state(), ChannelState::Open);
        assert_eq!(dc_b.label(), "reliable");
    }

    #[tokio::test]
    async fn frames_arrive_in_order() {
        let (_a, _b, dc_a, dc_b) = linked_pair().await;

        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        dc_b.on_message(Box::new(move |data| {
            let _ = seen_tx.send(data);
        }));

        for i in 0u8..10 {
            dc_a.send(Bytes::from(vec![i])).await.unwrap();
        }
        for i in 0u8..10 {
            let frame = tokio::time::timeout(Duration::from_secs(1), seen_rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(frame.as_ref(), &[i]);
        }
    }

    #[tokio::test]
    async fn close_propagates_to_peer() {
        let (_a, _b, dc_a, dc_b) = linked_pair().await;

        let closed = Arc::new(AtomicUsize::new(0));
        let counter = closed.clone();
        dc_b.on_close(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        dc_a.close().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(closed.load(Ordering::SeqCst), 1);
        assert!(dc_a.send(Bytes::from_static(b"x")).await.is_err());
    }

    #[tokio::test]
    async fn stats_follow_establishment() {
        let net = MockNetwork::new();
        let factory = net.factory();
        let a = factory.create_peer_connection(&[]).await.unwrap();
        assert!(a.candidate_pair_stats().await.unwrap().is_empty());

        let (_a2, b, _dc_a, _dc_b) = linked_pair().await;
        let stats = b.candidate_pair_stats().await.unwrap();
        assert_eq!(stats.len(), 1);
        assert!(stats[0].succeeded);
        assert!(stats[0].current_round_trip_time.is_some());
    }
}
