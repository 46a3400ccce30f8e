//! End-to-end mesh scenarios over the in-memory signaling server and
//! transport fabric.

use peermesh::{
    ClientEvent, ConnectOptions, MeshClient, MeshErrorKind, MeshOptions, MockConnectionFactory,
    MockNetwork, MockSignalingServer, NodeEvent, Payload, PeerId, RemoteNode, SendOptions,
    ServerMessageType,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const WAIT: Duration = Duration::from_secs(2);

fn peer(id: &str) -> PeerId {
    PeerId::new(id).unwrap()
}

fn test_options() -> MeshOptions {
    MeshOptions {
        ping_interval: Duration::from_millis(200),
        ..Default::default()
    }
}

/// Await the first event the picker accepts, with a timeout.
async fn wait_for<T, R>(
    rx: &mut mpsc::UnboundedReceiver<T>,
    mut pick: impl FnMut(T) -> Option<R>,
) -> R {
    tokio::time::timeout(WAIT, async {
        loop {
            let event = rx.recv().await.expect("event stream ended");
            if let Some(result) = pick(event) {
                return result;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Poll a condition until it holds.
async fn eventually(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT, async {
        loop {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .expect("condition never became true");
}

async fn wait_node_open(rx: &mut mpsc::UnboundedReceiver<NodeEvent>) {
    wait_for(rx, |event| matches!(event, NodeEvent::Open).then_some(())).await
}

async fn wait_data_text(rx: &mut mpsc::UnboundedReceiver<NodeEvent>, expected: &str) {
    let expected = expected.to_string();
    wait_for(rx, move |event| match event {
        NodeEvent::Data(Payload::Json(value)) if value.as_str() == Some(expected.as_str()) => {
            Some(())
        }
        _ => None,
    })
    .await
}

async fn wait_connection(rx: &mut mpsc::UnboundedReceiver<ClientEvent>) -> Arc<RemoteNode> {
    wait_for(rx, |event| match event {
        ClientEvent::Connection(node) => Some(node),
        _ => None,
    })
    .await
}

struct TestMesh {
    server: MockSignalingServer,
    net: MockNetwork,
}

impl TestMesh {
    fn new() -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
        Self {
            server: MockSignalingServer::new(),
            net: MockNetwork::new(),
        }
    }

    /// Start a client and wait for its signaling session to open.
    async fn client(
        &self,
        id: &str,
    ) -> (
        MeshClient,
        mpsc::UnboundedReceiver<ClientEvent>,
        Arc<MockConnectionFactory>,
    ) {
        let factory = self.net.factory();
        let client = MeshClient::with_backends(
            Some(peer(id)),
            test_options(),
            self.server.connector(),
            factory.clone(),
        );
        let mut events = client.subscribe();
        wait_for(&mut events, |event| {
            matches!(event, ClientEvent::Open(_)).then_some(())
        })
        .await;
        (client, events, factory)
    }
}

#[tokio::test]
async fn two_peer_connect_and_both_labels() {
    let mesh = TestMesh::new();
    let (a, _a_events, _) = mesh.client("a").await;
    let (_b, mut b_events, _) = mesh.client("b").await;

    let a_node = a.connect(peer("b"), ConnectOptions::default()).await.unwrap();
    let mut a_node_events = a_node.subscribe();

    let b_node = wait_connection(&mut b_events).await;
    let mut b_node_events = b_node.subscribe();

    wait_node_open(&mut a_node_events).await;
    wait_node_open(&mut b_node_events).await;

    a_node
        .send(Payload::text("hello"), SendOptions::default())
        .await
        .unwrap();
    wait_data_text(&mut b_node_events, "hello").await;

    a_node
        .send(
            Payload::text("hi"),
            SendOptions {
                reliable: Some(false),
            },
        )
        .await
        .unwrap();
    wait_data_text(&mut b_node_events, "hi").await;

    // The realtime send lazily opens the second channel; both sides end up
    // with both labels mapped.
    eventually(|| {
        a_node.channel_labels() == ["realtime", "reliable"]
            && b_node.channel_labels() == ["realtime", "reliable"]
    })
    .await;

    // The open latch fired exactly once per node despite the second channel.
    let mut extra_opens = 0;
    while let Ok(event) = a_node_events.try_recv() {
        if matches!(event, NodeEvent::Open) {
            extra_opens += 1;
        }
    }
    assert_eq!(extra_opens, 0, "node re-emitted open");

    // All connection attempts settled.
    assert_eq!(a.pending_connection_attempts(), 0);
}

#[tokio::test]
async fn connect_is_idempotent_per_peer() {
    let mesh = TestMesh::new();
    let (a, _a_events, _) = mesh.client("a").await;
    let (_b, mut b_events, _) = mesh.client("b").await;

    let first = a.connect(peer("b"), ConnectOptions::default()).await.unwrap();
    let second = a.connect(peer("b"), ConnectOptions::default()).await.unwrap();
    assert!(Arc::ptr_eq(&first, &second));

    let b_node = wait_connection(&mut b_events).await;
    let mut b_node_events = b_node.subscribe();
    wait_node_open(&mut b_node_events).await;

    // Still the same node once open.
    let third = a.connect(peer("b"), ConnectOptions::default()).await.unwrap();
    assert!(Arc::ptr_eq(&first, &third));
    eventually(|| first.open_connection_count() == 1).await;
}

#[tokio::test]
async fn send_before_open_fails_not_open_yet() {
    let mesh = TestMesh::new();
    let (a, _a_events, _) = mesh.client("a").await;
    let (_b, _b_events, _) = mesh.client("b").await;

    let node = a.connect(peer("b"), ConnectOptions::default()).await.unwrap();
    let err = node
        .send(Payload::text("too soon"), SendOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), MeshErrorKind::NotOpenYet);
}

#[tokio::test]
async fn transitive_discovery_fills_the_mesh() {
    let mesh = TestMesh::new();
    let (a, _a_events, _) = mesh.client("a").await;
    let (b, _b_events, _) = mesh.client("b").await;
    let (c, _c_events, _) = mesh.client("c").await;

    // B and C know each other; A and C do not.
    let bc = b.connect(peer("c"), ConnectOptions::default()).await.unwrap();
    let mut bc_events = bc.subscribe();
    wait_node_open(&mut bc_events).await;

    // A joins through B. B's peer list for A contains C, and A connects.
    let ab = a.connect(peer("b"), ConnectOptions::default()).await.unwrap();
    let mut ab_events = ab.subscribe();
    wait_node_open(&mut ab_events).await;

    eventually(|| {
        a.node(&peer("c")).map(|n| n.is_open()).unwrap_or(false)
            && c.node(&peer("a")).map(|n| n.is_open()).unwrap_or(false)
    })
    .await;

    // Handshakes complete on every client.
    eventually(|| {
        a.pending_handshakes() == 0
            && b.pending_handshakes() == 0
            && c.pending_handshakes() == 0
    })
    .await;
    assert_eq!(a.pending_connection_attempts(), 0);
    assert_eq!(c.pending_connection_attempts(), 0);
}

#[tokio::test]
async fn simultaneous_connect_deduplicates_to_one_connection() {
    let mesh = TestMesh::new();
    // "z" > "a": the z side is the closer.
    let (za, _z_events, _) = mesh.client("z").await;
    let (ab, mut a_events, _) = mesh.client("a").await;

    let (z_node, a_node) = tokio::join!(
        async { za.connect(peer("a"), ConnectOptions::default()).await.unwrap() },
        async { ab.connect(peer("z"), ConnectOptions::default()).await.unwrap() },
    );
    let mut z_node_events = z_node.subscribe();
    let mut a_node_events = a_node.subscribe();
    wait_node_open(&mut z_node_events).await;
    wait_node_open(&mut a_node_events).await;

    // Crossing offers give each side two connections.
    eventually(|| z_node.connection_count() == 2 && a_node.connection_count() == 2).await;
    let mut candidate_ids = z_node.connection_ids();
    candidate_ids.sort();
    let expected_survivor = candidate_ids[0].clone();

    // Neither side loses traffic sent during the overlap window.
    z_node
        .send(Payload::text("from-z"), SendOptions::default())
        .await
        .unwrap();
    a_node
        .send(Payload::text("from-a"), SendOptions::default())
        .await
        .unwrap();
    wait_data_text(&mut a_node_events, "from-z").await;
    wait_data_text(&mut z_node_events, "from-a").await;

    // After the settle delay both sides converge on the smallest id.
    eventually(|| {
        z_node.open_connection_count() == 1 && a_node.open_connection_count() == 1
    })
    .await;
    assert_eq!(z_node.connection_ids(), vec![expected_survivor.clone()]);
    assert_eq!(a_node.connection_ids(), vec![expected_survivor]);

    // Still usable afterwards.
    z_node
        .send(Payload::text("after-dedup"), SendOptions::default())
        .await
        .unwrap();
    wait_data_text(&mut a_node_events, "after-dedup").await;

    // No spurious connection event backlog left on the a side.
    while let Ok(event) = a_events.try_recv() {
        assert!(
            !matches!(event, ClientEvent::Error(_)),
            "unexpected error event: {event:?}"
        );
    }
}

#[tokio::test]
async fn reordered_signaling_is_held_and_replayed() {
    let mesh = TestMesh::new();
    // Candidates overtake the offer.
    mesh.server
        .set_delivery_delay(ServerMessageType::Offer, Duration::from_millis(150));

    let (a, mut a_events, _) = mesh.client("a").await;
    let (b, _b_events, _) = mesh.client("b").await;

    let b_node = b.connect(peer("a"), ConnectOptions::default()).await.unwrap();
    let mut b_node_events = b_node.subscribe();

    // The early candidate has nowhere to go yet.
    eventually(|| a.lost_message_count() > 0).await;

    // Once the offer lands, the held messages drain and negotiation
    // completes.
    let a_node = wait_connection(&mut a_events).await;
    let mut a_node_events = a_node.subscribe();
    wait_node_open(&mut a_node_events).await;
    wait_node_open(&mut b_node_events).await;
    eventually(|| a.lost_message_count() == 0).await;

    b_node
        .send(Payload::text("made it"), SendOptions::default())
        .await
        .unwrap();
    wait_data_text(&mut a_node_events, "made it").await;
}

#[tokio::test(start_paused = true)]
async fn unacked_handshake_retries_then_gives_up() {
    let mesh = TestMesh::new();
    let (a, mut a_events, _fa) = mesh.client("a").await;
    let (b, _b_events, fb) = mesh.client("b").await;

    // B's channels swallow every data frame: mesh-peers never arrives and
    // no acknowledgement ever comes back.
    fb.set_drop_incoming(true);

    let a_node = a.connect(peer("b"), ConnectOptions::default()).await.unwrap();
    let mut a_node_events = a_node.subscribe();
    wait_node_open(&mut a_node_events).await;
    eventually(|| a.pending_handshakes() == 1).await;

    // 1 s + 2 s + 4 s of retries, then abandonment.
    tokio::time::sleep(Duration::from_secs(20)).await;
    assert_eq!(a.pending_handshakes(), 0);
    assert_eq!(b.pending_handshakes(), 0);

    // The failure stays silent and the link stays up.
    assert!(a_node.is_open());
    while let Ok(event) = a_events.try_recv() {
        assert!(
            !matches!(event, ClientEvent::Error(_)),
            "handshake failure leaked an error: {event:?}"
        );
    }
}

#[tokio::test]
async fn disconnect_preserves_p2p_and_reconnect_restores_signaling() {
    let mesh = TestMesh::new();
    let (a, mut a_events, _) = mesh.client("a").await;
    let (_b, mut b_events, _) = mesh.client("b").await;

    let a_node = a.connect(peer("b"), ConnectOptions::default()).await.unwrap();
    let mut a_node_events = a_node.subscribe();
    let b_node = wait_connection(&mut b_events).await;
    let mut b_node_events = b_node.subscribe();
    wait_node_open(&mut a_node_events).await;
    wait_node_open(&mut b_node_events).await;

    a.disconnect();
    let id = wait_for(&mut a_events, |event| match event {
        ClientEvent::Disconnected(id) => Some(id),
        _ => None,
    })
    .await;
    assert_eq!(id, peer("a"));
    assert!(a.is_disconnected());

    // Open P2P links still deliver.
    a_node
        .send(Payload::text("still here"), SendOptions::default())
        .await
        .unwrap();
    wait_data_text(&mut b_node_events, "still here").await;

    // connect() while disconnected is refused.
    let err = a
        .connect(peer("nobody"), ConnectOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), MeshErrorKind::Disconnected);

    // Reconnect with the same id.
    a.reconnect().await.unwrap();
    let id = wait_for(&mut a_events, |event| match event {
        ClientEvent::Open(id) => Some(id),
        _ => None,
    })
    .await;
    assert_eq!(id, peer("a"));

    // New connections work again.
    let (_c, mut c_events, _) = mesh.client("c").await;
    let a_c = a.connect(peer("c"), ConnectOptions::default()).await.unwrap();
    let mut a_c_events = a_c.subscribe();
    let c_node = wait_connection(&mut c_events).await;
    let mut c_node_events = c_node.subscribe();
    wait_node_open(&mut a_c_events).await;
    wait_node_open(&mut c_node_events).await;
}

#[tokio::test]
async fn broadcast_counts_open_recipients_exactly_once() {
    let mesh = TestMesh::new();
    let (a, _a_events, _) = mesh.client("a").await;
    let (_b, mut b_events, _) = mesh.client("b").await;
    let (_c, mut c_events, _) = mesh.client("c").await;

    let ab = a.connect(peer("b"), ConnectOptions::default()).await.unwrap();
    let mut ab_events = ab.subscribe();
    let b_node = wait_connection(&mut b_events).await;
    let mut b_node_events = b_node.subscribe();
    wait_node_open(&mut ab_events).await;

    let ac = a.connect(peer("c"), ConnectOptions::default()).await.unwrap();
    let mut ac_events = ac.subscribe();
    let c_node = wait_connection(&mut c_events).await;
    let mut c_node_events = c_node.subscribe();
    wait_node_open(&mut ac_events).await;

    let delivered = a
        .broadcast(Payload::text("fanout"), SendOptions::default())
        .await;
    assert_eq!(delivered, 2);

    wait_data_text(&mut b_node_events, "fanout").await;
    wait_data_text(&mut c_node_events, "fanout").await;

    // Exactly once per recipient.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let duplicates = |rx: &mut mpsc::UnboundedReceiver<NodeEvent>| {
        let mut count = 0;
        while let Ok(event) = rx.try_recv() {
            if let NodeEvent::Data(Payload::Json(value)) = event {
                if value.as_str() == Some("fanout") {
                    count += 1;
                }
            }
        }
        count
    };
    assert_eq!(duplicates(&mut b_node_events), 0);
    assert_eq!(duplicates(&mut c_node_events), 0);
}

#[tokio::test]
async fn latency_probe_reports_ping() {
    let mesh = TestMesh::new();
    mesh.net.set_default_rtt(Some(0.05));
    let (a, _a_events, _) = mesh.client("a").await;
    let (_b, _b_events, _) = mesh.client("b").await;

    let node = a.connect(peer("b"), ConnectOptions::default()).await.unwrap();
    let mut node_events = node.subscribe();
    wait_node_open(&mut node_events).await;

    let ms = wait_for(&mut node_events, |event| match event {
        NodeEvent::Ping(ms) => Some(ms),
        _ => None,
    })
    .await;
    assert_eq!(ms, 50);
    assert_eq!(node.ping(), Some(50));
}

#[tokio::test]
async fn ping_stays_unset_without_rtt_reports() {
    let mesh = TestMesh::new();
    mesh.net.set_default_rtt(None);
    let (a, _a_events, _) = mesh.client("a").await;
    let (_b, _b_events, _) = mesh.client("b").await;

    let node = a.connect(peer("b"), ConnectOptions::default()).await.unwrap();
    let mut node_events = node.subscribe();
    wait_node_open(&mut node_events).await;

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(node.ping(), None);
}

#[tokio::test]
async fn unreachable_peer_expires_and_cleans_up() {
    let mesh = TestMesh::new();
    let (a, mut a_events, _) = mesh.client("a").await;

    let _ = a.connect(peer("ghost"), ConnectOptions::default()).await.unwrap();
    let err = wait_for(&mut a_events, |event| match event {
        ClientEvent::Error(err) => Some(err),
        _ => None,
    })
    .await;
    assert_eq!(err.kind(), MeshErrorKind::PeerUnavailable);

    eventually(|| a.node(&peer("ghost")).is_none()).await;
    assert_eq!(a.pending_connection_attempts(), 0);
}

#[tokio::test]
async fn duplicate_id_aborts_the_second_client() {
    let mesh = TestMesh::new();
    let (_a, _a_events, _) = mesh.client("dup").await;

    // Second client with the same id never opens.
    let factory = mesh.net.factory();
    let second = MeshClient::with_backends(
        Some(peer("dup")),
        test_options(),
        mesh.server.connector(),
        factory,
    );
    let mut events = second.subscribe();

    let err = wait_for(&mut events, |event| match event {
        ClientEvent::Error(err) => Some(err),
        _ => None,
    })
    .await;
    assert_eq!(err.kind(), MeshErrorKind::UnavailableId);
    wait_for(&mut events, |event| {
        matches!(event, ClientEvent::Close).then_some(())
    })
    .await;
    assert!(second.is_destroyed());
}

#[tokio::test]
async fn leave_closes_the_node_and_destroy_closes_everything() {
    let mesh = TestMesh::new();
    let (a, mut a_events, _) = mesh.client("a").await;
    let (b, mut b_events, _) = mesh.client("b").await;

    let a_node = a.connect(peer("b"), ConnectOptions::default()).await.unwrap();
    let mut a_node_events = a_node.subscribe();
    let b_node = wait_connection(&mut b_events).await;
    let mut b_node_events = b_node.subscribe();
    wait_node_open(&mut a_node_events).await;
    wait_node_open(&mut b_node_events).await;

    // B goes away entirely.
    b.destroy().await;
    wait_for(&mut b_events, |event| {
        matches!(event, ClientEvent::Close).then_some(())
    })
    .await;
    assert!(b.is_destroyed());

    // Its node-close propagates through the closed channels.
    wait_for(&mut a_node_events, |event| {
        matches!(event, NodeEvent::Close).then_some(())
    })
    .await;
    eventually(|| a.node(&peer("b")).is_none()).await;

    // Destroyed clients refuse further work, and close is not re-emitted.
    let err = b
        .connect(peer("a"), ConnectOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), MeshErrorKind::Destroyed);

    // close is emitted at most once.
    b.destroy().await;
    let mut close_count = 0;
    while let Ok(event) = b_events.try_recv() {
        if matches!(event, ClientEvent::Close) {
            close_count += 1;
        }
    }
    assert_eq!(close_count, 0, "destroy re-emitted close");
    while let Ok(event) = a_events.try_recv() {
        let _ = event;
    }
}
