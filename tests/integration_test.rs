//! Black-box scenarios exercising real [`Transport`] instances wired
//! together over loopback TCP, the same way a small local cluster would run
//! them in production.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use curve25519_dalek::scalar::Scalar;
use dfl_transport::config::{PeerEntry, TransportConfig};
use dfl_transport::fragment_cache::FragmentCache;
use dfl_transport::keystore::KeyStore;
use dfl_transport::metrics::{MetricField, Metrics};
use dfl_transport::mixer::Mixer;
use dfl_transport::package::Package;
use dfl_transport::session_switch::SessionSwitch;
use dfl_transport::sphinx::{crypto::public_from_private, PacketCodec, SphinxParams};
use dfl_transport::transport::Transport;
use dfl_transport::PeerId;
use tokio::net::TcpListener;

async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

fn test_scalars(n: u32) -> Vec<(PeerId, Scalar)> {
    (0..n).map(|id| (id, Scalar::from_bytes_mod_order([(id + 1) as u8; 32]))).collect()
}

/// One fully-wired peer: key store, codec, session switch, mixer, accept
/// loop and inbound dispatch all spawned. `connect_peers` and the mixer's
/// own outbox loop are left to the caller, so a test can choose to enqueue
/// a whole batch before the mixer starts draining it.
struct Node {
    transport: Arc<Transport>,
    session_switch: Arc<SessionSwitch>,
    mixer: Arc<Mixer>,
}

#[allow(clippy::too_many_arguments)]
async fn spawn_node(
    node_id: PeerId,
    port: u16,
    n_nodes: u32,
    scalars: &[(PeerId, Scalar)],
    peer_ports: &HashMap<PeerId, u16>,
    mix_enabled: bool,
    mix_shuffle: bool,
    max_hops: usize,
) -> Node {
    let public_map = scalars.iter().map(|(id, scalar)| (*id, public_from_private(scalar))).collect::<HashMap<_, _>>();
    let self_private = scalars.iter().find(|(id, _)| *id == node_id).unwrap().1;
    let keystore = Arc::new(KeyStore::from_public_map(public_map).with_self_private(self_private));

    let params = SphinxParams::default();
    let codec = Arc::new(PacketCodec::new(params, node_id, self_private).unwrap());

    let metrics = Metrics::new_disabled();

    let mut config = TransportConfig::default();
    config.node_id = node_id;
    config.n_nodes = n_nodes;
    config.port = port;
    config.mix_enabled = mix_enabled;
    config.mix_shuffle = mix_shuffle;
    config.mix_outbox_size = 16;
    config.max_hops = max_hops;
    config.peers = peer_ports
        .iter()
        .filter(|(id, _)| **id != node_id)
        .map(|(id, port)| PeerEntry { id: *id, host: "127.0.0.1".to_string(), port: *port })
        .collect();

    let session_switch = SessionSwitch::new(node_id, port, params.packet_len(), config.peer_table(), metrics.clone());
    let fragments = Arc::new(FragmentCache::new(metrics.clone(), config.resend_period));
    let mixer = Mixer::new(config.mixer_config(), session_switch.clone(), metrics.clone());

    let transport = Transport::new(config, codec, keystore, fragments, mixer.clone(), session_switch.clone(), metrics);
    transport.install_cover_generator().await;

    let (inbound_tx, mut inbound_rx) = tokio::sync::mpsc::unbounded_channel();
    tokio::spawn(session_switch.clone().run_accept_loop(inbound_tx));

    let dispatch_transport = transport.clone();
    tokio::spawn(async move {
        while let Some((_peer_id, frame)) = inbound_rx.recv().await {
            let transport = dispatch_transport.clone();
            tokio::spawn(async move { transport.dispatch_inbound(frame).await });
        }
    });

    Node { transport, session_switch, mixer }
}

async fn connect_mesh(nodes: &[&Node]) {
    for node in nodes {
        node.session_switch.connect_peers().await;
    }
    for node in nodes {
        let mut waited = Duration::ZERO;
        while node.session_switch.active_peers().await.is_empty() && waited < Duration::from_secs(2) {
            tokio::time::sleep(Duration::from_millis(20)).await;
            waited += Duration::from_millis(20);
        }
    }
}

#[tokio::test]
async fn two_peer_direct_delivery_with_mixing_off() {
    let scalars = test_scalars(2);
    let ports: HashMap<PeerId, u16> = [(0, free_port().await), (1, free_port().await)].into_iter().collect();

    let node0 = spawn_node(0, ports[&0], 2, &scalars, &ports, false, false, 1).await;
    let node1 = spawn_node(1, ports[&1], 2, &scalars, &ports, false, false, 1).await;
    connect_mesh(&[&node0, &node1]).await;

    let sent = node0.transport.send_to_peers(Package::ModelPart(b"hello from node 0".to_vec())).await;
    assert_eq!(sent, 1);

    let delivered = tokio::time::timeout(Duration::from_secs(2), node1.transport.receive()).await.unwrap();
    assert_eq!(delivered, Some(b"hello from node 0".to_vec()));

    // The SURB reply makes it back and acks node0's fragment without node0
    // ever having to resend it.
    let mut acked = false;
    for _ in 0..100 {
        if node0.transport.all_acked().await {
            acked = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(acked, "originator's fragment was never acked by the SURB reply");
}

#[tokio::test]
async fn three_peer_relay_eventually_exercises_an_intermediate_hop() {
    // With n_nodes = 3 and max_hops = 1, any path that isn't direct has
    // exactly one possible intermediate: the third node. secure_random_path
    // draws the hop count uniformly from [0, 1], so repeated sends land on
    // the relayed case with overwhelming probability well inside 60 tries.
    let scalars = test_scalars(3);
    let ports: HashMap<PeerId, u16> =
        [(0, free_port().await), (1, free_port().await), (2, free_port().await)].into_iter().collect();

    let node0 = spawn_node(0, ports[&0], 3, &scalars, &ports, true, false, 1).await;
    let node1 = spawn_node(1, ports[&1], 3, &scalars, &ports, true, false, 1).await;
    let node2 = spawn_node(2, ports[&2], 3, &scalars, &ports, true, false, 1).await;
    connect_mesh(&[&node0, &node1, &node2]).await;

    tokio::spawn(node0.mixer.clone().run());
    tokio::spawn(node1.mixer.clone().run());
    tokio::spawn(node2.mixer.clone().run());

    let mut relayed = false;
    for _ in 0..60 {
        node0.transport.send_to_peers(Package::ModelPart(b"relay me".to_vec())).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        let forwarded = node1.transport.metrics().get(MetricField::Forwarded) + node2.transport.metrics().get(MetricField::Forwarded);
        if forwarded > 0 {
            relayed = true;
            break;
        }
    }
    assert!(relayed, "no send out of 60 attempts took the one-hop relay path");
}

/// Simulates an ack that never arrives by accepting node1's connection but
/// never spawning anything to read and reply to the frames it carries:
/// node0's fragment sits unacked until the resend sweep picks it up.
#[tokio::test]
async fn ack_loss_triggers_a_resend() {
    let scalars = test_scalars(2);
    let ports: HashMap<PeerId, u16> = [(0, free_port().await), (1, free_port().await)].into_iter().collect();

    let node0 = spawn_node(0, ports[&0], 2, &scalars, &ports, false, false, 1).await;

    // node1 only runs a bare accept loop: frames land in the channel but
    // nothing ever reads them, so no SURB reply is ever produced.
    let params = SphinxParams::default();
    let node1_metrics = Metrics::new_disabled();
    let node1_switch = SessionSwitch::new(1, ports[&1], params.packet_len(), HashMap::new(), node1_metrics);
    let (node1_tx, _node1_rx) = tokio::sync::mpsc::unbounded_channel();
    tokio::spawn(node1_switch.clone().run_accept_loop(node1_tx));

    node0.session_switch.connect_peers().await;
    let mut waited = Duration::ZERO;
    while node0.session_switch.active_peers().await.is_empty() && waited < Duration::from_secs(2) {
        tokio::time::sleep(Duration::from_millis(20)).await;
        waited += Duration::from_millis(20);
    }
    assert_eq!(node0.session_switch.active_peers().await, vec![1]);

    let sent = node0.transport.send_to_peers(Package::ModelPart(b"never acked".to_vec())).await;
    assert_eq!(sent, 1);
    assert!(!node0.transport.all_acked().await);

    node0.transport.resend_stale(Duration::from_secs(0)).await;
    assert!(node0.transport.metrics().get(MetricField::Resent) >= 1, "a stale fragment to an active peer should be resent");
}

/// A peer disconnecting drops its outstanding fragments rather than having
/// the resend loop chase a peer that will never come back.
#[tokio::test]
async fn peer_disconnect_purges_its_fragments() {
    let scalars = test_scalars(2);
    let port0 = free_port().await;

    // A bare listener stands in for peer 1: it only needs to accept the
    // connection so node0's send succeeds, and to be dropped later to
    // simulate peer 1 going away.
    let stand_in = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let stand_in_port = stand_in.local_addr().unwrap().port();
    let ports: HashMap<PeerId, u16> = [(0, port0), (1, stand_in_port)].into_iter().collect();

    let node0 = spawn_node(0, port0, 2, &scalars, &ports, false, false, 1).await;
    node0.session_switch.connect_peers().await;

    let accepted = tokio::time::timeout(Duration::from_secs(2), stand_in.accept()).await.unwrap().unwrap();
    let mut waited = Duration::ZERO;
    while node0.session_switch.active_peers().await.is_empty() && waited < Duration::from_secs(2) {
        tokio::time::sleep(Duration::from_millis(20)).await;
        waited += Duration::from_millis(20);
    }
    assert_eq!(node0.session_switch.active_peers().await, vec![1]);

    let sent = node0.transport.send_to_peers(Package::ModelPart(b"orphaned".to_vec())).await;
    assert_eq!(sent, 1);
    assert!(!node0.transport.all_acked().await);

    // Peer 1 disappears.
    drop(accepted.0);
    drop(stand_in);

    // The send attempt itself is what discovers the broken connection
    // (nothing reads proactively), so send once more to flip the link
    // inactive before purging.
    let _ = node0.transport.send_to_peers(Package::ModelPart(b"will fail to send".to_vec())).await;
    let mut waited = Duration::ZERO;
    while !node0.session_switch.active_peers().await.is_empty() && waited < Duration::from_secs(8) {
        let _ = node0.transport.send_to_peers(Package::ModelPart(b"poke".to_vec())).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        waited += Duration::from_millis(20);
    }
    assert!(node0.session_switch.active_peers().await.is_empty());

    node0.transport.purge_inactive_peers().await;
    assert!(node0.transport.all_acked().await, "fragments addressed to a purged peer should be gone, not just acked");
}

/// When the real outbound queue is empty, the mixer still fills its outbox
/// from cover traffic so an observer watching send timing alone cannot tell
/// an idle node from a busy one.
#[tokio::test]
async fn cover_traffic_fills_an_empty_queue() {
    let scalars = test_scalars(2);
    let ports: HashMap<PeerId, u16> = [(0, free_port().await), (1, free_port().await)].into_iter().collect();

    let node0 = spawn_node(0, ports[&0], 2, &scalars, &ports, true, true, 1).await;
    let node1 = spawn_node(1, ports[&1], 2, &scalars, &ports, true, true, 1).await;
    connect_mesh(&[&node0, &node1]).await;

    tokio::spawn(node0.mixer.clone().run());
    tokio::spawn(node1.mixer.clone().run());

    // Never call send_to_peers: the real queue stays empty the whole test.
    let mut saw_cover = false;
    for _ in 0..100 {
        if node0.transport.metrics().get(MetricField::CoversSent) > 0 {
            saw_cover = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(saw_cover, "an idle mixer should still emit cover traffic");
}

/// A burst of fragments queued before the mixer starts draining comes out
/// in a different order than it went in, because the outbox is shuffled
/// once per refill. With 8 distinct items the chance of recovering the
/// original order by accident is 1 in 8!.
#[tokio::test]
async fn shuffle_breaks_send_order() {
    let scalars = test_scalars(2);
    let ports: HashMap<PeerId, u16> = [(0, free_port().await), (1, free_port().await)].into_iter().collect();

    let node0 = spawn_node(0, ports[&0], 2, &scalars, &ports, true, true, 0).await;
    let node1 = spawn_node(1, ports[&1], 2, &scalars, &ports, true, true, 0).await;
    connect_mesh(&[&node0, &node1]).await;

    const N: u8 = 8;
    for i in 0..N {
        node0.transport.send_to_peers(Package::ModelPart(vec![i])).await;
    }

    // Only start draining now that the whole batch is queued, so the first
    // outbox refill shuffles all N items together.
    tokio::spawn(node0.mixer.clone().run());
    tokio::spawn(node1.mixer.clone().run());

    let mut order = Vec::new();
    for _ in 0..200 {
        if order.len() == N as usize {
            break;
        }
        if let Some(bytes) = tokio::time::timeout(Duration::from_millis(50), node1.transport.receive()).await.ok().flatten() {
            order.extend(bytes);
        }
    }
    assert_eq!(order.len(), N as usize);
    let in_order: Vec<u8> = (0..N).collect();
    assert_ne!(order, in_order, "a shuffled outbox landed back in send order");
}
