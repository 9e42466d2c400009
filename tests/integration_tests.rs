//! Integration tests for whole-engine behaviour.
//!
//! Every test runs real stages over loopback UDP with an in-memory relay,
//! so the actors, the session codec and the peer state machine are all
//! exercised together.

use std::sync::Arc;
use std::time::Duration;
use weft_core::{EngineConfig, EngineError, PeerInfo, PeerUpdate, SideBandKind};
use weft_integration_tests::fixtures::TwoNodeFixture;
use weft_integration_tests::fixtures::two_node::{HUB_RELAY, Node, fast_config};
use weft_integration_tests::test_helpers::{RelayHub, random_node_key, scaled, wait_for};
use weft_crypto::SessionPublic;

/// Drain a tunnel until `want` arrives or `limit` passes.
async fn receives(node: &Node, from: &Node, want: &[u8], limit: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if let Some(pkt) = node.recv_from(from, Duration::from_millis(200)).await {
            if pkt == want {
                return true;
            }
        }
    }
    false
}

// ============================================================================
// Path Establishment
// ============================================================================

/// Two nodes that know each other's endpoints reach a direct path and
/// deliver tunnel traffic both ways.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_two_nodes_establish_direct_path() {
    let fixture = Arc::new(TwoNodeFixture::new().await.expect("fixture"));
    fixture.introduce(true).expect("introduce");
    let pump = fixture.pump_traffic();

    let established = wait_for(Duration::from_secs(20), || {
        let f = Arc::clone(&fixture);
        async move {
            f.a.state_of(&f.b).await == Some("established")
                && f.b.state_of(&f.a).await == Some("established")
        }
    })
    .await;
    assert!(established, "both sides should reach established");

    assert!(receives(&fixture.b, &fixture.a, b"from-a", Duration::from_secs(5)).await);
    assert!(receives(&fixture.a, &fixture.b, b"from-b", Duration::from_secs(5)).await);

    pump.cancel();
    fixture.shutdown();
}

/// Without any endpoints the peers stay inactive and traffic rides the
/// home relay.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_traffic_falls_back_to_relay() {
    let fixture = Arc::new(TwoNodeFixture::new().await.expect("fixture"));
    fixture.a.stage.set_local_endpoints(Vec::new());
    fixture.b.stage.set_local_endpoints(Vec::new());
    fixture.introduce(false).expect("introduce");
    let pump = fixture.pump_traffic();

    assert!(receives(&fixture.b, &fixture.a, b"from-a", Duration::from_secs(10)).await);
    assert!(receives(&fixture.a, &fixture.b, b"from-b", Duration::from_secs(10)).await);

    assert_eq!(fixture.a.state_of(&fixture.b).await, Some("inactive"));
    let dials = fixture.hub.dials();
    assert!(dials.contains(&(fixture.a.key, HUB_RELAY)));
    assert!(dials.contains(&(fixture.b.key, HUB_RELAY)));

    pump.cancel();
    fixture.shutdown();
}

/// mDNS side-band packets reach peers that allow them, over the relay when
/// there is no direct path.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_mdns_side_band_reaches_allowed_peer() {
    let fixture = TwoNodeFixture::new().await.expect("fixture");
    fixture.a.stage.set_local_endpoints(Vec::new());
    fixture.b.stage.set_local_endpoints(Vec::new());
    fixture.introduce(false).expect("introduce");

    let allow = PeerUpdate {
        mdns: Some(true),
        ..PeerUpdate::default()
    };
    fixture.a.stage.update_peer(fixture.b.key, allow.clone()).expect("update a");
    fixture.b.stage.update_peer(fixture.a.key, allow).expect("update b");

    let delivered = wait_for(Duration::from_secs(10), || {
        let f = &fixture;
        async move {
            // Both sides spread so both hold a relay link.
            f.a.stage.spread_side_band(SideBandKind::Mdns, b"mdns-from-a".to_vec());
            f.b.stage.spread_side_band(SideBandKind::Mdns, b"mdns-from-b".to_vec());
            f.b.side_band.got.lock().unwrap().iter().any(|(from, kind, data)| {
                *from == f.a.key && *kind == SideBandKind::Mdns && data == b"mdns-from-a"
            })
        }
    })
    .await;
    assert!(delivered, "b should receive a's mDNS packet");

    fixture.shutdown();
}

/// Without permission in the peer info, side-band packets are dropped.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_mdns_side_band_needs_permission() {
    let fixture = TwoNodeFixture::new().await.expect("fixture");
    fixture.introduce(false).expect("introduce");

    for _ in 0..10 {
        fixture.a.stage.spread_side_band(SideBandKind::Mdns, b"mdns".to_vec());
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    tokio::time::sleep(scaled(Duration::from_millis(500))).await;
    assert!(fixture.b.side_band.got.lock().unwrap().is_empty());
    assert!(fixture.hub.dials().is_empty());

    fixture.shutdown();
}

/// Peers without traffic are left alone: no state, no relay dials.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_idle_peers_are_left_alone() {
    let fixture = TwoNodeFixture::new().await.expect("fixture");
    fixture.introduce(true).expect("introduce");

    tokio::time::sleep(Duration::from_millis(800)).await;
    assert_eq!(fixture.a.state_of(&fixture.b).await, None);
    assert_eq!(fixture.b.state_of(&fixture.a).await, None);
    assert!(fixture.hub.dials().is_empty());

    fixture.shutdown();
}

// ============================================================================
// Peer Lifecycle
// ============================================================================

/// Adding, updating and removing peers through the public surface.
#[tokio::test]
async fn test_peer_lifecycle() {
    let hub = RelayHub::new();
    let node = Node::spawn(fast_config(), &hub).await.expect("node");
    let peer = random_node_key();
    let session = SessionPublic::from_bytes([5; 32]);

    let mut info = PeerInfo::new(HUB_RELAY, Vec::new(), session);
    info.ipv4 = Some("100.64.0.2".parse().unwrap());
    node.stage.add_peer(peer, info.clone()).expect("add");
    assert!(matches!(
        node.stage.add_peer(peer, info),
        Err(EngineError::PeerExists(_))
    ));

    assert_eq!(
        node.backend.addresses(&peer),
        Some((Some("100.64.0.2".parse().unwrap()), None))
    );
    assert!(node.stage.out_conn_for(&peer).is_some());
    assert!(node.stage.in_conn_for(&peer).is_some());
    assert!(node.backend.tunnel(&peer).is_some());

    let endpoint = "192.0.2.7:41641".parse().unwrap();
    node.stage
        .update_peer(
            peer,
            PeerUpdate {
                home_relay: Some(7),
                endpoints: Some(vec![endpoint]),
                ..PeerUpdate::default()
            },
        )
        .expect("update");
    let info = node.stage.get_peer_info(&peer).expect("info");
    assert_eq!(info.home_relay, 7);
    assert_eq!(info.endpoints, vec![endpoint]);
    assert_eq!(info.session, session);

    node.stage.remove_peer(peer).expect("remove");
    assert!(node.stage.get_peer_info(&peer).is_none());
    assert!(node.stage.out_conn_for(&peer).is_none());
    assert!(node.backend.tunnel(&peer).is_none());
    assert!(matches!(
        node.stage.remove_peer(peer),
        Err(EngineError::PeerUnknown(_))
    ));

    node.stage.shutdown();
}

/// Tunnel traffic makes the Traffic Manager track a peer; it waits for a
/// session key before doing anything else.
#[tokio::test]
async fn test_active_peer_waits_for_session_key() {
    let hub = RelayHub::new();
    let node = Node::spawn(fast_config(), &hub).await.expect("node");
    let stage = &node.stage;
    let peer = random_node_key();
    stage
        .add_peer(peer, PeerInfo::new(HUB_RELAY, Vec::new(), SessionPublic::default()))
        .expect("add");

    let tunnel = node.backend.tunnel(&peer).expect("tunnel");
    tunnel.send(b"hello").await.expect("send");

    let waiting = wait_for(Duration::from_secs(5), || async move {
        stage
            .peer_states()
            .await
            .is_ok_and(|s| s.contains(&(peer, "waiting")))
    })
    .await;
    assert!(waiting, "a peer without a session key waits");

    stage
        .update_peer(
            peer,
            PeerUpdate {
                session: Some(SessionPublic::from_bytes([6; 32])),
                ..PeerUpdate::default()
            },
        )
        .expect("update");
    let moved_on = wait_for(Duration::from_secs(5), || async move {
        stage
            .peer_states()
            .await
            .is_ok_and(|s| s.iter().any(|(p, name)| *p == peer && *name != "waiting"))
    })
    .await;
    assert!(moved_on);

    stage.shutdown();
}

// ============================================================================
// Supervision
// ============================================================================

/// A connection pair with a dead half is replaced by the watchdog.
#[tokio::test]
async fn test_watchdog_revives_dead_connections() {
    let hub = RelayHub::new();
    let node = Node::spawn(fast_config(), &hub).await.expect("node");
    let peer = random_node_key();
    node.stage
        .add_peer(peer, PeerInfo::new(HUB_RELAY, Vec::new(), SessionPublic::from_bytes([5; 32])))
        .expect("add");

    let before = node.backend.tunnel(&peer).expect("tunnel");
    let out = node.stage.out_conn_for(&peer).expect("outconn");
    out.token().cancel();

    let (node_ref, before) = (&node, &before);
    let revived = wait_for(Duration::from_secs(5), || async move {
        node_ref.stage.out_conn_for(&peer).is_some_and(|h| !h.is_dead())
            && node_ref
                .backend
                .tunnel(&peer)
                .is_some_and(|t| !Arc::ptr_eq(&t, before))
    })
    .await;
    assert!(revived, "watchdog should rebuild the pair with a fresh socket");
    assert!(node.stage.in_conn_for(&peer).is_some_and(|h| !h.is_dead()));

    node.stage.shutdown();
}

/// Shutdown stops every actor; the engine cannot be restarted.
#[tokio::test]
async fn test_shutdown() {
    let hub = RelayHub::new();
    let node = Node::spawn(fast_config(), &hub).await.expect("node");
    assert!(node.stage.peer_states().await.is_ok());

    node.stage.shutdown();
    let stage = &node.stage;
    let stopped = wait_for(Duration::from_secs(5), || async move {
        stage.peer_states().await.is_err()
    })
    .await;
    assert!(stopped);
    assert!(matches!(node.stage.start(), Err(EngineError::Shutdown)));
}

// ============================================================================
// Configuration
// ============================================================================

/// A zero cadence is rejected before anything starts.
#[tokio::test]
async fn test_invalid_config_rejected() {
    let mut config = EngineConfig::default();
    config.timing.watchdog_ms = 0;
    assert!(matches!(
        Node::spawn(config, &RelayHub::new()).await,
        Err(EngineError::InvalidConfig(_))
    ));
}

/// In test-network mode the session key doubles as the node key.
#[tokio::test]
async fn test_session_key_as_node_key() {
    let mut config = fast_config();
    config.session_is_node_key = true;
    let node = Node::spawn(config, &RelayHub::new()).await.expect("node");

    assert_eq!(node.key.as_bytes(), node.session.as_bytes());
    node.stage.shutdown();
}

/// Config files parse into the same structure the engine validates.
#[test]
fn test_config_from_toml() {
    let config = EngineConfig::from_toml_str(
        r#"
        stun_servers = ["198.51.100.1:3478"]

        [timing]
        tick_ms = 250
        "#,
    )
    .expect("parse");
    assert_eq!(config.timing.tick(), Duration::from_millis(250));
    assert_eq!(config.stun_servers.len(), 1);
    assert!(config.validate().is_ok());
}
