//! Two-node test fixture for integration testing
//!
//! Runs two complete stages in one process:
//! - each with its own external loopback UDP socket
//! - sharing one in-memory relay hub (relay id 1)
//! - with loopback tunnel backends standing in for WireGuard
//!
//! # Example
//!
//! ```no_run
//! use weft_integration_tests::fixtures::TwoNodeFixture;
//!
//! #[tokio::test]
//! async fn test_basic() {
//!     let fixture = TwoNodeFixture::new().await.unwrap();
//!     fixture.introduce(true).unwrap();
//!
//!     fixture.a.send_to(&fixture.b, b"hello").await.unwrap();
//!     // ... poll the other tunnel, check peer states ...
//!
//!     fixture.shutdown();
//! }
//! ```

use crate::test_helpers::{
    LoopbackBackend, NoStun, RecordingControl, RecordingSideBand, RelayHub, init_test_logging,
    random_node_key, relay_info,
};
use rand_core::OsRng;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use weft_core::{
    Collaborators, EngineConfig, PeerInfo, RelayId, Result, SessionPrivate, SessionPublic, Stage,
};
use weft_crypto::NodePublic;
use weft_transport::{UdpConn, UdpSocketConn};

/// Relay id every fixture node uses as the peers' home relay.
pub const HUB_RELAY: RelayId = 1;

/// Config with short cadences so state transitions happen quickly.
pub fn fast_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.timing.tick_ms = 100;
    config.timing.watchdog_ms = 200;
    config.timing.relay_retry_ms = 200;
    config
}

/// One running node.
pub struct Node {
    /// Node key
    pub key: NodePublic,
    /// Session public key
    pub session: SessionPublic,
    /// The engine
    pub stage: Stage,
    /// External socket address
    pub external: SocketAddr,
    /// Tunnel side of every peer connection
    pub backend: Arc<LoopbackBackend>,
    /// Control plane notifications
    pub control: Arc<RecordingControl>,
    /// Side-band payloads received from peers
    pub side_band: Arc<RecordingSideBand>,
}

impl Node {
    /// Build and start a node.
    ///
    /// # Errors
    ///
    /// Returns an error if the external socket cannot be bound or the stage
    /// rejects `config`.
    pub async fn spawn(config: EngineConfig, hub: &Arc<RelayHub>) -> Result<Self> {
        init_test_logging();
        let external = UdpSocketConn::bind(SocketAddr::from(([127, 0, 0, 1], 0))).await?;
        let external_addr = external.local_addr()?;

        let key = random_node_key();
        let session = SessionPrivate::generate(&mut OsRng);
        let session_pub = session.public();

        let backend = Arc::new(LoopbackBackend::default());
        let control = Arc::new(RecordingControl::default());
        let side_band = Arc::new(RecordingSideBand::default());
        let collab = Collaborators {
            backend: backend.clone(),
            control: control.clone(),
            dialer: hub.dialer(key),
            stun: Arc::new(NoStun),
            side_band: side_band.clone(),
        };

        let stage = Stage::new(config, key, session, Arc::new(external), collab)?;
        stage.set_local_endpoints(vec![external_addr]);
        stage.start()?;
        stage.update_relays(vec![relay_info(HUB_RELAY)]);

        Ok(Self {
            key: stage.node_key(),
            session: session_pub,
            stage,
            external: external_addr,
            backend,
            control,
            side_band,
        })
    }

    /// Write `pkt` into our tunnel towards `peer`.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if there is no tunnel socket for `peer` yet or
    /// the write fails.
    pub async fn send_to(&self, peer: &Node, pkt: &[u8]) -> std::io::Result<()> {
        let tunnel = self
            .backend
            .tunnel(&peer.key)
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotConnected, "no tunnel"))?;
        tunnel.send(pkt).await?;
        Ok(())
    }

    /// Next packet that arrived on our tunnel from `peer`, if one shows up
    /// within `wait`.
    pub async fn recv_from(&self, peer: &Node, wait: Duration) -> Option<Vec<u8>> {
        let tunnel = self.backend.tunnel(&peer.key)?;
        let mut buf = vec![0u8; 2048];
        let n = tokio::time::timeout(wait, tunnel.recv(&mut buf)).await.ok()?.ok()?;
        buf.truncate(n);
        Some(buf)
    }

    /// Current state name of `peer`, if the Traffic Manager tracks it.
    pub async fn state_of(&self, peer: &Node) -> Option<&'static str> {
        let states = self.stage.peer_states().await.ok()?;
        states
            .into_iter()
            .find(|(key, _)| *key == peer.key)
            .map(|(_, name)| name)
    }
}

/// Two nodes sharing a relay hub.
pub struct TwoNodeFixture {
    /// First node
    pub a: Node,
    /// Second node
    pub b: Node,
    /// Shared relay
    pub hub: Arc<RelayHub>,
}

impl TwoNodeFixture {
    /// Two nodes with [`fast_config`].
    ///
    /// # Errors
    ///
    /// Returns an error if either node fails to start.
    pub async fn new() -> Result<Self> {
        Self::with_config(fast_config()).await
    }

    /// Two nodes with the same custom config.
    ///
    /// # Errors
    ///
    /// Returns an error if either node fails to start.
    pub async fn with_config(config: EngineConfig) -> Result<Self> {
        let hub = RelayHub::new();
        let a = Node::spawn(config.clone(), &hub).await?;
        let b = Node::spawn(config, &hub).await?;
        Ok(Self { a, b, hub })
    }

    /// Make each node a peer of the other, homed on the hub relay.
    ///
    /// With `with_endpoints` each node also learns the other's external
    /// address, so a direct path can be established.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::PeerExists` if called twice.
    pub fn introduce(&self, with_endpoints: bool) -> Result<()> {
        let endpoints = |n: &Node| {
            if with_endpoints {
                vec![n.external]
            } else {
                Vec::new()
            }
        };
        self.a.stage.add_peer(
            self.b.key,
            PeerInfo::new(HUB_RELAY, endpoints(&self.b), self.b.session),
        )?;
        self.b.stage.add_peer(
            self.a.key,
            PeerInfo::new(HUB_RELAY, endpoints(&self.a), self.a.session),
        )?;
        Ok(())
    }

    /// Keep both tunnels busy until the returned token is cancelled.
    pub fn pump_traffic(self: &Arc<Self>) -> CancellationToken {
        let token = CancellationToken::new();
        let fixture = Arc::clone(self);
        let stop = token.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(100));
            loop {
                tokio::select! {
                    () = stop.cancelled() => break,
                    _ = ticker.tick() => {
                        let _ = fixture.a.send_to(&fixture.b, b"from-a").await;
                        let _ = fixture.b.send_to(&fixture.a, b"from-b").await;
                    }
                }
            }
        });
        token
    }

    /// Stop both stages.
    pub fn shutdown(&self) {
        self.a.stage.shutdown();
        self.b.stage.shutdown();
    }
}
