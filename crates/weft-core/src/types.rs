//! Shared data types and the narrow interfaces to the engine's collaborators.

use crate::error::Result;
use crate::msgsess::SideBandKind;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use tokio::time::Instant;
use weft_crypto::{NodePublic, SessionPublic};
use weft_transport::UdpConn;

/// Relay server identifier, assigned by the control plane.
pub type RelayId = i64;

/// Default STUN port on relay servers
pub const DEFAULT_STUN_PORT: u16 = 3478;

/// What the engine knows about one peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    /// Relay the peer prefers before a direct path exists
    pub home_relay: RelayId,
    /// Endpoints announced by the control plane
    pub endpoints: Vec<SocketAddr>,
    /// Endpoints the peer sent us in a rendezvous (normalised)
    pub rendezvous_endpoints: Vec<SocketAddr>,
    /// Current session key; zero until known
    pub session: SessionPublic,
    /// Virtual IPv4 address inside the mesh
    pub ipv4: Option<Ipv4Addr>,
    /// Virtual IPv6 address inside the mesh
    pub ipv6: Option<Ipv6Addr>,
    /// Whether mDNS packets may be exchanged with this peer
    pub mdns: bool,
}

impl PeerInfo {
    /// New peer info with no rendezvous endpoints yet.
    #[must_use]
    pub fn new(home_relay: RelayId, endpoints: Vec<SocketAddr>, session: SessionPublic) -> Self {
        Self {
            home_relay,
            endpoints,
            rendezvous_endpoints: Vec::new(),
            session,
            ipv4: None,
            ipv6: None,
            mdns: false,
        }
    }
}

/// Partial update for [`PeerInfo`]; `None` leaves a field as is.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerUpdate {
    /// New home relay
    pub home_relay: Option<RelayId>,
    /// Replacement endpoint list
    pub endpoints: Option<Vec<SocketAddr>>,
    /// New session key
    pub session: Option<SessionPublic>,
    /// New mDNS permission
    pub mdns: Option<bool>,
}

/// Where a ping went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingDest {
    /// Sent through a relay
    Relay(RelayId),
    /// Sent to a literal address
    Direct(SocketAddr),
}

/// Record of an outstanding ping, keyed by transaction id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SentPing {
    /// Destination path
    pub dest: PingDest,
    /// Peer the ping was meant for
    pub to: NodePublic,
    /// Send time
    pub at: Instant,
}

impl SentPing {
    /// True if the ping went through a relay.
    #[must_use]
    pub fn to_relay(&self) -> bool {
        matches!(self.dest, PingDest::Relay(_))
    }
}

/// Relay server description as handed out by the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayInfo {
    /// Relay id
    pub id: RelayId,
    /// Key the relay is expected to present
    pub key: NodePublic,
    /// Domain to connect to; may be empty when `ips` is set
    #[serde(default)]
    pub domain: String,
    /// Expected TLS certificate common name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert_cn: Option<String>,
    /// Forced addresses, bypassing DNS
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ips: Option<Vec<IpAddr>>,
    /// STUN port override (default 3478)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stun_port: Option<u16>,
    /// HTTPS port override (default 443)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub https_port: Option<u16>,
    /// HTTP port override (default 80)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_port: Option<u16>,
    /// Connect over plain HTTP
    #[serde(default)]
    pub is_insecure: bool,
}

impl RelayInfo {
    /// STUN endpoints of this relay; empty when no IPs are forced.
    #[must_use]
    pub fn stun_endpoints(&self) -> Vec<SocketAddr> {
        let port = self.stun_port.unwrap_or(DEFAULT_STUN_PORT);
        self.ips
            .iter()
            .flatten()
            .map(|ip| SocketAddr::new(*ip, port))
            .collect()
    }
}

/// The tunnel-interface backend (kernel or userspace WireGuard).
///
/// `conn_for` is also the watchdog's revival hook: when a peer's
/// connection pair dies, the Stage asks for a fresh socket through it.
pub trait TunnelBackend: Send + Sync {
    /// Socket bridging the tunnel interface to this peer's OutConn/InConn.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot provide a socket.
    fn conn_for(&self, peer: NodePublic) -> Result<Arc<dyn UdpConn>>;

    /// Program the peer's allowed virtual addresses.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend rejects the update.
    fn update_peer(
        &self,
        peer: NodePublic,
        ipv4: Option<Ipv4Addr>,
        ipv6: Option<Ipv6Addr>,
    ) -> Result<()>;

    /// Forget the peer.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend rejects the removal.
    fn remove_peer(&self, peer: NodePublic) -> Result<()>;
}

/// Outward notifications towards the control plane.
pub trait ControlCallbacks: Send + Sync {
    /// Our reachable endpoints changed (set-replace).
    ///
    /// # Errors
    ///
    /// Returns an error if the control session cannot be updated.
    fn update_endpoints(&self, endpoints: Vec<SocketAddr>) -> Result<()>;

    /// Our home relay changed.
    ///
    /// # Errors
    ///
    /// Returns an error if the control session cannot be updated.
    fn update_home_relay(&self, relay: RelayId) -> Result<()>;
}

/// Receiver of side-band payloads sent by peers, such as mDNS packets to
/// re-inject on the local network.
pub trait SideBandSink: Send + Sync {
    /// `from` sent us `data`.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload could not be delivered.
    fn deliver(&self, from: NodePublic, kind: SideBandKind, data: Vec<u8>) -> Result<()>;
}

/// STUN transaction id
pub type StunTxId = [u8; 12];

/// STUN binding request/response codec.
pub trait StunCodec: Send + Sync {
    /// Binding request bytes for `txid`.
    fn request(&self, txid: StunTxId) -> Vec<u8>;

    /// Parse a binding response into its transaction id and mapped address.
    ///
    /// # Errors
    ///
    /// Returns an error if `pkt` is not a valid binding response.
    fn parse_response(&self, pkt: &[u8]) -> Result<(StunTxId, SocketAddr)>;
}
