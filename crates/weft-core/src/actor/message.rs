//! The closed set of messages exchanged between actors.
//!
//! Each actor has exactly one inbox type; nothing accepts arbitrary
//! payloads.

use crate::msgsess::{ClearMessage, SessionMessage, SideBandKind};
use crate::types::{RelayId, RelayInfo};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use weft_crypto::{NodePublic, SessionPublic};

/// Datagram read by a Socket Receiver.
#[derive(Debug, Clone)]
pub struct RecvFrame {
    /// Datagram bytes
    pub pkt: Vec<u8>,
    /// Source address
    pub src: SocketAddr,
    /// Read time
    pub at: Instant,
}

/// Datagram from the external socket, bound for the Direct Router.
#[derive(Debug, Clone)]
pub struct DirectedPeerFrame {
    /// Source address (normalised)
    pub src: SocketAddr,
    /// Read time
    pub at: Instant,
    /// Datagram bytes
    pub pkt: Vec<u8>,
}

/// Packet received through a relay, bound for the Relay Router.
#[derive(Debug, Clone)]
pub struct RelayedPeerFrame {
    /// Relay it arrived on
    pub relay: RelayId,
    /// Peer that sent it
    pub peer: NodePublic,
    /// Packet bytes
    pub pkt: Vec<u8>,
}

/// Literal write on the external socket.
#[derive(Debug, Clone)]
pub struct DirectWrite {
    /// Destination
    pub addr: SocketAddr,
    /// Bytes
    pub pkt: Vec<u8>,
}

/// Write through a relay.
#[derive(Debug, Clone)]
pub struct RelayWrite {
    /// Relay to send through
    pub relay: RelayId,
    /// Destination peer
    pub dst: NodePublic,
    /// Bytes
    pub pkt: Vec<u8>,
}

/// Snapshot of each peer's state name.
pub type StateSnapshot = Vec<(NodePublic, &'static str)>;

/// Traffic Manager inbox.
#[derive(Debug)]
pub enum TrafficMsg {
    /// An OutConn or InConn went active or idle
    ConnActivity {
        /// Peer
        peer: NodePublic,
        /// InConn if true, else OutConn
        is_in: bool,
        /// New activity flag
        active: bool,
    },
    /// An OutConn or InConn shut down
    ConnGoodBye {
        /// Peer
        peer: NodePublic,
        /// InConn if true, else OutConn
        is_in: bool,
    },
    /// Decrypted session message that arrived over a relay
    FromRelay {
        /// Relay
        relay: RelayId,
        /// Relay-attested sender
        peer: NodePublic,
        /// Message
        msg: ClearMessage,
    },
    /// Decrypted session message that arrived directly
    FromDirect {
        /// Source address
        addr: SocketAddr,
        /// Message
        msg: ClearMessage,
    },
    /// The Stage's peer info for `peer` changed
    SyncPeerInfo {
        /// Peer
        peer: NodePublic,
    },
    /// Send a local side-band payload to every peer allowing it
    SpreadSideBand {
        /// Payload kind
        kind: SideBandKind,
        /// Payload
        data: Vec<u8>,
    },
    /// Report every peer's current state
    Snapshot(oneshot::Sender<StateSnapshot>),
}

/// Session Manager inbox.
#[derive(Debug)]
pub enum SessionMsg {
    /// Sealed frame received over a relay
    FrameFromRelay {
        /// Relay
        relay: RelayId,
        /// Relay-attested sender
        peer: NodePublic,
        /// Whole frame, magic included
        frame: Vec<u8>,
    },
    /// Sealed frame received on the external socket
    FrameFromAddr {
        /// Source address
        addr: SocketAddr,
        /// Whole frame, magic included
        frame: Vec<u8>,
    },
    /// Seal and send through a relay
    SendToRelay {
        /// Relay
        relay: RelayId,
        /// Destination peer
        peer: NodePublic,
        /// Destination session key
        to_session: SessionPublic,
        /// Message
        msg: SessionMessage,
    },
    /// Seal and send directly
    SendToDirect {
        /// Destination
        addr: SocketAddr,
        /// Destination session key
        to_session: SessionPublic,
        /// Message
        msg: SessionMessage,
    },
}

/// Outbound path selection for an OutConn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutConnUse {
    /// Send through this relay
    Relay(RelayId),
    /// Send through the peer's current home relay, following changes
    TrackHome,
    /// Send directly to this address
    Direct(SocketAddr),
}

/// OutConn inbox.
#[derive(Debug, Clone)]
pub enum OutConnMsg {
    /// Switch outbound path
    Use(OutConnUse),
    /// Peer info changed; re-read the home relay when tracking it
    SyncPeerInfo,
}

/// Direct Router inbox.
#[derive(Debug)]
pub enum DirectRouterMsg {
    /// Learn an alias address for a peer
    AddKnownAs {
        /// Peer
        peer: NodePublic,
        /// Address (normalised by the router)
        addr: SocketAddr,
    },
    /// Forget all aliases of a peer
    ClearKnownAs {
        /// Peer
        peer: NodePublic,
    },
    /// Send these STUN requests and route replies from their targets to the
    /// Endpoint Manager
    PushStun {
        /// Target to request bytes
        packets: HashMap<SocketAddr, Vec<u8>>,
    },
}

/// Relay Manager inbox.
#[derive(Debug)]
pub enum RelayManMsg {
    /// Relay list add/update
    UpdateRelays(Vec<RelayInfo>),
    /// Latest STUN latency per relay
    LatencyResults(HashMap<RelayId, Duration>),
}

/// Endpoint Manager inbox.
#[derive(Debug)]
pub enum EndpointMsg {
    /// Relay list add/update
    UpdateRelays(Vec<RelayInfo>),
    /// Datagram from a STUN target
    StunResponse {
        /// Target it came from
        endpoint: SocketAddr,
        /// Bytes
        pkt: Vec<u8>,
        /// Read time
        at: Instant,
    },
}
