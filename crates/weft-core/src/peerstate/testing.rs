//! Deterministic [`TrafficContext`] with a hand-driven clock.

use super::TrafficContext;
use crate::actor::message::OutConnUse;
use crate::msgsess::{SessionMessage, TxId};
use crate::types::{PeerInfo, PingDest, RelayId, SentPing};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::time::Instant;
use weft_crypto::{NodePublic, SessionPublic};

pub(crate) const PEER: NodePublic = NodePublic::from_bytes([1; 32]);
pub(crate) const PEER_SESSION: SessionPublic = SessionPublic::from_bytes([2; 32]);
pub(crate) const LOCAL: NodePublic = NodePublic::from_bytes([9; 32]);
pub(crate) const HOME_RELAY: RelayId = 7;

pub(crate) fn sa(s: &str) -> SocketAddr {
    s.parse().unwrap()
}

#[derive(Debug)]
pub(crate) struct MockContext {
    pub now: Instant,
    pub peers: HashMap<NodePublic, PeerInfo>,
    pub local: Vec<SocketAddr>,
    pub active: HashSet<NodePublic>,
    pub pings: HashMap<TxId, SentPing>,
    pub direct_sent: Vec<(SocketAddr, SessionPublic, SessionMessage)>,
    pub relay_sent: Vec<(RelayId, NodePublic, SessionPublic, SessionMessage)>,
    pub out_conn: Vec<(NodePublic, OutConnUse)>,
    pub akas: HashMap<NodePublic, HashSet<SocketAddr>>,
    pub pokes: u32,
}

impl MockContext {
    /// Context knowing `PEER` with the given endpoints, active, with one
    /// local endpoint of our own.
    pub fn with_peer(endpoints: &[&str]) -> Self {
        let mut peers = HashMap::new();
        peers.insert(
            PEER,
            PeerInfo::new(HOME_RELAY, endpoints.iter().map(|s| sa(s)).collect(), PEER_SESSION),
        );
        Self {
            now: Instant::now(),
            peers,
            local: vec![sa("192.168.1.10:5000")],
            active: HashSet::from([PEER]),
            pings: HashMap::new(),
            direct_sent: Vec::new(),
            relay_sent: Vec::new(),
            out_conn: Vec::new(),
            akas: HashMap::new(),
            pokes: 0,
        }
    }

    pub fn advance(&mut self, d: Duration) {
        self.now += d;
    }

    /// Outstanding direct pings sent to `addr`, newest last.
    pub fn pings_to(&self, addr: SocketAddr) -> Vec<TxId> {
        let mut out: Vec<_> = self
            .pings
            .iter()
            .filter(|(_, p)| p.dest == PingDest::Direct(addr))
            .map(|(tx, p)| (p.at, *tx))
            .collect();
        out.sort_by_key(|(at, _)| *at);
        out.into_iter().map(|(_, tx)| tx).collect()
    }

    /// Kind and destination of every direct message, in send order.
    pub fn direct_log(&self) -> Vec<(&'static str, SocketAddr)> {
        self.direct_sent.iter().map(|(a, _, m)| (m.kind(), *a)).collect()
    }

    pub fn relay_log(&self) -> Vec<(&'static str, RelayId)> {
        self.relay_sent.iter().map(|(r, _, _, m)| (m.kind(), *r)).collect()
    }
}

impl TrafficContext for MockContext {
    fn now(&self) -> Instant {
        self.now
    }

    fn poke(&mut self) {
        self.pokes += 1;
    }

    fn peer_info(&self, peer: &NodePublic) -> Option<PeerInfo> {
        self.peers.get(peer).cloned()
    }

    fn set_rendezvous_endpoints(&mut self, peer: &NodePublic, endpoints: Vec<SocketAddr>) {
        if let Some(pi) = self.peers.get_mut(peer) {
            pi.rendezvous_endpoints = endpoints;
        }
    }

    fn local_endpoints(&self) -> Vec<SocketAddr> {
        self.local.clone()
    }

    fn is_active(&self, peer: &NodePublic) -> bool {
        self.active.contains(peer)
    }

    fn node_key(&self) -> NodePublic {
        LOCAL
    }

    fn pings(&mut self) -> &mut HashMap<TxId, SentPing> {
        &mut self.pings
    }

    fn send_msg_to_direct(&mut self, addr: SocketAddr, session: SessionPublic, msg: SessionMessage) {
        self.direct_sent.push((addr, session, msg));
    }

    fn send_msg_to_relay(
        &mut self,
        relay: RelayId,
        peer: NodePublic,
        session: SessionPublic,
        msg: SessionMessage,
    ) {
        self.relay_sent.push((relay, peer, session, msg));
    }

    fn out_conn_use_addr(&mut self, peer: NodePublic, addr: SocketAddr) {
        self.out_conn.push((peer, OutConnUse::Direct(addr)));
    }

    fn out_conn_use_relay(&mut self, peer: NodePublic, relay: RelayId) {
        self.out_conn.push((peer, OutConnUse::Relay(relay)));
    }

    fn out_conn_track_home(&mut self, peer: NodePublic) {
        self.out_conn.push((peer, OutConnUse::TrackHome));
    }

    fn set_aka(&mut self, peer: NodePublic, addr: SocketAddr) {
        self.akas.entry(peer).or_default().insert(addr);
    }

    fn clear_aka(&mut self, peer: NodePublic) {
        self.akas.remove(&peer);
    }
}
