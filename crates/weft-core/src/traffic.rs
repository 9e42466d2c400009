//! Traffic Manager: hosts one [`PeerState`] per active peer.
//!
//! Peer states only exist while at least one half of the peer's connection
//! pair has reported in. The manager ticks every state on a fixed cadence
//! and whenever poked, and routes decrypted session messages to the state
//! of the peer that sent them. Side-band payloads bypass the states and go
//! to the side-band sink, for peers whose info allows it.

use crate::actor::message::{DirectRouterMsg, OutConnUse, SessionMsg, StateSnapshot, TrafficMsg};
use crate::actor::spawn_supervised;
use crate::addr;
use crate::msgsess::{ClearMessage, SessionMessage, SideBandKind, TxId};
use crate::peerstate::{PeerState, TrafficContext};
use crate::stage::StageInner;
use crate::types::{PeerInfo, RelayId, SentPing};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use weft_crypto::{NodePublic, SessionPublic};

/// The [`TrafficContext`] the manager hands its peer states.
struct TrafficCx {
    stage: Arc<StageInner>,
    now: Instant,
    pings: HashMap<TxId, SentPing>,
    active_out: HashMap<NodePublic, bool>,
    active_in: HashMap<NodePublic, bool>,
    /// Session to peer cache, checked against the Stage on every hit
    sessions: HashMap<SessionPublic, NodePublic>,
}

impl TrafficCx {
    fn is_known(&self, peer: &NodePublic) -> bool {
        self.active_out.contains_key(peer) || self.active_in.contains_key(peer)
    }

    fn node_for_session(&mut self, session: &SessionPublic) -> Option<NodePublic> {
        if let Some(peer) = self.sessions.get(session) {
            let current = self
                .stage
                .peers
                .get(peer)
                .is_some_and(|pi| pi.session == *session);
            if current {
                return Some(*peer);
            }
        }

        let peer = self
            .stage
            .peers
            .iter()
            .find(|e| e.session == *session)
            .map(|e| *e.key())?;
        self.sessions.insert(*session, peer);
        Some(peer)
    }

    fn use_path(&self, peer: NodePublic, path: OutConnUse) {
        match self.stage.out_conn_for(&peer) {
            Some(out) => out.use_path(path),
            None => tracing::warn!(peer = %peer, ?path, "no outconn to switch path on"),
        }
    }
}

impl TrafficContext for TrafficCx {
    fn now(&self) -> Instant {
        self.now
    }

    fn poke(&mut self) {
        self.stage.handles.poke();
    }

    fn peer_info(&self, peer: &NodePublic) -> Option<PeerInfo> {
        self.stage.peer_info(peer)
    }

    fn set_rendezvous_endpoints(&mut self, peer: &NodePublic, endpoints: Vec<SocketAddr>) {
        if let Some(mut pi) = self.stage.peers.get_mut(peer) {
            pi.rendezvous_endpoints = endpoints;
        }
    }

    fn local_endpoints(&self) -> Vec<SocketAddr> {
        self.stage.get_endpoints()
    }

    fn is_active(&self, peer: &NodePublic) -> bool {
        self.active_out.get(peer).copied().unwrap_or(false)
            || self.active_in.get(peer).copied().unwrap_or(false)
    }

    fn node_key(&self) -> NodePublic {
        self.stage.node_key
    }

    fn pings(&mut self) -> &mut HashMap<TxId, SentPing> {
        &mut self.pings
    }

    fn send_msg_to_direct(&mut self, addr: SocketAddr, session: SessionPublic, msg: SessionMessage) {
        self.stage.handles.session.post(SessionMsg::SendToDirect {
            addr,
            to_session: session,
            msg,
        });
    }

    fn send_msg_to_relay(
        &mut self,
        relay: RelayId,
        peer: NodePublic,
        session: SessionPublic,
        msg: SessionMessage,
    ) {
        self.stage.handles.session.post(SessionMsg::SendToRelay {
            relay,
            peer,
            to_session: session,
            msg,
        });
    }

    fn out_conn_use_addr(&mut self, peer: NodePublic, addr: SocketAddr) {
        self.use_path(peer, OutConnUse::Direct(addr));
    }

    fn out_conn_use_relay(&mut self, peer: NodePublic, relay: RelayId) {
        self.use_path(peer, OutConnUse::Relay(relay));
    }

    fn out_conn_track_home(&mut self, peer: NodePublic) {
        self.use_path(peer, OutConnUse::TrackHome);
    }

    fn set_aka(&mut self, peer: NodePublic, addr: SocketAddr) {
        self.stage
            .handles
            .direct_router
            .post(DirectRouterMsg::AddKnownAs { peer, addr });
    }

    fn clear_aka(&mut self, peer: NodePublic) {
        self.stage
            .handles
            .direct_router
            .post(DirectRouterMsg::ClearKnownAs { peer });
    }
}

/// Owner of every peer state.
pub struct TrafficManager {
    token: CancellationToken,
    inbox: mpsc::Receiver<TrafficMsg>,
    poke: mpsc::Receiver<()>,
    states: HashMap<NodePublic, PeerState>,
    cx: TrafficCx,
}

impl TrafficManager {
    pub(crate) fn new(
        stage: Arc<StageInner>,
        inbox: mpsc::Receiver<TrafficMsg>,
        poke: mpsc::Receiver<()>,
    ) -> Self {
        let token = stage.token.child_token();
        Self {
            token,
            inbox,
            poke,
            states: HashMap::new(),
            cx: TrafficCx {
                stage,
                now: Instant::now(),
                pings: HashMap::new(),
                active_out: HashMap::new(),
                active_in: HashMap::new(),
                sessions: HashMap::new(),
            },
        }
    }

    /// Run under supervision.
    pub fn spawn(self) -> JoinHandle<()> {
        spawn_supervised("traffic_manager", self.token.clone(), self.run())
    }

    async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.cx.stage.config.timing.tick());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                () = self.token.cancelled() => break,
                // Ticks take priority over the inbox.
                _ = ticker.tick() => {
                    self.cx.now = Instant::now();
                    self.reap_pings();
                    self.tick_all();
                }
                msg = self.inbox.recv() => match msg {
                    Some(msg) => {
                        self.cx.now = Instant::now();
                        self.handle(msg);
                    }
                    None => break,
                },
                Some(()) = self.poke.recv() => {
                    self.cx.now = Instant::now();
                    self.tick_all();
                }
            }
        }
    }

    fn handle(&mut self, msg: TrafficMsg) {
        match msg {
            TrafficMsg::ConnActivity { peer, is_in, active } => {
                let map = if is_in {
                    &mut self.cx.active_in
                } else {
                    &mut self.cx.active_out
                };
                map.insert(peer, active);
                self.ensure_state(peer);
            }
            TrafficMsg::ConnGoodBye { peer, is_in } => {
                let map = if is_in {
                    &mut self.cx.active_in
                } else {
                    &mut self.cx.active_out
                };
                map.remove(&peer);

                if !self.cx.is_known(&peer) && self.states.remove(&peer).is_some() {
                    tracing::debug!(peer = %peer, "dropped peer state");
                }
            }
            TrafficMsg::FromDirect { addr, msg } => self.from_direct(addr, &msg),
            TrafficMsg::FromRelay { relay, peer, msg } => self.from_relay(relay, peer, &msg),
            TrafficMsg::SyncPeerInfo { peer } => self.sync_peer_info(peer),
            TrafficMsg::SpreadSideBand { kind, data } => self.spread_side_band(kind, &data),
            TrafficMsg::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
        }
    }

    fn from_direct(&mut self, addr: SocketAddr, msg: &ClearMessage) {
        let Some(peer) = self.cx.node_for_session(&msg.session) else {
            tracing::warn!(session = %msg.session, addr = %addr, "got message from direct for unknown session");
            return;
        };

        if let SessionMessage::SideBand { kind, data } = &msg.message {
            self.side_band_from(peer, *kind, data, "direct");
            return;
        }

        let addr = addr::normalise(addr);
        self.for_state(peer, |state, cx| state.on_direct(peer, cx, addr, msg));
    }

    fn from_relay(&mut self, relay: RelayId, peer: NodePublic, msg: &ClearMessage) {
        if !self.cx.valid_keys(&peer, &msg.session) {
            tracing::warn!(
                session = %msg.session,
                peer = %peer,
                relay,
                "got message from relay for peer with incorrect session"
            );
            return;
        }

        if let SessionMessage::SideBand { kind, data } = &msg.message {
            self.side_band_from(peer, *kind, data, "relay");
            return;
        }

        self.for_state(peer, |state, cx| state.on_relay(peer, cx, relay, peer, msg));
    }

    fn side_band_from(&self, peer: NodePublic, kind: SideBandKind, data: &[u8], via: &'static str) {
        if kind != SideBandKind::Mdns {
            tracing::debug!(peer = %peer, ?kind, via, "ignoring side-band data of unknown kind");
            return;
        }

        let allowed = self.cx.stage.peer_info(&peer).is_some_and(|pi| pi.mdns);
        if !allowed {
            tracing::warn!(peer = %peer, via, "got MDNS packet from peer where it is not allowed");
            return;
        }

        if let Err(e) = self.cx.stage.side_band.deliver(peer, kind, data.to_vec()) {
            tracing::warn!(peer = %peer, error = %e, "failed to deliver side-band data");
        }
    }

    /// Send `data` to every peer allowing it: straight to the endpoint of an
    /// established direct path, else over the peer's home relay.
    fn spread_side_band(&mut self, kind: SideBandKind, data: &[u8]) {
        let targets: Vec<(NodePublic, PeerInfo)> = self
            .cx
            .stage
            .peers
            .iter()
            .filter(|e| e.mdns && !e.session.is_zero())
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        tracing::trace!(peers = targets.len(), ?kind, "sending side-band packet to peers");

        for (peer, pi) in targets {
            let msg = SessionMessage::SideBand {
                kind,
                data: data.to_vec(),
            };
            match self.states.get(&peer) {
                Some(PeerState::Established(e)) => {
                    self.cx.send_msg_to_direct(e.endpoint(), pi.session, msg);
                }
                _ => self.cx.send_msg_to_relay(pi.home_relay, peer, pi.session, msg),
            }
        }
    }

    fn sync_peer_info(&mut self, peer: NodePublic) {
        if let Some(out) = self.cx.stage.out_conn_for(&peer) {
            out.sync_peer_info();
        }

        match self.cx.stage.peer_info(&peer) {
            Some(pi) => {
                self.cx.sessions.insert(pi.session, peer);
            }
            None => self.cx.sessions.retain(|_, p| *p != peer),
        }
    }

    /// Run `f` on the peer's state (starting it in Waiting if absent) and
    /// store whatever state it returns.
    fn for_state<F>(&mut self, peer: NodePublic, f: F)
    where
        F: FnOnce(&mut PeerState, &mut TrafficCx) -> Option<PeerState>,
    {
        self.ensure_state(peer);
        if let Some(state) = self.states.get_mut(&peer) {
            if let Some(next) = f(state, &mut self.cx) {
                *state = next;
            }
        }
    }

    fn ensure_state(&mut self, peer: NodePublic) {
        if !self.states.contains_key(&peer) {
            self.states.insert(peer, PeerState::waiting(peer));
            self.cx.poke();
        }
    }

    fn tick_all(&mut self) {
        for (peer, state) in &mut self.states {
            if let Some(next) = state.on_tick(*peer, &mut self.cx) {
                *state = next;
            }
        }
    }

    fn reap_pings(&mut self) {
        let reap_after = self.cx.stage.config.timing.ping_reap();
        let now = self.cx.now;
        let before = self.cx.pings.len();
        self.cx.pings.retain(|_, p| p.at + reap_after >= now);

        let reaped = before - self.cx.pings.len();
        if reaped > 0 {
            tracing::trace!(reaped, "reaped stale pings");
        }
    }

    fn snapshot(&self) -> StateSnapshot {
        let mut states: StateSnapshot = self
            .states
            .iter()
            .map(|(peer, state)| (*peer, state.name()))
            .collect();
        states.sort_unstable_by_key(|(peer, _)| *peer);
        states
    }
}
