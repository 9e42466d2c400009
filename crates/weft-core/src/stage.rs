//! Stage: the registry every actor hangs off.
//!
//! The Stage owns peer info, the per-peer OutConn/InConn pairs, our own
//! endpoint lists and the inboxes of every actor. It is what the control
//! plane drives (`add_peer`, `update_peer`, `remove_peer`, `update_relays`),
//! and it runs the watchdog that replaces connection pairs whose sockets
//! died.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use weft_core::config::EngineConfig;
//! use weft_core::stage::{Collaborators, Stage};
//! use weft_core::types::PeerInfo;
//! use weft_crypto::{NodePublic, SessionPrivate, SessionPublic};
//! use weft_transport::UdpSocketConn;
//!
//! # async fn example(collab: Collaborators) -> Result<(), Box<dyn std::error::Error>> {
//! let external = UdpSocketConn::bind("0.0.0.0:0".parse()?).await?;
//! let session = SessionPrivate::generate(&mut rand::rngs::OsRng);
//! let stage = Stage::new(
//!     EngineConfig::default(),
//!     NodePublic::from_bytes([1; 32]),
//!     session,
//!     Arc::new(external),
//!     collab,
//! )?;
//! stage.start()?;
//!
//! stage.add_peer(
//!     NodePublic::from_bytes([2; 32]),
//!     PeerInfo::new(1, vec!["192.0.2.7:41641".parse()?], SessionPublic::from_bytes([3; 32])),
//! )?;
//! # Ok(())
//! # }
//! ```

use crate::actor::message::{
    DirectRouterMsg, DirectWrite, DirectedPeerFrame, EndpointMsg, RelayManMsg, RelayWrite,
    RelayedPeerFrame, SessionMsg, StateSnapshot, TrafficMsg,
};
use crate::actor::{DropCounter, Mailbox, mailbox, spawn_supervised};
use crate::addr;
use crate::config::EngineConfig;
use crate::conn::{InConn, InConnHandle, OutConn, OutConnHandle};
use crate::direct::{DirectManager, DirectRouter};
use crate::endpoint::EndpointManager;
use crate::error::{EngineError, Result};
use crate::relay::{RelayDialer, RelayManager, RelayRouter};
use crate::session::{SessionCodec, SessionManager};
use crate::traffic::TrafficManager;
use crate::msgsess::SideBandKind;
use crate::types::{
    ControlCallbacks, PeerInfo, PeerUpdate, RelayInfo, SideBandSink, StunCodec, TunnelBackend,
};
use dashmap::DashMap;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use weft_crypto::{NodePublic, SessionPrivate, SessionPublic};
use weft_transport::UdpConn;

/// One pending poke is enough to get another tick pass.
const POKE_CAPACITY: usize = 1;

// ═══════════════════════════════════════════════════════════════════════════
// Actor inboxes
// ═══════════════════════════════════════════════════════════════════════════

/// Sending halves of every singleton actor's inbox.
#[derive(Debug, Clone)]
pub(crate) struct Handles {
    pub(crate) traffic: Mailbox<TrafficMsg>,
    poke: mpsc::Sender<()>,
    pub(crate) session: Mailbox<SessionMsg>,
    pub(crate) direct_writes: Mailbox<DirectWrite>,
    pub(crate) direct_router: Mailbox<DirectRouterMsg>,
    pub(crate) direct_frames: Mailbox<DirectedPeerFrame>,
    pub(crate) relay_man: Mailbox<RelayManMsg>,
    pub(crate) relay_writes: Mailbox<RelayWrite>,
    pub(crate) relay_frames: Mailbox<RelayedPeerFrame>,
    pub(crate) endpoint: Mailbox<EndpointMsg>,
}

/// Receiving halves, handed to the actors on start.
#[derive(Debug)]
pub(crate) struct Receivers {
    pub(crate) traffic: mpsc::Receiver<TrafficMsg>,
    pub(crate) poke: mpsc::Receiver<()>,
    pub(crate) session: mpsc::Receiver<SessionMsg>,
    pub(crate) direct_writes: mpsc::Receiver<DirectWrite>,
    pub(crate) direct_router: mpsc::Receiver<DirectRouterMsg>,
    pub(crate) direct_frames: mpsc::Receiver<DirectedPeerFrame>,
    pub(crate) relay_man: mpsc::Receiver<RelayManMsg>,
    pub(crate) relay_writes: mpsc::Receiver<RelayWrite>,
    pub(crate) relay_frames: mpsc::Receiver<RelayedPeerFrame>,
    pub(crate) endpoint: mpsc::Receiver<EndpointMsg>,
}

impl Handles {
    fn new(config: &EngineConfig, drops: &Arc<DropCounter>) -> (Self, Receivers) {
        let ch = &config.channels;
        let timeout = config.timing.send_timeout();

        let (traffic, traffic_rx) = mailbox("traffic", ch.traffic_inbox, timeout, Arc::clone(drops));
        let (poke, poke_rx) = mpsc::channel(POKE_CAPACITY);
        let (session, session_rx) = mailbox("session", ch.session_inbox, timeout, Arc::clone(drops));
        let (direct_writes, direct_writes_rx) =
            mailbox("direct_writes", ch.direct_man_writes, timeout, Arc::clone(drops));
        let (direct_router, direct_router_rx) =
            mailbox("direct_router", ch.direct_router_inbox, timeout, Arc::clone(drops));
        let (direct_frames, direct_frames_rx) =
            mailbox("direct_frames", ch.direct_router_frames, timeout, Arc::clone(drops));
        let (relay_man, relay_man_rx) =
            mailbox("relay_man", ch.relay_man_inbox, timeout, Arc::clone(drops));
        let (relay_writes, relay_writes_rx) =
            mailbox("relay_writes", ch.relay_man_writes, timeout, Arc::clone(drops));
        let (relay_frames, relay_frames_rx) =
            mailbox("relay_frames", ch.relay_router_frames, timeout, Arc::clone(drops));
        let (endpoint, endpoint_rx) =
            mailbox("endpoint", ch.endpoint_inbox, timeout, Arc::clone(drops));

        let handles = Self {
            traffic,
            poke,
            session,
            direct_writes,
            direct_router,
            direct_frames,
            relay_man,
            relay_writes,
            relay_frames,
            endpoint,
        };
        let receivers = Receivers {
            traffic: traffic_rx,
            poke: poke_rx,
            session: session_rx,
            direct_writes: direct_writes_rx,
            direct_router: direct_router_rx,
            direct_frames: direct_frames_rx,
            relay_man: relay_man_rx,
            relay_writes: relay_writes_rx,
            relay_frames: relay_frames_rx,
            endpoint: endpoint_rx,
        };
        (handles, receivers)
    }

    /// Ask the Traffic Manager for a tick pass; a no-op if one is pending.
    pub(crate) fn poke(&self) {
        let _ = self.poke.try_send(());
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Shared state
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Default)]
struct ConnMaps {
    outs: HashMap<NodePublic, OutConnHandle>,
    ins: HashMap<NodePublic, InConnHandle>,
}

impl ConnMaps {
    /// Remove and cancel whatever halves exist for `peer`.
    fn drop_pair(&mut self, peer: &NodePublic) {
        if let Some(out) = self.outs.remove(peer) {
            out.token().cancel();
        }
        if let Some(inc) = self.ins.remove(peer) {
            inc.token().cancel();
        }
    }
}

#[derive(Debug, Default)]
struct EndpointLists {
    local: Vec<SocketAddr>,
    stun: Vec<SocketAddr>,
}

/// Frames the routers could not deliver.
#[derive(Debug, Default)]
pub(crate) struct RouteCounters {
    pub(crate) direct: AtomicU64,
    pub(crate) relay: AtomicU64,
}

/// Counts of frames dropped by the routers for lack of a destination.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnroutableFrames {
    /// Dropped by the Direct Router
    pub direct: u64,
    /// Dropped by the Relay Router
    pub relay: u64,
}

/// Everything the singleton actors need until [`Stage::start`].
struct Pending {
    receivers: Receivers,
    codec: SessionCodec,
    external: Arc<dyn UdpConn>,
    dialer: Arc<dyn RelayDialer>,
    stun: Arc<dyn StunCodec>,
}

/// Stage state shared with every actor.
pub(crate) struct StageInner {
    /// Root of every actor's lifetime
    pub(crate) token: CancellationToken,
    pub(crate) config: EngineConfig,
    /// Our node key, as placed in pings
    pub(crate) node_key: NodePublic,
    /// Peer info, keyed by peer
    pub(crate) peers: DashMap<NodePublic, PeerInfo>,
    conns: RwLock<ConnMaps>,
    endpoints: RwLock<EndpointLists>,
    pub(crate) backend: Arc<dyn TunnelBackend>,
    pub(crate) control: Arc<dyn ControlCallbacks>,
    pub(crate) side_band: Arc<dyn SideBandSink>,
    pub(crate) handles: Handles,
    /// Total of every mailbox's drops
    pub(crate) drops: Arc<DropCounter>,
    pub(crate) unroutable: RouteCounters,
    started: AtomicBool,
    pending: Mutex<Option<Pending>>,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

impl StageInner {
    fn build(
        config: EngineConfig,
        node_key: NodePublic,
        backend: Arc<dyn TunnelBackend>,
        control: Arc<dyn ControlCallbacks>,
        side_band: Arc<dyn SideBandSink>,
        token: CancellationToken,
    ) -> (Self, Receivers) {
        let drops = Arc::new(DropCounter::default());
        let (handles, receivers) = Handles::new(&config, &drops);

        let inner = Self {
            token,
            config,
            node_key,
            peers: DashMap::new(),
            conns: RwLock::new(ConnMaps::default()),
            endpoints: RwLock::new(EndpointLists::default()),
            backend,
            control,
            side_band,
            handles,
            drops,
            unroutable: RouteCounters::default(),
            started: AtomicBool::new(false),
            pending: Mutex::new(None),
        };
        (inner, receivers)
    }

    /// Copy of the peer's info.
    pub(crate) fn peer_info(&self, peer: &NodePublic) -> Option<PeerInfo> {
        self.peers.get(peer).map(|pi| pi.clone())
    }

    pub(crate) fn out_conn_for(&self, peer: &NodePublic) -> Option<OutConnHandle> {
        read(&self.conns).outs.get(peer).cloned()
    }

    pub(crate) fn in_conn_for(&self, peer: &NodePublic) -> Option<InConnHandle> {
        read(&self.conns).ins.get(peer).cloned()
    }

    /// Local endpoints followed by STUN endpoints.
    pub(crate) fn get_endpoints(&self) -> Vec<SocketAddr> {
        let lists = read(&self.endpoints);
        lists.local.iter().chain(&lists.stun).copied().collect()
    }

    pub(crate) fn set_local_endpoints(&self, endpoints: Vec<SocketAddr>) {
        self.replace_endpoints(endpoints, |lists| &mut lists.local);
    }

    pub(crate) fn set_stun_endpoints(&self, endpoints: Vec<SocketAddr>) {
        self.replace_endpoints(endpoints, |lists| &mut lists.stun);
    }

    fn replace_endpoints(
        &self,
        endpoints: Vec<SocketAddr>,
        pick: impl FnOnce(&mut EndpointLists) -> &mut Vec<SocketAddr>,
    ) {
        let endpoints = addr::sorted(endpoints);

        let announce: Vec<SocketAddr> = {
            let mut lists = write(&self.endpoints);
            let slot = pick(&mut lists);
            if *slot == endpoints {
                return;
            }
            *slot = endpoints;
            lists.stun.iter().chain(&lists.local).copied().collect()
        };

        tracing::debug!(endpoints = %addr::pretty(&announce), "our endpoints changed");
        if let Err(e) = self.control.update_endpoints(announce) {
            tracing::warn!(error = %e, "could not update endpoints");
        }
    }

    #[cfg(test)]
    pub(crate) fn attach(&self, peer: NodePublic, out: OutConnHandle, inc: InConnHandle) {
        let mut maps = write(&self.conns);
        maps.outs.insert(peer, out);
        maps.ins.insert(peer, inc);
    }

    /// Tell the Traffic Manager that `peer`'s info changed.
    pub(crate) fn inform_peer_info(&self, peer: NodePublic) {
        self.handles.traffic.post(TrafficMsg::SyncPeerInfo { peer });
    }

    /// Create and spawn a pair for `peer`, replacing any existing one.
    fn add_conn_locked(self: &Arc<Self>, maps: &mut ConnMaps, peer: NodePublic) -> Result<()> {
        let conn = self.backend.conn_for(peer)?;
        maps.drop_pair(&peer);

        let (out, out_handle) = OutConn::new(peer, Arc::clone(&conn), Arc::clone(self));
        let (inc, in_handle) = InConn::new(peer, conn, Arc::clone(self));
        maps.outs.insert(peer, out_handle);
        maps.ins.insert(peer, in_handle);

        out.spawn();
        inc.spawn();
        Ok(())
    }

    /// Register `peer`'s session and (re)create its connection pair.
    pub(crate) fn add_conn(
        self: &Arc<Self>,
        peer: NodePublic,
        session: SessionPublic,
        endpoints: Vec<SocketAddr>,
        home_relay: crate::types::RelayId,
    ) -> Result<()> {
        let endpoints = addr::canonical(endpoints);
        self.peers
            .entry(peer)
            .and_modify(|pi| {
                pi.session = session;
                pi.endpoints.clone_from(&endpoints);
                pi.home_relay = home_relay;
            })
            .or_insert_with(|| PeerInfo::new(home_relay, endpoints.clone(), session));

        self.add_conn_locked(&mut write(&self.conns), peer)?;

        self.inform_peer_info(peer);
        self.handles.poke();
        Ok(())
    }

    /// Remove both halves of `peer`'s pair.
    ///
    /// # Panics
    ///
    /// Panics if only one half is registered; the maps must always agree.
    pub(crate) fn remove_conn(&self, peer: &NodePublic) {
        let (has_in, has_out) = {
            let mut maps = write(&self.conns);
            let has_in = maps.ins.contains_key(peer);
            let has_out = maps.outs.contains_key(peer);
            if has_in == has_out {
                maps.drop_pair(peer);
            }
            (has_in, has_out)
        };

        assert!(
            has_in == has_out,
            "InConn or OutConn presence on stage was unbalanced: in={has_in}, out={has_out}"
        );
    }

    /// Cancel and remove every pair with a dead half.
    pub(crate) fn reap_conns(&self) -> Vec<NodePublic> {
        let mut maps = write(&self.conns);

        let dead: HashSet<NodePublic> = maps
            .outs
            .iter()
            .filter(|(_, c)| c.is_dead())
            .map(|(p, _)| *p)
            .chain(maps.ins.iter().filter(|(_, c)| c.is_dead()).map(|(p, _)| *p))
            .collect();

        for peer in &dead {
            maps.drop_pair(peer);
            tracing::debug!(peer = %peer, "reaped dead conns");
        }

        dead.into_iter().collect()
    }

    /// Start pairs for known peers that lack one and prune pairs of unknown
    /// peers. New sockets come from [`TunnelBackend::conn_for`].
    pub(crate) fn sync_conns(self: &Arc<Self>) {
        let changed = {
            let mut maps = write(&self.conns);

            let known: HashSet<NodePublic> = self.peers.iter().map(|e| *e.key()).collect();
            let connected: HashSet<NodePublic> =
                maps.outs.keys().chain(maps.ins.keys()).copied().collect();

            let mut changed = false;

            for peer in connected.difference(&known) {
                maps.drop_pair(peer);
                tracing::debug!(peer = %peer, "pruned conns");
                changed = true;
            }

            for peer in known.difference(&connected) {
                match self.add_conn_locked(&mut maps, *peer) {
                    Ok(()) => {
                        tracing::debug!(peer = %peer, "started conns");
                        changed = true;
                    }
                    Err(e) => {
                        tracing::warn!(peer = %peer, error = %e, "could not create conns for peer");
                    }
                }
            }

            changed
        };

        if changed {
            self.handles.poke();
        }
    }
}

async fn watchdog(inner: Arc<StageInner>, token: CancellationToken) {
    let mut ticker = tokio::time::interval(inner.config.timing.watchdog());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            () = token.cancelled() => break,
            _ = ticker.tick() => {
                tracing::trace!("watchdog tick");
                let reaped = inner.reap_conns();
                if !reaped.is_empty() {
                    tracing::info!(count = reaped.len(), "reaped dead peer connections");
                }
                inner.sync_conns();
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Stage
// ═══════════════════════════════════════════════════════════════════════════

/// The engine's outside collaborators.
#[derive(Clone)]
pub struct Collaborators {
    /// Per-peer sockets into the tunnel interface
    pub backend: Arc<dyn TunnelBackend>,
    /// Notifications towards the control plane
    pub control: Arc<dyn ControlCallbacks>,
    /// Relay connections
    pub dialer: Arc<dyn RelayDialer>,
    /// STUN binding requests and responses
    pub stun: Arc<dyn StunCodec>,
    /// Side-band payloads from peers
    pub side_band: Arc<dyn SideBandSink>,
}

/// The connectivity engine.
///
/// Cheap to clone; every clone drives the same engine.
#[derive(Clone)]
pub struct Stage {
    inner: Arc<StageInner>,
}

impl Stage {
    /// Build a stage around the external socket `external`.
    ///
    /// Nothing runs until [`Stage::start`].
    ///
    /// # Errors
    ///
    /// Returns `EngineError::InvalidConfig` if `config` does not validate.
    pub fn new(
        config: EngineConfig,
        node_key: NodePublic,
        session: SessionPrivate,
        external: Arc<dyn UdpConn>,
        collab: Collaborators,
    ) -> Result<Self> {
        Self::with_token(config, node_key, session, external, collab, &CancellationToken::new())
    }

    /// Like [`Stage::new`], with the engine's lifetime tied to `parent`.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::InvalidConfig` if `config` does not validate.
    pub fn with_token(
        config: EngineConfig,
        node_key: NodePublic,
        session: SessionPrivate,
        external: Arc<dyn UdpConn>,
        collab: Collaborators,
        parent: &CancellationToken,
    ) -> Result<Self> {
        config.validate()?;

        let codec = SessionCodec::new(session);
        let node_key = if config.session_is_node_key {
            let key = NodePublic::from_bytes(*codec.public().as_bytes());
            tracing::warn!(node = %key, "using session key as node key");
            key
        } else {
            node_key
        };

        let (inner, receivers) = StageInner::build(
            config,
            node_key,
            collab.backend,
            collab.control,
            collab.side_band,
            parent.child_token(),
        );
        *inner.pending.lock().unwrap_or_else(PoisonError::into_inner) = Some(Pending {
            receivers,
            codec,
            external,
            dialer: collab.dialer,
            stun: collab.stun,
        });

        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Spawn every actor and the watchdog. Starting twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Shutdown` if the stage was already shut down.
    pub fn start(&self) -> Result<()> {
        let inner = &self.inner;

        if inner.token.is_cancelled() {
            return Err(EngineError::Shutdown);
        }

        if inner.started.swap(true, Ordering::SeqCst) {
            tracing::warn!("tried to start stage while already running");
            return Ok(());
        }

        let Some(p) = inner.pending.lock().unwrap_or_else(PoisonError::into_inner).take() else {
            return Err(EngineError::Shutdown);
        };
        let rx = p.receivers;

        TrafficManager::new(Arc::clone(inner), rx.traffic, rx.poke).spawn();
        SessionManager::new(p.codec, Arc::clone(inner), rx.session).spawn();
        EndpointManager::new(Arc::clone(inner), p.stun, rx.endpoint).spawn();
        DirectManager::new(Arc::clone(inner), p.external, rx.direct_writes).spawn();
        DirectRouter::new(Arc::clone(inner), rx.direct_router, rx.direct_frames).spawn();
        RelayManager::new(Arc::clone(inner), p.dialer, rx.relay_man, rx.relay_writes).spawn();
        RelayRouter::new(Arc::clone(inner), rx.relay_frames).spawn();

        let token = inner.token.child_token();
        spawn_supervised("watchdog", token.clone(), watchdog(Arc::clone(inner), token));

        tracing::info!(node = %inner.node_key, "stage started");
        Ok(())
    }

    /// Our node key.
    #[must_use]
    pub fn node_key(&self) -> NodePublic {
        self.inner.node_key
    }

    /// Root lifetime token; cancelled by [`Stage::shutdown`].
    #[must_use]
    pub fn token(&self) -> &CancellationToken {
        &self.inner.token
    }

    /// Cancel every actor.
    pub fn shutdown(&self) {
        tracing::info!("stage shutting down");
        self.inner.token.cancel();
    }

    // ───────────────────────────── peers ─────────────────────────────

    /// Register a peer announced by the control plane and start its
    /// connection pair.
    ///
    /// # Errors
    ///
    /// - `EngineError::PeerExists` if the peer is already known
    /// - the backend's error if it rejects the peer's addresses
    pub fn add_peer(&self, peer: NodePublic, mut info: PeerInfo) -> Result<()> {
        if self.inner.peers.contains_key(&peer) {
            return Err(EngineError::PeerExists(peer.to_string().into()));
        }

        if self.inner.config.session_is_node_key && info.session.is_zero() {
            info.session = SessionPublic::from_bytes(*peer.as_bytes());
        }

        self.inner.backend.update_peer(peer, info.ipv4, info.ipv6)?;
        info.endpoints = addr::canonical(info.endpoints);
        info.rendezvous_endpoints.clear();
        self.inner.peers.insert(peer, info);
        tracing::debug!(peer = %peer, "added peer");

        self.inner.sync_conns();
        self.inner.inform_peer_info(peer);
        Ok(())
    }

    /// Apply a partial update to a known peer.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::PeerUnknown` if the peer is not known.
    pub fn update_peer(&self, peer: NodePublic, update: PeerUpdate) -> Result<()> {
        {
            let Some(mut pi) = self.inner.peers.get_mut(&peer) else {
                return Err(EngineError::peer_unknown("update_peer"));
            };

            if let Some(relay) = update.home_relay {
                pi.home_relay = relay;
            }
            if let Some(endpoints) = update.endpoints {
                pi.endpoints = addr::canonical(endpoints);
            }
            if let Some(session) = update.session {
                pi.session = session;
            }
            if let Some(mdns) = update.mdns {
                pi.mdns = mdns;
            }
        }

        self.inner.inform_peer_info(peer);
        self.inner.handles.poke();
        Ok(())
    }

    /// Forget a peer and tear down its connection pair.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::PeerUnknown` if the peer was not known.
    pub fn remove_peer(&self, peer: NodePublic) -> Result<()> {
        if self.inner.peers.remove(&peer).is_none() {
            return Err(EngineError::peer_unknown("remove_peer"));
        }

        if let Err(e) = self.inner.backend.remove_peer(peer) {
            tracing::warn!(peer = %peer, error = %e, "backend failed to remove peer");
        }

        self.inner.sync_conns();
        self.inner.inform_peer_info(peer);
        tracing::debug!(peer = %peer, "removed peer");
        Ok(())
    }

    /// Send a side-band payload from our local network to every peer that
    /// allows it: directly when a direct path is up, else over its home relay.
    pub fn spread_side_band(&self, kind: SideBandKind, data: Vec<u8>) {
        self.inner
            .handles
            .traffic
            .post(TrafficMsg::SpreadSideBand { kind, data });
    }

    /// Add or update relay definitions.
    pub fn update_relays(&self, relays: Vec<RelayInfo>) {
        let handles = &self.inner.handles;
        handles.relay_man.post(RelayManMsg::UpdateRelays(relays.clone()));
        handles.endpoint.post(EndpointMsg::UpdateRelays(relays));
    }

    /// Copy of a peer's info.
    #[must_use]
    pub fn get_peer_info(&self, peer: &NodePublic) -> Option<PeerInfo> {
        self.inner.peer_info(peer)
    }

    // ───────────────────────────── conns ─────────────────────────────

    /// Register `peer`'s session and (re)create its connection pair.
    ///
    /// # Errors
    ///
    /// Returns the backend's error if it cannot provide a socket.
    pub fn add_conn(
        &self,
        peer: NodePublic,
        session: SessionPublic,
        endpoints: Vec<SocketAddr>,
        home_relay: crate::types::RelayId,
    ) -> Result<()> {
        self.inner.add_conn(peer, session, endpoints, home_relay)
    }

    /// Remove both halves of `peer`'s connection pair.
    ///
    /// # Panics
    ///
    /// Panics if only one of the halves exists.
    pub fn remove_conn(&self, peer: &NodePublic) {
        self.inner.remove_conn(peer);
    }

    /// The peer's OutConn, if any.
    #[must_use]
    pub fn out_conn_for(&self, peer: &NodePublic) -> Option<OutConnHandle> {
        self.inner.out_conn_for(peer)
    }

    /// The peer's InConn, if any.
    #[must_use]
    pub fn in_conn_for(&self, peer: &NodePublic) -> Option<InConnHandle> {
        self.inner.in_conn_for(peer)
    }

    /// Reconcile connection pairs with the known peers.
    pub fn sync_conns(&self) {
        self.inner.sync_conns();
    }

    /// Remove pairs with a dead half, returning their peers.
    pub fn reap_conns(&self) -> Vec<NodePublic> {
        self.inner.reap_conns()
    }

    // ─────────────────────────── endpoints ───────────────────────────

    /// Our endpoints: local ones first, then STUN-discovered ones.
    #[must_use]
    pub fn get_endpoints(&self) -> Vec<SocketAddr> {
        self.inner.get_endpoints()
    }

    /// Replace the local (interface) endpoints.
    pub fn set_local_endpoints(&self, endpoints: Vec<SocketAddr>) {
        self.inner.set_local_endpoints(endpoints);
    }

    // ────────────────────────── diagnostics ──────────────────────────

    /// Each peer's current state name, sorted by peer.
    ///
    /// # Errors
    ///
    /// - `EngineError::Channel` if the Traffic Manager is gone
    /// - `EngineError::Timeout` if it does not answer in time
    pub async fn peer_states(&self) -> Result<StateSnapshot> {
        let (tx, rx) = oneshot::channel();
        if !self.inner.handles.traffic.send(TrafficMsg::Snapshot(tx)).await {
            return Err(EngineError::channel("traffic manager inbox"));
        }

        match tokio::time::timeout(self.inner.config.timing.send_timeout(), rx).await {
            Ok(Ok(states)) => Ok(states),
            Ok(Err(_)) => Err(EngineError::channel("traffic manager stopped")),
            Err(_) => Err(EngineError::Timeout("peer state snapshot".into())),
        }
    }

    /// Messages dropped across every actor mailbox.
    #[must_use]
    pub fn dropped_sends(&self) -> u64 {
        self.inner.drops.get()
    }

    /// Frames the routers dropped for lack of a destination.
    #[must_use]
    pub fn unroutable_frames(&self) -> UnroutableFrames {
        UnroutableFrames {
            direct: self.inner.unroutable.direct.load(Ordering::Relaxed),
            relay: self.inner.unroutable.relay.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stage")
            .field("node_key", &self.inner.node_key)
            .field("peers", &self.inner.peers.len())
            .field("started", &self.inner.started.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
