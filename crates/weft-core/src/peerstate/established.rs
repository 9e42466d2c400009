use super::common::{
    CONNECTION_INACTIVITY_TIMEOUT, ESTABLISHED_PING_INTERVAL, ESTABLISHED_PING_TIMEOUT,
    ping_direct_valid, pong_direct_valid, reply_with_pong_direct,
};
use super::establishing::handle_relay_ping_pong;
use super::pingtracker::PingTracker;
use super::steady::{Inactive, Trying};
use super::{Handler, PeerState, TrafficContext, log_direct, log_relay};
use crate::addr;
use crate::msgsess::{ClearMessage, SessionMessage};
use crate::types::RelayId;
use std::collections::HashSet;
use std::net::SocketAddr;
use tokio::time::Instant;
use weft_crypto::NodePublic;

/// A direct path is up and carrying the peer's traffic.
#[derive(Debug, Clone)]
pub struct Established {
    tracker: PingTracker,
    last_ping_recv: Instant,
    last_pong_recv: Instant,
    next_ping: Instant,
    inactive_since: Option<Instant>,
    current: SocketAddr,
    known_in: HashSet<SocketAddr>,
}

impl Established {
    pub(crate) fn new(now: Instant, current: SocketAddr, tracker: PingTracker) -> Self {
        let current = addr::normalise(current);
        Self {
            tracker,
            last_ping_recv: now,
            last_pong_recv: now,
            next_ping: now,
            inactive_since: None,
            current,
            known_in: HashSet::from([current]),
        }
    }

    /// Address outgoing traffic currently goes to.
    #[must_use]
    pub fn endpoint(&self) -> SocketAddr {
        self.current
    }

    /// Whether `addr` has been accepted as one of the peer's source addresses.
    #[must_use]
    pub fn knows(&self, addr: SocketAddr) -> bool {
        self.known_in.contains(&addr::normalise(addr))
    }

    fn can_trust<C: TrafficContext>(&mut self, peer: NodePublic, cx: &mut C, addr: SocketAddr) -> bool {
        if self.known_in.contains(&addr) {
            return true;
        }

        let Some(pi) = cx.peer_info(&peer) else {
            return false;
        };

        let announced = pi
            .endpoints
            .iter()
            .chain(&pi.rendezvous_endpoints)
            .any(|e| addr::normalise(*e) == addr);
        if announced {
            self.known_in.insert(addr);
            cx.set_aka(peer, addr);
            tracing::info!(peer = %peer, addr = %addr, "adding new aka address to peer, as it is trusted");
            return true;
        }
        false
    }

    fn check_preferred<C: TrafficContext>(&mut self, peer: NodePublic, cx: &mut C) {
        let Ok(best) = self.tracker.best_addr() else {
            return;
        };
        if best == self.current {
            return;
        }

        let previous = self.current;
        self.current = best;
        cx.out_conn_use_addr(peer, best);
        cx.set_aka(peer, best);

        tracing::info!(
            peer = %peer,
            from = %previous,
            to = %best,
            "SWITCHED direct peer connection to better endpoint"
        );
    }
}

impl Handler for Established {
    const NAME: &'static str = "established";

    fn tick<C: TrafficContext>(&mut self, peer: NodePublic, cx: &mut C) -> Option<PeerState> {
        let pi = cx.peer_info(&peer)?;
        let now = cx.now();

        if cx.is_active(&peer) {
            self.inactive_since = None;
        } else {
            match self.inactive_since {
                None => self.inactive_since = Some(now),
                Some(since) if now > since + CONNECTION_INACTIVITY_TIMEOUT => {
                    return Some(PeerState::Teardown(Teardown { inactive: true }));
                }
                Some(_) => {}
            }
        }

        if now > self.last_ping_recv + ESTABLISHED_PING_TIMEOUT
            || now > self.last_pong_recv + ESTABLISHED_PING_TIMEOUT
        {
            return Some(PeerState::Teardown(Teardown { inactive: false }));
        }

        if now >= self.next_ping {
            cx.send_ping_direct(self.current, peer, pi.session);
            self.next_ping = now + ESTABLISHED_PING_INTERVAL;
        }

        None
    }

    fn direct<C: TrafficContext>(
        &mut self,
        peer: NodePublic,
        cx: &mut C,
        addr: SocketAddr,
        msg: &ClearMessage,
    ) -> Option<PeerState> {
        let addr = addr::normalise(addr);
        log_direct(peer, Self::NAME, addr, msg);

        if !self.can_trust(peer, cx, addr) {
            tracing::trace!(peer = %peer, addr = %addr, "dropping direct message, cannot trust endpoint");
            return None;
        }

        match &msg.message {
            SessionMessage::Ping { tx_id, node_key } => {
                if !ping_direct_valid(cx, &msg.session, node_key) {
                    tracing::warn!(peer = %peer, addr = %addr, "dropping invalid ping");
                    return None;
                }

                self.last_ping_recv = cx.now();
                reply_with_pong_direct(cx, addr, msg.session, *tx_id);

                if addr != self.current && !self.tracker.has(addr) {
                    let pi = cx.peer_info(&peer)?;
                    tracing::trace!(
                        peer = %peer,
                        addr = %addr,
                        current = %self.current,
                        "pinging back to prevent asymmetric glare"
                    );
                    cx.send_ping_direct_with_id(addr, peer, pi.session, *tx_id);
                }
            }
            SessionMessage::Pong { tx_id, .. } => {
                if let Err(reason) = pong_direct_valid(cx, peer, &msg.session, tx_id) {
                    tracing::warn!(peer = %peer, addr = %addr, reason, "dropping invalid pong");
                    return None;
                }

                self.last_pong_recv = cx.now();
                self.tracker.got_pong(addr);
                cx.pings().remove(tx_id);
                self.check_preferred(peer, cx);
            }
            SessionMessage::Rendezvous { .. } => {
                tracing::debug!(peer = %peer, addr = %addr, "ignoring direct rendezvous");
            }
            SessionMessage::SideBand { .. } => {}
        }
        None
    }

    fn relay<C: TrafficContext>(
        &mut self,
        peer: NodePublic,
        cx: &mut C,
        relay: RelayId,
        src: NodePublic,
        msg: &ClearMessage,
    ) -> Option<PeerState> {
        log_relay(peer, Self::NAME, relay, src, msg);
        handle_relay_ping_pong(cx, relay, src, msg);
        None
    }
}

/// Transient: drop the direct path and fall back to the home relay.
#[derive(Debug, Clone, Copy)]
pub struct Teardown {
    inactive: bool,
}

impl Teardown {
    /// Whether the teardown was caused by inactivity.
    #[must_use]
    pub fn inactive(&self) -> bool {
        self.inactive
    }
}

impl Handler for Teardown {
    const NAME: &'static str = "teardown(t)";

    fn tick<C: TrafficContext>(&mut self, peer: NodePublic, cx: &mut C) -> Option<PeerState> {
        cx.clear_aka(peer);
        cx.out_conn_track_home(peer);

        if self.inactive {
            tracing::info!(peer = %peer, "DROPPED direct peer connection (due to inactivity)");
            Some(PeerState::Inactive(Inactive))
        } else {
            tracing::info!(peer = %peer, "LOST direct peer connection");
            Some(PeerState::Trying(Trying::new(cx.now(), 0)))
        }
    }
}
