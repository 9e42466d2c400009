//! One establishment attempt: fan out pings, trade a rendezvous over the
//! home relay, and wait for the first valid pong.

use super::common::{
    EstablishingCommon, ack_pong_direct, ack_pong_relay, ping_direct_valid, pong_direct_valid,
    reply_with_pong_direct, reply_with_pong_relay,
};
use super::established::Established;
use super::pingtracker::PingTracker;
use super::{Handler, PeerState, TrafficContext, log_direct, log_relay};
use crate::addr;
use crate::msgsess::{ClearMessage, SessionMessage, TxId};
use crate::types::RelayId;
use std::net::SocketAddr;
use weft_crypto::{NodePublic, SessionPublic};

/// Transient: first ping fan-out and rendezvous of an attempt.
#[derive(Debug, Clone)]
pub struct PreTransmit {
    common: EstablishingCommon,
}

impl PreTransmit {
    pub(crate) fn new(common: EstablishingCommon) -> Self {
        Self { common }
    }
}

impl Handler for PreTransmit {
    const NAME: &'static str = "pre-transmit(t)";

    fn tick<C: TrafficContext>(&mut self, peer: NodePublic, cx: &mut C) -> Option<PeerState> {
        let pi = self.common.send_pings_to_peer(peer, cx)?;

        let endpoints = cx.local_endpoints();
        if !endpoints.is_empty() {
            cx.send_msg_to_relay(
                pi.home_relay,
                peer,
                pi.session,
                SessionMessage::Rendezvous {
                    my_addresses: endpoints,
                },
            );
        }

        Some(PeerState::EstTransmitting(Transmitting {
            common: self.common.clone(),
        }))
    }
}

/// Pinging the peer's endpoints, waiting for anything back.
#[derive(Debug, Clone)]
pub struct Transmitting {
    common: EstablishingCommon,
}

impl Transmitting {
    /// Attempt bookkeeping.
    #[must_use]
    pub fn common(&self) -> &EstablishingCommon {
        &self.common
    }
}

impl Handler for Transmitting {
    const NAME: &'static str = "transmitting";

    fn tick<C: TrafficContext>(&mut self, peer: NodePublic, cx: &mut C) -> Option<PeerState> {
        self.common.tick_waiting(peer, cx)
    }

    fn direct<C: TrafficContext>(
        &mut self,
        peer: NodePublic,
        cx: &mut C,
        addr: SocketAddr,
        msg: &ClearMessage,
    ) -> Option<PeerState> {
        log_direct(peer, Self::NAME, addr, msg);
        half_or_finalize(&self.common, peer, Self::NAME, cx, addr, msg)
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
        if let SessionMessage::Rendezvous { my_addresses } = &msg.message {
            cx.poke();
            return Some(PeerState::EstRendezGot(RendezGot::new(
                self.common.clone(),
                my_addresses.clone(),
            )));
        }
        handle_relay_ping_pong(cx, relay, src, msg);
        None
    }
}

/// Transient: the peer sent its endpoints over the relay.
#[derive(Debug, Clone)]
pub struct RendezGot {
    common: EstablishingCommon,
    addresses: Vec<SocketAddr>,
}

impl RendezGot {
    pub(crate) fn new(common: EstablishingCommon, addresses: Vec<SocketAddr>) -> Self {
        Self { common, addresses }
    }
}

impl Handler for RendezGot {
    const NAME: &'static str = "rendezvous-got(t)";

    fn tick<C: TrafficContext>(&mut self, peer: NodePublic, cx: &mut C) -> Option<PeerState> {
        let pi = cx.peer_info(&peer)?;

        let normalised: Vec<SocketAddr> = self.addresses.iter().copied().map(addr::normalise).collect();
        cx.set_rendezvous_endpoints(&peer, normalised);

        for ep in &self.addresses {
            cx.send_ping_direct(*ep, peer, pi.session);
        }

        let now = cx.now();
        self.common.set_last_ping(now);
        self.common.reset_deadline(now);

        Some(PeerState::EstRendezAck(RendezAck {
            common: self.common.clone(),
        }))
    }
}

/// Pinged the rendezvous endpoints, waiting for anything back.
#[derive(Debug, Clone)]
pub struct RendezAck {
    common: EstablishingCommon,
}

impl Handler for RendezAck {
    const NAME: &'static str = "rendezvous-acknowledged";

    fn tick<C: TrafficContext>(&mut self, peer: NodePublic, cx: &mut C) -> Option<PeerState> {
        self.common.tick_waiting(peer, cx)
    }

    fn direct<C: TrafficContext>(
        &mut self,
        peer: NodePublic,
        cx: &mut C,
        addr: SocketAddr,
        msg: &ClearMessage,
    ) -> Option<PeerState> {
        log_direct(peer, Self::NAME, addr, msg);
        half_or_finalize(&self.common, peer, Self::NAME, cx, addr, msg)
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

/// Transient: the peer pinged us first.
#[derive(Debug, Clone)]
pub struct HalfIng {
    common: EstablishingCommon,
    addr: SocketAddr,
    session: SessionPublic,
    tx_id: TxId,
}

impl Handler for HalfIng {
    const NAME: &'static str = "half-establishing(t)";

    fn tick<C: TrafficContext>(&mut self, peer: NodePublic, cx: &mut C) -> Option<PeerState> {
        reply_with_pong_direct(cx, self.addr, self.session, self.tx_id);
        cx.send_ping_direct(self.addr, peer, self.session);
        self.common.set_last_ping(cx.now());

        Some(PeerState::EstHalf(Half {
            common: self.common.clone(),
        }))
    }
}

/// We answered the peer's ping and pinged back; waiting for our pong.
#[derive(Debug, Clone)]
pub struct Half {
    common: EstablishingCommon,
}

impl Handler for Half {
    const NAME: &'static str = "half-established";

    fn tick<C: TrafficContext>(&mut self, peer: NodePublic, cx: &mut C) -> Option<PeerState> {
        self.common.tick_waiting(peer, cx)
    }

    fn direct<C: TrafficContext>(
        &mut self,
        peer: NodePublic,
        cx: &mut C,
        addr: SocketAddr,
        msg: &ClearMessage,
    ) -> Option<PeerState> {
        log_direct(peer, Self::NAME, addr, msg);
        match &msg.message {
            SessionMessage::Ping { tx_id, node_key } => {
                if !ping_direct_valid(cx, &msg.session, node_key) {
                    tracing::warn!(peer = %peer, state = Self::NAME, addr = %addr, "dropping invalid ping");
                    return None;
                }
                reply_with_pong_direct(cx, addr, msg.session, *tx_id);
                cx.send_ping_direct(addr, peer, msg.session);
                self.common.set_last_ping(cx.now());
                None
            }
            SessionMessage::Pong { tx_id, .. } => {
                finalize(peer, Self::NAME, cx, addr, msg.session, *tx_id)
            }
            SessionMessage::Rendezvous { .. } | SessionMessage::SideBand { .. } => None,
        }
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

/// Transient: a valid pong arrived; acknowledge it and boot.
#[derive(Debug, Clone)]
pub struct Finalizing {
    addr: SocketAddr,
    session: SessionPublic,
    tx_id: TxId,
}

impl Handler for Finalizing {
    const NAME: &'static str = "finalizing(t)";

    fn tick<C: TrafficContext>(&mut self, peer: NodePublic, cx: &mut C) -> Option<PeerState> {
        ack_pong_direct(cx, peer, &self.session, &self.tx_id);

        let mut tracker = PingTracker::new();
        tracker.got_pong(self.addr);
        let addr = tracker.best_addr().unwrap_or(self.addr);

        Some(PeerState::Booting(Booting { addr, tracker }))
    }
}

/// Transient: switch the data path to the confirmed address.
#[derive(Debug, Clone)]
pub struct Booting {
    addr: SocketAddr,
    tracker: PingTracker,
}

impl Handler for Booting {
    const NAME: &'static str = "booting(t)";

    fn tick<C: TrafficContext>(&mut self, peer: NodePublic, cx: &mut C) -> Option<PeerState> {
        cx.out_conn_use_addr(peer, self.addr);
        cx.set_aka(peer, self.addr);

        tracing::info!(peer = %peer, via = %self.addr, "ESTABLISHED direct peer connection");

        Some(PeerState::Established(Established::new(
            cx.now(),
            self.addr,
            self.tracker.clone(),
        )))
    }
}

/// Direct Ping or Pong while transmitting or after a rendezvous.
fn half_or_finalize<C: TrafficContext>(
    common: &EstablishingCommon,
    peer: NodePublic,
    state: &'static str,
    cx: &mut C,
    addr: SocketAddr,
    msg: &ClearMessage,
) -> Option<PeerState> {
    match &msg.message {
        SessionMessage::Ping { tx_id, node_key } => {
            if !ping_direct_valid(cx, &msg.session, node_key) {
                tracing::warn!(peer = %peer, state, addr = %addr, "dropping invalid ping");
                return None;
            }
            cx.poke();
            Some(PeerState::EstHalfIng(HalfIng {
                common: common.clone(),
                addr,
                session: msg.session,
                tx_id: *tx_id,
            }))
        }
        SessionMessage::Pong { tx_id, .. } => {
            finalize(peer, state, cx, addr, msg.session, *tx_id)
        }
        SessionMessage::Rendezvous { .. } | SessionMessage::SideBand { .. } => None,
    }
}

fn finalize<C: TrafficContext>(
    peer: NodePublic,
    state: &'static str,
    cx: &mut C,
    addr: SocketAddr,
    session: SessionPublic,
    tx_id: TxId,
) -> Option<PeerState> {
    if let Err(reason) = pong_direct_valid(cx, peer, &session, &tx_id) {
        tracing::warn!(peer = %peer, state, addr = %addr, reason, "dropping invalid pong");
        return None;
    }
    cx.poke();
    Some(PeerState::Finalizing(Finalizing {
        addr,
        session,
        tx_id,
    }))
}

pub(super) fn handle_relay_ping_pong<C: TrafficContext>(
    cx: &mut C,
    relay: RelayId,
    src: NodePublic,
    msg: &ClearMessage,
) {
    match &msg.message {
        SessionMessage::Ping { tx_id, .. } => {
            reply_with_pong_relay(cx, relay, src, msg.session, *tx_id);
        }
        SessionMessage::Pong { tx_id, .. } => ack_pong_relay(cx, src, &msg.session, tx_id),
        SessionMessage::Rendezvous { .. } | SessionMessage::SideBand { .. } => {}
    }
}
