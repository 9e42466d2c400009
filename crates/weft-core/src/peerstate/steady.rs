//! Resting states: no establishment attempt is in flight.

use super::common::{
    EstablishingCommon, ack_pong_direct, ack_pong_relay, ping_direct_valid, reply_with_pong_direct,
    reply_with_pong_relay,
};
use super::establishing::{PreTransmit, RendezGot};
use super::{Handler, PeerState, TrafficContext, log_direct, log_relay};
use crate::msgsess::{ClearMessage, SessionMessage};
use crate::types::RelayId;
use std::net::SocketAddr;
use tokio::time::Instant;
use weft_crypto::NodePublic;

/// Waiting for the peer's session key.
#[derive(Debug, Clone, Copy, Default)]
pub struct Waiting;

impl Handler for Waiting {
    const NAME: &'static str = "waiting";

    fn tick<C: TrafficContext>(&mut self, peer: NodePublic, cx: &mut C) -> Option<PeerState> {
        cx.peer_info(&peer)
            .filter(|pi| !pi.session.is_zero())
            .map(|_| PeerState::Inactive(Inactive))
    }
}

/// Known, but idle or without any endpoint to try.
#[derive(Debug, Clone, Copy, Default)]
pub struct Inactive;

impl Handler for Inactive {
    const NAME: &'static str = "inactive";

    fn tick<C: TrafficContext>(&mut self, peer: NodePublic, cx: &mut C) -> Option<PeerState> {
        let pi = cx.peer_info(&peer)?;
        if !cx.is_active(&peer) {
            return None;
        }

        let have_endpoints = !pi.endpoints.is_empty() || !pi.rendezvous_endpoints.is_empty();
        if have_endpoints || !cx.local_endpoints().is_empty() {
            return Some(PeerState::Trying(Trying::new(cx.now(), 0)));
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
        log_direct(peer, Self::NAME, addr, msg);
        handle_resting_direct(peer, Self::NAME, cx, addr, msg);
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
        let next = handle_resting_relay(Self::NAME, cx, relay, src, msg);
        if next.is_some() {
            cx.poke();
        }
        next
    }
}

/// Backing off until the next establishment attempt.
#[derive(Debug, Clone, Copy)]
pub struct Trying {
    try_at: Instant,
    attempts: u32,
}

impl Trying {
    pub(crate) fn new(try_at: Instant, attempts: u32) -> Self {
        Self { try_at, attempts }
    }

    /// When the next attempt starts.
    #[must_use]
    pub fn try_at(&self) -> Instant {
        self.try_at
    }

    /// Attempts made so far.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

impl Handler for Trying {
    const NAME: &'static str = "trying";

    fn tick<C: TrafficContext>(&mut self, _peer: NodePublic, cx: &mut C) -> Option<PeerState> {
        let now = cx.now();
        if now < self.try_at {
            return None;
        }
        Some(PeerState::EstPreTransmit(PreTransmit::new(
            EstablishingCommon::new(now, self.attempts),
        )))
    }

    fn direct<C: TrafficContext>(
        &mut self,
        peer: NodePublic,
        cx: &mut C,
        addr: SocketAddr,
        msg: &ClearMessage,
    ) -> Option<PeerState> {
        log_direct(peer, Self::NAME, addr, msg);
        handle_resting_direct(peer, Self::NAME, cx, addr, msg);
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
        handle_resting_relay(Self::NAME, cx, relay, src, msg)
    }
}

fn handle_resting_direct<C: TrafficContext>(
    peer: NodePublic,
    state: &'static str,
    cx: &mut C,
    addr: SocketAddr,
    msg: &ClearMessage,
) {
    match &msg.message {
        SessionMessage::Ping { tx_id, node_key } => {
            if !ping_direct_valid(cx, &msg.session, node_key) {
                tracing::warn!(peer = %peer, state, addr = %addr, "dropping invalid ping");
                return;
            }
            reply_with_pong_direct(cx, addr, msg.session, *tx_id);
        }
        SessionMessage::Pong { tx_id, .. } => ack_pong_direct(cx, peer, &msg.session, tx_id),
        SessionMessage::Rendezvous { .. } => {
            tracing::warn!(peer = %peer, state, addr = %addr, "ignoring direct rendezvous");
        }
        SessionMessage::SideBand { .. } => {}
    }
}

fn handle_resting_relay<C: TrafficContext>(
    state: &'static str,
    cx: &mut C,
    relay: RelayId,
    src: NodePublic,
    msg: &ClearMessage,
) -> Option<PeerState> {
    match &msg.message {
        SessionMessage::Ping { tx_id, .. } => {
            reply_with_pong_relay(cx, relay, src, msg.session, *tx_id);
            None
        }
        SessionMessage::Pong { tx_id, .. } => {
            ack_pong_relay(cx, src, &msg.session, tx_id);
            None
        }
        SessionMessage::Rendezvous { my_addresses } => {
            tracing::trace!(peer = %src, state, relay, "rendezvous starts a fresh attempt");
            Some(PeerState::EstRendezGot(RendezGot::new(
                EstablishingCommon::new(cx.now(), 0),
                my_addresses.clone(),
            )))
        }
        SessionMessage::SideBand { .. } => None,
    }
}
