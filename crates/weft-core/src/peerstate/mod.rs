//! Per-peer NAT traversal state machine.
//!
//! One [`PeerState`] exists per known peer, owned by the Traffic Manager.
//! Every handler returns `Option<PeerState>`: `None` keeps the current
//! state, `Some` replaces it wholesale.
//!
//! ```text
//!  Waiting -> Inactive -> Trying -> PreTransmit(t) -> Transmitting --+
//!                ^          ^                            |           |
//!                |          |                  Rendezvous v     Ping v
//!                |          +---- retry ---- RendezGot(t) -> RendezAck -> HalfIng(t) -> Half
//!                |                                   \ Pong       | Pong               | Pong
//!                |                                    +-----------+------> Finalizing(t)
//!                |                                                             |
//!                +---- Teardown(t) <---- Established <---- Booting(t) <--------+
//! ```
//!
//! States marked `(t)` are transient: their tick always moves on. Inbound
//! messages are handled with tick-then-cascade: the current state is
//! ticked first and, if it transitions, the new state handles the message.

mod common;
mod established;
mod establishing;
mod pingtracker;
mod steady;

pub use common::{
    BURST_ESTABLISHING_PING_INTERVAL, CONNECTION_INACTIVITY_TIMEOUT, ESTABLISHED_PING_INTERVAL,
    ESTABLISHED_PING_TIMEOUT, ESTABLISHING_PING_INTERVAL, ESTABLISHMENT_RETRY_MAX,
    ESTABLISHMENT_TIMEOUT, EstablishingCommon, retry_delay,
};
pub use established::{Established, Teardown};
pub use establishing::{Booting, Finalizing, Half, HalfIng, PreTransmit, RendezAck, RendezGot, Transmitting};
pub use pingtracker::{NoValidPings, PingTracker};
pub use steady::{Inactive, Trying, Waiting};

use crate::addr;
use crate::msgsess::{ClearMessage, SessionMessage, TxId};
use crate::types::{PeerInfo, PingDest, RelayId, SentPing};
use std::collections::HashMap;
use std::net::SocketAddr;
use tokio::time::Instant;
use weft_crypto::{NodePublic, SessionPublic};

/// Everything a peer state may read or do, provided by the Traffic Manager.
pub trait TrafficContext {
    /// Current time.
    fn now(&self) -> Instant;

    /// Ask for another tick pass once the inbox drains.
    fn poke(&mut self);

    /// Copy of the peer's info, if the peer is known.
    fn peer_info(&self, peer: &NodePublic) -> Option<PeerInfo>;

    /// Record endpoints the peer sent in a rendezvous.
    fn set_rendezvous_endpoints(&mut self, peer: &NodePublic, endpoints: Vec<SocketAddr>);

    /// Our own local and STUN endpoints.
    fn local_endpoints(&self) -> Vec<SocketAddr>;

    /// Whether either connection half of the peer has seen recent traffic.
    fn is_active(&self, peer: &NodePublic) -> bool;

    /// Our node key, placed in outgoing pings.
    fn node_key(&self) -> NodePublic;

    /// Outstanding pings.
    fn pings(&mut self) -> &mut HashMap<TxId, SentPing>;

    /// Seal and send a session message to an address.
    fn send_msg_to_direct(&mut self, addr: SocketAddr, session: SessionPublic, msg: SessionMessage);

    /// Seal and send a session message through a relay.
    fn send_msg_to_relay(
        &mut self,
        relay: RelayId,
        peer: NodePublic,
        session: SessionPublic,
        msg: SessionMessage,
    );

    /// Switch the peer's OutConn to a direct address.
    fn out_conn_use_addr(&mut self, peer: NodePublic, addr: SocketAddr);

    /// Pin the peer's OutConn to a relay.
    fn out_conn_use_relay(&mut self, peer: NodePublic, relay: RelayId);

    /// Send the peer's OutConn through its home relay.
    fn out_conn_track_home(&mut self, peer: NodePublic);

    /// Teach the Direct Router that `addr` is `peer`.
    fn set_aka(&mut self, peer: NodePublic, addr: SocketAddr);

    /// Make the Direct Router forget every alias of `peer`.
    fn clear_aka(&mut self, peer: NodePublic);

    /// True if `session` is the current session key of `peer`.
    fn valid_keys(&self, peer: &NodePublic, session: &SessionPublic) -> bool {
        self.peer_info(peer).is_some_and(|pi| pi.session == *session)
    }

    /// Send a ping with a caller-chosen transaction id and record it.
    fn send_ping_direct_with_id(
        &mut self,
        addr: SocketAddr,
        peer: NodePublic,
        session: SessionPublic,
        tx_id: TxId,
    ) {
        let addr = addr::normalise(addr);
        let node_key = self.node_key();
        self.send_msg_to_direct(addr, session, SessionMessage::Ping { tx_id, node_key });

        let at = self.now();
        self.pings().insert(
            tx_id,
            SentPing {
                dest: PingDest::Direct(addr),
                to: peer,
                at,
            },
        );
    }

    /// Send a ping with a fresh transaction id and record it.
    fn send_ping_direct(&mut self, addr: SocketAddr, peer: NodePublic, session: SessionPublic) {
        self.send_ping_direct_with_id(addr, peer, session, TxId::random());
    }
}

/// Handlers every state variant implements.
pub(crate) trait Handler {
    const NAME: &'static str;

    fn tick<C: TrafficContext>(&mut self, peer: NodePublic, cx: &mut C) -> Option<PeerState>;

    fn direct<C: TrafficContext>(
        &mut self,
        peer: NodePublic,
        _cx: &mut C,
        addr: SocketAddr,
        msg: &ClearMessage,
    ) -> Option<PeerState> {
        log_direct(peer, Self::NAME, addr, msg);
        None
    }

    fn relay<C: TrafficContext>(
        &mut self,
        peer: NodePublic,
        _cx: &mut C,
        relay: RelayId,
        src: NodePublic,
        msg: &ClearMessage,
    ) -> Option<PeerState> {
        log_relay(peer, Self::NAME, relay, src, msg);
        None
    }
}

/// A peer's connection state.
#[derive(Debug, Clone)]
#[allow(missing_docs)]
pub enum PeerState {
    Waiting(Waiting),
    Inactive(Inactive),
    Trying(Trying),
    EstPreTransmit(PreTransmit),
    EstTransmitting(Transmitting),
    EstRendezGot(RendezGot),
    EstRendezAck(RendezAck),
    EstHalfIng(HalfIng),
    EstHalf(Half),
    Finalizing(Finalizing),
    Booting(Booting),
    Established(Established),
    Teardown(Teardown),
}

macro_rules! dispatch {
    ($self:ident, $s:ident => $e:expr) => {
        match $self {
            PeerState::Waiting($s) => $e,
            PeerState::Inactive($s) => $e,
            PeerState::Trying($s) => $e,
            PeerState::EstPreTransmit($s) => $e,
            PeerState::EstTransmitting($s) => $e,
            PeerState::EstRendezGot($s) => $e,
            PeerState::EstRendezAck($s) => $e,
            PeerState::EstHalfIng($s) => $e,
            PeerState::EstHalf($s) => $e,
            PeerState::Finalizing($s) => $e,
            PeerState::Booting($s) => $e,
            PeerState::Established($s) => $e,
            PeerState::Teardown($s) => $e,
        }
    };
}

fn name_of<H: Handler>(_: &H) -> &'static str {
    H::NAME
}

impl PeerState {
    /// Initial state for a peer.
    #[must_use]
    pub fn waiting(peer: NodePublic) -> Self {
        tracing::info!(peer = %peer, "initialised peer state");
        PeerState::Waiting(Waiting)
    }

    /// Lower-case name for logs.
    #[must_use]
    pub fn name(&self) -> &'static str {
        dispatch!(self, s => name_of(s))
    }

    /// Whether this is a transient state, which always moves on when ticked.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PeerState::EstPreTransmit(_)
                | PeerState::EstRendezGot(_)
                | PeerState::EstHalfIng(_)
                | PeerState::Finalizing(_)
                | PeerState::Booting(_)
                | PeerState::Teardown(_)
        )
    }

    /// Periodic evaluation.
    pub fn on_tick<C: TrafficContext>(
        &mut self,
        peer: NodePublic,
        cx: &mut C,
    ) -> Option<PeerState> {
        let from = self.name();
        let next = dispatch!(self, s => s.tick(peer, cx));
        if let Some(to) = &next {
            log_transition(peer, from, to.name());
        }
        next
    }

    /// A session message received on the external socket from `addr`.
    pub fn on_direct<C: TrafficContext>(
        &mut self,
        peer: NodePublic,
        cx: &mut C,
        addr: SocketAddr,
        msg: &ClearMessage,
    ) -> Option<PeerState> {
        if let Some(mut next) = self.on_tick(peer, cx) {
            let after = next.on_direct(peer, cx, addr, msg);
            return Some(after.unwrap_or(next));
        }

        let from = self.name();
        let next = dispatch!(self, s => s.direct(peer, cx, addr, msg));
        if let Some(to) = &next {
            log_transition(peer, from, to.name());
        }
        next
    }

    /// A session message received through `relay`, attested to come from `src`.
    pub fn on_relay<C: TrafficContext>(
        &mut self,
        peer: NodePublic,
        cx: &mut C,
        relay: RelayId,
        src: NodePublic,
        msg: &ClearMessage,
    ) -> Option<PeerState> {
        if let Some(mut next) = self.on_tick(peer, cx) {
            let after = next.on_relay(peer, cx, relay, src, msg);
            return Some(after.unwrap_or(next));
        }

        let from = self.name();
        let next = dispatch!(self, s => s.relay(peer, cx, relay, src, msg));
        if let Some(to) = &next {
            log_transition(peer, from, to.name());
        }
        next
    }
}

fn log_transition(peer: NodePublic, from: &'static str, to: &'static str) {
    tracing::trace!(peer = %peer, state = from, to_state = to, "transitioning state");
}

pub(crate) fn log_direct(peer: NodePublic, state: &'static str, addr: SocketAddr, msg: &ClearMessage) {
    tracing::trace!(
        peer = %peer,
        state,
        from_addr = %addr,
        from_session = %msg.session,
        msg = msg.message.kind(),
        "received direct message"
    );
}

pub(crate) fn log_relay(
    peer: NodePublic,
    state: &'static str,
    relay: RelayId,
    src: NodePublic,
    msg: &ClearMessage,
) {
    tracing::trace!(
        peer = %peer,
        state,
        relay,
        from_peer = %src,
        from_session = %msg.session,
        msg = msg.message.kind(),
        "received relay message"
    );
}

#[cfg(test)]
pub(crate) mod testing;
