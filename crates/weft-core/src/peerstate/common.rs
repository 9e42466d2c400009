use super::{PeerState, TrafficContext, Trying};
use crate::addr;
use crate::msgsess::{SessionMessage, TxId};
use crate::types::{PeerInfo, RelayId};
use std::net::{Ipv6Addr, SocketAddr};
use std::time::Duration;
use tokio::time::Instant;
use weft_crypto::{NodePublic, SessionPublic};

/// How long one establishment attempt may take before retrying
pub const ESTABLISHMENT_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound on the retry delay between attempts
pub const ESTABLISHMENT_RETRY_MAX: Duration = Duration::from_secs(10 * 60);

/// Silence (pings or pongs) after which an established path is torn down
pub const ESTABLISHED_PING_TIMEOUT: Duration = Duration::from_secs(5);

/// Idle time after which an established peer goes inactive
pub const CONNECTION_INACTIVITY_TIMEOUT: Duration = Duration::from_secs(60);

/// Ping interval while establishing
pub const ESTABLISHING_PING_INTERVAL: Duration = Duration::from_millis(900);

/// Ping interval for the first pings of an attempt
pub const BURST_ESTABLISHING_PING_INTERVAL: Duration = Duration::from_millis(200);

/// Ping interval on an established path
pub const ESTABLISHED_PING_INTERVAL: Duration = Duration::from_secs(2);

const BURST_PING_COUNT: u32 = 4;

/// Delay before establishment attempt number `attempt + 1`.
///
/// `min(2^min(attempt, 10) s, 10 min)`.
#[must_use]
pub fn retry_delay(attempt: u32) -> Duration {
    let exp = attempt.clamp(1, 10);
    Duration::from_secs(1u64 << exp).min(ESTABLISHMENT_RETRY_MAX)
}

/// Bookkeeping shared by every establishing state of one attempt.
#[derive(Debug, Clone)]
pub struct EstablishingCommon {
    deadline: Instant,
    attempt: u32,
    last_ping: Option<Instant>,
    ping_count: u32,
}

impl EstablishingCommon {
    /// Start attempt `attempts + 1`.
    #[must_use]
    pub fn new(now: Instant, attempts: u32) -> Self {
        Self {
            deadline: now + ESTABLISHMENT_TIMEOUT,
            attempt: attempts.saturating_add(1),
            last_ping: None,
            ping_count: 0,
        }
    }

    /// Attempt number, starting at 1.
    #[must_use]
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Pings fanned out in this attempt.
    #[must_use]
    pub fn ping_count(&self) -> u32 {
        self.ping_count
    }

    pub(crate) fn reset_deadline(&mut self, now: Instant) {
        self.deadline = now + ESTABLISHMENT_TIMEOUT;
    }

    pub(crate) fn expired(&self, now: Instant) -> bool {
        now > self.deadline
    }

    pub(crate) fn retry(&self, now: Instant) -> PeerState {
        PeerState::Trying(Trying::new(now + retry_delay(self.attempt), self.attempt))
    }

    pub(crate) fn wants_ping(&self, now: Instant) -> bool {
        let interval = if self.ping_count < BURST_PING_COUNT {
            BURST_ESTABLISHING_PING_INTERVAL
        } else {
            ESTABLISHING_PING_INTERVAL
        };

        self.last_ping.is_none_or(|last| now > last + interval)
    }

    pub(crate) fn mark_pinged(&mut self, now: Instant) {
        self.last_ping = Some(now);
        self.ping_count += 1;
    }

    pub(crate) fn set_last_ping(&mut self, now: Instant) {
        self.last_ping = Some(now);
    }

    /// Ping every announced and rendezvous endpoint of `peer`.
    ///
    /// Returns `None` without sending anything if the peer is unknown.
    pub(crate) fn send_pings_to_peer<C: TrafficContext>(
        &mut self,
        peer: NodePublic,
        cx: &mut C,
    ) -> Option<PeerInfo> {
        let pi = cx.peer_info(&peer)?;
        let endpoints = addr::union(&pi.endpoints, &pi.rendezvous_endpoints);

        for ep in &endpoints {
            cx.send_ping_direct(*ep, peer, pi.session);
        }

        tracing::trace!(
            peer = %peer,
            via_endpoints = %addr::pretty(&endpoints),
            "fanning direct pings to peer"
        );

        self.mark_pinged(cx.now());
        Some(pi)
    }

    /// Expire into a retry, or keep pinging at the establishing cadence.
    pub(crate) fn tick_waiting<C: TrafficContext>(
        &mut self,
        peer: NodePublic,
        cx: &mut C,
    ) -> Option<PeerState> {
        let now = cx.now();
        if self.expired(now) {
            return Some(self.retry(now));
        }
        if self.wants_ping(now) {
            self.send_pings_to_peer(peer, cx);
        }
        None
    }
}

pub(crate) fn ping_direct_valid<C: TrafficContext>(
    cx: &C,
    session: &SessionPublic,
    node_key: &NodePublic,
) -> bool {
    cx.valid_keys(node_key, session)
}

pub(crate) fn reply_with_pong_direct<C: TrafficContext>(
    cx: &mut C,
    addr: SocketAddr,
    session: SessionPublic,
    tx_id: TxId,
) {
    cx.send_msg_to_direct(addr, session, SessionMessage::Pong { tx_id, src: addr });
}

pub(crate) fn reply_with_pong_relay<C: TrafficContext>(
    cx: &mut C,
    relay: RelayId,
    peer: NodePublic,
    session: SessionPublic,
    tx_id: TxId,
) {
    cx.send_msg_to_relay(
        relay,
        peer,
        session,
        SessionMessage::Pong {
            tx_id,
            src: SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)),
        },
    );
}

/// Check that a direct pong answers a direct ping we sent to `peer` under
/// the peer's current session.
pub(crate) fn pong_direct_valid<C: TrafficContext>(
    cx: &mut C,
    peer: NodePublic,
    session: &SessionPublic,
    tx_id: &TxId,
) -> Result<(), &'static str> {
    let sent = cx.pings().get(tx_id).copied().ok_or("pong for unknown ping")?;

    if sent.to_relay() {
        return Err("direct pong for relay ping");
    }
    if sent.to != peer {
        return Err("pong for ping to another peer");
    }
    if !cx.valid_keys(&peer, session) {
        return Err("pong under stale session");
    }
    Ok(())
}

/// Clear the sent-ping entry of a valid direct pong.
pub(crate) fn ack_pong_direct<C: TrafficContext>(
    cx: &mut C,
    peer: NodePublic,
    session: &SessionPublic,
    tx_id: &TxId,
) {
    match pong_direct_valid(cx, peer, session, tx_id) {
        Ok(()) => {
            cx.pings().remove(tx_id);
        }
        Err(reason) => {
            tracing::debug!(peer = %peer, tx_id = %tx_id, reason, "not acknowledging direct pong");
        }
    }
}

/// Clear the sent-ping entry of a valid relay pong from `src`.
pub(crate) fn ack_pong_relay<C: TrafficContext>(
    cx: &mut C,
    src: NodePublic,
    session: &SessionPublic,
    tx_id: &TxId,
) {
    let Some(sent) = cx.pings().get(tx_id).copied() else {
        tracing::debug!(peer = %src, tx_id = %tx_id, "relay pong for unknown ping");
        return;
    };

    if !sent.to_relay() {
        tracing::debug!(peer = %src, tx_id = %tx_id, "relay pong for direct ping");
        return;
    }
    if !cx.valid_keys(&src, session) || !cx.valid_keys(&sent.to, session) {
        tracing::debug!(peer = %src, tx_id = %tx_id, "relay pong under stale session");
        return;
    }

    cx.pings().remove(tx_id);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_delay_grows_and_caps() {
        assert_eq!(retry_delay(0), Duration::from_secs(2));
        assert_eq!(retry_delay(1), Duration::from_secs(2));
        assert_eq!(retry_delay(2), Duration::from_secs(4));
        assert_eq!(retry_delay(9), Duration::from_secs(512));
        assert_eq!(retry_delay(10), ESTABLISHMENT_RETRY_MAX);
        assert_eq!(retry_delay(u32::MAX), ESTABLISHMENT_RETRY_MAX);
    }

    #[test]
    fn test_retry_delay_monotonic() {
        let mut prev = Duration::ZERO;
        for a in 0..64 {
            let d = retry_delay(a);
            assert!(d >= prev);
            assert!(d <= ESTABLISHMENT_RETRY_MAX);
            prev = d;
        }
    }

    #[test]
    fn test_common_attempt_and_deadline() {
        let now = Instant::now();
        let ec = EstablishingCommon::new(now, 0);
        assert_eq!(ec.attempt(), 1);
        assert!(!ec.expired(now + ESTABLISHMENT_TIMEOUT));
        assert!(ec.expired(now + ESTABLISHMENT_TIMEOUT + Duration::from_millis(1)));
    }

    #[test]
    fn test_wants_ping_burst_then_slow() {
        let now = Instant::now();
        let mut ec = EstablishingCommon::new(now, 0);
        assert!(ec.wants_ping(now));

        ec.mark_pinged(now);
        assert!(!ec.wants_ping(now + Duration::from_millis(200)));
        assert!(ec.wants_ping(now + Duration::from_millis(201)));

        for _ in 0..3 {
            ec.mark_pinged(now);
        }
        assert_eq!(ec.ping_count(), 4);
        assert!(!ec.wants_ping(now + Duration::from_millis(500)));
        assert!(ec.wants_ping(now + Duration::from_millis(901)));
    }

    #[test]
    fn test_retry_carries_attempt() {
        let now = Instant::now();
        let ec = EstablishingCommon::new(now, 2);
        match ec.retry(now) {
            PeerState::Trying(t) => {
                assert_eq!(t.attempts(), 3);
                assert_eq!(t.try_at(), now + Duration::from_secs(8));
            }
            other => panic!("unexpected state {}", other.name()),
        }
    }
}
