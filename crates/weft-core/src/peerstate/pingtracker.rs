use crate::addr;
use std::cmp::Ordering;
use std::collections::HashSet;
use std::net::SocketAddr;
use thiserror::Error;

/// No address has answered a ping yet.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("no valid pings")]
pub struct NoValidPings;

/// Addresses that have answered at least one ping from us.
#[derive(Debug, Clone, Default)]
pub struct PingTracker {
    ponged: HashSet<SocketAddr>,
}

impl PingTracker {
    /// Empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a pong received from `addr`.
    pub fn got_pong(&mut self, addr: SocketAddr) {
        self.ponged.insert(addr::normalise(addr));
    }

    /// Whether `addr` has answered.
    #[must_use]
    pub fn has(&self, addr: SocketAddr) -> bool {
        self.ponged.contains(&addr::normalise(addr))
    }

    /// Number of answering addresses.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ponged.len()
    }

    /// True if nothing has answered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ponged.is_empty()
    }

    /// Highest-ranked answering address.
    ///
    /// IPv6 beats IPv4, then private beats public, then the larger address
    /// wins so the choice is deterministic.
    ///
    /// # Errors
    ///
    /// Returns [`NoValidPings`] if nothing has answered.
    pub fn best_addr(&self) -> Result<SocketAddr, NoValidPings> {
        self.ponged.iter().copied().max_by(rank).ok_or(NoValidPings)
    }
}

fn rank(a: &SocketAddr, b: &SocketAddr) -> Ordering {
    a.is_ipv6()
        .cmp(&b.is_ipv6())
        .then_with(|| addr::is_private(a.ip()).cmp(&addr::is_private(b.ip())))
        .then_with(|| a.cmp(b))
}
