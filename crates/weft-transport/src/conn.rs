//! Socket abstraction shared by the Socket Receiver, Direct Manager and the
//! per-peer connections.

use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

/// Transport layer errors
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// I/O error from the underlying socket
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Socket was closed locally
    #[error("socket is closed")]
    Closed,

    /// Address binding failed
    #[error("failed to bind to address: {0}")]
    BindFailed(String),

    /// Connected-mode operation on an unconnected socket
    #[error("socket is not connected")]
    NotConnected,
}

impl TransportError {
    /// True when the socket can never be used again.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        match self {
            Self::Closed => true,
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::NotConnected | io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// A datagram socket.
///
/// `recv_from` must be cancel-safe: the Socket Receiver races it against a
/// read deadline and its lifetime token.
#[async_trait]
pub trait UdpConn: Send + Sync {
    /// Send a datagram to `addr`.
    async fn send_to(&self, buf: &[u8], addr: SocketAddr) -> TransportResult<usize>;

    /// Send a datagram to the connected remote.
    async fn send(&self, buf: &[u8]) -> TransportResult<usize>;

    /// Receive one datagram, returning its length and source.
    async fn recv_from(&self, buf: &mut [u8]) -> TransportResult<(usize, SocketAddr)>;

    /// Local bound address.
    fn local_addr(&self) -> TransportResult<SocketAddr>;

    /// Mark the socket closed; later operations return [`TransportError::Closed`].
    fn close(&self);

    /// Whether [`UdpConn::close`] has been called.
    fn is_closed(&self) -> bool;

    /// Snapshot of the socket counters.
    fn stats(&self) -> ConnStatsSnapshot {
        ConnStatsSnapshot::default()
    }
}

/// Atomic per-socket counters.
#[derive(Debug, Default)]
pub struct ConnStats {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    packets_sent: AtomicU64,
    packets_received: AtomicU64,
    send_errors: AtomicU64,
    recv_errors: AtomicU64,
}

/// Point-in-time copy of [`ConnStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnStatsSnapshot {
    /// Total bytes sent
    pub bytes_sent: u64,
    /// Total bytes received
    pub bytes_received: u64,
    /// Total datagrams sent
    pub packets_sent: u64,
    /// Total datagrams received
    pub packets_received: u64,
    /// Failed sends
    pub send_errors: u64,
    /// Failed receives
    pub recv_errors: u64,
}

impl ConnStats {
    /// Record a successful send.
    pub fn record_send(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a successful receive.
    pub fn record_recv(&self, bytes: usize) {
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
        self.packets_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failed send.
    pub fn record_send_error(&self) {
        self.send_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failed receive.
    pub fn record_recv_error(&self) {
        self.recv_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Copy the current values.
    #[must_use]
    pub fn snapshot(&self) -> ConnStatsSnapshot {
        ConnStatsSnapshot {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
            recv_errors: self.recv_errors.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_accumulate() {
        let stats = ConnStats::default();
        for _ in 0..3 {
            stats.record_send(100);
        }
        stats.record_recv(40);
        stats.record_send_error();

        let snap = stats.snapshot();
        assert_eq!(snap.packets_sent, 3);
        assert_eq!(snap.bytes_sent, 300);
        assert_eq!(snap.packets_received, 1);
        assert_eq!(snap.bytes_received, 40);
        assert_eq!(snap.send_errors, 1);
        assert_eq!(snap.recv_errors, 0);
    }

    #[test]
    fn test_error_is_closed() {
        assert!(TransportError::Closed.is_closed());
        assert!(TransportError::Io(io::Error::from(io::ErrorKind::BrokenPipe)).is_closed());
        assert!(!TransportError::Io(io::Error::from(io::ErrorKind::TimedOut)).is_closed());
        assert!(!TransportError::NotConnected.is_closed());
    }

    #[test]
    fn test_error_display() {
        assert_eq!(TransportError::Closed.to_string(), "socket is closed");
        assert!(
            TransportError::BindFailed("in use".into())
                .to_string()
                .contains("in use")
        );
    }
}
