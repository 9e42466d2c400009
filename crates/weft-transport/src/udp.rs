//! Tokio UDP socket implementing [`UdpConn`].

use crate::conn::{ConnStats, ConnStatsSnapshot, TransportError, TransportResult, UdpConn};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::watch;

/// Socket buffer tuning applied before bind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketOptions {
    /// `SO_RCVBUF` in bytes
    pub recv_buffer: usize,
    /// `SO_SNDBUF` in bytes
    pub send_buffer: usize,
    /// `SO_REUSEADDR`
    pub reuse_address: bool,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            recv_buffer: 2 * 1024 * 1024,
            send_buffer: 2 * 1024 * 1024,
            reuse_address: false,
        }
    }
}

/// UDP socket with statistics and a wakeable close.
///
/// Clones share the socket, the counters and the closed flag. Calling
/// [`UdpConn::close`] wakes every pending `recv_from`.
///
/// # Examples
///
/// ```no_run
/// use weft_transport::{UdpConn, UdpSocketConn};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let conn = UdpSocketConn::bind("127.0.0.1:0".parse()?).await?;
/// conn.send_to(b"hello", "127.0.0.1:51820".parse()?).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct UdpSocketConn {
    socket: Arc<UdpSocket>,
    stats: Arc<ConnStats>,
    closed_tx: Arc<watch::Sender<bool>>,
    closed_rx: watch::Receiver<bool>,
    connected: bool,
}

impl UdpSocketConn {
    /// Bind with default [`SocketOptions`].
    ///
    /// # Errors
    ///
    /// Returns `TransportError::BindFailed` if the socket cannot be created or bound.
    pub async fn bind(addr: SocketAddr) -> TransportResult<Self> {
        Self::bind_with(addr, SocketOptions::default()).await
    }

    /// Bind with explicit buffer options.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::BindFailed` if the socket cannot be created or bound.
    pub async fn bind_with(addr: SocketAddr, opts: SocketOptions) -> TransportResult<Self> {
        let socket = Self::make_socket(addr, opts)?;
        Ok(Self::from_socket(socket, false))
    }

    /// Bind to `local` and connect to `remote`, so that [`UdpConn::send`]
    /// works and only datagrams from `remote` are received.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::BindFailed` on bind failure and
    /// `TransportError::Io` if the connect fails.
    pub async fn connect(local: SocketAddr, remote: SocketAddr) -> TransportResult<Self> {
        let socket = Self::make_socket(local, SocketOptions::default())?;
        socket.connect(remote).await?;
        tracing::trace!(%local, %remote, "connected udp socket");
        Ok(Self::from_socket(socket, true))
    }

    /// Wrap an already-bound tokio socket.
    #[must_use]
    pub fn from_socket(socket: UdpSocket, connected: bool) -> Self {
        let (closed_tx, closed_rx) = watch::channel(false);
        Self {
            socket: Arc::new(socket),
            stats: Arc::new(ConnStats::default()),
            closed_tx: Arc::new(closed_tx),
            closed_rx,
            connected,
        }
    }

    fn make_socket(addr: SocketAddr, opts: SocketOptions) -> TransportResult<UdpSocket> {
        let bind_err = |e: std::io::Error| TransportError::BindFailed(format!("{addr}: {e}"));

        let domain = if addr.is_ipv4() {
            socket2::Domain::IPV4
        } else {
            socket2::Domain::IPV6
        };

        let socket =
            socket2::Socket::new(domain, socket2::Type::DGRAM, Some(socket2::Protocol::UDP))
                .map_err(bind_err)?;

        // Buffer sizes are advisory; the kernel may clamp them.
        if let Err(e) = socket.set_recv_buffer_size(opts.recv_buffer) {
            tracing::debug!("SO_RCVBUF rejected: {e}");
        }
        if let Err(e) = socket.set_send_buffer_size(opts.send_buffer) {
            tracing::debug!("SO_SNDBUF rejected: {e}");
        }
        if opts.reuse_address {
            socket.set_reuse_address(true).map_err(bind_err)?;
        }

        socket.bind(&addr.into()).map_err(bind_err)?;
        socket.set_nonblocking(true).map_err(bind_err)?;

        let std_socket: std::net::UdpSocket = socket.into();
        UdpSocket::from_std(std_socket).map_err(bind_err)
    }

    fn check_open(&self) -> TransportResult<()> {
        if *self.closed_rx.borrow() {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl UdpConn for UdpSocketConn {
    async fn send_to(&self, buf: &[u8], addr: SocketAddr) -> TransportResult<usize> {
        self.check_open()?;

        match self.socket.send_to(buf, addr).await {
            Ok(sent) => {
                self.stats.record_send(sent);
                Ok(sent)
            }
            Err(e) => {
                self.stats.record_send_error();
                Err(TransportError::Io(e))
            }
        }
    }

    async fn send(&self, buf: &[u8]) -> TransportResult<usize> {
        self.check_open()?;
        if !self.connected {
            return Err(TransportError::NotConnected);
        }

        match self.socket.send(buf).await {
            Ok(sent) => {
                self.stats.record_send(sent);
                Ok(sent)
            }
            Err(e) => {
                self.stats.record_send_error();
                Err(TransportError::Io(e))
            }
        }
    }

    async fn recv_from(&self, buf: &mut [u8]) -> TransportResult<(usize, SocketAddr)> {
        self.check_open()?;

        let mut closed = self.closed_rx.clone();
        tokio::select! {
            _ = closed.wait_for(|c| *c) => Err(TransportError::Closed),
            res = self.socket.recv_from(buf) => match res {
                Ok((size, addr)) => {
                    self.stats.record_recv(size);
                    Ok((size, addr))
                }
                Err(e) => {
                    self.stats.record_recv_error();
                    Err(TransportError::Io(e))
                }
            },
        }
    }

    fn local_addr(&self) -> TransportResult<SocketAddr> {
        self.socket.local_addr().map_err(TransportError::Io)
    }

    fn close(&self) {
        self.closed_tx.send_replace(true);
    }

    fn is_closed(&self) -> bool {
        *self.closed_rx.borrow()
    }

    fn stats(&self) -> ConnStatsSnapshot {
        self.stats.snapshot()
    }
}

impl std::fmt::Debug for UdpSocketConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpSocketConn")
            .field("local", &self.socket.local_addr().ok())
            .field("connected", &self.connected)
            .field("closed", &self.is_closed())
            .finish()
    }
}
