//! Socket Receiver: pumps datagrams from one socket into a bounded channel.

use crate::actor::message::RecvFrame;
use crate::actor::spawn_supervised;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use weft_transport::{MAX_DATAGRAM_SIZE, UdpConn};

/// Reads one socket until cancelled or the socket fails.
///
/// Reads wake up at least every `read_timeout` to observe cancellation.
/// The socket is closed when the receiver stops, and its token is
/// cancelled, which is how the owner learns the socket died.
pub struct SockRecv {
    conn: Arc<dyn UdpConn>,
    out: mpsc::Sender<RecvFrame>,
    token: CancellationToken,
    read_timeout: Duration,
}

impl SockRecv {
    /// Create a receiver and the channel it feeds.
    pub fn new(
        conn: Arc<dyn UdpConn>,
        token: CancellationToken,
        capacity: usize,
        read_timeout: Duration,
    ) -> (Self, mpsc::Receiver<RecvFrame>) {
        let (out, rx) = mpsc::channel(capacity);
        (
            Self {
                conn,
                out,
                token,
                read_timeout,
            },
            rx,
        )
    }

    /// Lifetime token of this receiver.
    #[must_use]
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Run under supervision.
    pub fn spawn(self) -> JoinHandle<()> {
        spawn_supervised("sockrecv", self.token.clone(), self.run())
    }

    async fn run(self) {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

        loop {
            let read = tokio::select! {
                () = self.token.cancelled() => break,
                r = tokio::time::timeout(self.read_timeout, self.conn.recv_from(&mut buf)) => r,
            };

            let (n, src) = match read {
                Err(_) => continue,
                Ok(Ok(v)) => v,
                Ok(Err(e)) if e.is_closed() => {
                    tracing::debug!("socket closed under receiver");
                    break;
                }
                Ok(Err(e)) => {
                    tracing::warn!(error = %e, "socket read failed");
                    break;
                }
            };

            if n == 0 {
                continue;
            }

            let frame = RecvFrame {
                pkt: buf[..n].to_vec(),
                src,
                at: Instant::now(),
            };

            tokio::select! {
                () = self.token.cancelled() => break,
                sent = self.out.send(frame) => {
                    if sent.is_err() {
                        break;
                    }
                }
            }
        }

        self.conn.close();
    }
}
