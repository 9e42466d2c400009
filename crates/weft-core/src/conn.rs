//! Per-peer connection pair.
//!
//! The OutConn carries packets from the local tunnel interface towards the
//! peer, over a relay or directly. The InConn writes packets from the peer
//! back into the tunnel interface. Both share the backend socket and report
//! activity to the Traffic Manager.

use crate::actor::message::{DirectWrite, OutConnMsg, OutConnUse, RecvFrame, RelayWrite, TrafficMsg};
use crate::actor::{Mailbox, mailbox, spawn_supervised};
use crate::sockrecv::SockRecv;
use crate::stage::StageInner;
use crate::types::RelayId;
use std::future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use weft_crypto::NodePublic;
use weft_transport::UdpConn;

/// Bump/unbump bookkeeping shared by both halves of the pair.
#[derive(Debug)]
struct Activity {
    peer: NodePublic,
    is_in: bool,
    active: bool,
    idle_at: Option<Instant>,
    idle_after: Duration,
}

impl Activity {
    fn new(peer: NodePublic, is_in: bool, idle_after: Duration) -> Self {
        Self {
            peer,
            is_in,
            active: false,
            idle_at: None,
            idle_after,
        }
    }

    fn bump(&mut self, traffic: &Mailbox<TrafficMsg>) {
        self.idle_at = Some(Instant::now() + self.idle_after);
        if !self.active {
            self.active = true;
            self.report(traffic);
        }
    }

    fn unbump(&mut self, traffic: &Mailbox<TrafficMsg>) {
        self.idle_at = None;
        self.active = false;
        self.report(traffic);
    }

    fn report(&self, traffic: &Mailbox<TrafficMsg>) {
        traffic.post(TrafficMsg::ConnActivity {
            peer: self.peer,
            is_in: self.is_in,
            active: self.active,
        });
    }

    async fn idle(idle_at: Option<Instant>) {
        match idle_at {
            Some(at) => tokio::time::sleep_until(at).await,
            None => future::pending().await,
        }
    }

    fn goodbye(&self, traffic: &Mailbox<TrafficMsg>) {
        traffic.post(TrafficMsg::ConnGoodBye {
            peer: self.peer,
            is_in: self.is_in,
        });
    }
}

/// Stage-side handle of a running OutConn.
#[derive(Debug, Clone)]
pub struct OutConnHandle {
    inbox: Mailbox<OutConnMsg>,
    token: CancellationToken,
}

impl OutConnHandle {
    /// Switch the outbound path.
    pub fn use_path(&self, path: OutConnUse) {
        self.inbox.post(OutConnMsg::Use(path));
    }

    /// Re-read peer info (home relay) if tracking it.
    pub fn sync_peer_info(&self) {
        self.inbox.post(OutConnMsg::SyncPeerInfo);
    }

    /// Lifetime token.
    #[must_use]
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// True once the OutConn (or its socket) has died.
    #[must_use]
    pub fn is_dead(&self) -> bool {
        self.token.is_cancelled()
    }

    #[cfg(test)]
    pub(crate) fn detached(capacity: usize) -> (Self, mpsc::Receiver<OutConnMsg>) {
        let (inbox, rx) = mailbox(
            "out_conn",
            capacity,
            Duration::from_secs(1),
            Arc::default(),
        );
        let handle = Self {
            inbox,
            token: CancellationToken::new(),
        };
        (handle, rx)
    }
}

/// Outbound half: tunnel interface to relay or direct path.
pub struct OutConn {
    peer: NodePublic,
    stage: Arc<StageInner>,
    token: CancellationToken,
    inbox: mpsc::Receiver<OutConnMsg>,
    sock: Option<SockRecv>,
    frames: mpsc::Receiver<RecvFrame>,
    path: OutConnUse,
    to_relay: RelayId,
    activity: Activity,
}

impl OutConn {
    /// Build an OutConn reading `conn`, starting on the peer's home relay.
    pub(crate) fn new(
        peer: NodePublic,
        conn: Arc<dyn UdpConn>,
        stage: Arc<StageInner>,
    ) -> (Self, OutConnHandle) {
        let cfg = &stage.config;
        let token = stage.token.child_token();
        let (sock, frames) = SockRecv::new(
            conn,
            token.child_token(),
            cfg.channels.sock_recv_frames,
            cfg.timing.sock_read_timeout(),
        );
        let (inbox_tx, inbox) = mailbox(
            "out_conn",
            cfg.channels.out_conn_inbox,
            cfg.timing.send_timeout(),
            Arc::clone(&stage.drops),
        );
        let to_relay = stage.peer_info(&peer).map_or(0, |pi| pi.home_relay);
        let activity = Activity::new(peer, false, cfg.timing.conn_activity());

        let handle = OutConnHandle {
            inbox: inbox_tx,
            token: token.clone(),
        };
        let out = Self {
            peer,
            stage,
            token,
            inbox,
            sock: Some(sock),
            frames,
            path: OutConnUse::TrackHome,
            to_relay,
            activity,
        };
        (out, handle)
    }

    /// Run under supervision, together with the socket receiver.
    pub fn spawn(self) -> JoinHandle<()> {
        spawn_supervised("out_conn", self.token.clone(), self.run())
    }

    async fn run(mut self) {
        let Some(sock) = self.sock.take() else {
            return;
        };
        let sock_token = sock.token().clone();
        sock.spawn();

        loop {
            tokio::select! {
                () = self.token.cancelled() => break,
                () = sock_token.cancelled() => {
                    tracing::debug!(peer = %self.peer, "socket receiver died, stopping outconn");
                    break;
                }
                () = Activity::idle(self.activity.idle_at) => {
                    self.activity.unbump(&self.stage.handles.traffic);
                }
                Some(msg) = self.inbox.recv() => self.handle(msg),
                frame = self.frames.recv() => match frame {
                    Some(frame) => self.forward(frame.pkt).await,
                    None => break,
                },
            }
        }

        self.close();
    }

    fn handle(&mut self, msg: OutConnMsg) {
        match msg {
            OutConnMsg::Use(path) => {
                tracing::debug!(peer = %self.peer, ?path, "switching outconn path");
                self.path = path;
                match path {
                    OutConnUse::Relay(relay) => self.to_relay = relay,
                    OutConnUse::TrackHome => self.track_home(),
                    OutConnUse::Direct(_) => {}
                }
            }
            OutConnMsg::SyncPeerInfo => {
                if self.path == OutConnUse::TrackHome {
                    self.track_home();
                }
            }
        }
    }

    fn track_home(&mut self) {
        match self.stage.peer_info(&self.peer) {
            Some(pi) => self.to_relay = pi.home_relay,
            None => {
                tracing::warn!(peer = %self.peer, "tried to update home relay, peer info is gone");
            }
        }
    }

    async fn forward(&mut self, pkt: Vec<u8>) {
        let handles = &self.stage.handles;
        match self.path {
            OutConnUse::Direct(addr) => {
                handles.direct_writes.send(DirectWrite { addr, pkt }).await;
            }
            OutConnUse::Relay(_) | OutConnUse::TrackHome => {
                handles
                    .relay_writes
                    .send(RelayWrite {
                        relay: self.to_relay,
                        dst: self.peer,
                        pkt,
                    })
                    .await;
            }
        }
        self.activity.bump(&handles.traffic);
    }

    fn close(&mut self) {
        self.token.cancel();
        self.activity.goodbye(&self.stage.handles.traffic);
        tracing::debug!(peer = %self.peer, "closed outconn");
    }
}

/// Stage-side handle of a running InConn.
#[derive(Debug, Clone)]
pub struct InConnHandle {
    frames: Mailbox<Vec<u8>>,
    token: CancellationToken,
}

impl InConnHandle {
    /// Queue a packet for the tunnel interface; dropped if the queue is full.
    pub fn forward_packet(&self, pkt: Vec<u8>) -> bool {
        self.frames.try_post(pkt)
    }

    /// Lifetime token.
    #[must_use]
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// True once the InConn has died.
    #[must_use]
    pub fn is_dead(&self) -> bool {
        self.token.is_cancelled()
    }

    #[cfg(test)]
    pub(crate) fn detached(capacity: usize) -> (Self, mpsc::Receiver<Vec<u8>>) {
        let (frames, rx) = mailbox("in_conn", capacity, Duration::from_secs(1), Arc::default());
        let handle = Self {
            frames,
            token: CancellationToken::new(),
        };
        (handle, rx)
    }
}

/// Inbound half: packets from the peer into the tunnel interface.
pub struct InConn {
    peer: NodePublic,
    conn: Arc<dyn UdpConn>,
    stage: Arc<StageInner>,
    token: CancellationToken,
    frames: mpsc::Receiver<Vec<u8>>,
    activity: Activity,
}

impl InConn {
    /// Build an InConn writing to `conn`.
    pub(crate) fn new(
        peer: NodePublic,
        conn: Arc<dyn UdpConn>,
        stage: Arc<StageInner>,
    ) -> (Self, InConnHandle) {
        let cfg = &stage.config;
        let token = stage.token.child_token();
        let (tx, frames) = mailbox(
            "in_conn",
            cfg.channels.in_conn_frames,
            cfg.timing.send_timeout(),
            Arc::clone(&stage.drops),
        );
        let activity = Activity::new(peer, true, cfg.timing.conn_activity());

        let handle = InConnHandle {
            frames: tx,
            token: token.clone(),
        };
        let inc = Self {
            peer,
            conn,
            stage,
            token,
            frames,
            activity,
        };
        (inc, handle)
    }

    /// Run under supervision.
    pub fn spawn(self) -> JoinHandle<()> {
        spawn_supervised("in_conn", self.token.clone(), self.run())
    }

    async fn run(mut self) {
        loop {
            tokio::select! {
                () = self.token.cancelled() => break,
                () = Activity::idle(self.activity.idle_at) => {
                    self.activity.unbump(&self.stage.handles.traffic);
                }
                pkt = self.frames.recv() => {
                    let Some(pkt) = pkt else { break };
                    match self.conn.send(&pkt).await {
                        Ok(n) if n != pkt.len() => {
                            tracing::warn!(peer = %self.peer, expected = pkt.len(), got = n, "short write on backend socket");
                        }
                        Ok(_) => {}
                        Err(e) => {
                            tracing::warn!(peer = %self.peer, error = %e, "writing to backend socket failed");
                            break;
                        }
                    }
                    self.activity.bump(&self.stage.handles.traffic);
                }
            }
        }

        self.token.cancel();
        self.activity.goodbye(&self.stage.handles.traffic);
        tracing::debug!(peer = %self.peer, "closed inconn");
    }
}
