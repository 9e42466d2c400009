//! Direct path: the external UDP socket and the router behind it.
//!
//! The [`DirectManager`] owns the external socket. It performs literal
//! writes and pushes every datagram it reads to the [`DirectRouter`], which
//! classifies it:
//!
//! 1. from a STUN target of the current round: to the Endpoint Manager
//! 2. starts with the session magic: to the Session Manager
//! 3. from an address known to be a peer: to that peer's InConn
//! 4. anything else is dropped

use crate::actor::message::{
    DirectRouterMsg, DirectWrite, DirectedPeerFrame, EndpointMsg, RecvFrame, SessionMsg,
};
use crate::actor::spawn_supervised;
use crate::addr;
use crate::msgsess::looks_like_session_message;
use crate::sockrecv::SockRecv;
use crate::stage::StageInner;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use weft_crypto::NodePublic;
use weft_transport::UdpConn;

/// Owner of the external socket.
pub struct DirectManager {
    stage: Arc<StageInner>,
    token: CancellationToken,
    conn: Arc<dyn UdpConn>,
    writes: mpsc::Receiver<DirectWrite>,
    sock: Option<SockRecv>,
    frames: mpsc::Receiver<RecvFrame>,
}

impl DirectManager {
    pub(crate) fn new(
        stage: Arc<StageInner>,
        conn: Arc<dyn UdpConn>,
        writes: mpsc::Receiver<DirectWrite>,
    ) -> Self {
        let token = stage.token.child_token();
        let (sock, frames) = SockRecv::new(
            Arc::clone(&conn),
            token.child_token(),
            stage.config.channels.sock_recv_frames,
            stage.config.timing.sock_read_timeout(),
        );
        Self {
            stage,
            token,
            conn,
            writes,
            sock: Some(sock),
            frames,
        }
    }

    /// Run under supervision, together with the socket receiver.
    pub fn spawn(self) -> JoinHandle<()> {
        spawn_supervised("direct_manager", self.token.clone(), self.run())
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
                    tracing::error!("external socket receiver died");
                    break;
                }
                Some(write) = self.writes.recv() => {
                    tracing::trace!(to = %write.addr, len = write.pkt.len(), "direct: writing");
                    if let Err(e) = self.conn.send_to(&write.pkt, write.addr).await {
                        tracing::warn!(error = %e, to = %write.addr, "error writing to external socket");
                    }
                }
                frame = self.frames.recv() => {
                    let Some(frame) = frame else { break };
                    let frame = DirectedPeerFrame {
                        src: addr::normalise(frame.src),
                        at: frame.at,
                        pkt: frame.pkt,
                    };
                    self.stage.handles.direct_frames.send(frame).await;
                }
            }
        }

        self.conn.close();
    }
}

/// Classifies datagrams from the external socket.
pub struct DirectRouter {
    stage: Arc<StageInner>,
    token: CancellationToken,
    inbox: mpsc::Receiver<DirectRouterMsg>,
    frames: mpsc::Receiver<DirectedPeerFrame>,
    aka: HashMap<SocketAddr, NodePublic>,
    stun_endpoints: HashSet<SocketAddr>,
}

impl DirectRouter {
    pub(crate) fn new(
        stage: Arc<StageInner>,
        inbox: mpsc::Receiver<DirectRouterMsg>,
        frames: mpsc::Receiver<DirectedPeerFrame>,
    ) -> Self {
        let token = stage.token.child_token();
        Self {
            stage,
            token,
            inbox,
            frames,
            aka: HashMap::new(),
            stun_endpoints: HashSet::new(),
        }
    }

    /// Run under supervision.
    pub fn spawn(self) -> JoinHandle<()> {
        spawn_supervised("direct_router", self.token.clone(), self.run())
    }

    async fn run(mut self) {
        loop {
            tokio::select! {
                () = self.token.cancelled() => break,
                Some(msg) = self.inbox.recv() => self.handle(msg),
                frame = self.frames.recv() => match frame {
                    Some(frame) => self.route(frame).await,
                    None => break,
                },
            }
        }
    }

    fn handle(&mut self, msg: DirectRouterMsg) {
        match msg {
            DirectRouterMsg::AddKnownAs { peer, addr } => {
                let addr = addr::normalise(addr);
                tracing::info!(peer = %peer, addr = %addr, "peer known as address");
                self.aka.insert(addr, peer);
            }
            DirectRouterMsg::ClearKnownAs { peer } => {
                tracing::info!(peer = %peer, "clearing addresses of peer");
                self.aka.retain(|_, p| *p != peer);
            }
            DirectRouterMsg::PushStun { packets } => {
                self.stun_endpoints.clear();
                for (endpoint, pkt) in packets {
                    let addr = addr::normalise(endpoint);
                    self.stun_endpoints.insert(addr);
                    self.stage.handles.direct_writes.post(DirectWrite { addr, pkt });
                }
            }
        }
    }

    async fn route(&self, frame: DirectedPeerFrame) {
        let handles = &self.stage.handles;

        if self.stun_endpoints.contains(&frame.src) {
            handles.endpoint.post(EndpointMsg::StunResponse {
                endpoint: frame.src,
                pkt: frame.pkt,
                at: frame.at,
            });
            return;
        }

        if looks_like_session_message(&frame.pkt) {
            handles
                .session
                .send(SessionMsg::FrameFromAddr {
                    addr: frame.src,
                    frame: frame.pkt,
                })
                .await;
            return;
        }

        let inc = self
            .aka
            .get(&frame.src)
            .and_then(|peer| self.stage.in_conn_for(peer));
        match inc {
            Some(inc) => {
                inc.forward_packet(frame.pkt);
            }
            None => {
                tracing::trace!(src = %frame.src, len = frame.pkt.len(), "unroutable direct frame");
                self.stage.unroutable.direct.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}
