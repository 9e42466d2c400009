//! Relay path: one restartable connection per relay, the manager that owns
//! them and picks our home relay, and the router for relayed packets.

mod conn;

use crate::actor::message::{RelayManMsg, RelayWrite, RelayedPeerFrame, SessionMsg};
use crate::actor::spawn_supervised;
use crate::error::Result;
use crate::msgsess::looks_like_session_message;
use crate::stage::StageInner;
use crate::types::{RelayId, RelayInfo};
use async_trait::async_trait;
use conn::{RelayConnHandle, RestartableRelayConn};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use weft_crypto::NodePublic;

/// Latencies at or above this never win home relay selection.
pub const MAX_RELAY_LATENCY: Duration = Duration::from_secs(60);

/// An established link to a relay server.
///
/// The link is finished when `recv` yields `None`; dropping `send` asks the
/// dialer's side to close it.
#[derive(Debug)]
pub struct RelayLink {
    /// Outbound packets, by destination peer
    pub send: mpsc::Sender<(NodePublic, Vec<u8>)>,
    /// Inbound packets, by source peer
    pub recv: mpsc::Receiver<(NodePublic, Vec<u8>)>,
}

/// Connects to relay servers.
///
/// The relay client protocol lives behind this trait. `token` is cancelled
/// when the engine is done with the link.
#[async_trait]
pub trait RelayDialer: Send + Sync {
    /// Establish a link to `info`.
    ///
    /// # Errors
    ///
    /// Returns an error if the relay cannot be reached or refuses us.
    async fn dial(&self, info: &RelayInfo, token: CancellationToken) -> Result<RelayLink>;
}

/// Lowest latency under [`MAX_RELAY_LATENCY`], ties going to the lower id.
#[must_use]
pub fn select_relay(latencies: &HashMap<RelayId, Duration>) -> Option<RelayId> {
    latencies
        .iter()
        .filter(|(_, lat)| **lat < MAX_RELAY_LATENCY)
        .min_by_key(|(id, lat)| (**lat, **id))
        .map(|(id, _)| *id)
}

// ═══════════════════════════════════════════════════════════════════════════
// Relay Manager
// ═══════════════════════════════════════════════════════════════════════════

/// Owner of every relay connection.
pub struct RelayManager {
    stage: Arc<StageInner>,
    token: CancellationToken,
    dialer: Arc<dyn RelayDialer>,
    inbox: mpsc::Receiver<RelayManMsg>,
    writes: mpsc::Receiver<RelayWrite>,
    frames_tx: mpsc::Sender<RelayedPeerFrame>,
    frames: mpsc::Receiver<RelayedPeerFrame>,
    relays: HashMap<RelayId, RelayConnHandle>,
    home: RelayId,
    last_home_change: Option<Instant>,
}

impl RelayManager {
    pub(crate) fn new(
        stage: Arc<StageInner>,
        dialer: Arc<dyn RelayDialer>,
        inbox: mpsc::Receiver<RelayManMsg>,
        writes: mpsc::Receiver<RelayWrite>,
    ) -> Self {
        let token = stage.token.child_token();
        let (frames_tx, frames) = mpsc::channel(stage.config.channels.relay_man_frames);
        Self {
            stage,
            token,
            dialer,
            inbox,
            writes,
            frames_tx,
            frames,
            relays: HashMap::new(),
            home: 0,
            last_home_change: None,
        }
    }

    /// Run under supervision.
    pub fn spawn(self) -> JoinHandle<()> {
        spawn_supervised("relay_manager", self.token.clone(), self.run())
    }

    async fn run(mut self) {
        loop {
            tokio::select! {
                biased;
                () = self.token.cancelled() => break,
                Some(msg) = self.inbox.recv() => self.handle(msg),
                Some(write) = self.writes.recv() => self.write(write),
                Some(frame) = self.frames.recv() => {
                    self.stage.handles.relay_frames.send(frame).await;
                }
            }
        }

        self.relays.clear();
    }

    fn handle(&mut self, msg: RelayManMsg) {
        match msg {
            RelayManMsg::UpdateRelays(infos) => {
                for info in infos {
                    self.update(info);
                }
            }
            RelayManMsg::LatencyResults(latencies) => self.on_latencies(&latencies),
        }
    }

    fn update(&mut self, info: RelayInfo) {
        if let Some(existing) = self.relays.get(&info.id) {
            tracing::debug!(relay = info.id, "updating relay definition");
            existing.update(info);
            return;
        }

        let id = info.id;
        let cfg = &self.stage.config;
        let (conn, handle) = RestartableRelayConn::new(
            info,
            id == self.home,
            Arc::clone(&self.dialer),
            self.frames_tx.clone(),
            self.token.child_token(),
            cfg.channels.relay_conn_send_buffer,
            cfg.timing.relay_idle(),
            cfg.timing.relay_retry(),
        );
        conn.spawn();
        self.relays.insert(id, handle);
        tracing::debug!(relay = id, "added relay");
    }

    fn on_latencies(&mut self, latencies: &HashMap<RelayId, Duration>) {
        for (relay, latency) in latencies {
            tracing::trace!(relay, ?latency, "relay latency");
        }

        let Some(new) = select_relay(latencies) else {
            tracing::debug!("no relay latency under the ceiling, keeping home relay");
            return;
        };
        let old = self.home;
        if new == old {
            return;
        }

        let now = Instant::now();
        let too_soon = self
            .last_home_change
            .is_some_and(|at| now < at + self.stage.config.timing.home_relay_change());
        if too_soon {
            let old_connected = self.relays.get(&old).is_some_and(RelayConnHandle::is_connected);
            if old_connected {
                tracing::warn!(
                    old_relay = old,
                    new_relay = new,
                    "home relay change suggested, but too soon since the latest change"
                );
                return;
            }
            tracing::warn!(
                old_relay = old,
                new_relay = new,
                "changing home relay early; old home relay is not connected"
            );
        }

        self.home = new;
        if let Some(c) = self.relays.get(&old) {
            c.stay_connected(false);
        }
        if let Some(c) = self.relays.get(&new) {
            c.stay_connected(true);
        }
        tracing::info!(old_relay = old, new_relay = new, "chose new home relay based on latency");

        if let Err(e) = self.stage.control.update_home_relay(new) {
            tracing::warn!(error = %e, "failed to update home relay");
        }
        self.last_home_change = Some(now);
    }

    fn write(&self, write: RelayWrite) {
        match self.relays.get(&write.relay) {
            Some(conn) => conn.queue(write.dst, write.pkt),
            None => tracing::warn!(
                to_relay = write.relay,
                to_peer = %write.dst,
                "cannot forward to relay; unknown relay"
            ),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Relay Router
// ═══════════════════════════════════════════════════════════════════════════

/// Routes packets received through relays.
pub struct RelayRouter {
    stage: Arc<StageInner>,
    token: CancellationToken,
    frames: mpsc::Receiver<RelayedPeerFrame>,
}

impl RelayRouter {
    pub(crate) fn new(stage: Arc<StageInner>, frames: mpsc::Receiver<RelayedPeerFrame>) -> Self {
        let token = stage.token.child_token();
        Self {
            stage,
            token,
            frames,
        }
    }

    /// Run under supervision.
    pub fn spawn(self) -> JoinHandle<()> {
        spawn_supervised("relay_router", self.token.clone(), self.run())
    }

    async fn run(mut self) {
        loop {
            tokio::select! {
                () = self.token.cancelled() => break,
                frame = self.frames.recv() => match frame {
                    Some(frame) => self.route(frame).await,
                    None => break,
                },
            }
        }
    }

    async fn route(&self, frame: RelayedPeerFrame) {
        if looks_like_session_message(&frame.pkt) {
            self.stage
                .handles
                .session
                .send(SessionMsg::FrameFromRelay {
                    relay: frame.relay,
                    peer: frame.peer,
                    frame: frame.pkt,
                })
                .await;
            return;
        }

        match self.stage.in_conn_for(&frame.peer) {
            Some(inc) => {
                inc.forward_packet(frame.pkt);
            }
            None => {
                tracing::trace!(relay = frame.relay, peer = %frame.peer, "unroutable relay frame");
                self.stage.unroutable.relay.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}
