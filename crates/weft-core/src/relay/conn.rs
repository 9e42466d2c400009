//! Restartable connection to one relay server.
//!
//! The connection holds no link while idle. Queuing a packet, or being
//! asked to stay connected, makes it dial. While linked it pumps queued
//! packets out and received packets back to the Relay Manager, and drops
//! the link again once it has been idle for the idle period.

use super::{RelayDialer, RelayLink};
use crate::actor::message::RelayedPeerFrame;
use crate::actor::spawn_supervised;
use crate::peerstate::ESTABLISHMENT_RETRY_MAX;
use crate::types::{RelayId, RelayInfo};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{Notify, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use weft_crypto::NodePublic;

/// How often a linked connection checks whether it went idle.
const IDLE_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// A lost link that lived at least this long, or received anything, does
/// not count as a failed dial.
const STABLE_LINK: Duration = Duration::from_secs(10);

/// Delay before redialling after `failures` consecutive failed dials.
pub(crate) fn redial_delay(base: Duration, failures: u32) -> Duration {
    let factor = 2u32.saturating_pow(failures.saturating_sub(1).min(16));
    base.saturating_mul(factor).min(ESTABLISHMENT_RETRY_MAX)
}

/// Bounded outbound buffer that drops its oldest packet when full.
#[derive(Debug)]
struct SendQueue {
    packets: Mutex<VecDeque<(NodePublic, Vec<u8>)>>,
    capacity: usize,
    notify: Notify,
}

impl SendQueue {
    fn new(capacity: usize) -> Self {
        Self {
            packets: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            notify: Notify::new(),
        }
    }

    /// Enqueue, returning true if the oldest packet had to go.
    fn push(&self, dst: NodePublic, pkt: Vec<u8>) -> bool {
        let dropped = {
            let mut q = self.packets.lock().unwrap_or_else(PoisonError::into_inner);
            let dropped = q.len() >= self.capacity && q.pop_front().is_some();
            q.push_back((dst, pkt));
            dropped
        };
        self.notify.notify_one();
        dropped
    }

    fn pop(&self) -> Option<(NodePublic, Vec<u8>)> {
        self.packets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }

    fn is_empty(&self) -> bool {
        self.packets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }
}

/// Manager-side handle of a [`RestartableRelayConn`].
#[derive(Debug)]
pub(crate) struct RelayConnHandle {
    id: RelayId,
    queue: Arc<SendQueue>,
    stay: watch::Sender<bool>,
    info: watch::Sender<RelayInfo>,
    connected: Arc<AtomicBool>,
    token: CancellationToken,
}

impl RelayConnHandle {
    /// Queue a packet for `dst` without blocking.
    pub(crate) fn queue(&self, dst: NodePublic, pkt: Vec<u8>) {
        if self.queue.push(dst, pkt) {
            tracing::debug!(relay = self.id, "relay send buffer full, dropped oldest packet");
        }
    }

    /// Replace the relay definition; an open link is closed and redialled.
    pub(crate) fn update(&self, info: RelayInfo) {
        self.info.send_replace(info);
    }

    /// Keep the link up even without traffic.
    pub(crate) fn stay_connected(&self, stay: bool) {
        self.stay.send_replace(stay);
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }
}

impl Drop for RelayConnHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Why a link stopped being pumped.
#[derive(Debug, PartialEq, Eq)]
enum LinkEnd {
    Cancelled,
    Idle,
    Updated,
    Lost,
}

pub(crate) struct RestartableRelayConn {
    id: RelayId,
    dialer: Arc<dyn RelayDialer>,
    queue: Arc<SendQueue>,
    stay: watch::Receiver<bool>,
    info: watch::Receiver<RelayInfo>,
    connected: Arc<AtomicBool>,
    frames: mpsc::Sender<RelayedPeerFrame>,
    token: CancellationToken,
    idle_after: Duration,
    retry: Duration,
    last_activity: Option<Instant>,
    link_received: bool,
}

impl RestartableRelayConn {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        info: RelayInfo,
        stay: bool,
        dialer: Arc<dyn RelayDialer>,
        frames: mpsc::Sender<RelayedPeerFrame>,
        token: CancellationToken,
        buffer: usize,
        idle_after: Duration,
        retry: Duration,
    ) -> (Self, RelayConnHandle) {
        let id = info.id;
        let queue = Arc::new(SendQueue::new(buffer));
        let connected = Arc::new(AtomicBool::new(false));
        let (stay_tx, stay_rx) = watch::channel(stay);
        let (info_tx, info_rx) = watch::channel(info);

        let handle = RelayConnHandle {
            id,
            queue: Arc::clone(&queue),
            stay: stay_tx,
            info: info_tx,
            connected: Arc::clone(&connected),
            token: token.clone(),
        };
        let conn = Self {
            id,
            dialer,
            queue,
            stay: stay_rx,
            info: info_rx,
            connected,
            frames,
            token,
            idle_after,
            retry,
            last_activity: None,
            link_received: false,
        };
        (conn, handle)
    }

    pub(crate) fn spawn(self) -> JoinHandle<()> {
        spawn_supervised("relay_conn", self.token.clone(), self.run())
    }

    fn note_activity(&mut self) {
        self.last_activity = Some(Instant::now());
    }

    fn should_idle(&self) -> bool {
        if *self.stay.borrow() {
            return false;
        }
        self.last_activity
            .is_none_or(|at| Instant::now() > at + self.idle_after)
    }

    /// Wait for something that may end idleness. False once stopped.
    async fn wait_idle(&mut self) -> bool {
        tokio::select! {
            () = self.token.cancelled() => false,
            changed = self.stay.changed() => changed.is_ok(),
            changed = self.info.changed() => changed.is_ok(),
            () = self.queue.notify.notified() => true,
        }
    }

    async fn run(mut self) {
        let mut failures = 0u32;

        loop {
            if self.should_idle() && self.queue.is_empty() {
                if !self.wait_idle().await {
                    break;
                }
                continue;
            }
            if !self.queue.is_empty() {
                self.note_activity();
            }

            let info = self.info.borrow_and_update().clone();
            let link_token = self.token.child_token();
            let dialed = tokio::select! {
                () = self.token.cancelled() => break,
                r = self.dialer.dial(&info, link_token.clone()) => r,
            };

            let link = match dialed {
                Ok(link) => link,
                Err(e) => {
                    failures = failures.saturating_add(1);
                    let delay = redial_delay(self.retry, failures);
                    tracing::warn!(relay = self.id, error = %e, failures, ?delay, "failed to establish connection to relay");
                    tokio::select! {
                        () = self.token.cancelled() => break,
                        () = tokio::time::sleep(delay) => continue,
                    }
                }
            };

            tracing::debug!(relay = self.id, "relay link established");
            let linked_at = Instant::now();
            self.link_received = false;
            self.connected.store(true, Ordering::Relaxed);
            let end = self.pump(link).await;
            self.connected.store(false, Ordering::Relaxed);
            link_token.cancel();

            match end {
                LinkEnd::Cancelled => break,
                LinkEnd::Idle => {
                    failures = 0;
                    tracing::debug!(relay = self.id, "closed idle relay link");
                }
                LinkEnd::Updated => {
                    failures = 0;
                    tracing::debug!(relay = self.id, "relay updated, reconnecting");
                }
                LinkEnd::Lost => {
                    if self.link_received || linked_at.elapsed() >= STABLE_LINK {
                        failures = 0;
                    } else {
                        failures = failures.saturating_add(1);
                    }
                    let delay = redial_delay(self.retry, failures.max(1));
                    tracing::warn!(relay = self.id, failures, ?delay, "relay link lost");
                    tokio::select! {
                        () = self.token.cancelled() => break,
                        () = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        tracing::trace!(relay = self.id, "relay conn stopped");
    }

    async fn pump(&mut self, mut link: RelayLink) -> LinkEnd {
        let mut checker = tokio::time::interval(IDLE_CHECK_INTERVAL);
        checker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        if let Err(end) = self.flush(&link).await {
            return end;
        }

        loop {
            tokio::select! {
                () = self.token.cancelled() => return LinkEnd::Cancelled,
                _ = checker.tick() => {
                    if self.should_idle() {
                        return LinkEnd::Idle;
                    }
                }
                changed = self.info.changed() => {
                    return if changed.is_ok() { LinkEnd::Updated } else { LinkEnd::Cancelled };
                }
                () = self.queue.notify.notified() => {
                    if let Err(end) = self.flush(&link).await {
                        return end;
                    }
                }
                recv = link.recv.recv() => {
                    let Some((peer, pkt)) = recv else {
                        return LinkEnd::Lost;
                    };
                    self.note_activity();
                    self.link_received = true;
                    let frame = RelayedPeerFrame { relay: self.id, peer, pkt };
                    tokio::select! {
                        () = self.token.cancelled() => return LinkEnd::Cancelled,
                        sent = self.frames.send(frame) => {
                            if sent.is_err() {
                                return LinkEnd::Cancelled;
                            }
                        }
                    }
                }
            }
        }
    }

    /// Drain the send queue into the link.
    async fn flush(&mut self, link: &RelayLink) -> Result<(), LinkEnd> {
        while let Some(pkt) = self.queue.pop() {
            self.note_activity();
            tokio::select! {
                () = self.token.cancelled() => return Err(LinkEnd::Cancelled),
                sent = link.send.send(pkt) => {
                    if sent.is_err() {
                        return Err(LinkEnd::Lost);
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{EngineError, Result};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;

    const PEER: NodePublic = NodePublic::from_bytes([1; 32]);
    const RETRY: Duration = Duration::from_secs(5);
    const IDLE: Duration = Duration::from_secs(60);

    fn info(domain: &str) -> RelayInfo {
        RelayInfo {
            id: 3,
            key: NodePublic::from_bytes([3; 32]),
            domain: domain.into(),
            cert_cn: None,
            ips: None,
            stun_port: None,
            https_port: None,
            http_port: None,
            is_insecure: false,
        }
    }

    /// Far side of a dialled link.
    struct Remote {
        info: RelayInfo,
        outbound: mpsc::Receiver<(NodePublic, Vec<u8>)>,
        inbound: mpsc::Sender<(NodePublic, Vec<u8>)>,
    }

    /// Fails the first `fail_first` dials, then hands out links. With
    /// `dead_links` every link it hands out is already closed by the far side.
    struct ScriptedDialer {
        fail_first: u32,
        dead_links: bool,
        attempts: AtomicU32,
        dialed_at: Mutex<Vec<Instant>>,
        remotes: mpsc::UnboundedSender<Remote>,
    }

    impl ScriptedDialer {
        fn new(fail_first: u32) -> (Arc<Self>, mpsc::UnboundedReceiver<Remote>) {
            let (remotes, rx) = mpsc::unbounded_channel();
            let dialer = Arc::new(Self {
                fail_first,
                dead_links: false,
                attempts: AtomicU32::new(0),
                dialed_at: Mutex::new(Vec::new()),
                remotes,
            });
            (dialer, rx)
        }

        fn dead_links() -> Arc<Self> {
            let (remotes, _) = mpsc::unbounded_channel();
            Arc::new(Self {
                fail_first: 0,
                dead_links: true,
                attempts: AtomicU32::new(0),
                dialed_at: Mutex::new(Vec::new()),
                remotes,
            })
        }
    }

    #[async_trait]
    impl RelayDialer for ScriptedDialer {
        async fn dial(&self, info: &RelayInfo, _token: CancellationToken) -> Result<RelayLink> {
            self.dialed_at.lock().unwrap().push(Instant::now());
            if self.attempts.fetch_add(1, Ordering::SeqCst) < self.fail_first {
                return Err(EngineError::Relay("refused".into()));
            }

            let (send, outbound) = mpsc::channel(8);
            let (inbound, recv) = mpsc::channel(8);
            if self.dead_links {
                return Ok(RelayLink { send, recv });
            }
            let _ = self.remotes.send(Remote {
                info: info.clone(),
                outbound,
                inbound,
            });
            Ok(RelayLink { send, recv })
        }
    }

    fn conn(
        stay: bool,
        dialer: Arc<ScriptedDialer>,
    ) -> (RelayConnHandle, mpsc::Receiver<RelayedPeerFrame>) {
        let (frames_tx, frames) = mpsc::channel(8);
        let (c, handle) = RestartableRelayConn::new(
            info("relay.example"),
            stay,
            dialer,
            frames_tx,
            CancellationToken::new(),
            4,
            IDLE,
            RETRY,
        );
        c.spawn();
        (handle, frames)
    }

    #[test]
    fn test_redial_delay_doubles_and_caps() {
        assert_eq!(redial_delay(RETRY, 1), Duration::from_secs(5));
        assert_eq!(redial_delay(RETRY, 2), Duration::from_secs(10));
        assert_eq!(redial_delay(RETRY, 4), Duration::from_secs(40));
        assert_eq!(redial_delay(RETRY, 10), ESTABLISHMENT_RETRY_MAX);
        assert_eq!(redial_delay(RETRY, u32::MAX), ESTABLISHMENT_RETRY_MAX);
    }

    #[test]
    fn test_queue_drops_oldest_when_full() {
        let q = SendQueue::new(2);
        assert!(!q.push(PEER, vec![1]));
        assert!(!q.push(PEER, vec![2]));
        assert!(q.push(PEER, vec![3]));

        assert_eq!(q.pop(), Some((PEER, vec![2])));
        assert_eq!(q.pop(), Some((PEER, vec![3])));
        assert!(q.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_until_packet_queued() {
        let (dialer, mut remotes) = ScriptedDialer::new(0);
        let (handle, mut frames) = conn(false, dialer.clone());

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(remotes.try_recv().is_err());

        handle.queue(PEER, b"hello".to_vec());
        let mut remote = remotes.recv().await.unwrap();
        assert_eq!(remote.outbound.recv().await.unwrap(), (PEER, b"hello".to_vec()));
        assert!(handle.is_connected());

        remote.inbound.send((PEER, b"back".to_vec())).await.unwrap();
        let frame = frames.recv().await.unwrap();
        assert_eq!((frame.relay, frame.peer, frame.pkt), (3, PEER, b"back".to_vec()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_link_is_closed() {
        let (dialer, mut remotes) = ScriptedDialer::new(0);
        let (handle, _frames) = conn(false, dialer);

        handle.queue(PEER, b"x".to_vec());
        let mut remote = remotes.recv().await.unwrap();
        remote.outbound.recv().await.unwrap();

        // The link goes away after the idle period.
        assert!(remote.outbound.recv().await.is_none());
        assert!(!handle.is_connected());
        assert!(remotes.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stay_connected_dials_and_keeps_link() {
        let (dialer, mut remotes) = ScriptedDialer::new(0);
        let (handle, _frames) = conn(false, dialer);

        handle.stay_connected(true);
        let mut remote = remotes.recv().await.unwrap();

        tokio::time::sleep(IDLE * 3).await;
        assert!(handle.is_connected());
        assert!(remote.outbound.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_dials_back_off() {
        let (dialer, mut remotes) = ScriptedDialer::new(3);
        let (_handle, _frames) = conn(true, dialer.clone());

        remotes.recv().await.unwrap();
        let at = dialer.dialed_at.lock().unwrap().clone();
        assert_eq!(at.len(), 4);
        let gaps: Vec<u64> = at.windows(2).map(|w| (w[1] - w[0]).as_secs()).collect();
        assert_eq!(gaps, vec![5, 10, 20]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_link_respects_backoff() {
        let dialer = ScriptedDialer::dead_links();
        let (_handle, _frames) = conn(true, dialer.clone());

        tokio::time::sleep(Duration::from_secs(36)).await;
        let at = dialer.dialed_at.lock().unwrap().clone();
        assert_eq!(at.len(), 4);
        let gaps: Vec<u64> = at.windows(2).map(|w| (w[1] - w[0]).as_secs()).collect();
        assert_eq!(gaps, vec![5, 10, 20]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_link_after_traffic_redials_after_base_delay() {
        let (dialer, mut remotes) = ScriptedDialer::new(0);
        let (_handle, mut frames) = conn(true, dialer.clone());

        let remote = remotes.recv().await.unwrap();
        remote.inbound.send((PEER, b"hi".to_vec())).await.unwrap();
        frames.recv().await.unwrap();
        drop(remote);

        remotes.recv().await.unwrap();
        let at = dialer.dialed_at.lock().unwrap().clone();
        assert_eq!(at.len(), 2);
        assert_eq!((at[1] - at[0]).as_secs(), RETRY.as_secs());
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_redials_with_new_info() {
        let (dialer, mut remotes) = ScriptedDialer::new(0);
        let (handle, _frames) = conn(true, dialer);

        let mut first = remotes.recv().await.unwrap();
        assert_eq!(first.info.domain, "relay.example");

        handle.update(info("relay2.example"));
        let second = remotes.recv().await.unwrap();
        assert_eq!(second.info.domain, "relay2.example");
        assert!(first.outbound.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_handle_stops_conn() {
        let (dialer, mut remotes) = ScriptedDialer::new(0);
        let (handle, _frames) = conn(true, dialer);
        let mut remote = remotes.recv().await.unwrap();

        drop(handle);
        assert!(remote.outbound.recv().await.is_none());
    }
}
