//! Endpoint Manager: periodic STUN rounds.
//!
//! A round sends one binding request to every configured STUN server and to
//! the STUN port of every relay with forced IPs. The requests go out through
//! the Direct Router, which routes replies from those targets back here. The
//! round ends when every target has answered or after the STUN timeout;
//! either way the mapped addresses become our STUN endpoints and the
//! per-relay latencies go to the Relay Manager.

use crate::actor::message::{DirectRouterMsg, EndpointMsg, RelayManMsg};
use crate::actor::spawn_supervised;
use crate::addr;
use crate::error::EngineError;
use crate::stage::StageInner;
use crate::types::{RelayId, RelayInfo, StunCodec, StunTxId};
use rand::RngCore;
use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Why a STUN response was rejected.
#[derive(Debug, Error)]
pub enum StunError {
    /// No round in progress
    #[error("STUN is not active")]
    NotActive,

    /// Reply from an address we did not query, or already answered
    #[error("response from unexpected address {0}")]
    UnexpectedSource(SocketAddr),

    /// Reply carried someone else's transaction id
    #[error("transaction id mismatch from {0}")]
    TxIdMismatch(SocketAddr),

    /// Codec rejected the bytes
    #[error("could not parse response: {0}")]
    Parse(#[from] EngineError),
}

struct Response {
    mapped: SocketAddr,
    from: SocketAddr,
    latency: Duration,
}

struct StunRound {
    requests: HashMap<SocketAddr, (StunTxId, Instant)>,
    relay_endpoints: HashMap<SocketAddr, RelayId>,
    responses: Vec<Response>,
    deadline: Instant,
}

/// STUN round driver.
pub struct EndpointManager {
    stage: Arc<StageInner>,
    token: CancellationToken,
    stun: Arc<dyn StunCodec>,
    inbox: mpsc::Receiver<EndpointMsg>,
    relays: HashMap<RelayId, RelayInfo>,
    did_startup: bool,
    round: Option<StunRound>,
}

impl EndpointManager {
    pub(crate) fn new(
        stage: Arc<StageInner>,
        stun: Arc<dyn StunCodec>,
        inbox: mpsc::Receiver<EndpointMsg>,
    ) -> Self {
        let token = stage.token.child_token();
        Self {
            stage,
            token,
            stun,
            inbox,
            relays: HashMap::new(),
            did_startup: false,
            round: None,
        }
    }

    /// Run under supervision.
    pub fn spawn(self) -> JoinHandle<()> {
        spawn_supervised("endpoint_manager", self.token.clone(), self.run())
    }

    async fn run(mut self) {
        let every = self.stage.config.timing.stun_interval();
        let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let deadline = self.round.as_ref().map(|r| r.deadline);
            tokio::select! {
                () = self.token.cancelled() => break,
                _ = ticker.tick() => self.start_round(),
                () = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.finalise(true);
                }
                msg = self.inbox.recv() => match msg {
                    Some(msg) => self.handle(msg),
                    None => break,
                },
            }
        }
    }

    fn handle(&mut self, msg: EndpointMsg) {
        match msg {
            EndpointMsg::UpdateRelays(infos) => {
                for info in infos {
                    self.relays.insert(info.id, info);
                }
                // First relay list: learn our endpoints now rather than at
                // the first tick.
                if !self.did_startup {
                    self.did_startup = true;
                    self.start_round();
                }
            }
            EndpointMsg::StunResponse { endpoint, pkt, at } => {
                if let Err(e) = self.on_response(endpoint, &pkt, at) {
                    tracing::error!(endpoint = %endpoint, error = %e, "error when processing STUN response");
                }
            }
        }
    }

    fn relay_stun_endpoints(&self) -> HashMap<SocketAddr, RelayId> {
        self.relays
            .values()
            .flat_map(|info| {
                info.stun_endpoints()
                    .into_iter()
                    .map(|ep| (addr::normalise(ep), info.id))
            })
            .collect()
    }

    fn start_round(&mut self) {
        if self.round.is_some() {
            tracing::error!("tried to start STUN while it was already underway");
            return;
        }

        let relay_endpoints = self.relay_stun_endpoints();
        let targets: BTreeSet<SocketAddr> = self
            .stage
            .config
            .stun_servers
            .iter()
            .map(|ep| addr::normalise(*ep))
            .chain(relay_endpoints.keys().copied())
            .collect();

        if targets.is_empty() {
            tracing::warn!("aborted STUN due to no endpoints");
            return;
        }

        let now = Instant::now();
        let mut rng = rand::thread_rng();
        let mut requests = HashMap::with_capacity(targets.len());
        let mut packets = HashMap::with_capacity(targets.len());
        for target in targets {
            let mut txid: StunTxId = [0; 12];
            rng.fill_bytes(&mut txid);
            packets.insert(target, self.stun.request(txid));
            requests.insert(target, (txid, now));
        }

        tracing::debug!(targets = requests.len(), "starting STUN round");
        self.round = Some(StunRound {
            requests,
            relay_endpoints,
            responses: Vec::new(),
            deadline: now + self.stage.config.timing.stun_timeout(),
        });
        self.stage
            .handles
            .direct_router
            .post(DirectRouterMsg::PushStun { packets });
    }

    fn on_response(&mut self, from: SocketAddr, pkt: &[u8], at: Instant) -> Result<(), StunError> {
        let round = self.round.as_mut().ok_or(StunError::NotActive)?;
        let from = addr::normalise(from);

        let (txid, sent) = *round
            .requests
            .get(&from)
            .ok_or(StunError::UnexpectedSource(from))?;
        let (got, mapped) = self.stun.parse_response(pkt)?;
        if got != txid {
            return Err(StunError::TxIdMismatch(from));
        }

        round.requests.remove(&from);
        round.responses.push(Response {
            mapped: addr::normalise(mapped),
            from,
            latency: at.saturating_duration_since(sent),
        });

        if round.requests.is_empty() {
            self.finalise(false);
        }
        Ok(())
    }

    fn finalise(&mut self, timed_out: bool) {
        let Some(round) = self.round.take() else {
            tracing::warn!("got timeout notice while not performing STUN");
            return;
        };

        let mut latencies: HashMap<RelayId, Duration> = HashMap::new();
        for r in &round.responses {
            match round.relay_endpoints.get(&r.from) {
                Some(relay) => {
                    latencies
                        .entry(*relay)
                        .and_modify(|l| *l = (*l).min(r.latency))
                        .or_insert(r.latency);
                }
                None => tracing::trace!(from = %r.from, "STUN response is not from a relay"),
            }
        }
        let endpoints = addr::sorted(round.responses.iter().map(|r| r.mapped));

        if timed_out {
            if endpoints.is_empty() {
                tracing::warn!("STUN failed, timed out with no endpoints");
            } else {
                let silent: Vec<SocketAddr> = round.requests.keys().copied().collect();
                tracing::warn!(
                    endpoints = %addr::pretty(&endpoints),
                    not_responded = %addr::pretty(&silent),
                    "STUN completed with non-responsive servers"
                );
            }
        } else {
            tracing::debug!(endpoints = %addr::pretty(&endpoints), "STUN completed");
        }

        self.stage
            .handles
            .relay_man
            .post(RelayManMsg::LatencyResults(latencies));
        if !endpoints.is_empty() {
            self.stage.set_stun_endpoints(endpoints);
        }
    }
}
