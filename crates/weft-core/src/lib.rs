//! # weft Core
//!
//! Connectivity engine for a WireGuard-style peer-to-peer mesh.
//!
//! This crate provides:
//! - The Stage: peer registry, endpoint lists, and the actor supervisor
//! - Per-peer connection state machines driven by session pings
//! - Sealed session messages (ping, pong, rendezvous) between nodes
//! - Direct UDP and relay paths for tunnel traffic
//! - Periodic STUN rounds and home relay selection
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                            Stage                                  │
//! │   (peers, OutConn/InConn pairs, endpoints, watchdog)             │
//! ├──────────────────────────────────────────────────────────────────┤
//! │       Traffic Manager  ◄──►  Session Manager                     │
//! │   (peer state machines)      (seal/open session frames)          │
//! ├───────────────────────────────┬──────────────────────────────────┤
//! │  Direct Manager / Router      │  Relay Manager / Router          │
//! │  (external UDP socket)        │  (one connection per relay)      │
//! ├───────────────────────────────┴──────────────────────────────────┤
//! │                       Endpoint Manager                            │
//! │   (STUN rounds, relay latency)                                   │
//! └──────────────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod actor;
pub mod addr;
pub mod config;
pub mod conn;
pub mod direct;
pub mod endpoint;
pub mod error;
pub mod logging;
pub mod msgsess;
pub mod peerstate;
pub mod relay;
pub mod session;
pub mod sockrecv;
pub mod stage;
pub mod traffic;
pub mod types;

pub use actor::message::StateSnapshot;
pub use actor::{DropCounter, Mailbox};
pub use config::{ChannelConfig, EngineConfig, TimingConfig};
pub use error::{EngineError, Result};
pub use msgsess::{ClearMessage, MAGIC, SessionMessage, SideBandKind};
pub use peerstate::PeerState;
pub use relay::{RelayDialer, RelayLink, select_relay};
pub use stage::{Collaborators, Stage, UnroutableFrames};
pub use types::{
    ControlCallbacks, PeerInfo, PeerUpdate, RelayId, RelayInfo, SideBandSink, StunCodec, StunTxId,
    TunnelBackend,
};
pub use weft_crypto::{NodePublic, SessionPrivate, SessionPublic};
