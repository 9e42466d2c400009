//! # weft Transport
//!
//! Datagram sockets for the weft connectivity engine.
//!
//! This crate provides:
//! - The [`UdpConn`] trait every engine actor reads from and writes to
//! - [`UdpSocketConn`], a tokio UDP socket tuned through `socket2`
//! - Lock-free per-socket statistics
//!
//! The engine owns one external socket (shared by all direct traffic) and one
//! connected socket per peer that bridges to the tunnel-interface backend.
//! Both are consumed through the same trait so tests and embedders can swap
//! in their own implementations.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod conn;
pub mod udp;

pub use conn::{ConnStats, ConnStatsSnapshot, TransportError, TransportResult, UdpConn};
pub use udp::{SocketOptions, UdpSocketConn};

/// Largest datagram the engine ever reads
pub const MAX_DATAGRAM_SIZE: usize = 1 << 16;
