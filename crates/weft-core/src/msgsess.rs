//! Session message definitions and their cleartext wire format.
//!
//! A session wire frame is:
//!
//! ```text
//! magic (8) | sender session key (32) | nonce (24) | sealed payload
//! ```
//!
//! and the sealed payload decrypts to `version (1) | type (1) | body`.
//! This module only handles the cleartext body; sealing is done by the
//! Session Manager.

use crate::addr::{self, ADDR_PORT_LEN};
use rand::RngCore;
use std::fmt;
use std::net::SocketAddr;
use thiserror::Error;
use weft_crypto::{KEY_LEN, NodePublic, SessionPublic, XCHACHA_NONCE_SIZE};

/// Header of every session frame.
pub const MAGIC: [u8; 8] = [0xF0, 0x9F, 0xAA, 0x84, 0xF0, 0x9F, 0xA7, 0xA6];

/// Shortest byte string that can be a session frame.
pub const WIRE_HEADER_LEN: usize = MAGIC.len() + KEY_LEN + XCHACHA_NONCE_SIZE;

const VERSION_V1: u8 = 0x01;

const TYPE_PING: u8 = 0x00;
const TYPE_PONG: u8 = 0x01;
const TYPE_SIDE_BAND: u8 = 0x02;
const TYPE_RENDEZVOUS: u8 = 0xFF;

/// Transaction id length
pub const TXID_LEN: usize = 12;

/// Ping/pong transaction id.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TxId(pub [u8; TXID_LEN]);

impl TxId {
    /// Fresh random id.
    #[must_use]
    pub fn random() -> Self {
        let mut tx = [0u8; TXID_LEN];
        rand::thread_rng().fill_bytes(&mut tx);
        Self(tx)
    }
}

impl fmt::Debug for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TxId({})", hex::encode(self.0))
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// What a [`SessionMessage::SideBand`] payload carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SideBandKind {
    /// A multicast DNS packet from the sender's local network
    Mdns,
    /// A kind this node does not understand
    Other(u8),
}

impl From<u8> for SideBandKind {
    fn from(b: u8) -> Self {
        match b {
            0 => SideBandKind::Mdns,
            other => SideBandKind::Other(other),
        }
    }
}

impl From<SideBandKind> for u8 {
    fn from(kind: SideBandKind) -> Self {
        match kind {
            SideBandKind::Mdns => 0,
            SideBandKind::Other(b) => b,
        }
    }
}

/// A decrypted session message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionMessage {
    /// Liveness check; the node key is the sender's claimed identity.
    Ping {
        /// Transaction id echoed in the pong
        tx_id: TxId,
        /// Claimed sender node key
        node_key: NodePublic,
    },
    /// Reply to a ping, telling the pinger which address the ping came from.
    Pong {
        /// Transaction id of the ping being answered
        tx_id: TxId,
        /// Source address the ping was observed from
        src: SocketAddr,
    },
    /// Candidate endpoints, exchanged over the relay.
    Rendezvous {
        /// The sender's own candidate addresses
        my_addresses: Vec<SocketAddr>,
    },
    /// Opaque data riding along the session channel.
    SideBand {
        /// Payload kind
        kind: SideBandKind,
        /// Payload
        data: Vec<u8>,
    },
}

/// A session message together with the session key it was sealed under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClearMessage {
    /// Sender's session public key
    pub session: SessionPublic,
    /// Decrypted message
    pub message: SessionMessage,
}

/// Cleartext parse failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MessageError {
    /// Payload shorter than the header or body requires
    #[error("session message too small")]
    TooSmall,

    /// Unknown version byte
    #[error("invalid version: {0:#04x}")]
    InvalidVersion(u8),

    /// Unknown type byte
    #[error("invalid message type: {0:#04x}")]
    InvalidType(u8),

    /// Rendezvous body is not a whole number of addresses
    #[error("malformed rendezvous addresses")]
    MalformedRendezvous,
}

/// Cheap pre-check used by the routers before handing a frame to the
/// Session Manager.
#[must_use]
pub fn looks_like_session_message(pkt: &[u8]) -> bool {
    pkt.len() >= WIRE_HEADER_LEN && pkt[..MAGIC.len()] == MAGIC
}

impl SessionMessage {
    /// Short name for logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            SessionMessage::Ping { .. } => "ping",
            SessionMessage::Pong { .. } => "pong",
            SessionMessage::Rendezvous { .. } => "rendezvous",
            SessionMessage::SideBand { .. } => "sidebanddata",
        }
    }

    /// Serialize to `version | type | body`.
    #[must_use]
    pub fn marshal(&self) -> Vec<u8> {
        match self {
            SessionMessage::Ping { tx_id, node_key } => {
                let mut b = Vec::with_capacity(2 + TXID_LEN + KEY_LEN);
                b.extend_from_slice(&[VERSION_V1, TYPE_PING]);
                b.extend_from_slice(&tx_id.0);
                b.extend_from_slice(node_key.as_bytes());
                b
            }
            SessionMessage::Pong { tx_id, src } => {
                let mut b = Vec::with_capacity(2 + TXID_LEN + ADDR_PORT_LEN);
                b.extend_from_slice(&[VERSION_V1, TYPE_PONG]);
                b.extend_from_slice(&tx_id.0);
                b.extend_from_slice(&addr::encode(*src));
                b
            }
            SessionMessage::Rendezvous { my_addresses } => {
                let mut b = Vec::with_capacity(2 + ADDR_PORT_LEN * my_addresses.len());
                b.extend_from_slice(&[VERSION_V1, TYPE_RENDEZVOUS]);
                for ap in my_addresses {
                    b.extend_from_slice(&addr::encode(*ap));
                }
                b
            }
            SessionMessage::SideBand { kind, data } => {
                let mut b = Vec::with_capacity(3 + data.len());
                b.extend_from_slice(&[VERSION_V1, TYPE_SIDE_BAND, u8::from(*kind)]);
                b.extend_from_slice(data);
                b
            }
        }
    }

    /// Parse `version | type | body`.
    ///
    /// # Errors
    ///
    /// Returns a [`MessageError`] describing the first malformed field.
    pub fn parse(b: &[u8]) -> Result<Self, MessageError> {
        let [version, msg_type, body @ ..] = b else {
            return Err(MessageError::TooSmall);
        };

        if *version != VERSION_V1 {
            return Err(MessageError::InvalidVersion(*version));
        }

        match *msg_type {
            TYPE_PING => parse_ping(body),
            TYPE_PONG => parse_pong(body),
            TYPE_RENDEZVOUS => parse_rendezvous(body),
            TYPE_SIDE_BAND => parse_side_band(body),
            other => Err(MessageError::InvalidType(other)),
        }
    }
}

fn take_txid(b: &[u8]) -> TxId {
    let mut tx = [0u8; TXID_LEN];
    tx.copy_from_slice(&b[..TXID_LEN]);
    TxId(tx)
}

fn parse_ping(b: &[u8]) -> Result<SessionMessage, MessageError> {
    if b.len() < TXID_LEN + KEY_LEN {
        return Err(MessageError::TooSmall);
    }

    let node_key = NodePublic::from_slice(&b[TXID_LEN..TXID_LEN + KEY_LEN])
        .map_err(|_| MessageError::TooSmall)?;

    // Trailing bytes are padding.
    Ok(SessionMessage::Ping {
        tx_id: take_txid(b),
        node_key,
    })
}

fn parse_pong(b: &[u8]) -> Result<SessionMessage, MessageError> {
    if b.len() < TXID_LEN + ADDR_PORT_LEN {
        return Err(MessageError::TooSmall);
    }

    let mut ap = [0u8; ADDR_PORT_LEN];
    ap.copy_from_slice(&b[TXID_LEN..TXID_LEN + ADDR_PORT_LEN]);

    Ok(SessionMessage::Pong {
        tx_id: take_txid(b),
        src: addr::decode(&ap),
    })
}

fn parse_rendezvous(b: &[u8]) -> Result<SessionMessage, MessageError> {
    if b.len() % ADDR_PORT_LEN != 0 {
        return Err(MessageError::MalformedRendezvous);
    }

    let my_addresses = b
        .chunks_exact(ADDR_PORT_LEN)
        .map(|chunk| {
            let mut ap = [0u8; ADDR_PORT_LEN];
            ap.copy_from_slice(chunk);
            addr::decode(&ap)
        })
        .collect();

    Ok(SessionMessage::Rendezvous { my_addresses })
}

fn parse_side_band(b: &[u8]) -> Result<SessionMessage, MessageError> {
    let [kind, data @ ..] = b else {
        return Err(MessageError::TooSmall);
    };

    Ok(SessionMessage::SideBand {
        kind: SideBandKind::from(*kind),
        data: data.to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn arb_addr() -> impl Strategy<Value = SocketAddr> {
        prop_oneof![
            (any::<[u8; 4]>(), any::<u16>()).prop_map(|(ip, p)| SocketAddr::from((ip, p))),
            (any::<[u8; 16]>(), any::<u16>())
                .prop_map(|(ip, p)| addr::normalise(SocketAddr::from((ip, p)))),
        ]
    }

    fn arb_message() -> impl Strategy<Value = SessionMessage> {
        prop_oneof![
            (any::<[u8; 12]>(), any::<[u8; 32]>()).prop_map(|(tx, key)| SessionMessage::Ping {
                tx_id: TxId(tx),
                node_key: NodePublic::from_bytes(key),
            }),
            (any::<[u8; 12]>(), arb_addr()).prop_map(|(tx, src)| SessionMessage::Pong {
                tx_id: TxId(tx),
                src,
            }),
            proptest::collection::vec(arb_addr(), 0..8)
                .prop_map(|my_addresses| SessionMessage::Rendezvous { my_addresses }),
            (any::<u8>(), proptest::collection::vec(any::<u8>(), 0..64)).prop_map(|(k, data)| {
                SessionMessage::SideBand {
                    kind: SideBandKind::from(k),
                    data,
                }
            }),
        ]
    }

    #[test]
    fn test_ping_layout() {
        let msg = SessionMessage::Ping {
            tx_id: TxId([7; 12]),
            node_key: NodePublic::from_bytes([9; 32]),
        };
        let b = msg.marshal();
        assert_eq!(b.len(), 2 + 12 + 32);
        assert_eq!(&b[..2], &[0x01, 0x00]);
        assert_eq!(&b[2..14], &[7; 12]);
    }

    #[test]
    fn test_rendezvous_type_byte() {
        let b = SessionMessage::Rendezvous {
            my_addresses: vec!["1.2.3.4:5".parse().unwrap()],
        }
        .marshal();
        assert_eq!(b[1], 0xFF);
        assert_eq!(b.len(), 2 + 18);
    }

    #[test]
    fn test_side_band_layout() {
        let b = SessionMessage::SideBand {
            kind: SideBandKind::Mdns,
            data: vec![0xAB, 0xCD],
        }
        .marshal();
        assert_eq!(b, vec![0x01, 0x02, 0x00, 0xAB, 0xCD]);

        assert_eq!(
            SessionMessage::parse(&[0x01, 0x02, 0x07]).unwrap(),
            SessionMessage::SideBand {
                kind: SideBandKind::Other(7),
                data: vec![]
            }
        );
        assert_eq!(SessionMessage::parse(&[0x01, 0x02]), Err(MessageError::TooSmall));
    }

    #[test]
    fn test_empty_rendezvous_parses() {
        let parsed = SessionMessage::parse(&[0x01, 0xFF]).unwrap();
        assert_eq!(
            parsed,
            SessionMessage::Rendezvous {
                my_addresses: vec![]
            }
        );
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(SessionMessage::parse(&[0x01]), Err(MessageError::TooSmall));
        assert_eq!(
            SessionMessage::parse(&[0x02, 0x00]),
            Err(MessageError::InvalidVersion(0x02))
        );
        assert_eq!(
            SessionMessage::parse(&[0x01, 0x42]),
            Err(MessageError::InvalidType(0x42))
        );
        assert_eq!(
            SessionMessage::parse(&[0x01, 0x00, 1, 2, 3]),
            Err(MessageError::TooSmall)
        );
        assert_eq!(
            SessionMessage::parse(&[0x01, 0xFF, 1, 2, 3]),
            Err(MessageError::MalformedRendezvous)
        );
    }

    #[test]
    fn test_looks_like_session_message() {
        let mut pkt = vec![0u8; WIRE_HEADER_LEN];
        assert!(!looks_like_session_message(&pkt));
        pkt[..8].copy_from_slice(&MAGIC);
        assert!(looks_like_session_message(&pkt));
        assert!(!looks_like_session_message(&pkt[..WIRE_HEADER_LEN - 1]));
    }

    proptest! {
        #[test]
        fn prop_parse_inverts_marshal(msg in arb_message()) {
            prop_assert_eq!(SessionMessage::parse(&msg.marshal()).unwrap(), msg);
        }

        #[test]
        fn prop_parse_never_panics(data in proptest::collection::vec(any::<u8>(), 0..128)) {
            let _ = SessionMessage::parse(&data);
        }
    }
}
