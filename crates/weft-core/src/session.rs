//! Session Manager: seals and opens session frames.
//!
//! The codec is stateless apart from the local session secret. Every frame
//! is boxed under the X25519 shared secret of the sender's and receiver's
//! session keys, and carries the sender's session public key in the clear
//! so the receiver can derive the same secret.

use crate::actor::message::{DirectWrite, RelayWrite, SessionMsg, TrafficMsg};
use crate::actor::spawn_supervised;
use crate::error::CodecError;
use crate::msgsess::{ClearMessage, MAGIC, SessionMessage, looks_like_session_message};
use crate::stage::StageInner;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use weft_crypto::{KEY_LEN, SessionPrivate, SessionPublic};

/// Pack/unpack under one local session secret.
#[derive(Clone)]
pub struct SessionCodec {
    key: SessionPrivate,
    public: SessionPublic,
}

impl SessionCodec {
    /// Codec for the given local session secret.
    #[must_use]
    pub fn new(key: SessionPrivate) -> Self {
        let public = key.public();
        Self { key, public }
    }

    /// Our session public key, as placed in frame headers.
    #[must_use]
    pub fn public(&self) -> SessionPublic {
        self.public
    }

    /// Seal `msg` for the holder of `to`.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Crypto`] if `to` is not a usable public key.
    pub fn pack(&self, msg: &SessionMessage, to: &SessionPublic) -> Result<Vec<u8>, CodecError> {
        let sealed = self.key.shared(to)?.seal(&msg.marshal())?;

        let mut frame = Vec::with_capacity(MAGIC.len() + KEY_LEN + sealed.len());
        frame.extend_from_slice(&MAGIC);
        frame.extend_from_slice(self.public.as_bytes());
        frame.extend_from_slice(&sealed);
        Ok(frame)
    }

    /// Open a frame and parse its message.
    ///
    /// # Errors
    ///
    /// - [`CodecError::NotSessionFrame`] if the magic header is missing
    /// - [`CodecError::Crypto`] if the box does not open
    /// - [`CodecError::Parse`] if the contents are not a session message
    pub fn unpack(&self, frame: &[u8]) -> Result<ClearMessage, CodecError> {
        if !looks_like_session_message(frame) {
            return Err(CodecError::NotSessionFrame);
        }

        let rest = &frame[MAGIC.len()..];
        let session = SessionPublic::from_slice(&rest[..KEY_LEN])?;
        let clear = self.key.shared(&session)?.open(&rest[KEY_LEN..])?;
        let message = SessionMessage::parse(&clear)?;

        Ok(ClearMessage { session, message })
    }
}

impl std::fmt::Debug for SessionCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCodec")
            .field("public", &self.public)
            .finish_non_exhaustive()
    }
}

/// Actor wrapping a [`SessionCodec`] between the routers, the Traffic
/// Manager and the write paths.
pub struct SessionManager {
    codec: SessionCodec,
    stage: Arc<StageInner>,
    inbox: mpsc::Receiver<SessionMsg>,
    token: CancellationToken,
}

impl SessionManager {
    pub(crate) fn new(
        codec: SessionCodec,
        stage: Arc<StageInner>,
        inbox: mpsc::Receiver<SessionMsg>,
    ) -> Self {
        tracing::debug!(session = %codec.public(), "session manager with session key");
        let token = stage.token.child_token();
        Self {
            codec,
            stage,
            inbox,
            token,
        }
    }

    /// Run under supervision.
    pub fn spawn(self) -> JoinHandle<()> {
        spawn_supervised("session_manager", self.token.clone(), self.run())
    }

    async fn run(mut self) {
        loop {
            tokio::select! {
                () = self.token.cancelled() => break,
                msg = self.inbox.recv() => match msg {
                    Some(msg) => self.handle(msg),
                    None => break,
                },
            }
        }
    }

    fn handle(&self, msg: SessionMsg) {
        let handles = &self.stage.handles;
        match msg {
            SessionMsg::FrameFromRelay { relay, peer, frame } => match self.codec.unpack(&frame) {
                Ok(msg) => handles.traffic.post(TrafficMsg::FromRelay { relay, peer, msg }),
                Err(e) => tracing::error!(
                    error = %e,
                    peer = %peer,
                    relay,
                    len = frame.len(),
                    "error when unpacking session frame from relay"
                ),
            },
            SessionMsg::FrameFromAddr { addr, frame } => match self.codec.unpack(&frame) {
                Ok(msg) => handles.traffic.post(TrafficMsg::FromDirect { addr, msg }),
                Err(e) => tracing::error!(
                    error = %e,
                    addr = %addr,
                    len = frame.len(),
                    "error when unpacking session frame from direct"
                ),
            },
            SessionMsg::SendToRelay {
                relay,
                peer,
                to_session,
                msg,
            } => match self.codec.pack(&msg, &to_session) {
                Ok(pkt) => handles.relay_writes.post(RelayWrite {
                    relay,
                    dst: peer,
                    pkt,
                }),
                Err(e) => tracing::error!(error = %e, peer = %peer, "could not pack session message"),
            },
            SessionMsg::SendToDirect {
                addr,
                to_session,
                msg,
            } => match self.codec.pack(&msg, &to_session) {
                Ok(pkt) => handles.direct_writes.post(DirectWrite { addr, pkt }),
                Err(e) => tracing::error!(error = %e, addr = %addr, "could not pack session message"),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msgsess::{SideBandKind, TxId};
    use crate::stage::testing::inner_with_peer;
    use proptest::prelude::*;
    use std::net::SocketAddr;
    use std::time::Duration;
    use weft_crypto::{CryptoError, NodePublic};

    fn codec(seed: u8) -> SessionCodec {
        SessionCodec::new(SessionPrivate::from_bytes([seed; 32]))
    }

    fn ping() -> SessionMessage {
        SessionMessage::Ping {
            tx_id: TxId([7; 12]),
            node_key: NodePublic::from_bytes([3; 32]),
        }
    }

    #[test]
    fn test_pack_layout() {
        let a = codec(1);
        let b = codec(2);
        let frame = a.pack(&ping(), &b.public()).unwrap();
        assert_eq!(&frame[..8], &MAGIC);
        assert_eq!(&frame[8..40], a.public().as_bytes());
        assert!(looks_like_session_message(&frame));
    }

    #[test]
    fn test_unpack_reports_sender_session() {
        let a = codec(1);
        let b = codec(2);
        let frame = a.pack(&ping(), &b.public()).unwrap();
        let clear = b.unpack(&frame).unwrap();
        assert_eq!(clear.session, a.public());
        assert_eq!(clear.message, ping());
    }

    #[test]
    fn test_unpack_wrong_recipient_fails() {
        let a = codec(1);
        let b = codec(2);
        let c = codec(3);
        let frame = a.pack(&ping(), &b.public()).unwrap();
        assert!(matches!(c.unpack(&frame), Err(CodecError::Crypto(_))));
    }

    #[test]
    fn test_unpack_without_magic() {
        let b = codec(2);
        assert_eq!(b.unpack(&[0u8; 100]), Err(CodecError::NotSessionFrame));
        assert_eq!(b.unpack(&MAGIC), Err(CodecError::NotSessionFrame));
    }

    #[test]
    fn test_pack_to_low_order_key_fails() {
        let a = codec(1);
        assert_eq!(
            a.pack(&ping(), &SessionPublic::default()),
            Err(CodecError::Crypto(CryptoError::InvalidPublicKey))
        );
    }

    #[test]
    fn test_unpack_garbage_body_fails_to_parse() {
        let a = codec(1);
        let b = codec(2);
        let sealed = a.key.shared(&b.public()).unwrap().seal(&[0x09, 0x00]).unwrap();
        let mut frame = MAGIC.to_vec();
        frame.extend_from_slice(a.public().as_bytes());
        frame.extend_from_slice(&sealed);
        assert!(matches!(b.unpack(&frame), Err(CodecError::Parse(_))));
    }

    fn arb_message() -> impl Strategy<Value = SessionMessage> {
        let addr = (any::<[u8; 4]>(), any::<u16>()).prop_map(|(ip, p)| SocketAddr::from((ip, p)));
        prop_oneof![
            (any::<[u8; 12]>(), any::<[u8; 32]>()).prop_map(|(tx, k)| SessionMessage::Ping {
                tx_id: TxId(tx),
                node_key: NodePublic::from_bytes(k),
            }),
            (any::<[u8; 12]>(), addr.clone()).prop_map(|(tx, src)| SessionMessage::Pong {
                tx_id: TxId(tx),
                src,
            }),
            proptest::collection::vec(addr, 0..8)
                .prop_map(|my_addresses| SessionMessage::Rendezvous { my_addresses }),
            (any::<u8>(), proptest::collection::vec(any::<u8>(), 0..64)).prop_map(|(k, data)| {
                SessionMessage::SideBand {
                    kind: SideBandKind::from(k),
                    data,
                }
            }),
        ]
    }

    proptest! {
        #[test]
        fn roundtrip_between_any_two_keys(
            sa in any::<[u8; 32]>(),
            sb in any::<[u8; 32]>(),
            msg in arb_message(),
        ) {
            let a = SessionCodec::new(SessionPrivate::from_bytes(sa));
            let b = SessionCodec::new(SessionPrivate::from_bytes(sb));
            let frame = a.pack(&msg, &b.public()).unwrap();
            let clear = b.unpack(&frame).unwrap();
            prop_assert_eq!(clear.message, msg);
            prop_assert_eq!(clear.session, a.public());
        }

        #[test]
        fn tampered_payload_never_opens(
            msg in arb_message(),
            pos in any::<prop::sample::Index>(),
            flip in 1u8..=255,
        ) {
            let a = codec(1);
            let b = codec(2);
            let mut frame = a.pack(&msg, &b.public()).unwrap();
            let start = MAGIC.len() + KEY_LEN;
            let i = start + pos.index(frame.len() - start);
            frame[i] ^= flip;
            prop_assert!(b.unpack(&frame).is_err());
        }
    }

    #[tokio::test]
    async fn test_manager_routes_frames() {
        let peer = NodePublic::from_bytes([1; 32]);
        let (inner, mut rx) = inner_with_peer(peer, 5).await;
        let ours = codec(1);
        let theirs = codec(2);

        let (tx, inbox) = mpsc::channel(4);
        SessionManager::new(ours.clone(), Arc::clone(&inner), inbox).spawn();

        tx.send(SessionMsg::SendToRelay {
            relay: 5,
            peer,
            to_session: theirs.public(),
            msg: ping(),
        })
        .await
        .unwrap();
        let write = tokio::time::timeout(Duration::from_secs(2), rx.relay_writes.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!((write.relay, write.dst), (5, peer));
        assert_eq!(theirs.unpack(&write.pkt).unwrap().message, ping());

        let frame = theirs.pack(&ping(), &ours.public()).unwrap();
        let addr: SocketAddr = "192.0.2.1:9".parse().unwrap();
        tx.send(SessionMsg::FrameFromAddr { addr, frame }).await.unwrap();
        match tokio::time::timeout(Duration::from_secs(2), rx.traffic.recv()).await.unwrap() {
            Some(TrafficMsg::FromDirect { addr: from, msg }) => {
                assert_eq!(from, addr);
                assert_eq!(msg.session, theirs.public());
            }
            other => panic!("unexpected {other:?}"),
        }

        tx.send(SessionMsg::FrameFromRelay {
            relay: 5,
            peer,
            frame: b"not a frame".to_vec(),
        })
        .await
        .unwrap();
        tx.send(SessionMsg::SendToDirect {
            addr,
            to_session: theirs.public(),
            msg: ping(),
        })
        .await
        .unwrap();
        let write = tokio::time::timeout(Duration::from_secs(2), rx.direct_writes.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(write.addr, addr);
        assert!(rx.traffic.try_recv().is_err());

        inner.token.cancel();
    }
}
