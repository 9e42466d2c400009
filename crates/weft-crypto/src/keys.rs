//! Node and session key types.
//!
//! A node is identified by a long-lived [`NodePublic`] handed out by the
//! control plane. Session-protocol messages are sealed under an ephemeral
//! per-process [`SessionPrivate`], whose public half travels in every frame
//! header so the receiver can derive the same shared secret.

use crate::CryptoError;
use crate::sealed::SessionShared;
use rand_core::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Length of every public key on the wire
pub const KEY_LEN: usize = 32;

/// Long-lived node identity key (opaque to the engine).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct NodePublic([u8; KEY_LEN]);

/// Public half of an ephemeral session key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct SessionPublic([u8; KEY_LEN]);

/// Ephemeral X25519 session secret, zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SessionPrivate(x25519_dalek::StaticSecret);

impl NodePublic {
    /// Wrap raw key bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Parse from a slice of exactly [`KEY_LEN`] bytes.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::InvalidKeyLength` on any other length.
    pub fn from_slice(slice: &[u8]) -> Result<Self, CryptoError> {
        <[u8; KEY_LEN]>::try_from(slice)
            .map(Self)
            .map_err(|_| CryptoError::InvalidKeyLength {
                expected: KEY_LEN,
                actual: slice.len(),
            })
    }

    /// Raw key bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// True for the all-zero key, which marks "not yet known".
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; KEY_LEN]
    }
}

impl SessionPublic {
    /// Wrap raw key bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Parse from a slice of exactly [`KEY_LEN`] bytes.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::InvalidKeyLength` on any other length.
    pub fn from_slice(slice: &[u8]) -> Result<Self, CryptoError> {
        <[u8; KEY_LEN]>::try_from(slice)
            .map(Self)
            .map_err(|_| CryptoError::InvalidKeyLength {
                expected: KEY_LEN,
                actual: slice.len(),
            })
    }

    /// Raw key bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// True for the all-zero key; a peer with a zero session cannot be talked to yet.
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; KEY_LEN]
    }
}

impl SessionPrivate {
    /// Generate a fresh random session secret.
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        Self(x25519_dalek::StaticSecret::random_from_rng(rng))
    }

    /// Import from raw bytes (clamped per RFC 7748).
    #[must_use]
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(x25519_dalek::StaticSecret::from(bytes))
    }

    /// Public half, as placed in frame headers.
    #[must_use]
    pub fn public(&self) -> SessionPublic {
        SessionPublic(x25519_dalek::PublicKey::from(&self.0).to_bytes())
    }

    /// Derive the box key shared with `peer`.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::InvalidPublicKey` when `peer` is a low-order
    /// point and the Diffie-Hellman output is all zeroes.
    pub fn shared(&self, peer: &SessionPublic) -> Result<SessionShared, CryptoError> {
        let dh = self
            .0
            .diffie_hellman(&x25519_dalek::PublicKey::from(peer.0));

        if dh.as_bytes() == &[0u8; KEY_LEN] {
            return Err(CryptoError::InvalidPublicKey);
        }

        Ok(SessionShared::derive(dh.as_bytes()))
    }
}

impl fmt::Display for NodePublic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0[..8]))
    }
}

impl fmt::Debug for NodePublic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodePublic({})", hex::encode(&self.0[..8]))
    }
}

impl fmt::Display for SessionPublic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0[..8]))
    }
}

impl fmt::Debug for SessionPublic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionPublic({})", hex::encode(&self.0[..8]))
    }
}

impl fmt::Debug for SessionPrivate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionPrivate(pub={})", self.public())
    }
}
