//! Session boxes.
//!
//! A sealed box is `nonce (24) || ciphertext || tag (16)`. The nonce is drawn
//! at random for every box; XChaCha20's 192-bit nonce keeps collisions
//! negligible without any per-peer counter state.

use crate::{CryptoError, SEALED_OVERHEAD, XCHACHA_NONCE_SIZE};
use chacha20poly1305::{
    XChaCha20Poly1305, XNonce,
    aead::{Aead, KeyInit},
};
use rand_core::{OsRng, RngCore};
use zeroize::ZeroizeOnDrop;

/// Domain separation context for the box key
const BOX_KDF_CONTEXT: &str = "weft 2024 session box v1";

/// Symmetric key shared between two session key pairs.
#[derive(Clone, ZeroizeOnDrop)]
pub struct SessionShared([u8; 32]);

impl std::fmt::Debug for SessionShared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionShared(..)")
    }
}

impl SessionShared {
    pub(crate) fn derive(dh: &[u8; 32]) -> Self {
        Self(blake3::derive_key(BOX_KDF_CONTEXT, dh))
    }

    /// Seal `plaintext` into a fresh box.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::EncryptionFailed` if the AEAD rejects the input.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut nonce = [0u8; XCHACHA_NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce);

        let cipher = XChaCha20Poly1305::new((&self.0).into());

        let mut out = Vec::with_capacity(SEALED_OVERHEAD + plaintext.len());
        out.extend_from_slice(&nonce);

        let ct = cipher
            .encrypt(XNonce::from_slice(&nonce), plaintext)
            .map_err(|_| CryptoError::EncryptionFailed)?;
        out.extend_from_slice(&ct);

        Ok(out)
    }

    /// Open a box produced by [`SessionShared::seal`].
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::SealedTooShort` if the input cannot hold a nonce
    /// and tag, or `CryptoError::DecryptionFailed` if authentication fails.
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if sealed.len() < SEALED_OVERHEAD {
            return Err(CryptoError::SealedTooShort {
                expected: SEALED_OVERHEAD,
                actual: sealed.len(),
            });
        }

        let (nonce, ct) = sealed.split_at(XCHACHA_NONCE_SIZE);
        let cipher = XChaCha20Poly1305::new((&self.0).into());

        cipher
            .decrypt(XNonce::from_slice(nonce), ct)
            .map_err(|_| CryptoError::DecryptionFailed)
    }
}
