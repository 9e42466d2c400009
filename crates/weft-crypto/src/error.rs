//! Cryptographic error types.

use thiserror::Error;

/// Cryptographic errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// AEAD encryption failed
    #[error("encryption failed")]
    EncryptionFailed,

    /// AEAD decryption failed (authentication failure)
    #[error("decryption failed: authentication failure")]
    DecryptionFailed,

    /// Sealed box is shorter than nonce plus tag
    #[error("sealed box too short: expected at least {expected}, got {actual}")]
    SealedTooShort {
        /// Minimum length
        expected: usize,
        /// Actual length
        actual: usize,
    },

    /// Invalid key length
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength {
        /// Expected length
        expected: usize,
        /// Actual length
        actual: usize,
    },

    /// Peer public key produced an all-zero shared secret
    #[error("invalid public key")]
    InvalidPublicKey,
}
