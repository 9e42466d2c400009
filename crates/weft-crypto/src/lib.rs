//! # weft Crypto
//!
//! Key material and sealing primitives for the weft session protocol.
//!
//! This crate provides:
//! - Node and session public key types
//! - Ephemeral X25519 session key pairs
//! - Shared-secret derivation with low-order point rejection
//! - Session boxes: `XChaCha20-Poly1305` under a BLAKE3-derived key
//!
//! ## Cryptographic Suite
//!
//! | Function | Algorithm | Security Level |
//! |----------|-----------|----------------|
//! | Key Exchange | X25519 | 128-bit |
//! | KDF | BLAKE3 `derive_key` | 128-bit |
//! | AEAD | XChaCha20-Poly1305 | 256-bit key |

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod keys;
pub mod sealed;

pub use error::CryptoError;
pub use keys::{KEY_LEN, NodePublic, SessionPrivate, SessionPublic};
pub use sealed::SessionShared;

/// XChaCha20-Poly1305 nonce size
pub const XCHACHA_NONCE_SIZE: usize = 24;

/// Poly1305 authentication tag size
pub const TAG_SIZE: usize = 16;

/// Smallest possible sealed box: nonce plus tag around an empty plaintext
pub const SEALED_OVERHEAD: usize = XCHACHA_NONCE_SIZE + TAG_SIZE;
