//! Error types for the connectivity engine
//!
//! Errors are split by the boundary they cross:
//!
//! - [`EngineError`]: returned from the Stage control operations and from
//!   actor setup. Categorised into transient and permanent failures.
//! - [`CodecError`]: returned by the Session Manager when packing or
//!   unpacking a session frame. These never escalate; the offending frame is
//!   dropped with a log entry.
//!
//! # Example
//!
//! ```
//! use weft_core::error::EngineError;
//!
//! let err = EngineError::peer_unknown("remove_peer");
//! assert!(err.is_permanent());
//! ```

use crate::msgsess::MessageError;
use std::borrow::Cow;
use thiserror::Error;
use weft_crypto::CryptoError;
use weft_transport::TransportError;

/// Errors surfaced by the engine.
#[derive(Debug, Error, Clone)]
pub enum EngineError {
    // ============ Peer registry ============
    /// Peer already registered
    #[error("Peer already exists: {0}")]
    PeerExists(Cow<'static, str>),

    /// Peer is not known to the Stage
    #[error("Peer not found: {0}")]
    PeerUnknown(Cow<'static, str>),

    // ============ Transport ============
    /// Socket setup or I/O failed
    #[error("Transport error: {0}")]
    Transport(Cow<'static, str>),

    /// Tunnel backend refused an operation
    #[error("Backend error: {0}")]
    Backend(Cow<'static, str>),

    /// Relay could not be reached
    #[error("Relay error: {0}")]
    Relay(Cow<'static, str>),

    // ============ Crypto ============
    /// Key exchange or box failure
    #[error("Crypto error: {0}")]
    Crypto(Cow<'static, str>),

    // ============ Configuration & lifecycle ============
    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    InvalidConfig(Cow<'static, str>),

    /// Operation timed out
    #[error("Operation timed out: {0}")]
    Timeout(Cow<'static, str>),

    /// Actor inbox closed or full
    #[error("Channel error: {0}")]
    Channel(Cow<'static, str>),

    /// Engine has been shut down
    #[error("Engine is shut down")]
    Shutdown,
}

impl EngineError {
    /// Returns true if the operation may succeed on retry.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EngineError::Transport(_)
                | EngineError::Relay(_)
                | EngineError::Timeout(_)
                | EngineError::Channel(_)
        )
    }

    /// Returns true if retrying without intervention is pointless.
    #[must_use]
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            EngineError::PeerExists(_)
                | EngineError::PeerUnknown(_)
                | EngineError::InvalidConfig(_)
                | EngineError::Crypto(_)
                | EngineError::Shutdown
        )
    }

    /// Unknown peer error with static context
    #[must_use]
    pub const fn peer_unknown(context: &'static str) -> Self {
        EngineError::PeerUnknown(Cow::Borrowed(context))
    }

    /// Invalid configuration error with static context
    #[must_use]
    pub const fn invalid_config(context: &'static str) -> Self {
        EngineError::InvalidConfig(Cow::Borrowed(context))
    }

    /// Channel error with static context
    #[must_use]
    pub const fn channel(context: &'static str) -> Self {
        EngineError::Channel(Cow::Borrowed(context))
    }
}

impl From<TransportError> for EngineError {
    fn from(err: TransportError) -> Self {
        EngineError::Transport(Cow::Owned(err.to_string()))
    }
}

impl From<CryptoError> for EngineError {
    fn from(err: CryptoError) -> Self {
        EngineError::Crypto(Cow::Owned(err.to_string()))
    }
}

impl From<toml::de::Error> for EngineError {
    fn from(err: toml::de::Error) -> Self {
        EngineError::InvalidConfig(Cow::Owned(err.to_string()))
    }
}

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

/// Session frame pack/unpack failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Frame does not start with the session magic or is too short
    #[error("not a session frame")]
    NotSessionFrame,

    /// Box did not open or seal, or the other side's key is unusable
    #[error("session box failed: {0}")]
    Crypto(#[from] CryptoError),

    /// Box opened but the contents did not parse
    #[error("parse failed: {0}")]
    Parse(#[from] MessageError),
}
