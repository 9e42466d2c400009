//! Engine configuration.
//!
//! Everything here has a working default, so an embedder only writes the
//! values it wants to change:
//!
//! ```
//! use weft_core::config::EngineConfig;
//!
//! let config = EngineConfig::from_toml_str(
//!     r#"
//!     stun_servers = ["192.0.2.10:3478"]
//!
//!     [timing]
//!     tick_ms = 500
//!     "#,
//! )
//! .unwrap();
//!
//! assert_eq!(config.timing.tick().as_millis(), 500);
//! assert_eq!(config.channels.session_inbox, 32);
//! ```

use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

/// Top-level engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct EngineConfig {
    /// Actor cadences and timeouts
    pub timing: TimingConfig,

    /// Queue lengths
    pub channels: ChannelConfig,

    /// Extra STUN servers queried alongside the relays
    pub stun_servers: Vec<SocketAddr>,

    /// Use the node key as the session key (test networks only)
    pub session_is_node_key: bool,
}

/// Actor cadences, in milliseconds on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Traffic Manager tick
    pub tick_ms: u64,
    /// Stage watchdog interval
    pub watchdog_ms: u64,
    /// Socket Receiver read deadline
    pub sock_read_timeout_ms: u64,
    /// OutConn/InConn inactivity timer
    pub conn_activity_ms: u64,
    /// Upper bound on a background mailbox send
    pub send_timeout_ms: u64,
    /// Age at which unanswered pings are forgotten
    pub ping_reap_ms: u64,
    /// Base delay before redialing a relay
    pub relay_retry_ms: u64,
    /// Idle period before an unused relay link is closed
    pub relay_idle_ms: u64,
    /// Minimum time between home relay changes
    pub home_relay_change_ms: u64,
    /// STUN round interval
    pub stun_interval_ms: u64,
    /// STUN round timeout
    pub stun_timeout_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            tick_ms: 1_000,
            watchdog_ms: 5_000,
            sock_read_timeout_ms: 5_000,
            conn_activity_ms: 10_000,
            send_timeout_ms: 5_000,
            ping_reap_ms: 10 * 60 * 1_000,
            relay_retry_ms: 5_000,
            relay_idle_ms: 60_000,
            home_relay_change_ms: 5 * 60 * 1_000,
            stun_interval_ms: 60_000,
            stun_timeout_ms: 10_000,
        }
    }
}

impl TimingConfig {
    /// Traffic Manager tick
    #[must_use]
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    /// Stage watchdog interval
    #[must_use]
    pub fn watchdog(&self) -> Duration {
        Duration::from_millis(self.watchdog_ms)
    }

    /// Socket Receiver read deadline
    #[must_use]
    pub fn sock_read_timeout(&self) -> Duration {
        Duration::from_millis(self.sock_read_timeout_ms)
    }

    /// Connection inactivity timer
    #[must_use]
    pub fn conn_activity(&self) -> Duration {
        Duration::from_millis(self.conn_activity_ms)
    }

    /// Background send bound
    #[must_use]
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    /// Sent-ping expiry
    #[must_use]
    pub fn ping_reap(&self) -> Duration {
        Duration::from_millis(self.ping_reap_ms)
    }

    /// Relay redial base delay
    #[must_use]
    pub fn relay_retry(&self) -> Duration {
        Duration::from_millis(self.relay_retry_ms)
    }

    /// Relay idle period
    #[must_use]
    pub fn relay_idle(&self) -> Duration {
        Duration::from_millis(self.relay_idle_ms)
    }

    /// Home relay change suppression window
    #[must_use]
    pub fn home_relay_change(&self) -> Duration {
        Duration::from_millis(self.home_relay_change_ms)
    }

    /// STUN interval
    #[must_use]
    pub fn stun_interval(&self) -> Duration {
        Duration::from_millis(self.stun_interval_ms)
    }

    /// STUN timeout
    #[must_use]
    pub fn stun_timeout(&self) -> Duration {
        Duration::from_millis(self.stun_timeout_ms)
    }

    fn fields(&self) -> [(&'static str, u64); 11] {
        [
            ("tick_ms", self.tick_ms),
            ("watchdog_ms", self.watchdog_ms),
            ("sock_read_timeout_ms", self.sock_read_timeout_ms),
            ("conn_activity_ms", self.conn_activity_ms),
            ("send_timeout_ms", self.send_timeout_ms),
            ("ping_reap_ms", self.ping_reap_ms),
            ("relay_retry_ms", self.relay_retry_ms),
            ("relay_idle_ms", self.relay_idle_ms),
            ("home_relay_change_ms", self.home_relay_change_ms),
            ("stun_interval_ms", self.stun_interval_ms),
            ("stun_timeout_ms", self.stun_timeout_ms),
        ]
    }
}

/// Bounded queue lengths.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
#[allow(missing_docs)]
pub struct ChannelConfig {
    pub out_conn_inbox: usize,
    pub session_inbox: usize,
    pub traffic_inbox: usize,
    pub relay_man_inbox: usize,
    pub direct_router_inbox: usize,
    pub sock_recv_frames: usize,
    pub in_conn_frames: usize,
    pub relay_man_frames: usize,
    pub relay_man_writes: usize,
    pub relay_router_frames: usize,
    pub relay_conn_send_buffer: usize,
    pub direct_man_writes: usize,
    pub direct_router_frames: usize,
    pub endpoint_inbox: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            out_conn_inbox: 10,
            session_inbox: 32,
            traffic_inbox: 16,
            relay_man_inbox: 4,
            direct_router_inbox: 4,
            sock_recv_frames: 160,
            in_conn_frames: 160,
            relay_man_frames: 8,
            relay_man_writes: 8,
            relay_router_frames: 4,
            relay_conn_send_buffer: 32,
            direct_man_writes: 64,
            direct_router_frames: 64,
            endpoint_inbox: 32,
        }
    }
}

impl ChannelConfig {
    fn fields(&self) -> [(&'static str, usize); 14] {
        [
            ("out_conn_inbox", self.out_conn_inbox),
            ("session_inbox", self.session_inbox),
            ("traffic_inbox", self.traffic_inbox),
            ("relay_man_inbox", self.relay_man_inbox),
            ("direct_router_inbox", self.direct_router_inbox),
            ("sock_recv_frames", self.sock_recv_frames),
            ("in_conn_frames", self.in_conn_frames),
            ("relay_man_frames", self.relay_man_frames),
            ("relay_man_writes", self.relay_man_writes),
            ("relay_router_frames", self.relay_router_frames),
            ("relay_conn_send_buffer", self.relay_conn_send_buffer),
            ("direct_man_writes", self.direct_man_writes),
            ("direct_router_frames", self.direct_router_frames),
            ("endpoint_inbox", self.endpoint_inbox),
        ]
    }
}

impl EngineConfig {
    /// Parse from TOML; missing keys take their defaults.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::InvalidConfig` on malformed TOML or on values
    /// rejected by [`EngineConfig::validate`].
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Render as pretty TOML.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::InvalidConfig` if serialization fails.
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| EngineError::InvalidConfig(e.to_string().into()))
    }

    /// Reject zero intervals and zero-length queues.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::InvalidConfig` naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        for (name, value) in self.timing.fields() {
            if value == 0 {
                return Err(EngineError::InvalidConfig(
                    format!("timing.{name} must be non-zero").into(),
                ));
            }
        }

        for (name, value) in self.channels.fields() {
            if value == 0 {
                return Err(EngineError::InvalidConfig(
                    format!("channels.{name} must be non-zero").into(),
                ));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        EngineConfig::default().validate().unwrap();
    }

    #[test]
    fn test_defaults_match_cadences() {
        let t = TimingConfig::default();
        assert_eq!(t.tick(), Duration::from_secs(1));
        assert_eq!(t.watchdog(), Duration::from_secs(5));
        assert_eq!(t.ping_reap(), Duration::from_secs(600));
        assert_eq!(t.stun_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_toml_roundtrip() {
        let mut config = EngineConfig::default();
        config.session_is_node_key = true;
        config.stun_servers.push("198.51.100.1:3478".parse().unwrap());

        let s = config.to_toml_string().unwrap();
        assert_eq!(EngineConfig::from_toml_str(&s).unwrap(), config);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = EngineConfig::from_toml_str("[channels]\ntraffic_inbox = 64\n").unwrap();
        assert_eq!(config.channels.traffic_inbox, 64);
        assert_eq!(config.channels.out_conn_inbox, 10);
        assert_eq!(config.timing, TimingConfig::default());
    }

    #[test]
    fn test_validate_rejects_zero() {
        let err = EngineConfig::from_toml_str("[timing]\ntick_ms = 0\n").unwrap_err();
        assert!(err.to_string().contains("timing.tick_ms"));

        let mut config = EngineConfig::default();
        config.channels.in_conn_frames = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_malformed_toml() {
        assert!(matches!(
            EngineConfig::from_toml_str("timing = 3"),
            Err(EngineError::InvalidConfig(_))
        ));
    }
}
