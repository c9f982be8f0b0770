//! Membership service configuration.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Settings for one cluster member.
///
/// Every timing field is in milliseconds so the struct reads naturally from
/// JSON:
///
/// ```json
/// { "bind_addr": "127.0.0.1:5000", "seeds": ["127.0.0.1:5001"], "heartbeat_interval_ms": 500 }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MembershipConfig {
    /// Local UDP address to bind.
    pub bind_addr: SocketAddr,

    /// Address peers should use to reach this node.
    /// Defaults to the bound address; required when binding to 0.0.0.0 or [::].
    pub advertise_addr: Option<SocketAddr>,

    /// Discovery addresses: unicast peers and/or one IPv4 multicast group.
    pub seeds: Vec<SocketAddr>,

    pub heartbeat_interval_ms: u64,
    pub heartbeat_response_timeout_ms: u64,
    pub heartbeat_retry_count: u32,

    pub add_member_response_timeout_ms: u64,
    pub add_member_retry_count: u32,

    /// How long an incomplete fragment set is kept before it is dropped.
    pub lost_timeout_ms: u64,

    /// Largest datagram sent or received; bigger messages are fragmented.
    pub receive_buffer_size: usize,

    /// Client members observe the cluster but never vote or lead.
    pub is_client: bool,

    /// Drop messages that arrive older than one already delivered from the same sender.
    pub keep_order: bool,

    /// Response timeout used by `stop()` so teardown never waits on dead peers.
    pub shutdown_timeout_ms: u64,
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            advertise_addr: None,
            seeds: Vec::new(),
            heartbeat_interval_ms: 1000,
            heartbeat_response_timeout_ms: 500,
            heartbeat_retry_count: 1,
            add_member_response_timeout_ms: 500,
            add_member_retry_count: 1,
            lost_timeout_ms: 1000,
            receive_buffer_size: 1400,
            is_client: false,
            keep_order: false,
            shutdown_timeout_ms: 100,
        }
    }
}

impl MembershipConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("parsing config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks the values that would otherwise break the protocol at runtime.
    ///
    /// Discovery addresses are not checked here: a dynamic source may fill them
    /// in after construction, so their absence is reported by `join()`.
    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_interval_ms == 0 {
            anyhow::bail!("heartbeat_interval_ms must be > 0");
        }
        if self.heartbeat_response_timeout_ms == 0 {
            anyhow::bail!("heartbeat_response_timeout_ms must be > 0");
        }
        if self.add_member_response_timeout_ms == 0 {
            anyhow::bail!("add_member_response_timeout_ms must be > 0");
        }
        if self.lost_timeout_ms == 0 {
            anyhow::bail!("lost_timeout_ms must be > 0");
        }
        if self.receive_buffer_size < 256 || self.receive_buffer_size > 65_507 {
            anyhow::bail!(
                "receive_buffer_size must be within 256..=65507, got {}",
                self.receive_buffer_size
            );
        }
        if let Some(advertise) = self.advertise_addr
            && advertise.ip().is_unspecified()
        {
            anyhow::bail!("advertise_addr {} is not reachable by peers", advertise);
        }
        if self.advertise_addr.is_none() && self.bind_addr.ip().is_unspecified() {
            anyhow::bail!(
                "advertise_addr is required when binding to {}",
                self.bind_addr
            );
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_response_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_response_timeout_ms)
    }

    pub fn add_member_response_timeout(&self) -> Duration {
        Duration::from_millis(self.add_member_response_timeout_ms)
    }

    pub fn lost_timeout(&self) -> Duration {
        Duration::from_millis(self.lost_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// Silence after which a peer is presumed gone.
    pub fn silence_window(&self) -> Duration {
        (self.heartbeat_interval() + self.heartbeat_response_timeout())
            * self.heartbeat_retry_count.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(MembershipConfig::default().validate().is_ok());
    }

    #[test]
    fn test_unspecified_bind_needs_advertise_addr() {
        let mut config = MembershipConfig {
            bind_addr: "0.0.0.0:5000".parse().unwrap(),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        config.advertise_addr = Some("10.1.2.3:5000".parse().unwrap());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_zero_interval_and_tiny_buffer() {
        let config = MembershipConfig {
            heartbeat_interval_ms: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = MembershipConfig {
            receive_buffer_size: 64,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: MembershipConfig = serde_json::from_str(
            r#"{ "bind_addr": "127.0.0.1:6000", "is_client": true, "heartbeat_retry_count": 3 }"#,
        )
        .unwrap();

        assert_eq!(config.bind_addr.port(), 6000);
        assert!(config.is_client);
        assert_eq!(config.heartbeat_retry_count, 3);
        assert_eq!(config.receive_buffer_size, 1400);
        assert_eq!(config.silence_window(), Duration::from_millis(4500));
    }
}
