//! `[transport]` section: how the shared connection is dialed and kept alive

use crate::helper::{RetryConfig, DEFAULT_CONNECT_TIMEOUT_SECS};
use serde::{Deserialize, Serialize};
use std::time::Duration;

fn default_connect_timeout_secs() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_SECS
}

fn default_max_retries() -> u32 {
    10
}

fn default_retry_initial_ms() -> u64 {
    1000
}

fn default_retry_max_secs() -> u64 {
    60
}

/// Shared transport settings
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TransportConfig {
    /// Dial timeout of the `connect` command
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Failed dials in a row before the client gives up
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// First reconnect delay; doubles per failure
    #[serde(default = "default_retry_initial_ms")]
    pub retry_initial_ms: u64,

    /// Reconnect delay cap
    #[serde(default = "default_retry_max_secs")]
    pub retry_max_secs: u64,

    #[serde(default)]
    pub tcp: TcpConfig,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            connect_timeout_secs: default_connect_timeout_secs(),
            max_retries: default_max_retries(),
            retry_initial_ms: default_retry_initial_ms(),
            retry_max_secs: default_retry_max_secs(),
            tcp: TcpConfig::default(),
        }
    }
}

impl TransportConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.max(1))
    }

    /// Reconnect policy of the client
    pub fn retry(&self) -> RetryConfig {
        let initial_delay = Duration::from_millis(self.retry_initial_ms);
        RetryConfig {
            max_retries: self.max_retries,
            initial_delay,
            max_delay: Duration::from_secs(self.retry_max_secs).max(initial_delay),
            ..RetryConfig::default()
        }
    }
}

fn default_nodelay() -> bool {
    true
}

fn default_keepalive_secs() -> u64 {
    20
}

fn default_keepalive_interval() -> u64 {
    8
}

/// Options applied to the transport socket; 0 disables keepalive
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct TcpConfig {
    #[serde(default = "default_nodelay")]
    pub nodelay: bool,

    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,

    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval: u64,
}

impl Default for TcpConfig {
    fn default() -> Self {
        TcpConfig {
            nodelay: default_nodelay(),
            keepalive_secs: default_keepalive_secs(),
            keepalive_interval: default_keepalive_interval(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TransportConfig::default();
        assert_eq!(config.connect_timeout(), Duration::from_secs(10));
        assert_eq!(config.tcp, TcpConfig::default());
        assert!(config.tcp.nodelay);
    }

    #[test]
    fn test_retry_policy_from_config() {
        let config = TransportConfig {
            max_retries: 3,
            retry_initial_ms: 250,
            retry_max_secs: 0,
            ..TransportConfig::default()
        };
        let retry = config.retry();
        assert_eq!(retry.max_retries, 3);
        assert_eq!(retry.delay_for_attempt(0), Duration::from_millis(250));
        // the cap never undercuts the first delay
        assert_eq!(retry.delay_for_attempt(5), Duration::from_millis(250));
    }
}
