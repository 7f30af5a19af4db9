//! Network plumbing
//!
//! Socket options for the shared transport plus the [`Dialer`] responders
//! use to reach their targets, directly or through a proxy.

mod dialer;
mod proxy;

pub use dialer::{Dialer, DirectDialer};
pub use proxy::{ProxyKind, ProxySpec};

use crate::config::TcpConfig;
use anyhow::{Context, Result};
use std::time::Duration;
use tokio::net::TcpStream;

/// Socket options for configuring connections
#[derive(Debug, Clone)]
pub struct SocketOpts {
    /// Enable TCP_NODELAY
    pub nodelay: bool,
    /// TCP keepalive timeout
    pub keepalive_secs: Option<u64>,
    /// TCP keepalive interval
    pub keepalive_interval: Option<u64>,
}

impl Default for SocketOpts {
    fn default() -> Self {
        SocketOpts {
            nodelay: true,
            keepalive_secs: Some(20),
            keepalive_interval: Some(8),
        }
    }
}

impl SocketOpts {
    /// Options from `[transport.tcp]`; a zero keepalive turns it off
    pub fn from_tcp_config(config: &TcpConfig) -> Self {
        let enabled = config.keepalive_secs > 0;
        SocketOpts {
            nodelay: config.nodelay,
            keepalive_secs: enabled.then_some(config.keepalive_secs),
            keepalive_interval: enabled.then_some(config.keepalive_interval.max(1)),
        }
    }

    /// Apply socket options to a TCP stream
    pub fn apply(&self, stream: &TcpStream) -> std::io::Result<()> {
        stream.set_nodelay(self.nodelay)?;

        if let (Some(timeout), Some(interval)) = (self.keepalive_secs, self.keepalive_interval) {
            let socket = socket2::SockRef::from(stream);
            let keepalive = socket2::TcpKeepalive::new()
                .with_time(Duration::from_secs(timeout))
                .with_interval(Duration::from_secs(interval));
            socket.set_tcp_keepalive(&keepalive)?;
        }

        Ok(())
    }
}

/// Open the shared transport connection to `addr`
pub async fn connect_transport(addr: &str, opts: &SocketOpts, timeout: Duration) -> Result<TcpStream> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
        .await
        .with_context(|| format!("Connection timeout to {}", addr))?
        .with_context(|| format!("Failed to connect to {}", addr))?;

    opts.apply(&stream)
        .with_context(|| "Failed to apply socket options")?;
    tracing::debug!("Transport connection established to {}", addr);
    Ok(stream)
}
