//! Configuration loading
//!
//! A TOML file with a `[tunnel]` section for the engine, a `[transport]`
//! section for the shared connection and any number of `[[forward]]`
//! entries used by the `connect` command.

mod transport;
mod tunnel;

pub use transport::{TcpConfig, TransportConfig};
pub use tunnel::TunnelConfig;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Local listener tunnelled to a remote target
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ForwardConfig {
    /// Local address to listen on
    pub local: String,
    /// Target host as seen from the remote side
    pub host: String,
    /// Target port
    pub port: u16,
}

/// Whole configuration file
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub tunnel: TunnelConfig,

    #[serde(default)]
    pub transport: TransportConfig,

    #[serde(default)]
    pub forward: Vec<ForwardConfig>,
}

/// Load configuration from a TOML file
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let content = std::fs::read_to_string(path.as_ref())
        .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;

    parse_config(&content)
}

/// Parse and validate configuration from a TOML string
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse configuration")?;
    config
        .tunnel
        .validate()
        .with_context(|| "Invalid [tunnel] section")?;
    Ok(config)
}
