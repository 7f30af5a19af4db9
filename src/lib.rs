//! # Muxtun - channel multiplexing and tunnelling over one connection
//!
//! Muxtun carries many independent byte streams over a single ordered
//! transport (normally one TCP connection). Each packet is tagged with a
//! channel and a per-channel sequence value both ends derive from a shared
//! seed, so a misrouted packet is detected instead of silently corrupting
//! another stream.
//!
//! On top of the multiplexer sits a small control protocol that lets either
//! side ask the other to open TCP connections, accept one, run a SOCKS5
//! server or relay UDP datagrams on its behalf.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use muxtun::config::TunnelConfig;
//! use muxtun::transport::{DirectDialer, ProxySpec};
//! use muxtun::tunnel::{TunnelChannel, TunnelConnection};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let transport = tokio::net::TcpStream::connect("peer:7000").await?;
//!     let dialer = Arc::new(DirectDialer::default());
//!     let connection = TunnelConnection::start(transport, TunnelConfig::default(), dialer).await?;
//!
//!     let channel = TunnelChannel::new(connection);
//!     let stream = channel.connect("example.com", 80, &ProxySpec::direct()).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! socket <-> TunnelSession <-> (InputChannel, OutputChannel) <-> Multiplexer <-> transport
//!                                         control channel <-> control task
//! ```

#![warn(rust_2018_idioms)]

pub mod client;
pub mod config;
pub mod error;
pub mod helper;
pub mod mux;
pub mod protocol;
pub mod server;
pub mod transport;
pub mod tunnel;

pub use client::run_client;
pub use config::{load_config, Config};
pub use error::TunnelError;
pub use server::run_server;

/// Version of the Muxtun library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Name of the application
pub const NAME: &str = env!("CARGO_PKG_NAME");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name() {
        assert_eq!(NAME, "muxtun");
        assert!(!VERSION.is_empty());
    }
}
