//! SOCKS5 server run by the responder of a `S` tunnel
//!
//! The server speaks to the originator over the tunnel's piped stream and
//! dials each CONNECT target through the request's proxy.

mod auth;
mod command;
mod consts;

pub use auth::{authenticate, AuthMethod};
pub use command::{build_reply, parse_command, SocksCommand, TargetAddr};
pub use consts::*;

use crate::transport::{Dialer, ProxySpec};
use anyhow::{Context, Result};
use command::io_error_to_reply_code;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

/// Per-tunnel server settings taken from the request
#[derive(Debug, Clone, Default)]
pub struct SocksOptions {
    pub username: Option<String>,
    pub password: Option<String>,
    /// Local bind address for target dials
    pub bind: String,
    pub proxy: ProxySpec,
    pub connect_timeout: Option<Duration>,
}

impl SocksOptions {
    pub fn auth_required(&self) -> bool {
        self.username.is_some()
    }
}

/// Serve one SOCKS5 client on `stream`
pub async fn serve_socks5<S>(mut stream: S, options: &SocksOptions, dialer: &dyn Dialer) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let method = authenticate(&mut stream, options)
        .await
        .with_context(|| "Authentication negotiation failed")?;
    debug!("Authentication completed with method: {:?}", method);

    let (command, target) = parse_command(&mut stream)
        .await
        .with_context(|| "Failed to parse SOCKS5 command")?;
    info!("SOCKS5 {} request to {}", command, target);

    if command != SocksCommand::Connect {
        warn!("{} command not supported over the tunnel", command);
        build_reply(&mut stream, SOCKS5_REPLY_COMMAND_NOT_SUPPORTED, None).await?;
        return Ok(());
    }

    let target_stream = match dialer
        .connect(
            &options.bind,
            &target.host(),
            target.port(),
            options.connect_timeout,
            &options.proxy,
        )
        .await
    {
        Ok(s) => s,
        Err(e) => {
            warn!("Failed to connect to {}: {}", target, e);
            build_reply(&mut stream, io_error_to_reply_code(&e), None).await?;
            return Err(e.into());
        }
    };

    build_reply(&mut stream, SOCKS5_REPLY_SUCCEEDED, target_stream.local_addr().ok()).await?;
    info!("SOCKS5 tunnel established to {}", target);
    relay_tcp(stream, target_stream).await
}

/// Copy both ways until either direction finishes
pub async fn relay_tcp<A, B>(a: A, b: B) -> Result<()>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);

    tokio::select! {
        result = tokio::io::copy(&mut a_read, &mut b_write) => match result {
            Ok(bytes) => debug!("A->B finished: {} bytes", bytes),
            Err(e) => debug!("A->B error: {}", e),
        },
        result = tokio::io::copy(&mut b_read, &mut a_write) => match result {
            Ok(bytes) => debug!("B->A finished: {} bytes", bytes),
            Err(e) => debug!("B->A error: {}", e),
        },
    }
    Ok(())
}
