//! Local listeners tunnelled through the connection

use crate::config::ForwardConfig;
use crate::transport::ProxySpec;
use crate::tunnel::TunnelChannel;
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

/// Listener bound once and reused across reconnects
#[derive(Debug, Clone)]
pub struct Forward {
    pub config: ForwardConfig,
    listener: Arc<TcpListener>,
}

impl Forward {
    pub async fn bind(config: ForwardConfig) -> Result<Self> {
        let listener = TcpListener::bind(&config.local)
            .await
            .with_context(|| format!("Failed to listen on {}", config.local))?;
        info!(
            "Forwarding {} to {}:{}",
            listener.local_addr()?,
            config.host,
            config.port
        );
        Ok(Forward {
            config,
            listener: Arc::new(listener),
        })
    }

    /// Accept and tunnel sockets until the connection closes
    pub async fn serve(&self, channel: TunnelChannel) {
        let connection = channel.connection().clone();
        loop {
            let accepted = tokio::select! {
                accepted = self.listener.accept() => accepted,
                _ = connection.closed() => break,
            };
            match accepted {
                Ok((socket, peer)) => {
                    debug!("Accepted {} on {}", peer, self.config.local);
                    let channel = channel.clone();
                    let config = self.config.clone();
                    tokio::spawn(async move {
                        if let Err(e) = forward_socket(socket, &channel, &config).await {
                            warn!("Forward to {}:{} failed: {:#}", config.host, config.port, e);
                        }
                    });
                }
                Err(e) => warn!("Accept on {} failed: {}", self.config.local, e),
            }
        }
    }
}

async fn forward_socket(mut socket: TcpStream, channel: &TunnelChannel, config: &ForwardConfig) -> Result<()> {
    let _ = socket.set_nodelay(true);
    let mut stream = channel
        .connect(&config.host, config.port, &ProxySpec::global())
        .await
        .with_context(|| format!("Tunnel to {}:{} refused", config.host, config.port))?;
    let (up, down) = tokio::io::copy_bidirectional(&mut socket, &mut stream).await?;
    debug!("Forward to {}:{} done ({} up, {} down)", config.host, config.port, up, down);
    Ok(())
}
