//! `serve` mode: accept transport connections and answer their requests

use crate::config::Config;
use crate::transport::{Dialer, DirectDialer, SocketOpts};
use crate::tunnel::TunnelConnection;
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Accept connections on `listen_addr` until shutdown
pub async fn run_server(
    config: Config,
    listen_addr: String,
    mut shutdown_rx: broadcast::Receiver<bool>,
) -> Result<()> {
    let listener = TcpListener::bind(&listen_addr)
        .await
        .with_context(|| format!("Failed to listen on {}", listen_addr))?;
    info!("Listening on {}", listener.local_addr()?);

    let opts = SocketOpts::from_tcp_config(&config.transport.tcp);
    let dialer: Arc<dyn Dialer> = Arc::new(DirectDialer::new(opts.clone()));

    loop {
        let (stream, peer) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Accept failed: {}", e);
                    continue;
                }
            },
            _ = shutdown_rx.recv() => {
                info!("Shutdown signal received, stopping server");
                return Ok(());
            }
        };
        if let Err(e) = opts.apply(&stream) {
            debug!("Failed to apply socket options for {}: {}", peer, e);
        }

        let config = config.clone();
        let dialer = dialer.clone();
        let shutdown = shutdown_rx.resubscribe();
        tokio::spawn(async move {
            if let Err(e) = serve_connection(stream, config, dialer, shutdown).await {
                warn!("Connection from {} failed: {:#}", peer, e);
            }
            info!("Connection from {} closed", peer);
        });
    }
}

async fn serve_connection(
    stream: TcpStream,
    config: Config,
    dialer: Arc<dyn Dialer>,
    mut shutdown_rx: broadcast::Receiver<bool>,
) -> Result<()> {
    let connection = TunnelConnection::start(stream, config.tunnel, dialer).await?;
    tokio::select! {
        _ = connection.closed() => {}
        _ = shutdown_rx.recv() => {}
    }
    connection.close().await;
    Ok(())
}
