//! `connect` mode: dial the peer and serve the configured forwards
//!
//! The transport is re-established with exponential backoff whenever it
//! drops; forward listeners stay bound across reconnects.

mod forward;

pub use forward::Forward;

use crate::config::Config;
use crate::transport::{connect_transport, Dialer, DirectDialer, SocketOpts};
use crate::tunnel::{TunnelChannel, TunnelConnection};
use anyhow::Result;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

/// Run until shutdown or until reconnecting keeps failing
pub async fn run_client(
    config: Config,
    remote_addr: String,
    mut shutdown_rx: broadcast::Receiver<bool>,
) -> Result<()> {
    let opts = SocketOpts::from_tcp_config(&config.transport.tcp);
    let dialer: Arc<dyn Dialer> = Arc::new(DirectDialer::new(opts.clone()));
    let retry = config.transport.retry();

    let mut forwards = Vec::with_capacity(config.forward.len());
    for forward in &config.forward {
        forwards.push(Forward::bind(forward.clone()).await?);
    }

    let mut attempt = 0;
    loop {
        let connect = connect_transport(&remote_addr, &opts, config.transport.connect_timeout());
        let result = tokio::select! {
            result = connect => result,
            _ = shutdown_rx.recv() => return Ok(()),
        };

        match result {
            Ok(stream) => {
                attempt = 0;
                let connection =
                    TunnelConnection::start(stream, config.tunnel.clone(), dialer.clone()).await?;
                info!("Connected to {}", remote_addr);

                let channel = TunnelChannel::new(connection.clone());
                for forward in &forwards {
                    let forward = forward.clone();
                    let channel = channel.clone();
                    tokio::spawn(async move { forward.serve(channel).await });
                }

                tokio::select! {
                    _ = connection.closed() => warn!("Connection to {} lost", remote_addr),
                    _ = shutdown_rx.recv() => {
                        info!("Shutdown signal received, closing connection");
                        connection.close().await;
                        return Ok(());
                    }
                }
                connection.close().await;
            }
            Err(e) => {
                attempt += 1;
                if attempt > retry.max_retries {
                    error!("Max retries exceeded, giving up");
                    return Err(e);
                }
                warn!("{:#}; retry {}/{}", e, attempt, retry.max_retries);
            }
        }

        let delay = retry.delay_for_attempt(attempt.saturating_sub(1));
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown_rx.recv() => return Ok(()),
        }
    }
}
