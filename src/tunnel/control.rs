//! Control task: serves tunnel requests and completes pending sessions
//!
//! Requests are answered exactly once. The channel pair is claimed on the
//! control task itself; the dial, accept or bind runs on a spawned task so a
//! slow target never holds up other messages.

use super::connection::TunnelConnection;
use super::handler::{attach_stream, pump_outbound};
use super::session::TunnelSession;
use super::socks::{serve_socks5, SocksOptions};
use super::udp::relay_datagrams;
use crate::mux::{ChannelReader, Closeable, SessionLink};
use crate::protocol::{
    ControlMessage, EndianReader, RequestTarget, TunnelKind, TunnelRequest, TunnelResponse,
};
use anyhow::{anyhow, Context, Result};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::UdpSocket;
use tracing::{debug, error, info, warn};

fn millis(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

pub(crate) async fn run_control(connection: TunnelConnection, mut reader: EndianReader<ChannelReader>) {
    loop {
        let blob = match reader.read_blob().await {
            Ok(blob) => blob,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                debug!("Control channel closed");
                break;
            }
            Err(e) => {
                error!("Control channel unreadable: {}", e);
                connection.multiplexer().close().await;
                break;
            }
        };
        match ControlMessage::parse(&blob) {
            Ok(ControlMessage::Request(request)) => handle_request(&connection, request).await,
            Ok(ControlMessage::Response(response)) => handle_response(&connection, response).await,
            Err(e) => warn!("Dropped control message: {}", e),
        }
    }
}

fn failure_response(request: &TunnelRequest) -> ControlMessage {
    ControlMessage::Response(TunnelResponse {
        tunnel: request.tunnel,
        channel_type: request.channel_type,
        output_number: request.input_number,
        input_number: None,
        remote: None,
    })
}

async fn send_failure(connection: &TunnelConnection, request: &TunnelRequest) {
    if let Err(e) = connection.send_control(&failure_response(request)).await {
        debug!("Failure response not sent: {}", e);
    }
}

async fn handle_request(connection: &TunnelConnection, request: TunnelRequest) {
    debug!("Tunnel request {:?}", request);
    let mux = connection.multiplexer();
    let ty = request.channel_type;
    let session = TunnelSession::new(mux.clone(), request.tunnel, false);

    let input = match mux.claim_input(ty, request.input_number, SessionLink::Incoming(session.clone())) {
        Ok(input) => input,
        Err(e) => {
            warn!("Refusing {} request on channel {}: {}", request.tunnel, request.input_number, e);
            return send_failure(connection, &request).await;
        }
    };
    let output = match mux.claim_output(ty, request.output_number, SessionLink::Incoming(session.clone())) {
        Ok(output) => output,
        Err(e) => {
            warn!("Refusing {} request on channel {}: {}", request.tunnel, request.output_number, e);
            mux.release_input(&input);
            return send_failure(connection, &request).await;
        }
    };
    session.attach(input.clone(), output);

    // a close from the originator withdraws the request
    let owner: Arc<dyn Closeable> = session.clone();
    input.add_propagated(owner.clone()).await;

    let connection = connection.clone();
    tokio::spawn(async move {
        let outcome = tokio::select! {
            result = establish(&connection, &session, &request) => result,
            _ = session.closed() => Err(anyhow!("request withdrawn")),
            _ = connection.closed() => Err(anyhow!("connection closed")),
        };
        input.remove_propagated(&owner).await;
        if let Err(e) = outcome {
            warn!("{} request failed: {:#}", request.tunnel, e);
            let withdrawn = session.is_closed();
            session.set_result(false);
            session.close().await;
            if !withdrawn {
                send_failure(&connection, &request).await;
            }
        }
    });
}

/// Open the local end of the request, then answer and relay
async fn establish(
    connection: &TunnelConnection,
    session: &Arc<TunnelSession>,
    request: &TunnelRequest,
) -> Result<()> {
    let dialer = connection.dialer().clone();
    let timeout = millis(request.connect_timeout_ms);
    let capacity = connection.config().packet_size * 4;

    match (&request.target, request.tunnel) {
        (RequestTarget::Endpoint { host, port }, TunnelKind::Tcp) => {
            let stream = if request.proxy.is_accept() {
                dialer.accept(host, *port, timeout).await
            } else {
                dialer
                    .connect(&request.bind, host, *port, timeout, &request.proxy)
                    .await
            }
            .with_context(|| format!("Failed to reach {}:{}", host, port))?;
            let _ = stream.set_nodelay(true);
            let remote = stream
                .peer_addr()
                .ok()
                .map(|addr| (addr.ip().to_string(), addr.port()));
            answer(connection, session, request, stream, remote).await
        }
        (RequestTarget::Endpoint { host, port }, TunnelKind::Udp) => {
            let bind = if request.bind.is_empty() {
                "0.0.0.0:0"
            } else {
                request.bind.as_str()
            };
            let socket = UdpSocket::bind(bind)
                .await
                .with_context(|| format!("Failed to bind UDP socket on {}", bind))?;
            let connected = !host.is_empty();
            if connected {
                socket
                    .connect((host.as_str(), *port))
                    .await
                    .with_context(|| format!("Failed to associate with {}:{}", host, port))?;
            }
            let local = socket.local_addr()?;
            let (inner, outer) = tokio::io::duplex(capacity);
            tokio::spawn(async move {
                if let Err(e) = relay_datagrams(outer, socket, connected).await {
                    debug!("UDP relay stopped: {:#}", e);
                }
            });
            let remote = Some((local.ip().to_string(), local.port()));
            answer(connection, session, request, inner, remote).await
        }
        (RequestTarget::Socks { username, password }, TunnelKind::Socks) => {
            let options = SocksOptions {
                username: username.clone(),
                password: password.clone(),
                bind: request.bind.clone(),
                proxy: request.proxy.clone(),
                connect_timeout: timeout,
            };
            let (inner, outer) = tokio::io::duplex(capacity);
            tokio::spawn(async move {
                if let Err(e) = serve_socks5(outer, &options, dialer.as_ref()).await {
                    debug!("SOCKS5 session ended: {:#}", e);
                }
            });
            answer(connection, session, request, inner, None).await
        }
        (target, tunnel) => Err(anyhow!("{} request with target {:?}", tunnel, target)),
    }
}

async fn answer<S>(
    connection: &TunnelConnection,
    session: &Arc<TunnelSession>,
    request: &TunnelRequest,
    stream: S,
    remote: Option<(String, u16)>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let output = session
        .output()
        .cloned()
        .ok_or_else(|| anyhow!("session has no channels"))?;
    let read_half = attach_stream(session, stream).await?;
    output.open().await?;

    if let Some((host, port)) = &remote {
        session.set_remote(host.clone(), *port);
    }
    connection
        .send_control(&ControlMessage::Response(TunnelResponse {
            tunnel: request.tunnel,
            channel_type: request.channel_type,
            output_number: request.input_number,
            input_number: Some(request.output_number),
            remote,
        }))
        .await?;
    session.set_result(true);
    info!(
        "{} tunnel established (in={}, out={})",
        request.tunnel, request.input_number, request.output_number
    );

    tokio::spawn(pump_outbound(
        session.clone(),
        read_half,
        millis(request.data_timeout_ms),
    ));
    Ok(())
}

async fn handle_response(connection: &TunnelConnection, response: TunnelResponse) {
    let link = connection
        .multiplexer()
        .output_link(response.channel_type, response.output_number);
    let session = match link {
        Some(SessionLink::Outgoing(session)) => session,
        other => {
            warn!(
                "Dropped response for channel {}: no pending session ({:?})",
                response.output_number, other
            );
            return;
        }
    };

    if response.is_success() {
        if let Some((host, port)) = response.remote {
            session.set_remote(host, port);
        }
        session.set_result(true);
    } else {
        debug!("Remote refused request on channel {}", response.output_number);
        session.set_result(false);
        session.close().await;
    }
}
