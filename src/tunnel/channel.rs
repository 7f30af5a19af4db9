//! Originator API
//!
//! Each call claims a channel pair, wires an in-memory pipe to it, sends the
//! request and waits for the peer's answer. The caller gets the other end of
//! the pipe.

use super::connection::TunnelConnection;
use super::handler::{attach_stream, pump_outbound};
use super::piped::TunnelStream;
use super::session::TunnelSession;
use super::udp::TunnelDatagramSocket;
use crate::error::{Result, TunnelError};
use crate::mux::{ChannelType, SessionLink};
use crate::protocol::{ControlMessage, RequestTarget, TunnelKind, TunnelRequest};
use crate::transport::ProxySpec;
use async_trait::async_trait;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Creates sockets whose far end lives on the remote peer
#[async_trait]
pub trait RemoteSocketFactory: Send + Sync {
    /// Connect from the peer to `host:port`
    async fn create_socket(&self, host: &str, port: u16) -> io::Result<TunnelStream>;

    /// Let the peer accept one connection on `host:port`
    async fn accept_socket(
        &self,
        host: &str,
        port: u16,
        timeout: Option<Duration>,
    ) -> io::Result<TunnelStream>;
}

struct OpenRequest<'a> {
    tunnel: TunnelKind,
    bind: &'a str,
    target: RequestTarget,
    proxy: ProxySpec,
    connect_timeout: Option<Duration>,
}

/// Closes a half-opened session when the opening future is dropped
struct PendingSession(Option<Arc<TunnelSession>>);

impl PendingSession {
    fn complete(mut self) {
        self.0 = None;
    }
}

impl Drop for PendingSession {
    fn drop(&mut self) {
        let Some(session) = self.0.take() else {
            return;
        };
        if session.is_closed() {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { session.close().await });
            }
            Err(_) => debug!("No runtime left to close abandoned session"),
        }
    }
}

/// Session factory over one connection
#[derive(Debug, Clone)]
pub struct TunnelChannel {
    connection: TunnelConnection,
    channel_type: ChannelType,
    proxy: ProxySpec,
}

fn as_millis(timeout: Option<Duration>) -> u64 {
    timeout.map_or(0, |t| t.as_millis().max(1) as u64)
}

impl TunnelChannel {
    /// Use the configured session channel type and the peer's global proxy
    pub fn new(connection: TunnelConnection) -> Self {
        let channel_type = connection.config().session_channel_type();
        TunnelChannel {
            connection,
            channel_type,
            proxy: ProxySpec::global(),
        }
    }

    pub fn with_channel_type(mut self, channel_type: ChannelType) -> Self {
        self.channel_type = channel_type;
        self
    }

    /// Proxy used by [`RemoteSocketFactory::create_socket`]
    pub fn with_proxy(mut self, proxy: ProxySpec) -> Self {
        self.proxy = proxy;
        self
    }

    pub fn connection(&self) -> &TunnelConnection {
        &self.connection
    }

    pub fn channel_type(&self) -> ChannelType {
        self.channel_type
    }

    /// TCP connection from the peer to `host:port`
    pub async fn connect(&self, host: &str, port: u16, proxy: &ProxySpec) -> Result<TunnelStream> {
        self.open(OpenRequest {
            tunnel: TunnelKind::Tcp,
            bind: "",
            target: RequestTarget::Endpoint {
                host: host.to_string(),
                port,
            },
            proxy: proxy.clone(),
            connect_timeout: self.connection.config().connect_timeout(),
        })
        .await
    }

    /// TCP connection the peer accepts on `host:port`
    pub async fn accept(&self, host: &str, port: u16, timeout: Option<Duration>) -> Result<TunnelStream> {
        self.open(OpenRequest {
            tunnel: TunnelKind::Tcp,
            bind: "",
            target: RequestTarget::Endpoint {
                host: host.to_string(),
                port,
            },
            proxy: ProxySpec::accept(),
            connect_timeout: timeout,
        })
        .await
    }

    /// SOCKS5 server run by the peer; speak SOCKS5 on the returned stream
    pub async fn socks(
        &self,
        bind: &str,
        username: Option<&str>,
        password: Option<&str>,
        proxy: &ProxySpec,
    ) -> Result<TunnelStream> {
        self.open(OpenRequest {
            tunnel: TunnelKind::Socks,
            bind,
            target: RequestTarget::Socks {
                username: username.map(str::to_string),
                password: password.map(str::to_string),
            },
            proxy: proxy.clone(),
            connect_timeout: self.connection.config().connect_timeout(),
        })
        .await
    }

    /// UDP association on the peer, connected to `host:port` unless `host`
    /// is empty
    pub async fn udp(&self, host: &str, port: u16) -> Result<TunnelDatagramSocket> {
        let stream = self
            .open(OpenRequest {
                tunnel: TunnelKind::Udp,
                bind: "",
                target: RequestTarget::Endpoint {
                    host: host.to_string(),
                    port,
                },
                proxy: ProxySpec::direct(),
                connect_timeout: self.connection.config().connect_timeout(),
            })
            .await?;
        Ok(TunnelDatagramSocket::new(stream))
    }

    async fn open(&self, request: OpenRequest<'_>) -> Result<TunnelStream> {
        let mux = self.connection.multiplexer();
        let ty = self.channel_type;
        let session = TunnelSession::new(mux.clone(), request.tunnel, true);
        let pending = PendingSession(Some(session.clone()));

        let refused = |e: TunnelError| match e {
            TunnelError::ResourceExhausted => TunnelError::Connect(e.to_string()),
            other => other,
        };
        let output = mux
            .link_output(ty, SessionLink::Outgoing(session.clone()))
            .map_err(refused)?;
        let input = match mux.link_input(ty, SessionLink::Outgoing(session.clone())) {
            Ok(input) => input,
            Err(e) => {
                mux.release_output(&output);
                return Err(refused(e));
            }
        };
        session.attach(input.clone(), output.clone());

        let capacity = self.connection.config().packet_size * 4;
        let (user, inner) = tokio::io::duplex(capacity);
        let read_half = match attach_stream(&session, inner).await {
            Ok(read_half) => read_half,
            Err(e) => {
                session.close().await;
                return Err(e);
            }
        };

        let message = ControlMessage::Request(TunnelRequest {
            tunnel: request.tunnel,
            channel_type: ty,
            output_number: input.number(),
            input_number: output.number(),
            connect_timeout_ms: as_millis(request.connect_timeout),
            data_timeout_ms: self.connection.config().data_timeout_ms,
            bind: request.bind.to_string(),
            target: request.target,
            proxy: request.proxy,
        });
        let sent = async {
            output.open().await?;
            self.connection.send_control(&message).await
        };
        if let Err(e) = sent.await {
            session.close().await;
            return Err(e);
        }

        let established = tokio::select! {
            ok = session.wait_result() => ok,
            _ = self.connection.closed() => false,
        };
        if !established {
            session.close().await;
            debug!("{} request on channel {} failed", request.tunnel, output.number());
            return Err(if self.connection.is_closed() {
                TunnelConnection::closed_error()
            } else {
                TunnelError::Connect(format!("remote refused {} tunnel", request.tunnel))
            });
        }

        info!(
            "{} tunnel established (in={}, out={})",
            request.tunnel,
            input.number(),
            output.number()
        );
        pending.complete();
        tokio::spawn(pump_outbound(session.clone(), read_half, None));
        Ok(TunnelStream::new(user, session))
    }
}

#[async_trait]
impl RemoteSocketFactory for TunnelChannel {
    async fn create_socket(&self, host: &str, port: u16) -> io::Result<TunnelStream> {
        Ok(self.connect(host, port, &self.proxy).await?)
    }

    async fn accept_socket(
        &self,
        host: &str,
        port: u16,
        timeout: Option<Duration>,
    ) -> io::Result<TunnelStream> {
        Ok(self.accept(host, port, timeout).await?)
    }
}
