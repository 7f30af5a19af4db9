//! Outbound and inbound TCP establishment for tunnel responders

use super::proxy::{ProxyKind, ProxySpec};
use super::SocketOpts;
use async_trait::async_trait;
use std::fmt::Debug;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{lookup_host, TcpListener, TcpSocket, TcpStream};
use tracing::{debug, trace};

/// Establishes the real sockets behind tunnel sessions
#[async_trait]
pub trait Dialer: Debug + Send + Sync {
    /// Connect to `host:port`, optionally from `bind` and through `proxy`
    async fn connect(
        &self,
        bind: &str,
        host: &str,
        port: u16,
        timeout: Option<Duration>,
        proxy: &ProxySpec,
    ) -> io::Result<TcpStream>;

    /// Listen on `host:port` and accept a single connection
    async fn accept(&self, host: &str, port: u16, timeout: Option<Duration>)
        -> io::Result<TcpStream>;
}

/// Dialer backed by the OS network stack
#[derive(Debug, Clone, Default)]
pub struct DirectDialer {
    socket_opts: SocketOpts,
    /// Proxy used for [`ProxyKind::Global`] requests
    global: Option<ProxySpec>,
}

fn other_error<E: std::error::Error + Send + Sync + 'static>(err: E) -> io::Error {
    io::Error::new(io::ErrorKind::Other, err)
}

async fn with_timeout<T, F>(timeout: Option<Duration>, what: &str, fut: F) -> io::Result<T>
where
    F: std::future::Future<Output = io::Result<T>>,
{
    match timeout {
        Some(limit) => tokio::time::timeout(limit, fut).await.map_err(|_| {
            io::Error::new(io::ErrorKind::TimedOut, format!("{} timed out", what))
        })?,
        None => fut.await,
    }
}

async fn resolve_bind(bind: &str) -> io::Result<SocketAddr> {
    if let Ok(addr) = bind.parse::<SocketAddr>() {
        return Ok(addr);
    }
    lookup_host((bind, 0)).await?.next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("cannot resolve bind address {}", bind),
        )
    })
}

impl DirectDialer {
    pub fn new(socket_opts: SocketOpts) -> Self {
        DirectDialer {
            socket_opts,
            global: None,
        }
    }

    /// Proxy to use when a request asks for the global one
    pub fn with_global_proxy(mut self, proxy: ProxySpec) -> Self {
        self.global = Some(proxy);
        self
    }

    async fn connect_from(&self, bind: Option<SocketAddr>, target: SocketAddr) -> io::Result<TcpStream> {
        let stream = match bind {
            Some(local) => {
                let socket = socket2::Socket::new(
                    socket2::Domain::for_address(target),
                    socket2::Type::STREAM,
                    Some(socket2::Protocol::TCP),
                )?;
                socket.set_nonblocking(true)?;
                socket.set_reuse_address(true)?;
                socket.bind(&local.into())?;
                let std_stream: std::net::TcpStream = socket.into();
                TcpSocket::from_std_stream(std_stream).connect(target).await?
            }
            None => TcpStream::connect(target).await?,
        };
        if let Err(e) = self.socket_opts.apply(&stream) {
            debug!("Failed to apply socket options: {}", e);
        }
        Ok(stream)
    }

    /// Plain TCP connect, trying each resolved address in turn
    async fn dial(&self, bind: &str, host: &str, port: u16) -> io::Result<TcpStream> {
        let bind = if bind.is_empty() {
            None
        } else {
            Some(resolve_bind(bind).await?)
        };

        let mut last_err = None;
        for target in lookup_host((host, port)).await? {
            if let Some(local) = bind {
                if local.is_ipv4() != target.is_ipv4() {
                    continue;
                }
            }
            trace!("Dialing {}", target);
            match self.connect_from(bind, target).await {
                Ok(stream) => return Ok(stream),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("no usable address for {}:{}", host, port),
            )
        }))
    }

    async fn via_socks(
        &self,
        bind: &str,
        host: &str,
        port: u16,
        proxy: &ProxySpec,
    ) -> io::Result<TcpStream> {
        let mut stream = self.dial(bind, &proxy.host, proxy.port).await?;
        let auth = proxy
            .username
            .as_ref()
            .map(|user| async_socks5::Auth::new(user.as_str(), proxy.password.as_deref().unwrap_or("")));
        async_socks5::connect(&mut stream, (host.to_string(), port), auth)
            .await
            .map_err(other_error)?;
        Ok(stream)
    }

    async fn via_http(
        &self,
        bind: &str,
        host: &str,
        port: u16,
        proxy: &ProxySpec,
    ) -> io::Result<TcpStream> {
        let mut stream = self.dial(bind, &proxy.host, proxy.port).await?;
        match &proxy.username {
            Some(user) => async_http_proxy::http_connect_tokio_with_basic_auth(
                &mut stream,
                host,
                port,
                user,
                proxy.password.as_deref().unwrap_or(""),
            )
            .await
            .map_err(other_error)?,
            None => async_http_proxy::http_connect_tokio(&mut stream, host, port)
                .await
                .map_err(other_error)?,
        }
        Ok(stream)
    }

    fn resolve_proxy<'a>(&'a self, proxy: &'a ProxySpec) -> &'a ProxySpec {
        match (proxy.kind, &self.global) {
            (ProxyKind::Global, Some(global)) => global,
            _ => proxy,
        }
    }

    async fn connect_with(
        &self,
        bind: &str,
        host: &str,
        port: u16,
        proxy: &ProxySpec,
    ) -> io::Result<TcpStream> {
        let proxy = self.resolve_proxy(proxy);
        match proxy.kind {
            ProxyKind::Direct | ProxyKind::Accept | ProxyKind::Global => {
                self.dial(bind, host, port).await
            }
            ProxyKind::Socks => self.via_socks(bind, host, port, proxy).await,
            ProxyKind::Http => self.via_http(bind, host, port, proxy).await,
            ProxyKind::Plus => match self.via_socks(bind, host, port, proxy).await {
                Ok(stream) => Ok(stream),
                Err(e) => {
                    debug!("SOCKS proxy failed ({}), trying HTTP CONNECT", e);
                    self.via_http(bind, host, port, proxy).await
                }
            },
        }
    }
}

#[async_trait]
impl Dialer for DirectDialer {
    async fn connect(
        &self,
        bind: &str,
        host: &str,
        port: u16,
        timeout: Option<Duration>,
        proxy: &ProxySpec,
    ) -> io::Result<TcpStream> {
        let stream = with_timeout(timeout, "connect", self.connect_with(bind, host, port, proxy)).await?;
        debug!("Connected to {}:{} via {:?}", host, port, proxy.kind);
        Ok(stream)
    }

    async fn accept(
        &self,
        host: &str,
        port: u16,
        timeout: Option<Duration>,
    ) -> io::Result<TcpStream> {
        let host = if host.is_empty() { "0.0.0.0" } else { host };
        let listener = TcpListener::bind((host, port)).await?;
        debug!("Waiting for a connection on {}", listener.local_addr()?);
        let (stream, peer) = with_timeout(timeout, "accept", listener.accept()).await?;
        debug!("Accepted connection from {}", peer);
        if let Err(e) = self.socket_opts.apply(&stream) {
            debug!("Failed to apply socket options: {}", e);
        }
        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_direct_connect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (mut s, _) = listener.accept().await.unwrap();
            s.write_all(b"hi").await.unwrap();
        });

        let dialer = DirectDialer::default();
        let mut stream = dialer
            .connect("", "127.0.0.1", port, Some(Duration::from_secs(2)), &ProxySpec::direct())
            .await
            .unwrap();
        let mut buf = [0u8; 2];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_with_bind_address() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move { listener.accept().await.unwrap().1 });

        let dialer = DirectDialer::default();
        let stream = dialer
            .connect("127.0.0.1", "127.0.0.1", port, None, &ProxySpec::direct())
            .await
            .unwrap();
        let peer = server.await.unwrap();
        assert_eq!(stream.local_addr().unwrap(), peer);
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let dialer = DirectDialer::default();
        let result = dialer
            .connect("", "127.0.0.1", port, Some(Duration::from_secs(2)), &ProxySpec::direct())
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_accept_times_out() {
        let dialer = DirectDialer::default();
        let err = dialer
            .accept("127.0.0.1", 0, Some(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }
}
