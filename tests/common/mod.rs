//! Shared helpers for the integration tests

#![allow(dead_code)]

use bytes::BytesMut;
use muxtun::config::TunnelConfig;
use muxtun::mux::{CompressionMode, MuxSettings, Multiplexer, PipeKind, Sequencer, SessionSeed};
use muxtun::protocol::PacketHeader;
use muxtun::transport::{Dialer, DirectDialer};
use muxtun::tunnel::TunnelConnection;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::net::{TcpListener, UdpSocket};

/// Upper bound for anything a test waits on
pub const WAIT: Duration = Duration::from_secs(5);

/// Tunnel configuration builder
pub struct TestConfigBuilder {
    config: TunnelConfig,
}

impl Default for TestConfigBuilder {
    fn default() -> Self {
        TestConfigBuilder {
            config: TunnelConfig {
                token: "test-token".to_string(),
                packet_size: 1024,
                connect_timeout_ms: 2000,
                ..TunnelConfig::default()
            },
        }
    }
}

impl TestConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn token(mut self, token: &str) -> Self {
        self.config.token = token.to_string();
        self
    }

    pub fn packet_size(mut self, size: usize) -> Self {
        self.config.packet_size = size;
        self
    }

    pub fn compression(mut self, mode: CompressionMode) -> Self {
        self.config.compression = mode;
        self
    }

    pub fn build(self) -> TunnelConfig {
        self.config
    }
}

/// Two connections joined by an in-memory transport
pub async fn connection_pair(config: TunnelConfig) -> (TunnelConnection, TunnelConnection) {
    let (a, b) = duplex(256 * 1024);
    let dialer: Arc<dyn Dialer> = Arc::new(DirectDialer::default());
    let left = TunnelConnection::start(a, config.clone(), dialer.clone())
        .await
        .unwrap();
    let right = TunnelConnection::start(b, config, dialer).await.unwrap();
    (left, right)
}

pub fn test_settings() -> MuxSettings {
    MuxSettings {
        packet_size: 512,
        pipe_capacity: 64,
        delivery_timeout: Duration::from_millis(200),
    }
}

/// Two engines joined by an in-memory transport
pub fn mux_pair(seed: u64) -> (Multiplexer, Multiplexer) {
    let (a, b) = duplex(256 * 1024);
    let seed = SessionSeed::from_u64(seed);
    (
        Multiplexer::start(a, test_settings(), seed),
        Multiplexer::start(b, test_settings(), seed),
    )
}

/// Engine on one end, raw transport on the other
pub fn mux_with_raw_peer(seed: u64) -> (Multiplexer, DuplexStream) {
    let (a, b) = duplex(64 * 1024);
    (
        Multiplexer::start(a, test_settings(), SessionSeed::from_u64(seed)),
        b,
    )
}

/// Sequencer the engine uses for `(kind, number)`
pub fn peer_sequencer(seed: u64, kind: PipeKind, number: u32) -> Sequencer {
    SessionSeed::from_u64(seed).sequencer(kind, number)
}

/// Encode one raw packet
pub fn raw_packet(header: &PacketHeader, payload: &[u8]) -> Vec<u8> {
    let mut buf = BytesMut::new();
    header.encode(&mut buf);
    buf.extend_from_slice(payload);
    buf.to_vec()
}

/// TCP echo server, one task per connection
pub async fn spawn_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if socket.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

/// UDP echo server
pub async fn spawn_udp_echo() -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = vec![0u8; 2048];
        while let Ok((n, from)) = socket.recv_from(&mut buf).await {
            let _ = socket.send_to(&buf[..n], from).await;
        }
    });
    addr
}

/// Port nothing listens on
pub async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

/// Client side of the SOCKS5 handshake
pub mod socks5_mock {
    use muxtun::tunnel::socks::*;

    pub fn create_auth_request_no_auth() -> Vec<u8> {
        vec![SOCKS5_VERSION, 1, SOCKS5_AUTH_METHOD_NONE]
    }

    pub fn create_auth_request_password() -> Vec<u8> {
        vec![SOCKS5_VERSION, 1, SOCKS5_AUTH_METHOD_PASSWORD]
    }

    pub fn create_password(username: &str, password: &str) -> Vec<u8> {
        let mut request = vec![SOCKS5_AUTH_VERSION, username.len() as u8];
        request.extend_from_slice(username.as_bytes());
        request.push(password.len() as u8);
        request.extend_from_slice(password.as_bytes());
        request
    }

    pub fn create_connect_ipv4(ip: [u8; 4], port: u16) -> Vec<u8> {
        let mut cmd = vec![
            SOCKS5_VERSION,
            SOCKS5_CMD_TCP_CONNECT,
            SOCKS5_RESERVED,
            SOCKS5_ADDR_TYPE_IPV4,
        ];
        cmd.extend_from_slice(&ip);
        cmd.extend_from_slice(&port.to_be_bytes());
        cmd
    }
}
