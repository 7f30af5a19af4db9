//! SOCKS5 requests and replies
//!
//! ```text
//! request: VER | CMD | RSV | ATYP | DST.ADDR | DST.PORT
//! reply:   VER | REP | RSV | ATYP | BND.ADDR | BND.PORT
//! ```

use super::consts::*;
use anyhow::{anyhow, bail, Context, Result};
use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocksCommand {
    Connect,
    Bind,
    UdpAssociate,
}

impl SocksCommand {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            SOCKS5_CMD_TCP_CONNECT => Some(SocksCommand::Connect),
            SOCKS5_CMD_TCP_BIND => Some(SocksCommand::Bind),
            SOCKS5_CMD_UDP_ASSOCIATE => Some(SocksCommand::UdpAssociate),
            _ => None,
        }
    }
}

impl fmt::Display for SocksCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SocksCommand::Connect => write!(f, "CONNECT"),
            SocksCommand::Bind => write!(f, "BIND"),
            SocksCommand::UdpAssociate => write!(f, "UDP ASSOCIATE"),
        }
    }
}

/// Destination named by a request
///
/// Domains are kept unresolved so the dialer (or its proxy) resolves them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetAddr {
    Ip(SocketAddr),
    Domain(String, u16),
}

impl TargetAddr {
    pub fn host(&self) -> String {
        match self {
            TargetAddr::Ip(addr) => addr.ip().to_string(),
            TargetAddr::Domain(domain, _) => domain.clone(),
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            TargetAddr::Ip(addr) => addr.port(),
            TargetAddr::Domain(_, port) => *port,
        }
    }
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetAddr::Ip(addr) => write!(f, "{}", addr),
            TargetAddr::Domain(domain, port) => write!(f, "{}:{}", domain, port),
        }
    }
}

async fn read_port<S: AsyncRead + Unpin>(stream: &mut S) -> Result<u16> {
    Ok(stream.read_u16().await?)
}

/// Read one request
pub async fn parse_command<S>(stream: &mut S) -> Result<(SocksCommand, TargetAddr)>
where
    S: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    stream
        .read_exact(&mut header)
        .await
        .with_context(|| "Failed to read command header")?;
    let [version, cmd_byte, _reserved, addr_type] = header;

    if version != SOCKS5_VERSION {
        bail!("Unsupported SOCKS version in command: {}", version);
    }
    let command =
        SocksCommand::from_byte(cmd_byte).ok_or_else(|| anyhow!("Unknown command: {}", cmd_byte))?;

    let target = match addr_type {
        SOCKS5_ADDR_TYPE_IPV4 => {
            let mut addr = [0u8; 4];
            stream.read_exact(&mut addr).await?;
            let port = read_port(stream).await?;
            TargetAddr::Ip(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(addr)), port))
        }
        SOCKS5_ADDR_TYPE_DOMAIN => {
            let len = stream.read_u8().await? as usize;
            if len == 0 || len > MAX_DOMAIN_LEN {
                bail!("Invalid domain length: {}", len);
            }
            let mut domain = vec![0u8; len];
            stream.read_exact(&mut domain).await?;
            let domain = String::from_utf8(domain).with_context(|| "Invalid UTF-8 in domain name")?;
            let port = read_port(stream).await?;
            TargetAddr::Domain(domain, port)
        }
        SOCKS5_ADDR_TYPE_IPV6 => {
            let mut addr = [0u8; 16];
            stream.read_exact(&mut addr).await?;
            let port = read_port(stream).await?;
            TargetAddr::Ip(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(addr)), port))
        }
        _ => bail!("Unsupported address type: {}", addr_type),
    };

    tracing::debug!("Parsed SOCKS5 command: {} to {}", command, target);
    Ok((command, target))
}

fn reply_bytes(reply_code: u8, bind_addr: Option<SocketAddr>) -> Vec<u8> {
    let bind_addr =
        bind_addr.unwrap_or_else(|| SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0));
    let mut reply = vec![SOCKS5_VERSION, reply_code, SOCKS5_RESERVED];
    match bind_addr {
        SocketAddr::V4(addr) => {
            reply.push(SOCKS5_ADDR_TYPE_IPV4);
            reply.extend_from_slice(&addr.ip().octets());
            reply.extend_from_slice(&addr.port().to_be_bytes());
        }
        SocketAddr::V6(addr) => {
            reply.push(SOCKS5_ADDR_TYPE_IPV6);
            reply.extend_from_slice(&addr.ip().octets());
            reply.extend_from_slice(&addr.port().to_be_bytes());
        }
    }
    reply
}

pub async fn build_reply<S>(stream: &mut S, reply_code: u8, bind_addr: Option<SocketAddr>) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(&reply_bytes(reply_code, bind_addr)).await?;
    stream.flush().await?;
    Ok(())
}

pub fn io_error_to_reply_code(error: &io::Error) -> u8 {
    match error.kind() {
        io::ErrorKind::ConnectionRefused => SOCKS5_REPLY_CONNECTION_REFUSED,
        io::ErrorKind::TimedOut | io::ErrorKind::AddrNotAvailable => SOCKS5_REPLY_HOST_UNREACHABLE,
        io::ErrorKind::PermissionDenied => SOCKS5_REPLY_CONNECTION_NOT_ALLOWED,
        io::ErrorKind::NotFound => SOCKS5_REPLY_NETWORK_UNREACHABLE,
        _ => SOCKS5_REPLY_GENERAL_FAILURE,
    }
}
