//! Datagram relay for `U` tunnels
//!
//! The channel pair carries a stream of [`UdpTraffic`] frames. On the
//! responder, frames map onto a real UDP socket; on the originator they are
//! exposed as a [`TunnelDatagramSocket`].

use super::piped::TunnelStream;
use crate::protocol::{UdpTraffic, MAX_DATAGRAM_LEN};
use anyhow::Result;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tracing::{debug, trace};

/// Address used in outbound frames of a connected association
pub const UNSPECIFIED_ADDR: SocketAddr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0));

/// ICMP errors of an earlier send surface on the next socket call
fn is_lost_datagram(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionRefused | io::ErrorKind::ConnectionReset
    )
}

/// Relay frames on `stream` to and from `socket` until either side ends
///
/// A connected socket ignores the frame address; an unconnected one sends
/// each frame to it.
pub async fn relay_datagrams<S>(stream: S, socket: UdpSocket, connected: bool) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send,
{
    let (mut rd, mut wr) = tokio::io::split(stream);

    let outbound = async {
        while let Some(frame) = UdpTraffic::read(&mut rd).await? {
            trace!("Datagram of {} bytes to {}", frame.data.len(), frame.from);
            let sent = if connected {
                socket.send(&frame.data).await
            } else {
                socket.send_to(&frame.data, frame.from).await
            };
            match sent {
                Ok(_) => {}
                Err(e) if is_lost_datagram(&e) => debug!("Datagram to {} lost: {}", frame.from, e),
                Err(e) => return Err(e.into()),
            }
        }
        Ok::<(), anyhow::Error>(())
    };

    let inbound = async {
        let mut buf = vec![0u8; MAX_DATAGRAM_LEN];
        loop {
            let (n, from) = match socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) if is_lost_datagram(&e) => {
                    debug!("Datagram lost: {}", e);
                    continue;
                }
                Err(e) => return Err::<(), anyhow::Error>(e.into()),
            };
            trace!("Datagram of {} bytes from {}", n, from);
            UdpTraffic::write_slice(&mut wr, from, &buf[..n]).await?;
        }
    };

    tokio::select! {
        result = outbound => result,
        result = inbound => result,
    }
}

/// Datagram view of an established `U` tunnel
#[derive(Debug)]
pub struct TunnelDatagramSocket {
    reader: Mutex<ReadHalf<TunnelStream>>,
    writer: Mutex<WriteHalf<TunnelStream>>,
    remote: Option<(String, u16)>,
}

impl TunnelDatagramSocket {
    pub(crate) fn new(stream: TunnelStream) -> Self {
        let remote = stream.remote_addr();
        let (reader, writer) = tokio::io::split(stream);
        TunnelDatagramSocket {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            remote,
        }
    }

    /// Address of the responder's UDP socket
    pub fn remote_addr(&self) -> Option<(String, u16)> {
        self.remote.clone()
    }

    /// Send `data` to `target` from the responder's socket
    pub async fn send_to(&self, data: &[u8], target: SocketAddr) -> io::Result<usize> {
        let mut writer = self.writer.lock().await;
        UdpTraffic::write_slice(&mut *writer, target, data)
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        Ok(data.len())
    }

    /// Send on a connected association
    pub async fn send(&self, data: &[u8]) -> io::Result<usize> {
        self.send_to(data, UNSPECIFIED_ADDR).await
    }

    /// Receive the next datagram; excess bytes are truncated
    pub async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        let mut reader = self.reader.lock().await;
        let frame = UdpTraffic::read(&mut *reader)
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
            .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "tunnel closed"))?;
        let n = frame.data.len().min(buf.len());
        buf[..n].copy_from_slice(&frame.data[..n]);
        if n < frame.data.len() {
            debug!("Truncated datagram from {} to {} bytes", frame.from, n);
        }
        Ok((n, frame.from))
    }
}
