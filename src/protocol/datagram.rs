//! Datagram framing over an ordered byte tunnel
//!
//! Each datagram travels as `hdr_len: u8 | bincode(UdpHeader) | payload`.
//! The address names the peer: the source on the way back to the
//! originator, the destination on the way out.

use anyhow::{Context, Result};
use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

/// UDP payload length type
pub type UdpPacketLen = u16;

/// Largest payload one frame can carry
pub const MAX_DATAGRAM_LEN: usize = UdpPacketLen::MAX as usize;

/// Per-datagram header
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct UdpHeader {
    /// Peer address of the datagram
    pub from: SocketAddr,
    /// Payload length
    pub len: UdpPacketLen,
}

/// One framed datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpTraffic {
    pub from: SocketAddr,
    pub data: Bytes,
}

impl UdpTraffic {
    /// Write one frame for `data` addressed to `from`
    pub async fn write_slice<T: AsyncWrite + Unpin>(
        writer: &mut T,
        from: SocketAddr,
        data: &[u8],
    ) -> Result<()> {
        if data.len() > MAX_DATAGRAM_LEN {
            anyhow::bail!("datagram too large: {} bytes", data.len());
        }
        let hdr = UdpHeader {
            from,
            len: data.len() as UdpPacketLen,
        };
        let v = bincode::serialize(&hdr).context("Failed to serialize UdpHeader")?;

        trace!("Write {:?} of length {}", hdr, v.len());
        let mut frame = BytesMut::with_capacity(1 + v.len() + data.len());
        frame.extend_from_slice(&[v.len() as u8]);
        frame.extend_from_slice(&v);
        frame.extend_from_slice(data);
        writer.write_all(&frame).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Read the next frame, `None` on a clean end of stream
    pub async fn read<T: AsyncRead + Unpin>(reader: &mut T) -> Result<Option<UdpTraffic>> {
        let hdr_len = match reader.read_u8().await {
            Ok(len) => len,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut buf = vec![0; hdr_len as usize];
        reader
            .read_exact(&mut buf)
            .await
            .with_context(|| "Failed to read udp header")?;
        let hdr: UdpHeader =
            bincode::deserialize(&buf).with_context(|| "Failed to deserialize UdpHeader")?;
        trace!("hdr {:?}", hdr);

        let mut data = BytesMut::new();
        data.resize(hdr.len as usize, 0);
        reader.read_exact(&mut data).await?;

        Ok(Some(UdpTraffic {
            from: hdr.from,
            data: data.freeze(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frames_keep_boundaries() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let addr: SocketAddr = "127.0.0.1:5353".parse().unwrap();

        UdpTraffic::write_slice(&mut a, addr, b"first").await.unwrap();
        UdpTraffic::write_slice(&mut a, addr, b"").await.unwrap();
        UdpTraffic::write_slice(&mut a, addr, b"third").await.unwrap();
        drop(a);

        let first = UdpTraffic::read(&mut b).await.unwrap().unwrap();
        assert_eq!(first.data.as_ref(), b"first");
        assert_eq!(first.from, addr);
        assert!(UdpTraffic::read(&mut b).await.unwrap().unwrap().data.is_empty());
        assert_eq!(
            UdpTraffic::read(&mut b).await.unwrap().unwrap().data.as_ref(),
            b"third"
        );
        assert!(UdpTraffic::read(&mut b).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_oversized_datagram_not_framed() {
        let (mut a, _b) = tokio::io::duplex(64);
        let addr: SocketAddr = "127.0.0.1:5353".parse().unwrap();
        let big = vec![0u8; MAX_DATAGRAM_LEN + 1];
        assert!(UdpTraffic::write_slice(&mut a, addr, &big).await.is_err());
    }

    #[tokio::test]
    async fn test_truncated_frame_is_error() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&[20, 1, 2]).await.unwrap();
        drop(a);
        assert!(UdpTraffic::read(&mut b).await.is_err());
    }
}
