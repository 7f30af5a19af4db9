//! Multiplexed packet framing
//!
//! ```text
//! +----------+------+---------+--------+-----------------+
//! | sequence | type | channel | length | payload         |
//! +----------+------+---------+--------+-----------------+
//! |    8     |  1   |    3    |   4    | length (if > 0) |
//! +----------+------+---------+--------+-----------------+
//! ```
//!
//! All fields are little-endian. A positive `length` announces that many
//! payload bytes; [`LENGTH_CLOSE`] and [`LENGTH_OPEN`] are in-band channel
//! signals and any other value is a fatal framing error.

use super::endian::{put_uint, ByteOrder, EndianReader};
use crate::error::{Result, TunnelError};
use bytes::{BufMut, BytesMut};
use tokio::io::AsyncRead;

/// Size of the fixed packet header in bytes
pub const PACKET_HEADER_LEN: usize = 16;

/// Length code: close the addressed channel
pub const LENGTH_CLOSE: i32 = -2;

/// Length code: open (reset) the addressed channel
pub const LENGTH_OPEN: i32 = -3;

/// Channel numbers are 24 bits wide on the wire
pub const MAX_CHANNEL_NUMBER: u32 = 0x00FF_FFFF;

/// Number of addressable channels per pipe kind
pub const CHANNEL_SPACE: u32 = MAX_CHANNEL_NUMBER + 1;

/// What a packet asks the receiving channel to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    /// `length` payload bytes follow the header
    Data(usize),
    /// Close the channel
    Close,
    /// Re-open the channel
    Open,
}

/// Decoded packet header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Per-channel sequence value
    pub sequence: u64,
    /// Raw channel type bits
    pub channel_type: u8,
    /// 24-bit channel number
    pub channel: u32,
    /// Payload length or signal code
    pub length: i32,
}

impl PacketHeader {
    /// Header for a data packet
    pub fn data(sequence: u64, channel_type: u8, channel: u32, len: usize) -> Self {
        PacketHeader {
            sequence,
            channel_type,
            channel,
            length: len as i32,
        }
    }

    /// Header for a signal packet (`LENGTH_CLOSE` / `LENGTH_OPEN`)
    pub fn signal(sequence: u64, channel_type: u8, channel: u32, code: i32) -> Self {
        PacketHeader {
            sequence,
            channel_type,
            channel,
            length: code,
        }
    }

    /// Interpret the length field
    pub fn kind(&self) -> Result<PacketKind> {
        match self.length {
            n if n > 0 => Ok(PacketKind::Data(n as usize)),
            LENGTH_CLOSE => Ok(PacketKind::Close),
            LENGTH_OPEN => Ok(PacketKind::Open),
            other => Err(TunnelError::Framing(format!(
                "unrecognized length code {} on channel {}",
                other, self.channel
            ))),
        }
    }

    /// Append the encoded header to `buf`
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(PACKET_HEADER_LEN);
        buf.put_u64_le(self.sequence);
        buf.put_u8(self.channel_type);
        put_uint(buf, ByteOrder::Little, (self.channel & MAX_CHANNEL_NUMBER) as u64, 3);
        buf.put_i32_le(self.length);
    }

    /// Read one header from the transport
    pub async fn read<R: AsyncRead + Unpin>(reader: &mut EndianReader<R>) -> Result<Self> {
        let sequence = reader.read_u64().await?;
        let channel_type = reader.read_u8().await?;
        let channel = reader.read_u24().await?;
        let length = reader.read_i32().await?;
        Ok(PacketHeader {
            sequence,
            channel_type,
            channel,
            length,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[test]
    fn test_encode_layout() {
        let header = PacketHeader::data(0x0807_0605_0403_0201, 0x05, 0x00AB_CDEF, 300);
        let mut buf = BytesMut::new();
        header.encode(&mut buf);

        assert_eq!(buf.len(), PACKET_HEADER_LEN);
        assert_eq!(&buf[..8], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(buf[8], 0x05);
        assert_eq!(&buf[9..12], &[0xEF, 0xCD, 0xAB]);
        assert_eq!(&buf[12..16], &300i32.to_le_bytes());
    }

    #[test]
    fn test_kind() {
        assert_eq!(
            PacketHeader::data(0, 0, 1, 10).kind().unwrap(),
            PacketKind::Data(10)
        );
        assert_eq!(
            PacketHeader::signal(0, 0, 1, LENGTH_CLOSE).kind().unwrap(),
            PacketKind::Close
        );
        assert_eq!(
            PacketHeader::signal(0, 0, 1, LENGTH_OPEN).kind().unwrap(),
            PacketKind::Open
        );
    }

    #[test]
    fn test_reserved_and_unknown_lengths_are_framing_errors() {
        for code in [0, -1, -4, i32::MIN] {
            let err = PacketHeader::signal(0, 0, 1, code).kind().unwrap_err();
            assert!(matches!(err, TunnelError::Framing(_)));
        }
    }

    #[tokio::test]
    async fn test_read_header() {
        let header = PacketHeader::signal(99, 0x01, 77, LENGTH_OPEN);
        let mut buf = BytesMut::new();
        header.encode(&mut buf);

        let (mut client, server) = tokio::io::duplex(64);
        client.write_all(&buf).await.unwrap();

        let mut reader = EndianReader::little(server);
        let decoded = PacketHeader::read(&mut reader).await.unwrap();
        assert_eq!(decoded, header);
    }

    #[tokio::test]
    async fn test_truncated_header_fails() {
        let (mut client, server) = tokio::io::duplex(64);
        client.write_all(&[0u8; 10]).await.unwrap();
        drop(client);

        let mut reader = EndianReader::little(server);
        let err = PacketHeader::read(&mut reader).await.unwrap_err();
        assert!(err.is_fatal());
    }
}
