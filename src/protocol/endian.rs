//! Fixed-width primitive codec over async byte streams
//!
//! Reads and writes integers, floats and length-prefixed blobs in a declared
//! byte order. The data path of the multiplexer is little-endian; the
//! big-endian variant exists for other framings.
//!
//! Every read loops until the requested width is satisfied and fails with
//! [`std::io::ErrorKind::UnexpectedEof`] otherwise.

use bytes::{Buf, BufMut, BytesMut};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest blob accepted by [`EndianReader::read_blob`]
pub const MAX_BLOB_LEN: usize = 16 * 1024 * 1024;

/// Byte order of a codec
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    /// Least significant byte first
    Little,
    /// Most significant byte first
    Big,
}

/// Reader half of the endian codec
#[derive(Debug)]
pub struct EndianReader<R> {
    inner: R,
    order: ByteOrder,
}

impl<R: AsyncRead + Unpin> EndianReader<R> {
    /// Wrap a reader with the given byte order
    pub fn new(inner: R, order: ByteOrder) -> Self {
        EndianReader { inner, order }
    }

    /// Little-endian reader, as used by the packet framing
    pub fn little(inner: R) -> Self {
        Self::new(inner, ByteOrder::Little)
    }

    /// Big-endian reader
    pub fn big(inner: R) -> Self {
        Self::new(inner, ByteOrder::Big)
    }

    /// Byte order of this reader
    pub fn order(&self) -> ByteOrder {
        self.order
    }

    /// Unwrap the inner reader
    pub fn into_inner(self) -> R {
        self.inner
    }

    /// Fill `buf` completely or fail with `UnexpectedEof`
    pub async fn read_fully(&mut self, buf: &mut [u8]) -> io::Result<()> {
        self.inner.read_exact(buf).await.map(|_| ())
    }

    async fn read_uint(&mut self, width: usize) -> io::Result<u64> {
        let mut raw = [0u8; 8];
        self.read_fully(&mut raw[..width]).await?;
        let mut buf = &raw[..width];
        Ok(match self.order {
            ByteOrder::Little => buf.get_uint_le(width),
            ByteOrder::Big => buf.get_uint(width),
        })
    }

    /// Read one byte
    pub async fn read_u8(&mut self) -> io::Result<u8> {
        self.inner.read_u8().await
    }

    /// Read a 16-bit unsigned integer
    pub async fn read_u16(&mut self) -> io::Result<u16> {
        Ok(self.read_uint(2).await? as u16)
    }

    /// Read a 24-bit unsigned integer
    pub async fn read_u24(&mut self) -> io::Result<u32> {
        Ok(self.read_uint(3).await? as u32)
    }

    /// Read a 32-bit unsigned integer
    pub async fn read_u32(&mut self) -> io::Result<u32> {
        Ok(self.read_uint(4).await? as u32)
    }

    /// Read a 32-bit signed integer
    pub async fn read_i32(&mut self) -> io::Result<i32> {
        Ok(self.read_u32().await? as i32)
    }

    /// Read a 64-bit unsigned integer
    pub async fn read_u64(&mut self) -> io::Result<u64> {
        self.read_uint(8).await
    }

    /// Read a 64-bit signed integer
    pub async fn read_i64(&mut self) -> io::Result<i64> {
        Ok(self.read_u64().await? as i64)
    }

    /// Read an IEEE-754 single
    pub async fn read_f32(&mut self) -> io::Result<f32> {
        Ok(f32::from_bits(self.read_u32().await?))
    }

    /// Read an IEEE-754 double
    pub async fn read_f64(&mut self) -> io::Result<f64> {
        Ok(f64::from_bits(self.read_u64().await?))
    }

    /// Read an `i32` length followed by that many bytes
    pub async fn read_blob(&mut self) -> io::Result<Vec<u8>> {
        let len = self.read_i32().await?;
        if len < 0 || len as usize > MAX_BLOB_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("invalid blob length: {}", len),
            ));
        }
        let mut data = vec![0u8; len as usize];
        self.read_fully(&mut data).await?;
        Ok(data)
    }

    /// Read a length-prefixed UTF-8 string
    pub async fn read_string(&mut self) -> io::Result<String> {
        let data = self.read_blob().await?;
        String::from_utf8(data).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

/// Writer half of the endian codec
#[derive(Debug)]
pub struct EndianWriter<W> {
    inner: W,
    order: ByteOrder,
}

impl<W: AsyncWrite + Unpin> EndianWriter<W> {
    /// Wrap a writer with the given byte order
    pub fn new(inner: W, order: ByteOrder) -> Self {
        EndianWriter { inner, order }
    }

    /// Little-endian writer, as used by the packet framing
    pub fn little(inner: W) -> Self {
        Self::new(inner, ByteOrder::Little)
    }

    /// Big-endian writer
    pub fn big(inner: W) -> Self {
        Self::new(inner, ByteOrder::Big)
    }

    /// Mutable access to the inner writer
    pub fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }

    /// Unwrap the inner writer
    pub fn into_inner(self) -> W {
        self.inner
    }

    async fn write_uint(&mut self, value: u64, width: usize) -> io::Result<()> {
        let mut buf = BytesMut::with_capacity(width);
        put_uint(&mut buf, self.order, value, width);
        self.inner.write_all(&buf).await
    }

    /// Write one byte
    pub async fn write_u8(&mut self, value: u8) -> io::Result<()> {
        self.inner.write_u8(value).await
    }

    /// Write a 16-bit unsigned integer
    pub async fn write_u16(&mut self, value: u16) -> io::Result<()> {
        self.write_uint(value as u64, 2).await
    }

    /// Write the low 24 bits of `value`
    pub async fn write_u24(&mut self, value: u32) -> io::Result<()> {
        self.write_uint((value & 0x00FF_FFFF) as u64, 3).await
    }

    /// Write a 32-bit unsigned integer
    pub async fn write_u32(&mut self, value: u32) -> io::Result<()> {
        self.write_uint(value as u64, 4).await
    }

    /// Write a 32-bit signed integer
    pub async fn write_i32(&mut self, value: i32) -> io::Result<()> {
        self.write_u32(value as u32).await
    }

    /// Write a 64-bit unsigned integer
    pub async fn write_u64(&mut self, value: u64) -> io::Result<()> {
        self.write_uint(value, 8).await
    }

    /// Write a 64-bit signed integer
    pub async fn write_i64(&mut self, value: i64) -> io::Result<()> {
        self.write_u64(value as u64).await
    }

    /// Write an IEEE-754 single
    pub async fn write_f32(&mut self, value: f32) -> io::Result<()> {
        self.write_u32(value.to_bits()).await
    }

    /// Write an IEEE-754 double
    pub async fn write_f64(&mut self, value: f64) -> io::Result<()> {
        self.write_u64(value.to_bits()).await
    }

    /// Write an `i32` length prefix followed by `data`
    pub async fn write_blob(&mut self, data: &[u8]) -> io::Result<()> {
        if data.len() > MAX_BLOB_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("blob too large: {} bytes", data.len()),
            ));
        }
        self.write_i32(data.len() as i32).await?;
        self.inner.write_all(data).await
    }

    /// Write a length-prefixed UTF-8 string
    pub async fn write_string(&mut self, value: &str) -> io::Result<()> {
        self.write_blob(value.as_bytes()).await
    }

    /// Flush the inner writer
    pub async fn flush(&mut self) -> io::Result<()> {
        self.inner.flush().await
    }
}

/// Append `value` as a `width`-byte integer in `order` to `buf`
pub fn put_uint(buf: &mut BytesMut, order: ByteOrder, value: u64, width: usize) {
    match order {
        ByteOrder::Little => buf.put_uint_le(value, width),
        ByteOrder::Big => buf.put_uint(value, width),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_little_endian_layout() {
        let (client, server) = tokio::io::duplex(64);
        let mut writer = EndianWriter::little(client);
        writer.write_u32(0x0102_0304).await.unwrap();
        writer.write_u24(0x00AB_CDEF).await.unwrap();
        writer.flush().await.unwrap();
        drop(writer);

        let mut reader = EndianReader::little(server);
        let mut raw = [0u8; 7];
        reader.read_fully(&mut raw).await.unwrap();
        assert_eq!(raw, [0x04, 0x03, 0x02, 0x01, 0xEF, 0xCD, 0xAB]);
    }

    #[tokio::test]
    async fn test_big_endian_layout() {
        let (client, server) = tokio::io::duplex(64);
        let mut writer = EndianWriter::big(client);
        writer.write_u16(0x0102).await.unwrap();
        writer.write_i32(-2).await.unwrap();
        drop(writer);

        let mut reader = EndianReader::big(server);
        assert_eq!(reader.read_u8().await.unwrap(), 0x01);
        assert_eq!(reader.read_u8().await.unwrap(), 0x02);
        assert_eq!(reader.read_i32().await.unwrap(), -2);
    }

    #[tokio::test]
    async fn test_mixed_values_read_back() {
        let (client, server) = tokio::io::duplex(1024);
        let mut writer = EndianWriter::little(client);
        writer.write_u64(u64::MAX - 7).await.unwrap();
        writer.write_i64(-42).await.unwrap();
        writer.write_f32(1.5).await.unwrap();
        writer.write_f64(-0.25).await.unwrap();
        writer.write_string("héllo").await.unwrap();
        writer.write_blob(&[]).await.unwrap();
        drop(writer);

        let mut reader = EndianReader::little(server);
        assert_eq!(reader.read_u64().await.unwrap(), u64::MAX - 7);
        assert_eq!(reader.read_i64().await.unwrap(), -42);
        assert_eq!(reader.read_f32().await.unwrap(), 1.5);
        assert_eq!(reader.read_f64().await.unwrap(), -0.25);
        assert_eq!(reader.read_string().await.unwrap(), "héllo");
        assert!(reader.read_blob().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_short_read_is_eof() {
        let (mut client, server) = tokio::io::duplex(64);
        client.write_all(&[1, 2, 3]).await.unwrap();
        drop(client);

        let mut reader = EndianReader::little(server);
        let err = reader.read_u32().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn test_negative_blob_length_rejected() {
        let (client, server) = tokio::io::duplex(64);
        let mut writer = EndianWriter::little(client);
        writer.write_i32(-5).await.unwrap();
        drop(writer);

        let mut reader = EndianReader::little(server);
        let err = reader.read_blob().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
