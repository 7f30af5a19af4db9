//! Outbound half of a multiplexed channel and the shared packet writer

use super::channel_type::{ChannelType, PipeKind};
use super::compression::Compressor;
use super::registry::{lock, RegisteredChannel, SessionLink};
use super::sequencer::Sequencer;
use crate::error::{Result, TunnelError};
use crate::protocol::{PacketHeader, LENGTH_CLOSE, LENGTH_OPEN, PACKET_HEADER_LEN};
use bytes::BytesMut;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{ready, Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tracing::{debug, trace, warn};

/// Writer half of the shared transport
pub type BoxedTransportWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Serializes every packet of every channel onto the transport
pub struct PacketWriter {
    inner: tokio::sync::Mutex<BoxedTransportWriter>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl PacketWriter {
    pub(crate) fn new(inner: BoxedTransportWriter, shutdown: Arc<watch::Sender<bool>>) -> Self {
        PacketWriter {
            inner: tokio::sync::Mutex::new(inner),
            shutdown,
        }
    }

    fn is_shut_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Write one framed packet
    ///
    /// A transport failure raises the engine shutdown signal.
    pub async fn write_packet(&self, header: &PacketHeader, payload: &[u8]) -> Result<()> {
        let mut frame = BytesMut::with_capacity(PACKET_HEADER_LEN + payload.len());
        header.encode(&mut frame);
        frame.extend_from_slice(payload);

        let mut writer = self.inner.lock().await;
        if self.is_shut_down() {
            return Err(TunnelError::Closed("transport closed".to_string()));
        }
        let result = async {
            writer.write_all(&frame).await?;
            writer.flush().await
        }
        .await;
        if let Err(e) = result {
            warn!("Transport write failed: {}", e);
            self.shutdown.send_replace(true);
            return Err(e.into());
        }
        trace!(
            "Sent packet channel={} type={:#04x} length={}",
            header.channel,
            header.channel_type,
            header.length
        );
        Ok(())
    }

    /// Shut the transport writer down, waiting at most `grace` for a
    /// writer in progress
    pub(crate) async fn shutdown(&self, grace: Duration) {
        self.shutdown.send_replace(true);
        if let Ok(mut writer) = tokio::time::timeout(grace, self.inner.lock()).await {
            let _ = writer.shutdown().await;
        }
    }
}

struct OutputState {
    sequencer: Sequencer,
    filter: Option<Compressor>,
}

/// Sending endpoint of one `(type, number)` channel
pub struct OutputChannel {
    number: u32,
    kind: PipeKind,
    channel_type: AtomicU8,
    packet_size: usize,
    closed: AtomicBool,
    link: Mutex<Option<SessionLink>>,
    writer: Arc<PacketWriter>,
    state: tokio::sync::Mutex<OutputState>,
}

impl OutputChannel {
    pub(crate) fn new(
        channel_type: ChannelType,
        number: u32,
        sequencer: Sequencer,
        packet_size: usize,
        writer: Arc<PacketWriter>,
    ) -> Self {
        OutputChannel {
            number,
            kind: channel_type.pipe_kind(),
            channel_type: AtomicU8::new(channel_type.bits()),
            packet_size: packet_size.max(1),
            closed: AtomicBool::new(false),
            link: Mutex::new(None),
            writer,
            state: tokio::sync::Mutex::new(OutputState {
                sequencer,
                filter: Compressor::for_mode(channel_type.compression()),
            }),
        }
    }

    pub fn number(&self) -> u32 {
        self.number
    }

    pub fn pipe_kind(&self) -> PipeKind {
        self.kind
    }

    pub fn channel_type(&self) -> ChannelType {
        ChannelType::from_bits(self.channel_type.load(Ordering::Acquire))
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn link(&self) -> Option<SessionLink> {
        lock(&self.link).clone()
    }

    pub fn set_link(&self, link: Option<SessionLink>) {
        *lock(&self.link) = link;
    }

    /// Send `data`, split into packets of at most `packet_size` bytes
    pub async fn write(&self, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        if self.is_closed() {
            return Err(TunnelError::Closed(format!(
                "output channel {} is closed",
                self.number
            )));
        }

        let mut state = self.state.lock().await;
        let compressed;
        let payload = match state.filter.as_mut() {
            Some(filter) => {
                compressed = filter.compress(data)?;
                &compressed[..]
            }
            None => data,
        };

        let ty = self.channel_type().bits();
        for chunk in payload.chunks(self.packet_size) {
            let sequence = state.sequencer.next_value();
            let header = PacketHeader::data(sequence, ty, self.number, chunk.len());
            self.writer.write_packet(&header, chunk).await?;
        }
        Ok(())
    }

    async fn signal(&self, state: &mut OutputState, code: i32) -> Result<()> {
        let sequence = state.sequencer.next_value();
        let header = PacketHeader::signal(sequence, self.channel_type().bits(), self.number, code);
        self.writer.write_packet(&header, &[]).await
    }

    /// Re-arm the channel and tell the peer to re-arm its input
    pub async fn open(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        state.filter = Compressor::for_mode(self.channel_type().compression());
        self.closed.store(false, Ordering::Release);
        debug!("Output channel {} opened", self.number);
        self.signal(&mut state, LENGTH_OPEN).await
    }

    /// Tell the peer to close its input and stop writing
    ///
    /// Only the first call sends the close signal.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let mut state = self.state.lock().await;
        state.filter = None;
        debug!("Output channel {} closed", self.number);
        self.signal(&mut state, LENGTH_CLOSE).await
    }

    /// Mark closed without signalling, for engine teardown
    pub(crate) fn close_local(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// `AsyncWrite` adapter for use with `tokio::io::copy`
    pub fn writer(self: &Arc<Self>) -> ChannelWriter {
        ChannelWriter {
            channel: self.clone(),
            pending: None,
            closing: None,
        }
    }
}

impl RegisteredChannel for OutputChannel {
    fn link(&self) -> Option<SessionLink> {
        OutputChannel::link(self)
    }

    fn set_link(&self, link: Option<SessionLink>) {
        OutputChannel::set_link(self, link)
    }

    fn retype(&self, channel_type: ChannelType) {
        self.channel_type
            .store(channel_type.bits(), Ordering::Release);
    }
}

impl std::fmt::Debug for OutputChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputChannel")
            .field("number", &self.number)
            .field("type", &self.channel_type())
            .field("closed", &self.is_closed())
            .finish()
    }
}

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// `AsyncWrite` over an [`OutputChannel`]
///
/// Shutting the writer down closes the channel.
pub struct ChannelWriter {
    channel: Arc<OutputChannel>,
    pending: Option<BoxFuture<Result<usize>>>,
    closing: Option<BoxFuture<Result<()>>>,
}

impl AsyncWrite for ChannelWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        let channel = &this.channel;
        let fut = this.pending.get_or_insert_with(|| {
            let channel = channel.clone();
            let data = buf.to_vec();
            let fut: BoxFuture<Result<usize>> = Box::pin(async move {
                channel.write(&data).await?;
                Ok::<usize, TunnelError>(data.len())
            });
            fut
        });
        let result = ready!(fut.as_mut().poll(cx));
        this.pending = None;
        Poll::Ready(result.map_err(io::Error::from))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if let Some(fut) = self.pending.as_mut() {
            let result = ready!(fut.as_mut().poll(cx));
            self.pending = None;
            result.map_err(io::Error::from)?;
        }
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        ready!(self.as_mut().poll_flush(cx))?;
        let this = &mut *self;
        let channel = &this.channel;
        let fut = this.closing.get_or_insert_with(|| {
            let channel = channel.clone();
            let fut: BoxFuture<Result<()>> = Box::pin(async move { channel.close().await });
            fut
        });
        let result = ready!(fut.as_mut().poll(cx));
        this.closing = None;
        Poll::Ready(result.map_err(io::Error::from))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{EndianReader, PacketKind};

    fn output(
        packet_size: usize,
    ) -> (Arc<OutputChannel>, EndianReader<tokio::io::DuplexStream>) {
        let (transport, peer) = tokio::io::duplex(64 * 1024);
        let (tx, _rx) = watch::channel(false);
        let writer = Arc::new(PacketWriter::new(Box::new(transport), Arc::new(tx)));
        let channel = Arc::new(OutputChannel::new(
            ChannelType::BUFFERED,
            5,
            Sequencer::new(7),
            packet_size,
            writer,
        ));
        (channel, EndianReader::little(peer))
    }

    #[tokio::test]
    async fn test_write_splits_into_packets() {
        let (channel, mut peer) = output(4);
        channel.write(b"abcdefghij").await.unwrap();

        let mut expected = Sequencer::new(7);
        let mut collected = Vec::new();
        for want in [4usize, 4, 2] {
            let header = PacketHeader::read(&mut peer).await.unwrap();
            assert_eq!(header.channel, 5);
            assert_eq!(header.sequence, expected.next_value());
            assert_eq!(header.kind().unwrap(), PacketKind::Data(want));
            let mut buf = vec![0u8; want];
            peer.read_fully(&mut buf).await.unwrap();
            collected.extend_from_slice(&buf);
        }
        assert_eq!(collected, b"abcdefghij");
    }

    #[tokio::test]
    async fn test_close_signals_once() {
        let (channel, mut peer) = output(16);
        channel.close().await.unwrap();
        channel.close().await.unwrap();
        assert!(channel.write(b"x").await.is_err());

        channel.open().await.unwrap();
        channel.write(b"y").await.unwrap();

        let close = PacketHeader::read(&mut peer).await.unwrap();
        assert_eq!(close.kind().unwrap(), PacketKind::Close);
        let open = PacketHeader::read(&mut peer).await.unwrap();
        assert_eq!(open.kind().unwrap(), PacketKind::Open);
        let data = PacketHeader::read(&mut peer).await.unwrap();
        assert_eq!(data.kind().unwrap(), PacketKind::Data(1));

        let mut expected = Sequencer::new(7);
        assert_eq!(close.sequence, expected.next_value());
        assert_eq!(open.sequence, expected.next_value());
        assert_eq!(data.sequence, expected.next_value());
    }

    #[tokio::test]
    async fn test_channel_writer_with_copy() {
        let (channel, mut peer) = output(1024);
        let mut writer = channel.writer();
        let mut source: &[u8] = b"copied through the adapter";
        tokio::io::copy(&mut source, &mut writer).await.unwrap();
        writer.shutdown().await.unwrap();
        assert!(channel.is_closed());

        let header = PacketHeader::read(&mut peer).await.unwrap();
        assert_eq!(header.kind().unwrap(), PacketKind::Data(26));
        let mut buf = vec![0u8; 26];
        peer.read_fully(&mut buf).await.unwrap();
        assert_eq!(buf, b"copied through the adapter");
        let header = PacketHeader::read(&mut peer).await.unwrap();
        assert_eq!(header.kind().unwrap(), PacketKind::Close);
    }

    #[tokio::test]
    async fn test_write_after_transport_loss_fails() {
        let (channel, peer) = output(16);
        drop(peer);
        assert!(channel.write(b"lost").await.is_err());
        assert!(channel.writer.is_shut_down());
    }
}
