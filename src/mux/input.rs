//! Inbound half of a multiplexed channel
//!
//! The engine reader pushes each packet payload into the channel. A
//! buffered channel queues it on a bounded pipe drained by a
//! [`ChannelReader`]; a direct channel writes it into the sink attached
//! with [`InputChannel::set_sink`].

use super::channel_type::{ChannelType, PipeKind};
use super::compression::Decompressor;
use super::registry::{lock, RegisteredChannel, SessionLink};
use super::sequencer::Sequencer;
use crate::error::{Result, TunnelError};
use async_trait::async_trait;
use bytes::Bytes;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{ready, Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::sync::mpsc;
use tracing::debug;

/// Something that is closed together with a channel
#[async_trait]
pub trait Closeable: Send + Sync {
    async fn close(&self);
}

/// Writer half a direct channel delivers into
pub type BoxedSink = Box<dyn AsyncWrite + Send + Unpin>;

struct DirectSink {
    writer: BoxedSink,
    owner: Option<Arc<dyn Closeable>>,
}

struct InputState {
    pipe: Option<mpsc::Sender<Bytes>>,
    receiver: Option<mpsc::Receiver<Bytes>>,
    sink: Option<DirectSink>,
    filter: Option<Decompressor>,
    propagated: Vec<Arc<dyn Closeable>>,
}

/// Receiving endpoint of one `(type, number)` channel
pub struct InputChannel {
    number: u32,
    kind: PipeKind,
    channel_type: AtomicU8,
    pipe_capacity: usize,
    closed: AtomicBool,
    link: Mutex<Option<SessionLink>>,
    sequencer: Mutex<Sequencer>,
    state: tokio::sync::Mutex<InputState>,
}

impl InputChannel {
    pub(crate) fn new(
        channel_type: ChannelType,
        number: u32,
        sequencer: Sequencer,
        pipe_capacity: usize,
    ) -> Self {
        let kind = channel_type.pipe_kind();
        let (pipe, receiver) = match kind {
            PipeKind::Buffered => {
                let (tx, rx) = mpsc::channel(pipe_capacity.max(1));
                (Some(tx), Some(rx))
            }
            PipeKind::Direct => (None, None),
        };
        InputChannel {
            number,
            kind,
            channel_type: AtomicU8::new(channel_type.bits()),
            pipe_capacity,
            closed: AtomicBool::new(false),
            link: Mutex::new(None),
            sequencer: Mutex::new(sequencer),
            state: tokio::sync::Mutex::new(InputState {
                pipe,
                receiver,
                sink: None,
                filter: Decompressor::for_mode(channel_type.compression()),
                propagated: Vec::new(),
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

    /// Mark closed without touching attachments, for engine teardown
    pub(crate) fn close_local(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Sequence value the next inbound packet must carry
    pub(crate) fn next_sequence(&self) -> u64 {
        lock(&self.sequencer).next_value()
    }

    /// Take the reading end of a buffered channel
    ///
    /// There is one reader per open cycle. Taking it from a closed channel
    /// arms the pipe for the next open without accepting data yet.
    pub async fn reader(&self) -> Result<ChannelReader> {
        if self.kind == PipeKind::Direct {
            return Err(TunnelError::Closed(format!(
                "channel {} delivers to a sink",
                self.number
            )));
        }
        let mut state = self.state.lock().await;
        if state.pipe.is_none() && state.receiver.is_none() {
            let (tx, rx) = mpsc::channel(self.pipe_capacity.max(1));
            state.pipe = Some(tx);
            state.receiver = Some(rx);
        }
        state
            .receiver
            .take()
            .map(|rx| ChannelReader {
                rx,
                pending: Bytes::new(),
            })
            .ok_or_else(|| {
                TunnelError::Closed(format!("reader of channel {} already taken", self.number))
            })
    }

    /// Attach the sink a direct channel delivers into
    ///
    /// `owner` is closed when the channel closes. Attaching resets the
    /// decompression state.
    pub async fn set_sink(&self, writer: BoxedSink, owner: Option<Arc<dyn Closeable>>) {
        let mut state = self.state.lock().await;
        state.sink = Some(DirectSink { writer, owner });
        state.filter = Decompressor::for_mode(self.channel_type().compression());
    }

    /// Drop an attached sink without closing its owner
    ///
    /// Used when a sink was attached to a closed channel that the peer never
    /// re-opened.
    pub async fn detach_sink(&self) -> bool {
        let sink = self.state.lock().await.sink.take();
        match sink {
            Some(mut sink) => {
                let _ = sink.writer.shutdown().await;
                true
            }
            None => false,
        }
    }

    pub async fn add_propagated(&self, closeable: Arc<dyn Closeable>) {
        self.state.lock().await.propagated.push(closeable);
    }

    pub async fn remove_propagated(&self, closeable: &Arc<dyn Closeable>) {
        self.state
            .lock()
            .await
            .propagated
            .retain(|c| !Arc::ptr_eq(c, closeable));
    }

    /// Hand one packet payload to the consumer
    ///
    /// Waits at most `timeout` for a full pipe or a slow sink.
    pub(crate) async fn deliver(&self, data: &[u8], timeout: Duration) -> Result<()> {
        let delivery_error = |reason: String| TunnelError::Delivery {
            channel: self.number,
            reason,
        };
        if self.is_closed() {
            return Err(delivery_error("channel closed".to_string()));
        }

        let mut state = self.state.lock().await;
        let data = match state.filter.as_mut() {
            Some(filter) => Bytes::from(
                filter
                    .decompress(data)
                    .map_err(|e| delivery_error(e.to_string()))?,
            ),
            None => Bytes::copy_from_slice(data),
        };
        if data.is_empty() {
            return Ok(());
        }

        match self.kind {
            PipeKind::Buffered => {
                let pipe = state
                    .pipe
                    .clone()
                    .ok_or_else(|| delivery_error("pipe closed".to_string()))?;
                drop(state);
                pipe.send_timeout(data, timeout).await.map_err(|e| match e {
                    mpsc::error::SendTimeoutError::Timeout(_) => {
                        delivery_error("consumer stalled".to_string())
                    }
                    mpsc::error::SendTimeoutError::Closed(_) => {
                        delivery_error("consumer gone".to_string())
                    }
                })
            }
            PipeKind::Direct => {
                let sink = state
                    .sink
                    .as_mut()
                    .ok_or_else(|| delivery_error("no sink attached".to_string()))?;
                let write = async {
                    sink.writer.write_all(&data).await?;
                    sink.writer.flush().await
                };
                match tokio::time::timeout(timeout, write).await {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => Err(delivery_error(e.to_string())),
                    Err(_) => Err(delivery_error("sink stalled".to_string())),
                }
            }
        }
    }

    /// Re-arm the channel after a close
    pub async fn open(&self) {
        let mut state = self.state.lock().await;
        if self.kind == PipeKind::Buffered
            && state.pipe.as_ref().map_or(true, |pipe| pipe.is_closed())
        {
            let (tx, rx) = mpsc::channel(self.pipe_capacity.max(1));
            state.pipe = Some(tx);
            state.receiver = Some(rx);
        }
        state.filter = Decompressor::for_mode(self.channel_type().compression());
        self.closed.store(false, Ordering::Release);
        debug!("Input channel {} opened", self.number);
    }

    /// Close the channel and everything attached to it
    ///
    /// A buffered reader sees end of stream once the queued payloads are
    /// drained. Calling this on a closed channel does nothing.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let (sink, propagated) = {
            let mut state = self.state.lock().await;
            state.pipe = None;
            state.receiver = None;
            state.filter = None;
            (state.sink.take(), state.propagated.clone())
        };
        debug!("Input channel {} closed", self.number);

        if let Some(mut sink) = sink {
            let _ = sink.writer.shutdown().await;
            if let Some(owner) = sink.owner {
                owner.close().await;
            }
        }
        for closeable in propagated {
            closeable.close().await;
        }
    }
}

impl RegisteredChannel for InputChannel {
    fn link(&self) -> Option<SessionLink> {
        InputChannel::link(self)
    }

    fn set_link(&self, link: Option<SessionLink>) {
        InputChannel::set_link(self, link)
    }

    fn retype(&self, channel_type: ChannelType) {
        self.channel_type
            .store(channel_type.bits(), Ordering::Release);
    }
}

impl std::fmt::Debug for InputChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InputChannel")
            .field("number", &self.number)
            .field("type", &self.channel_type())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// `AsyncRead` over a buffered channel's pipe
pub struct ChannelReader {
    rx: mpsc::Receiver<Bytes>,
    pending: Bytes,
}

impl AsyncRead for ChannelReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            if !self.pending.is_empty() {
                let n = self.pending.len().min(buf.remaining());
                let chunk = self.pending.split_to(n);
                buf.put_slice(&chunk);
                return Poll::Ready(Ok(()));
            }
            match ready!(self.rx.poll_recv(cx)) {
                Some(data) => self.pending = data,
                None => return Poll::Ready(Ok(())),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mux::channel_type::CompressionMode;
    use crate::mux::compression::Compressor;
    use std::sync::atomic::AtomicUsize;
    use tokio::io::AsyncReadExt;

    const WAIT: Duration = Duration::from_millis(200);

    fn buffered(capacity: usize) -> InputChannel {
        InputChannel::new(ChannelType::BUFFERED, 5, Sequencer::new(1), capacity)
    }

    #[derive(Default)]
    struct CountingCloseable(AtomicUsize);

    #[async_trait]
    impl Closeable for CountingCloseable {
        async fn close(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_buffered_delivery_reads_back() {
        let channel = buffered(8);
        let mut reader = channel.reader().await.unwrap();

        channel.deliver(b"hello ", WAIT).await.unwrap();
        channel.deliver(b"world", WAIT).await.unwrap();
        channel.close().await;

        let mut out = String::new();
        reader.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "hello world");
    }

    #[tokio::test]
    async fn test_reader_taken_once_per_cycle() {
        let channel = buffered(8);
        let _reader = channel.reader().await.unwrap();
        assert!(channel.reader().await.is_err());

        channel.close().await;
        channel.open().await;
        assert!(channel.reader().await.is_ok());
    }

    #[tokio::test]
    async fn test_full_pipe_drops_after_timeout() {
        let channel = buffered(1);
        let _reader = channel.reader().await.unwrap();

        channel.deliver(b"a", WAIT).await.unwrap();
        let err = channel
            .deliver(b"b", Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::Delivery { channel: 5, .. }));
        assert!(!err.is_fatal());
    }

    #[tokio::test]
    async fn test_closed_channel_rejects_delivery() {
        let channel = buffered(4);
        channel.close().await;
        assert!(channel.deliver(b"late", WAIT).await.is_err());

        channel.open().await;
        let mut reader = channel.reader().await.unwrap();
        channel.deliver(b"again", WAIT).await.unwrap();
        let mut buf = [0u8; 5];
        reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"again");
    }

    #[tokio::test]
    async fn test_direct_sink_and_owner_close() {
        let channel = InputChannel::new(ChannelType::DIRECT, 9, Sequencer::new(1), 4);
        assert!(channel.reader().await.is_err());
        assert!(channel.deliver(b"nowhere", WAIT).await.is_err());

        let (sink, mut peer) = tokio::io::duplex(64);
        let owner = Arc::new(CountingCloseable::default());
        channel.set_sink(Box::new(sink), Some(owner.clone())).await;

        channel.deliver(b"direct", WAIT).await.unwrap();
        let mut buf = [0u8; 6];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"direct");

        channel.close().await;
        channel.close().await;
        assert_eq!(owner.0.load(Ordering::SeqCst), 1);
        assert_eq!(peer.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_sink_on_closed_channel_survives_stale_close() {
        let channel = InputChannel::new(ChannelType::DIRECT, 2, Sequencer::new(1), 4);
        channel.close().await;

        let (sink, mut peer) = tokio::io::duplex(64);
        let owner = Arc::new(CountingCloseable::default());
        channel.set_sink(Box::new(sink), Some(owner.clone())).await;

        // a late close for the previous cycle must not take the new sink
        channel.close().await;
        assert_eq!(owner.0.load(Ordering::SeqCst), 0);

        channel.open().await;
        channel.deliver(b"next", WAIT).await.unwrap();
        let mut buf = [0u8; 4];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"next");
    }

    #[tokio::test]
    async fn test_reader_armed_before_reopen() {
        let channel = buffered(4);
        channel.close().await;

        let mut reader = channel.reader().await.unwrap();
        assert!(channel.deliver(b"early", WAIT).await.is_err());

        channel.open().await;
        channel.deliver(b"late", WAIT).await.unwrap();
        let mut buf = [0u8; 4];
        reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"late");
    }

    #[tokio::test]
    async fn test_propagated_closeables() {
        let channel = buffered(4);
        let kept = Arc::new(CountingCloseable::default());
        let removed = Arc::new(CountingCloseable::default());
        let removed_dyn: Arc<dyn Closeable> = removed.clone();

        channel.add_propagated(kept.clone()).await;
        channel.add_propagated(removed_dyn.clone()).await;
        channel.remove_propagated(&removed_dyn).await;
        channel.close().await;

        assert_eq!(kept.0.load(Ordering::SeqCst), 1);
        assert_eq!(removed.0.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_compressed_delivery() {
        let ty = ChannelType::BUFFERED.with_compression(CompressionMode::Light);
        let channel = InputChannel::new(ty, 1, Sequencer::new(1), 8);
        let mut reader = channel.reader().await.unwrap();
        let mut tx = Compressor::for_mode(CompressionMode::Light).unwrap();

        let packet = tx.compress(b"compressed payload").unwrap();
        channel.deliver(&packet, WAIT).await.unwrap();
        let mut buf = [0u8; 18];
        reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"compressed payload");
    }
}
