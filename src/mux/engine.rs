//! Multiplexing engine
//!
//! Owns the shared transport. A single reader task demultiplexes inbound
//! packets into input channels; output channels share one [`PacketWriter`].
//! The first fatal condition closes the whole engine:
//!
//! - transport end of stream or I/O failure
//! - a sequence value the addressed channel did not expect
//! - an unknown length code or an oversized payload

use super::channel_type::ChannelType;
use super::input::InputChannel;
use super::output::{OutputChannel, PacketWriter};
use super::registry::{lock, ChannelRegistry, SessionLink};
use super::sequencer::SessionSeed;
use crate::error::{Result, TunnelError};
use crate::protocol::{EndianReader, PacketHeader, PacketKind, MAX_CHANNEL_NUMBER};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// Engine tuning
#[derive(Debug, Clone)]
pub struct MuxSettings {
    /// Largest payload of one packet
    pub packet_size: usize,
    /// Depth of each buffered pipe, in packets
    pub pipe_capacity: usize,
    /// How long the reader waits on one slow consumer before dropping
    pub delivery_timeout: Duration,
}

impl Default for MuxSettings {
    fn default() -> Self {
        MuxSettings {
            packet_size: 16 * 1024,
            pipe_capacity: 256,
            delivery_timeout: Duration::from_secs(5),
        }
    }
}

struct MuxShared {
    settings: MuxSettings,
    seed: SessionSeed,
    inputs: Mutex<ChannelRegistry<InputChannel>>,
    outputs: Mutex<ChannelRegistry<OutputChannel>>,
    writer: Arc<PacketWriter>,
    shutdown: Arc<watch::Sender<bool>>,
    closing: AtomicBool,
    reader_task: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to a running engine; clones share it
#[derive(Clone)]
pub struct Multiplexer {
    shared: Arc<MuxShared>,
}

async fn wait_shutdown(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|closed| *closed).await;
}

impl Multiplexer {
    /// Take over `transport` and start the packet reader
    pub fn start<T>(transport: T, settings: MuxSettings, seed: SessionSeed) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(transport);
        let (tx, _) = watch::channel(false);
        let shutdown = Arc::new(tx);
        let writer = Arc::new(PacketWriter::new(Box::new(write_half), shutdown.clone()));

        let mux = Multiplexer {
            shared: Arc::new(MuxShared {
                settings,
                seed,
                inputs: Mutex::new(ChannelRegistry::new()),
                outputs: Mutex::new(ChannelRegistry::new()),
                writer,
                shutdown,
                closing: AtomicBool::new(false),
                reader_task: Mutex::new(None),
            }),
        };

        let handle = tokio::spawn(mux.clone().run_reader(read_half));
        *lock(&mux.shared.reader_task) = Some(handle);
        mux
    }

    pub fn settings(&self) -> &MuxSettings {
        &self.shared.settings
    }

    /// Whether the packet reader task is still running
    pub fn is_reader_running(&self) -> bool {
        lock(&self.shared.reader_task)
            .as_ref()
            .map_or(false, |handle| !handle.is_finished())
    }

    fn make_input(&self, channel_type: ChannelType, number: u32) -> InputChannel {
        InputChannel::new(
            channel_type,
            number,
            self.shared.seed.sequencer(channel_type.pipe_kind(), number),
            self.shared.settings.pipe_capacity,
        )
    }

    fn make_output(&self, channel_type: ChannelType, number: u32) -> OutputChannel {
        OutputChannel::new(
            channel_type,
            number,
            self.shared.seed.sequencer(channel_type.pipe_kind(), number),
            self.shared.settings.packet_size,
            self.shared.writer.clone(),
        )
    }

    /// Input channel for `(type, number)`, created on first use
    ///
    /// Once the engine is closing this hands out an unregistered, closed
    /// channel.
    pub fn input(&self, channel_type: ChannelType, number: u32) -> Arc<InputChannel> {
        let number = number & MAX_CHANNEL_NUMBER;
        let mut inputs = lock(&self.shared.inputs);
        if self.is_closed() {
            let channel = self.make_input(channel_type, number);
            channel.close_local();
            return Arc::new(channel);
        }
        inputs.get_or_create(channel_type, number, || self.make_input(channel_type, number))
    }

    /// Output channel for `(type, number)`, created on first use
    ///
    /// Once the engine is closing this hands out an unregistered, closed
    /// channel.
    pub fn output(&self, channel_type: ChannelType, number: u32) -> Arc<OutputChannel> {
        let number = number & MAX_CHANNEL_NUMBER;
        let mut outputs = lock(&self.shared.outputs);
        if self.is_closed() {
            let channel = self.make_output(channel_type, number);
            channel.close_local();
            return Arc::new(channel);
        }
        outputs.get_or_create(channel_type, number, || self.make_output(channel_type, number))
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(TunnelError::Closed("multiplexer closed".to_string()))
        } else {
            Ok(())
        }
    }

    /// Link the lowest free input channel of `channel_type` to `link`
    pub fn link_input(&self, channel_type: ChannelType, link: SessionLink) -> Result<Arc<InputChannel>> {
        self.ensure_open()?;
        lock(&self.shared.inputs).link_first_free(channel_type, link, |number| {
            self.make_input(channel_type, number)
        })
    }

    /// Link input channel `number` to `link`, replacing any previous link
    pub fn link_input_number(
        &self,
        channel_type: ChannelType,
        number: u32,
        link: SessionLink,
    ) -> Result<Arc<InputChannel>> {
        self.ensure_open()?;
        let channel = self.input(channel_type, number);
        channel.set_link(Some(link));
        Ok(channel)
    }

    /// Link the lowest free output channel of `channel_type` to `link`
    pub fn link_output(
        &self,
        channel_type: ChannelType,
        link: SessionLink,
    ) -> Result<Arc<OutputChannel>> {
        self.ensure_open()?;
        lock(&self.shared.outputs).link_first_free(channel_type, link, |number| {
            self.make_output(channel_type, number)
        })
    }

    /// Link input channel `number` to `link` unless a session holds it
    pub fn claim_input(
        &self,
        channel_type: ChannelType,
        number: u32,
        link: SessionLink,
    ) -> Result<Arc<InputChannel>> {
        self.ensure_open()?;
        let number = number & MAX_CHANNEL_NUMBER;
        lock(&self.shared.inputs).link_number_if_free(channel_type, number, link, || {
            self.make_input(channel_type, number)
        })
    }

    /// Link output channel `number` to `link` unless a session holds it
    pub fn claim_output(
        &self,
        channel_type: ChannelType,
        number: u32,
        link: SessionLink,
    ) -> Result<Arc<OutputChannel>> {
        self.ensure_open()?;
        let number = number & MAX_CHANNEL_NUMBER;
        lock(&self.shared.outputs).link_number_if_free(channel_type, number, link, || {
            self.make_output(channel_type, number)
        })
    }

    /// Link output channel `number` to `link`, replacing any previous link
    pub fn link_output_number(
        &self,
        channel_type: ChannelType,
        number: u32,
        link: SessionLink,
    ) -> Result<Arc<OutputChannel>> {
        self.ensure_open()?;
        let channel = self.output(channel_type, number);
        channel.set_link(Some(link));
        Ok(channel)
    }

    /// Clear the link of an input channel so its number can be reused
    pub fn release_input(&self, channel: &InputChannel) {
        let _registry = lock(&self.shared.inputs);
        channel.set_link(None);
    }

    /// Clear the link of an output channel so its number can be reused
    pub fn release_output(&self, channel: &OutputChannel) {
        let _registry = lock(&self.shared.outputs);
        channel.set_link(None);
    }

    /// Link stored on output channel `(type, number)`, if that channel exists
    pub fn output_link(&self, channel_type: ChannelType, number: u32) -> Option<SessionLink> {
        lock(&self.shared.outputs)
            .get(channel_type.pipe_kind(), number & MAX_CHANNEL_NUMBER)
            .and_then(|channel| channel.link())
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closing.load(Ordering::Acquire)
    }

    /// Resolves once the engine has started closing
    pub async fn closed(&self) {
        let mut rx = self.shared.shutdown.subscribe();
        wait_shutdown(&mut rx).await;
    }

    /// Close the transport and every channel
    ///
    /// Safe to call any number of times from any task; only the first call
    /// does the work.
    pub async fn close(&self) {
        if self.shared.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Closing multiplexer");
        self.shared
            .writer
            .shutdown(self.shared.settings.delivery_timeout)
            .await;

        let outputs = lock(&self.shared.outputs).drain();
        let inputs = lock(&self.shared.inputs).drain();
        for output in outputs {
            output.close_local();
        }
        for input in inputs {
            input.close().await;
        }
        debug!("Multiplexer closed");
    }

    /// Close the engine and wait for the reader task to finish
    pub async fn stop(&self) {
        self.close().await;
        let handle = lock(&self.shared.reader_task).take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    async fn run_reader<R>(self, reader: R)
    where
        R: AsyncRead + Unpin,
    {
        let mut shutdown = self.shared.shutdown.subscribe();
        let mut reader = EndianReader::little(reader);

        let result = tokio::select! {
            res = self.read_packets(&mut reader) => res,
            _ = wait_shutdown(&mut shutdown) => Ok(()),
        };

        match result {
            Ok(()) => debug!("Packet reader stopped"),
            Err(TunnelError::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                info!("Transport closed by peer")
            }
            Err(e) => error!("Packet reader failed: {}", e),
        }
        self.close().await;
    }

    async fn read_packets<R>(&self, reader: &mut EndianReader<R>) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        let settings = &self.shared.settings;
        let mut payload = vec![0u8; settings.packet_size];

        loop {
            let header = PacketHeader::read(reader).await?;
            let channel_type = ChannelType::from_bits(header.channel_type);
            let channel = self.input(channel_type, header.channel);

            let expected = channel.next_sequence();
            if expected != header.sequence {
                return Err(TunnelError::SequenceMismatch {
                    channel: header.channel,
                    expected,
                    actual: header.sequence,
                });
            }

            match header.kind()? {
                PacketKind::Data(len) => {
                    if len > payload.len() {
                        return Err(TunnelError::Framing(format!(
                            "packet of {} bytes exceeds packet size {} on channel {}",
                            len,
                            payload.len(),
                            header.channel
                        )));
                    }
                    reader.read_fully(&mut payload[..len]).await?;
                    trace!(
                        "Received packet channel={} type={} length={}",
                        header.channel,
                        channel_type,
                        len
                    );
                    if let Err(e) = channel
                        .deliver(&payload[..len], settings.delivery_timeout)
                        .await
                    {
                        warn!("Dropped {} bytes: {}", len, e);
                    }
                }
                PacketKind::Close => {
                    debug!("Peer closed channel {} ({})", header.channel, channel_type);
                    channel.close().await;
                }
                PacketKind::Open => {
                    debug!("Peer opened channel {} ({})", header.channel, channel_type);
                    channel.open().await;
                }
            }
        }
    }
}

impl std::fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Multiplexer")
            .field("closed", &self.is_closed())
            .field("inputs", &lock(&self.shared.inputs).len())
            .field("outputs", &lock(&self.shared.outputs).len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn pair() -> (Multiplexer, Multiplexer) {
        let (a, b) = tokio::io::duplex(256 * 1024);
        let seed = SessionSeed::from_u64(0x5eed);
        let settings = MuxSettings {
            packet_size: 1024,
            pipe_capacity: 64,
            delivery_timeout: Duration::from_millis(500),
        };
        (
            Multiplexer::start(a, settings.clone(), seed),
            Multiplexer::start(b, settings, seed),
        )
    }

    #[tokio::test]
    async fn test_buffered_round_trip_across_packets() {
        let (left, right) = pair();
        let mut reader = right.input(ChannelType::BUFFERED, 5).reader().await.unwrap();
        let output = left.output(ChannelType::BUFFERED, 5);

        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 253) as u8).collect();
        output.write(&data).await.unwrap();

        let mut received = vec![0u8; data.len()];
        reader.read_exact(&mut received).await.unwrap();
        assert_eq!(received, data);
    }

    #[tokio::test]
    async fn test_link_by_number_and_release() {
        let (left, _right) = pair();
        let first = left
            .link_output(ChannelType::DIRECT, SessionLink::Control)
            .unwrap();
        assert_eq!(first.number(), 0);
        assert!(left.output_link(ChannelType::DIRECT, 0).is_some());

        left.release_output(&first);
        assert!(left.output_link(ChannelType::DIRECT, 0).is_none());

        let pinned = left
            .link_input_number(ChannelType::BUFFERED, 40, SessionLink::Control)
            .unwrap();
        assert_eq!(pinned.number(), 40);
        assert!(pinned.link().is_some());
        assert!(left
            .claim_input(ChannelType::BUFFERED, 40, SessionLink::Control)
            .is_err());
        assert!(left.output_link(ChannelType::BUFFERED, 40).is_none());
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_stops_reader() {
        let (left, right) = pair();
        assert!(left.is_reader_running());

        tokio::join!(left.close(), left.close());
        left.stop().await;
        assert!(left.is_closed());
        assert!(!left.is_reader_running());
        assert!(left
            .link_output(ChannelType::DIRECT, SessionLink::Control)
            .is_err());

        // the peer sees end of stream and closes too
        tokio::time::timeout(Duration::from_secs(2), right.closed())
            .await
            .unwrap();
    }
}
