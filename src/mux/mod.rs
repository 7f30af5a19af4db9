//! Packet multiplexing engine
//!
//! Many logical channels, each identified by `(type, number)`, share one
//! transport. See [`Multiplexer`] for the engine and [`InputChannel`] /
//! [`OutputChannel`] for the two halves of a channel.

mod channel_type;
mod compression;
mod engine;
mod input;
mod output;
mod registry;
mod sequencer;

pub use channel_type::{ChannelType, CompressionMode, PipeKind};
pub use compression::{Compressor, Decompressor};
pub use engine::{MuxSettings, Multiplexer};
pub use input::{BoxedSink, ChannelReader, Closeable, InputChannel};
pub use output::{ChannelWriter, OutputChannel, PacketWriter};
pub use registry::SessionLink;
pub use sequencer::{Sequencer, SessionSeed};
