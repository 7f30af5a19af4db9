//! Channel type bitmask

use serde::{Deserialize, Serialize};

/// How inbound bytes reach the consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipeKind {
    /// Internal bounded pipe read through [`crate::mux::ChannelReader`]
    Buffered,
    /// Written straight into a caller-supplied sink
    Direct,
}

/// Per-channel compression level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionMode {
    #[default]
    None,
    Light,
    Heavy,
}

/// Raw type byte carried in every packet header
///
/// Bit 0 selects direct delivery, bit 1 enables compression and bit 2
/// upgrades it to the heavy level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ChannelType(u8);

impl ChannelType {
    pub const PIPE_DIRECT: u8 = 0x01;
    pub const COMPRESSION_ENABLED: u8 = 0x02;
    pub const COMPRESSION_HEAVY: u8 = 0x04;

    /// Buffered, uncompressed
    pub const BUFFERED: ChannelType = ChannelType(0);
    /// Direct, uncompressed
    pub const DIRECT: ChannelType = ChannelType(Self::PIPE_DIRECT);

    pub const fn from_bits(bits: u8) -> Self {
        ChannelType(bits)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub fn pipe_kind(self) -> PipeKind {
        if self.0 & Self::PIPE_DIRECT != 0 {
            PipeKind::Direct
        } else {
            PipeKind::Buffered
        }
    }

    pub fn compression(self) -> CompressionMode {
        if self.0 & Self::COMPRESSION_ENABLED == 0 {
            CompressionMode::None
        } else if self.0 & Self::COMPRESSION_HEAVY != 0 {
            CompressionMode::Heavy
        } else {
            CompressionMode::Light
        }
    }

    /// Same pipe kind with the given compression bits
    pub fn with_compression(self, mode: CompressionMode) -> Self {
        let base = self.0 & !(Self::COMPRESSION_ENABLED | Self::COMPRESSION_HEAVY);
        let bits = match mode {
            CompressionMode::None => base,
            CompressionMode::Light => base | Self::COMPRESSION_ENABLED,
            CompressionMode::Heavy => base | Self::COMPRESSION_ENABLED | Self::COMPRESSION_HEAVY,
        };
        ChannelType(bits)
    }
}

impl std::fmt::Display for ChannelType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#04x}", self.0)
    }
}
