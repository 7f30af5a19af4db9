//! Tunnel engine configuration

use crate::error::TunnelError;
use crate::mux::{ChannelType, CompressionMode, MuxSettings, SessionSeed};
use crate::protocol::MAX_CHANNEL_NUMBER;
use serde::{Deserialize, Serialize};
use std::time::Duration;

fn default_packet_size() -> usize {
    16 * 1024
}

fn default_pipe_capacity() -> usize {
    256
}

fn default_delivery_timeout_ms() -> u64 {
    5000
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

/// `[tunnel]` section
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TunnelConfig {
    /// Shared secret the sequence seed is derived from
    #[serde(default)]
    pub token: String,

    /// Largest payload of one packet
    #[serde(default = "default_packet_size")]
    pub packet_size: usize,

    /// Depth of each buffered pipe, in packets
    #[serde(default = "default_pipe_capacity")]
    pub pipe_capacity: usize,

    /// How long the packet reader waits on one slow consumer
    #[serde(default = "default_delivery_timeout_ms")]
    pub delivery_timeout_ms: u64,

    /// Reserved control channel number
    #[serde(default)]
    pub control_channel: u32,

    /// Default connect timeout of originated requests, 0 = none
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Default idle timeout of originated requests, 0 = none
    #[serde(default)]
    pub data_timeout_ms: u64,

    /// Compression of tunnel session channels
    #[serde(default)]
    pub compression: CompressionMode,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        TunnelConfig {
            token: String::new(),
            packet_size: default_packet_size(),
            pipe_capacity: default_pipe_capacity(),
            delivery_timeout_ms: default_delivery_timeout_ms(),
            control_channel: 0,
            connect_timeout_ms: default_connect_timeout_ms(),
            data_timeout_ms: 0,
            compression: CompressionMode::None,
        }
    }
}

fn millis(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

impl TunnelConfig {
    /// Check value ranges
    pub fn validate(&self) -> Result<(), TunnelError> {
        if self.packet_size == 0 || self.packet_size > MAX_CHANNEL_NUMBER as usize + 1 {
            return Err(TunnelError::Config(format!(
                "packet_size must be between 1 and {}, got {}",
                MAX_CHANNEL_NUMBER as usize + 1,
                self.packet_size
            )));
        }
        if self.pipe_capacity == 0 {
            return Err(TunnelError::Config(
                "pipe_capacity must be at least 1".to_string(),
            ));
        }
        if self.control_channel > MAX_CHANNEL_NUMBER {
            return Err(TunnelError::Config(format!(
                "control_channel {} is outside the channel space",
                self.control_channel
            )));
        }
        Ok(())
    }

    pub fn mux_settings(&self) -> MuxSettings {
        MuxSettings {
            packet_size: self.packet_size,
            pipe_capacity: self.pipe_capacity,
            delivery_timeout: Duration::from_millis(self.delivery_timeout_ms),
        }
    }

    pub fn seed(&self) -> SessionSeed {
        SessionSeed::from_token(&self.token)
    }

    /// Channel type for tunnel sessions
    pub fn session_channel_type(&self) -> ChannelType {
        ChannelType::DIRECT.with_compression(self.compression)
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        millis(self.connect_timeout_ms)
    }

    pub fn data_timeout(&self) -> Option<Duration> {
        millis(self.data_timeout_ms)
    }
}
