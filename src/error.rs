//! Error types for Muxtun
//!
//! One variant per failure class of the multiplexing engine and the tunnel
//! negotiation. Only some of them are fatal to a connection; see
//! [`TunnelError::is_fatal`].

use std::io;
use thiserror::Error;

/// Main error type for Muxtun operations
#[derive(Error, Debug)]
pub enum TunnelError {
    /// IO error on the shared transport or a session socket
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Short read, bad length code or oversized packet on the transport
    #[error("Framing error: {0}")]
    Framing(String),

    /// A packet carried a sequence number the channel did not expect
    #[error("Sequence mismatch on channel {channel}: expected {expected:#018x}, got {actual:#018x}")]
    SequenceMismatch {
        /// Channel number the packet was addressed to
        channel: u32,
        /// Sequence value the local sequencer produced
        expected: u64,
        /// Sequence value found on the wire
        actual: u64,
    },

    /// A packet could not be handed to its channel sink
    #[error("Delivery error on channel {channel}: {reason}")]
    Delivery {
        /// Channel number the packet was addressed to
        channel: u32,
        /// Why the sink rejected it
        reason: String,
    },

    /// Malformed or short control message
    #[error("Negotiation error: {0}")]
    Negotiation(String),

    /// Target dial, bind or accept failed, locally or on the remote side
    #[error("Connect error: {0}")]
    Connect(String),

    /// No free channel number left in the channel space
    #[error("No free channel number available")]
    ResourceExhausted,

    /// The channel or the whole engine is closed
    #[error("Closed: {0}")]
    Closed(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Timeout error
    #[error("Timeout: {0}")]
    Timeout(String),
}

impl TunnelError {
    /// Whether this error must tear down the whole multiplexing engine.
    ///
    /// Framing errors, sequence mismatches and transport I/O failures are
    /// fatal. Everything else is scoped to one channel, one session or one
    /// control message.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TunnelError::Io(_) | TunnelError::Framing(_) | TunnelError::SequenceMismatch { .. }
        )
    }
}

impl From<TunnelError> for io::Error {
    fn from(err: TunnelError) -> Self {
        match err {
            TunnelError::Io(e) => e,
            TunnelError::Connect(msg) => io::Error::new(io::ErrorKind::ConnectionRefused, msg),
            TunnelError::ResourceExhausted => io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "no free channel number available",
            ),
            TunnelError::Closed(msg) => io::Error::new(io::ErrorKind::BrokenPipe, msg),
            TunnelError::Timeout(msg) => io::Error::new(io::ErrorKind::TimedOut, msg),
            other => io::Error::new(io::ErrorKind::Other, other.to_string()),
        }
    }
}

/// Result alias used by the mux and tunnel layers
pub type Result<T, E = TunnelError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(TunnelError::Framing("eof".to_string()).is_fatal());
        assert!(TunnelError::SequenceMismatch {
            channel: 1,
            expected: 2,
            actual: 3
        }
        .is_fatal());
        assert!(TunnelError::Io(io::Error::new(io::ErrorKind::UnexpectedEof, "eof")).is_fatal());

        assert!(!TunnelError::Delivery {
            channel: 1,
            reason: "closed".to_string()
        }
        .is_fatal());
        assert!(!TunnelError::Negotiation("short".to_string()).is_fatal());
        assert!(!TunnelError::Connect("refused".to_string()).is_fatal());
        assert!(!TunnelError::ResourceExhausted.is_fatal());
    }

    #[test]
    fn test_tunnel_error_display() {
        let err = TunnelError::SequenceMismatch {
            channel: 7,
            expected: 1,
            actual: 2,
        };
        assert_eq!(
            format!("{}", err),
            "Sequence mismatch on channel 7: expected 0x0000000000000001, got 0x0000000000000002"
        );

        let err = TunnelError::Connect("host unreachable".to_string());
        assert_eq!(format!("{}", err), "Connect error: host unreachable");

        let err = TunnelError::ResourceExhausted;
        assert_eq!(format!("{}", err), "No free channel number available");

        let err = TunnelError::Config("bad packet size".to_string());
        assert_eq!(format!("{}", err), "Configuration error: bad packet size");
    }

    #[test]
    fn test_connect_error_maps_to_connection_refused() {
        let err: io::Error = TunnelError::Connect("failed".to_string()).into();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);

        let err: io::Error = TunnelError::ResourceExhausted.into();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);

        let err: io::Error = TunnelError::Timeout("slow".to_string()).into();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[test]
    fn test_io_error_roundtrips_kind() {
        let io_err = io::Error::new(io::ErrorKind::AddrInUse, "in use");
        let err: TunnelError = io_err.into();
        assert!(matches!(err, TunnelError::Io(_)));
        let back: io::Error = err.into();
        assert_eq!(back.kind(), io::ErrorKind::AddrInUse);
    }
}
