//! Wire formats
//!
//! The little-endian packet framing of the multiplexer, the textual control
//! messages carried on the control channel, and the datagram framing used by
//! UDP tunnels.

mod control;
mod datagram;
mod digest;
mod endian;
mod packet;

pub use control::{
    ControlMessage, RequestTarget, TunnelKind, TunnelRequest, TunnelResponse, EMPTY_FIELD,
    FIELD_SEPARATOR, MESSAGE_MARK, MESSAGE_PREFIX,
};
pub use datagram::{UdpHeader, UdpTraffic, MAX_DATAGRAM_LEN};
pub use digest::{digest, token_seed, Digest, HASH_WIDTH_IN_BYTES};
pub use endian::{put_uint, ByteOrder, EndianReader, EndianWriter, MAX_BLOB_LEN};
pub use packet::{
    PacketHeader, PacketKind, CHANNEL_SPACE, LENGTH_CLOSE, LENGTH_OPEN, MAX_CHANNEL_NUMBER,
    PACKET_HEADER_LEN,
};
