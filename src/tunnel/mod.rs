//! Tunnel sessions over a multiplexed connection
//!
//! A [`TunnelConnection`] runs the engine and the control task. The
//! originator opens sessions through a [`TunnelChannel`]; the responder side
//! is driven entirely by control requests.

mod channel;
mod connection;
mod control;
mod handler;
mod piped;
mod session;
pub mod socks;
mod udp;

pub use channel::{RemoteSocketFactory, TunnelChannel};
pub use connection::TunnelConnection;
pub use handler::{attach_stream, pump_outbound, wire_inbound};
pub use piped::TunnelStream;
pub use session::{SessionState, TunnelSession};
pub use udp::{relay_datagrams, TunnelDatagramSocket};
