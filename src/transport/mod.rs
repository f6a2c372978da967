//! Client-side transports to a host.
//!
//! A transport delivers [`ClientMessage`]s to the host and buffers
//! [`ServerMessage`]s until the processing loop polls for them. Polling
//! never blocks.

pub mod local;
pub mod tcp;

pub use local::LocalTransport;
pub use tcp::{TcpConnector, TcpTransport};

use crate::error::Result;
use crate::protocol::{ClientMessage, ServerMessage};

/// Something that happened on a transport since the last poll.
#[derive(Clone, Debug, PartialEq)]
pub enum TransportEvent {
    Message(ServerMessage),
    /// The host side went away. `Some` carries the reason for an abnormal
    /// close.
    Closed(Option<String>),
}

/// A bidirectional message channel to a host.
pub trait Transport: Send {
    fn send(&mut self, message: ClientMessage) -> Result<()>;

    /// Everything received since the last call, in arrival order.
    fn poll(&mut self) -> Vec<TransportEvent>;

    /// Close the channel. Calling this more than once has no effect.
    fn close(&mut self);
}

/// Opens transports to one kind of endpoint.
pub trait Connector {
    fn connect(&self, module: &str, token: Option<&str>) -> Result<Box<dyn Transport>>;
}
