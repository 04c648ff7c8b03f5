// Transport layer
//
// Seams between the engine and the sockets. The engine only knows how to
// hand a finished datagram to a `Transport` and how to receive whole
// datagrams through `DatagramHandler`; partial frames are never surfaced.
//
// Two instances are wired in: the unreliable UDP path carries probes and
// gossip, the reliable TCP path carries list synchronization, whose
// responses can exceed any sane datagram budget.

use crate::error::Result;
use crate::wire::NodeAddress;
use async_trait::async_trait;

pub mod tcp;
pub mod udp;

pub use tcp::{TcpConfig, TcpTransport};
pub use udp::{UdpConfig, UdpTransport};

/// Outbound side of a transport.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one whole datagram. Called with the engine lock held, so
    /// implementations must not block: deliver best-effort or fail fast.
    fn send(&self, destination: &NodeAddress, payload: &[u8]) -> Result<()>;

    /// Close the listener, then wait for the worker tasks to exit.
    async fn shutdown(&self) -> Result<()>;
}

/// Inbound side: the engine implements this and the transports call it with
/// each complete received datagram.
pub trait DatagramHandler: Send + Sync {
    fn dispatch_datagram(&self, payload: &[u8]) -> Result<()>;
}
