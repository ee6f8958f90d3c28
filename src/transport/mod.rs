//! Transport capability consumed by the core.
//!
//! A transport moves datagrams between this node and remote endpoints. The
//! core never retransmits; it only needs a way to dial, write, close, and to
//! send raw punch datagrams from the same socket it talks to the rendezvous
//! server with.
//!
//! - [`UdpTransport`]: a real udp socket.
//! - [`MemoryNetwork`]: an in-process network with deterministic loss, for tests.

use std::io::Result;
use std::net::SocketAddr;
use std::sync::Arc;

mod memory;
mod udp;
pub use memory::{Kind, MemoryNetwork, MemoryTransport};
pub use udp::UdpTransport;

/// Identifies one transport level connection. Transports keyed by remote
/// socket address use it directly.
pub type Handle = SocketAddr;

pub trait Transport: Send + Sync + 'static {
    /// Open (or reuse) a connection to `addr`.
    fn dial(&self, addr: SocketAddr) -> Result<Handle>;

    fn write(&self, handle: Handle, data: &[u8]) -> Result<()>;

    /// Close the connection and tell the remote side, best effort.
    fn close(&self, handle: Handle);

    /// Send an unframed datagram, used for hole punching.
    fn send_raw(&self, addr: SocketAddr, data: &[u8]) -> Result<()>;

    fn local_addr(&self) -> Result<SocketAddr>;

    /// Install the callbacks for inbound traffic. Delivery starts here.
    fn set_receiver(&self, receiver: Arc<dyn Receiver>);
}

/// Inbound callbacks, invoked on the transport's receive path.
pub trait Receiver: Send + Sync {
    /// A remote endpoint opened a new connection.
    fn on_connect(&self, handle: Handle);

    /// Data on a connection, or the error that ended it.
    fn on_receive(&self, handle: Handle, data: Result<&[u8]>);

    /// A raw datagram that does not belong to any connection framing.
    fn on_raw(&self, from: SocketAddr, data: &[u8]);
}
