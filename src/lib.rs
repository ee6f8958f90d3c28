//!Connection core of a teonet peer to peer network.
//!
//!A node behind a firewall or NAT only accepts traffic from hosts it sent traffic to first.
//!Teonet uses a public rendezvous server to make two such nodes open their paths to each other.
//!
//!## How it works
//!Every node holds an ed25519 key pair. It connects to a rendezvous server, which observes its
//!external address and assigns it a network address derived from the public key.
//!
//!To reach a peer, a node asks the server to forward a connect request. The peer answers through
//!the server with its local and observed addresses. Both sides then send punch datagrams carrying
//!the request id to every candidate address. The first punch that arrives tells the client where
//!the peer is reachable, and a direct handshake over that route completes the channel.
//!
//!After that, [`Teonet::send_to`] and [`Teonet::wait_from`] exchange packets over the channel
//!and handlers receive `(Channel, Packet, Event)` for data and lifecycle changes.
//!
//!Lost rendezvous and peer connections are re-established in the background until the node is
//!closed, or for a peer, until [`Teonet::reconnect_off`] is called.
//!
//!The packet transport is pluggable, see [`transport`]. The crate ships a plain udp transport and
//!an in-memory network for tests.

mod channel;
mod config;
mod connect_to;
mod error;
mod event;
pub mod identity;
mod pending;
mod puncher;
mod rendezvous;
mod shutdown;
mod subscribe;
mod teonet;
pub mod transport;
mod wait;
mod wire;

pub use channel::Channel;
pub use config::Config;
pub use error::{Error, Result};
pub use event::{Event, EventKind, Handler, Packet};
pub use subscribe::Subscription;
pub use teonet::{SendAttr, Teonet};
pub use wait::WaitFilter;
pub use wire::{ConnectData, ConnectToData};
