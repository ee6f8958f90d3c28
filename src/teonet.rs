use crate::channel::{Channel, Channels};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::event::{Event, EventKind, Handler, Packet};
use crate::identity::Identity;
use crate::pending::{spawn_sweeper, ConnectRequests, RequestStore};
use crate::puncher::{self, Puncher};
use crate::shutdown::Closing;
use crate::subscribe::{Subscribers, Subscription};
use crate::transport::{Handle, Receiver, Transport};
use crate::wire::{ConnectData, Frame};
use std::collections::HashSet;
use std::io;
use std::net::SocketAddr;
use std::sync::{
    atomic::{AtomicU32, Ordering::Relaxed},
    Arc, Mutex, RwLock, Weak,
};
use tokio::sync::oneshot;

/// Options of [`Teonet::send_to_with`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendAttr {
    /// Prefix the payload with a command byte.
    Command(u8),
    /// Append the packet id, little endian `u32`, so the answer can be
    /// matched with [`WaitFilter::Id`](crate::WaitFilter::Id).
    WithId,
}

#[derive(Default)]
pub(crate) struct AuthState {
    pub channel: Option<Arc<Channel>>,
    pub server_key: Vec<u8>,
    pub server_address: String,
    /// Servers of the last successful connect, reused by reconnects.
    pub hints: Vec<String>,
}

pub(crate) struct Inner {
    pub config: Config,
    pub identity: Identity,
    pub transport: Arc<dyn Transport>,
    pub channels: Channels,
    pub puncher: Arc<Puncher>,
    pub requests: Arc<dyn RequestStore>,
    pub subscribers: Subscribers,
    pub readers: RwLock<Vec<Handler>>,
    pub auth: RwLock<AuthState>,
    /// Handle of the handshake in flight and where its reply goes.
    pub auth_reply: Mutex<Option<(Handle, oneshot::Sender<ConnectData>)>>,
    /// One handshake at a time, so the reply slot has a single owner.
    pub handshake: tokio::sync::Mutex<()>,
    pub address: RwLock<String>,
    pub reconnect_off: RwLock<HashSet<String>>,
    pub closing: Arc<Closing>,
    packet_id: AtomicU32,
}

/// A teonet node.
///
/// Cheap to clone; all clones drive the same node. Must be created within a
/// tokio runtime.
///
/// ```no_run
/// # async fn run() -> teonet::Result<()> {
/// use teonet::{transport::UdpTransport, Config, Teonet};
///
/// let transport = UdpTransport::bind("0.0.0.0:0".parse().unwrap())?;
/// let node = Teonet::new(Config::default(), transport, vec![])?;
/// node.connect(&["rendezvous.example.org:7050"]).await?;
/// node.connect_to("8agv3zUVxZ5Kht7TsNgo3ri8BFAj", vec![]).await?;
/// node.send_to("8agv3zUVxZ5Kht7TsNgo3ri8BFAj", b"hello")?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Teonet {
    pub(crate) inner: Arc<Inner>,
}

struct Dispatcher(Weak<Inner>);

impl Dispatcher {
    fn node(&self) -> Option<Teonet> {
        self.0.upgrade().map(|inner| Teonet { inner })
    }
}

impl Receiver for Dispatcher {
    fn on_connect(&self, handle: Handle) {
        if let Some(node) = self.node() {
            node.channel_for(handle);
        }
    }

    fn on_receive(&self, handle: Handle, data: io::Result<&[u8]>) {
        if let Some(node) = self.node() {
            match data {
                Ok(data) => node.on_packet(handle, data),
                Err(e) => node.on_disconnect(handle, e),
            }
        }
    }

    fn on_raw(&self, from: SocketAddr, data: &[u8]) {
        if let Some(node) = self.node() {
            node.inner.puncher.received(from, data);
        }
    }
}

impl Teonet {
    /// Create a node on `transport`. `readers` receive every event and every
    /// data packet no subscription took.
    pub fn new(config: Config, transport: Arc<dyn Transport>, readers: Vec<Handler>) -> Result<Self> {
        let identity = match config.secret_key {
            Some(ref secret) => Identity::from_secret(secret),
            None => Identity::generate(),
        };
        let address = if config.rendezvous_server {
            identity.address()
        } else {
            String::new()
        };

        let requests: Arc<dyn RequestStore> = Arc::new(ConnectRequests::default());
        let closing = Arc::new(Closing::default());
        spawn_sweeper(requests.clone(), config.connect_timeout, closing.clone());

        let inner = Arc::new(Inner {
            puncher: Arc::new(Puncher::new(transport.clone())),
            transport: transport.clone(),
            channels: Default::default(),
            requests,
            subscribers: Default::default(),
            readers: RwLock::new(readers),
            auth: Default::default(),
            auth_reply: Mutex::new(None),
            handshake: Default::default(),
            address: RwLock::new(address),
            reconnect_off: Default::default(),
            closing,
            packet_id: AtomicU32::new(0),
            identity,
            config,
        });
        transport.set_receiver(Arc::new(Dispatcher(Arc::downgrade(&inner))));

        let node = Self { inner };
        log::debug!(
            "teonet node {} on {:?}",
            node.inner.identity.address(),
            transport.local_addr()
        );

        let local = Channel::new(node.inner.identity.address(), transport.local_addr()?, transport);
        node.dispatch(&local, Packet::default(), Event::new(EventKind::Init));

        Ok(node)
    }

    /// Address assigned by the rendezvous server, empty before `connect`.
    pub fn address(&self) -> String {
        self.inner.address.read().unwrap().clone()
    }

    pub fn public_key(&self) -> Vec<u8> {
        self.inner.identity.public_key()
    }

    /// True while a rendezvous server connection is up.
    pub fn is_connected(&self) -> bool {
        self.auth_channel().is_some()
    }

    pub fn server_address(&self) -> Option<String> {
        let auth = self.inner.auth.read().unwrap();
        auth.channel.as_ref().map(|_| auth.server_address.clone())
    }

    /// Add a general reader after construction.
    pub fn add_reader(&self, reader: Handler) {
        self.inner.readers.write().unwrap().push(reader);
    }

    /// Live channel of a peer.
    pub fn channel(&self, address: &str) -> Option<Arc<Channel>> {
        self.inner
            .channels
            .get_by_address(address)
            .filter(|c| !c.is_closing())
    }

    pub(crate) fn auth_channel(&self) -> Option<Arc<Channel>> {
        self.inner.auth.read().unwrap().channel.clone()
    }

    pub(crate) fn is_auth(&self, channel: &Arc<Channel>) -> bool {
        matches!(self.auth_channel(), Some(c) if Arc::ptr_eq(&c, channel))
    }

    pub(crate) fn is_server(&self) -> bool {
        self.inner.config.rendezvous_server
    }

    pub(crate) fn is_reconnect_off(&self, address: &str) -> bool {
        self.inner.reconnect_off.read().unwrap().contains(address)
    }

    #[cfg(test)]
    pub(crate) fn pending_requests(&self) -> usize {
        self.inner.requests.len()
    }

    /// Local candidates and port offered to a remote peer.
    pub(crate) fn local_candidates(&self) -> (Vec<String>, u32) {
        match self.inner.transport.local_addr() {
            Ok(addr) => (
                puncher::local_ips(addr, self.inner.config.discover_local_ips),
                addr.port() as u32,
            ),
            Err(e) => {
                log::warn!("local address: {}", e);
                (vec![], 0)
            }
        }
    }

    /// Channel of `handle`, created provisionally if the handle is new.
    fn channel_for(&self, handle: Handle) -> Arc<Channel> {
        if let Some(c) = self.inner.channels.get_by_handle(&handle) {
            return c;
        }
        let c = Channel::provisional(handle, self.inner.transport.clone());
        log::trace!("new channel {}", c.address());
        self.inner.channels.add(c.clone());
        c
    }

    fn on_packet(&self, handle: Handle, data: &[u8]) {
        let channel = self.channel_for(handle);

        match Frame::parse(data) {
            Some(Ok(frame)) => self.handle_frame(&channel, frame),
            Some(Err(e)) => log::warn!("malformed control packet from {}: {}", channel.address(), e),
            None => self.dispatch(
                &channel,
                Packet::new(channel.address(), data.to_vec()),
                Event::new(EventKind::Data),
            ),
        }
    }

    fn handle_frame(&self, channel: &Arc<Channel>, frame: Frame) {
        let server = self.is_server();
        match frame {
            Frame::Connect(d) if server => self.serve_connect(channel, d),
            Frame::Connect(d) => self.on_connect_reply(channel, d),
            Frame::ConnectTo(d) if server => self.relay_connect_to(channel, d),
            Frame::ConnectToPeerAnswer(d) if server => self.relay_peer_answer(channel, d),
            Frame::ConnectToPeer(d) if !server && self.is_auth(channel) => self.on_connect_to_peer(d),
            Frame::ConnectToAnswer(d) if !server && self.is_auth(channel) => {
                self.on_connect_to_answer(d)
            }
            Frame::NewConnection(d) => self.on_new_connection(channel, d),
            f => log::debug!("unexpected control packet from {}: {:?}", channel.address(), f),
        }
    }

    fn on_disconnect(&self, handle: Handle, err: io::Error) {
        let channel = match self.inner.channels.get_by_handle(&handle) {
            Some(c) => c,
            None => return,
        };
        self.inner.channels.remove(&channel);

        if self.is_auth(&channel) {
            self.inner.auth.write().unwrap().channel = None;
            log::info!("rendezvous server disconnected: {}", err);
            self.dispatch(
                &channel,
                Packet::default(),
                Event::with_err(EventKind::RendezvousDisconnected, &err),
            );
            self.inner.subscribers.unsubscribe_channel(&channel);
            self.spawn_auth_reconnect();
            return;
        }

        if !channel.is_provisional() {
            log::info!("peer {} disconnected: {}", channel.address(), err);
            self.dispatch(
                &channel,
                Packet::default(),
                Event::with_err(EventKind::PeerDisconnected, &err),
            );
        }
        self.inner.subscribers.unsubscribe_channel(&channel);
    }

    /// Deliver to subscriptions of the channel first, then to readers. A data
    /// packet stops at the first handler that takes it.
    pub(crate) fn dispatch(&self, channel: &Arc<Channel>, packet: Packet, event: Event) {
        if self.inner.subscribers.deliver(channel, &packet, &event) && event.is_data() {
            return;
        }

        let readers = self.inner.readers.read().unwrap().clone();
        for reader in readers {
            if reader(channel, &packet, &event) && event.is_data() {
                return;
            }
        }

        if event.is_data() {
            log::trace!("unhandled packet from {}", channel.address());
        }
    }

    /// Send `data` to a connected peer, returns the packet id.
    pub fn send_to(&self, address: &str, data: &[u8]) -> Result<u32> {
        self.send_to_with(address, data, &[])
    }

    pub fn send_to_with(&self, address: &str, data: &[u8], attrs: &[SendAttr]) -> Result<u32> {
        let channel = self
            .channel(address)
            .ok_or_else(|| Error::NotConnected(address.to_string()))?;
        let id = self.inner.packet_id.fetch_add(1, Relaxed).wrapping_add(1);

        let mut buf = Vec::with_capacity(data.len() + 5);
        if let Some(cmd) = attrs.iter().find_map(|a| match a {
            SendAttr::Command(c) => Some(*c),
            _ => None,
        }) {
            buf.push(cmd);
        }
        buf.extend_from_slice(data);
        if attrs.contains(&SendAttr::WithId) {
            buf.extend_from_slice(&id.to_le_bytes());
        }

        channel.send(&buf)?;
        log::trace!("send {} bytes to {}, id {}", buf.len(), address, id);
        Ok(id)
    }

    /// One-shot subscription on the channel of `address`: removed after the
    /// handler first returns true.
    pub fn subscribe(&self, address: &str, handler: Handler) -> Result<Arc<Subscription>> {
        let channel = self
            .channel(address)
            .ok_or_else(|| Error::NotConnected(address.to_string()))?;
        Ok(self.inner.subscribers.subscribe(channel, handler, true))
    }

    /// Idempotent.
    pub fn unsubscribe(&self, sub: &Subscription) {
        self.inner.subscribers.unsubscribe(sub);
    }

    /// Close the channel of a peer. No reconnect follows.
    pub fn close_to(&self, address: &str) -> Result<()> {
        let channel = self
            .inner
            .channels
            .get_by_address(address)
            .ok_or_else(|| Error::NotConnected(address.to_string()))?;

        channel.set_closing();
        self.inner.channels.remove(&channel);
        channel.close();
        log::debug!("closed channel {}", address);

        self.dispatch(&channel, Packet::default(), Event::new(EventKind::PeerDisconnected));
        self.inner.subscribers.unsubscribe_channel(&channel);
        Ok(())
    }

    /// Stop reconnecting to `address` after it disconnects.
    pub fn reconnect_off(&self, address: &str) {
        self.inner
            .reconnect_off
            .write()
            .unwrap()
            .insert(address.to_string());
    }

    /// Shut the node down: stop every loop and close every channel.
    pub fn close(&self) {
        if !self.inner.closing.close() {
            return;
        }
        log::debug!("closing teonet node {}", self.address());

        self.inner.auth.write().unwrap().channel = None;
        // a handshake in flight fails with Closed
        self.inner.auth_reply.lock().unwrap().take();
        for channel in self.inner.channels.all() {
            channel.set_closing();
            self.inner.channels.remove(&channel);
            channel.close();
            self.inner.subscribers.unsubscribe_channel(&channel);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closing.is_closed()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::transport::{MemoryNetwork, MemoryTransport};
    use std::time::Duration;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
    use tokio::time::timeout;

    pub const SERVER: &str = "10.0.0.1:7050";

    pub fn test_config() -> Config {
        Config {
            discover_local_ips: false,
            connect_timeout: Duration::from_secs(2),
            wait_timeout: Duration::from_millis(500),
            reconnect_backoff: Duration::from_millis(100),
            ..Default::default()
        }
    }

    /// Reader forwarding every (event, packet) to a channel.
    pub fn recorder() -> (Handler, UnboundedReceiver<(Event, Packet)>) {
        let (tx, rx) = unbounded_channel();
        let h: Handler = Arc::new(move |_, p, e| {
            let _ = tx.send((e.clone(), p.clone()));
            true
        });
        (h, rx)
    }

    pub fn server(net: &Arc<MemoryNetwork>) -> Teonet {
        let config = Config {
            rendezvous_server: true,
            ..test_config()
        };
        Teonet::new(config, net.bind(SERVER.parse().unwrap()), vec![]).unwrap()
    }

    pub async fn client(
        net: &Arc<MemoryNetwork>,
        addr: &str,
        readers: Vec<Handler>,
    ) -> (Teonet, Arc<MemoryTransport>) {
        let t = net.bind(addr.parse().unwrap());
        let node = Teonet::new(test_config(), t.clone(), readers).unwrap();
        node.connect(&[SERVER]).await.unwrap();
        (node, t)
    }

    pub async fn next_event(
        rx: &mut UnboundedReceiver<(Event, Packet)>,
        kind: EventKind,
    ) -> (Event, Packet) {
        timeout(Duration::from_secs(3), async {
            loop {
                let (e, p) = rx.recv().await.unwrap();
                if e.kind == kind {
                    return (e, p);
                }
            }
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_init_event_and_not_connected() {
        let net = MemoryNetwork::new();
        let (reader, mut rx) = recorder();
        let node = Teonet::new(
            test_config(),
            net.bind("10.0.0.2:7050".parse().unwrap()),
            vec![reader],
        )
        .unwrap();

        next_event(&mut rx, EventKind::Init).await;
        assert!(!node.is_connected());
        assert!(matches!(
            node.connect_to("nobody", vec![]).await,
            Err(Error::NotConnectedToTeonet)
        ));
        assert!(matches!(node.send_to("nobody", b"x"), Err(Error::NotConnected(_))));
        node.close();
        assert!(node.is_closed());
    }

    #[tokio::test]
    async fn test_send_attrs() {
        let net = MemoryNetwork::new();
        let _server = server(&net);
        let (a, _) = client(&net, "10.0.0.2:7050", vec![]).await;
        let (reader, mut rx) = recorder();
        let (b, _) = client(&net, "10.0.0.3:7050", vec![reader]).await;

        a.connect_to(&b.address(), vec![]).await.unwrap();
        let id = a
            .send_to_with(&b.address(), b"ping", &[SendAttr::Command(9), SendAttr::WithId])
            .unwrap();

        let (_, p) = next_event(&mut rx, EventKind::Data).await;
        assert_eq!(p.command(), Some(9));
        assert_eq!(p.id(), Some(id));
        assert_eq!(&p.data()[1..5], b"ping");
        assert_eq!(p.from_addr(), a.address());

        let next = a.send_to(&b.address(), b"x").unwrap();
        assert_eq!(next, id + 1);
    }
}
