use super::{Handle, Receiver, Transport};
use std::collections::{HashMap, HashSet};
use std::io::{Error, ErrorKind, Result};
use std::net::SocketAddr;
use std::sync::{
    atomic::{AtomicUsize, Ordering::Relaxed},
    Arc, Mutex, RwLock,
};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::task::spawn;

/// Kind of datagram crossing a [`MemoryNetwork`], as seen by a drop filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Data,
    Close,
    Raw,
}

enum Datagram {
    Data(Vec<u8>),
    Close,
    Raw(Vec<u8>),
}

impl Datagram {
    fn kind(&self) -> Kind {
        match self {
            Datagram::Data(_) => Kind::Data,
            Datagram::Close => Kind::Close,
            Datagram::Raw(_) => Kind::Raw,
        }
    }

    fn payload(&self) -> &[u8] {
        match self {
            Datagram::Data(d) | Datagram::Raw(d) => d,
            Datagram::Close => &[],
        }
    }
}

type DropFilter = Box<dyn Fn(SocketAddr, SocketAddr, Kind, &[u8]) -> bool + Send + Sync>;

/// In-process datagram network.
///
/// Every bound [`MemoryTransport`] gets a queue; datagrams are delivered in
/// send order by one task per endpoint. A drop filter decides
/// deterministically which datagrams are lost.
#[derive(Default)]
pub struct MemoryNetwork {
    nodes: RwLock<HashMap<SocketAddr, UnboundedSender<(SocketAddr, Datagram)>>>,
    drop_filter: RwLock<Option<DropFilter>>,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Default::default()
    }

    /// Attach an endpoint at `addr`, replacing any previous one.
    pub fn bind(self: &Arc<Self>, addr: SocketAddr) -> Arc<MemoryTransport> {
        let (tx, rx) = unbounded_channel();
        self.nodes.write().unwrap().insert(addr, tx);

        Arc::new(MemoryTransport {
            addr,
            net: self.clone(),
            peers: Default::default(),
            rx: Mutex::new(Some(rx)),
            sent: AtomicUsize::new(0),
        })
    }

    /// Drop every datagram for which `f(from, to, kind, payload)` returns
    /// true. The filter sees every datagram, so it can also count them.
    pub fn set_drop_filter<F>(&self, f: F)
    where
        F: Fn(SocketAddr, SocketAddr, Kind, &[u8]) -> bool + Send + Sync + 'static,
    {
        *self.drop_filter.write().unwrap() = Some(Box::new(f));
    }

    pub fn clear_drop_filter(&self) {
        *self.drop_filter.write().unwrap() = None;
    }

    fn deliver(&self, from: SocketAddr, to: SocketAddr, d: Datagram) {
        if let Some(f) = self.drop_filter.read().unwrap().as_ref() {
            if f(from, to, d.kind(), d.payload()) {
                log::trace!("memory network drop {:?} {} -> {}", d.kind(), from, to);
                return;
            }
        }

        match self.nodes.read().unwrap().get(&to) {
            Some(tx) => {
                let _ = tx.send((from, d));
            }
            None => log::trace!("memory network: no endpoint at {}", to),
        }
    }
}

/// One endpoint of a [`MemoryNetwork`].
pub struct MemoryTransport {
    addr: SocketAddr,
    net: Arc<MemoryNetwork>,
    peers: Arc<RwLock<HashSet<SocketAddr>>>,
    rx: Mutex<Option<UnboundedReceiver<(SocketAddr, Datagram)>>>,
    sent: AtomicUsize,
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.net.nodes.write().unwrap().remove(&self.addr);
    }
}

impl MemoryTransport {
    /// Number of datagrams this endpoint has sent.
    pub fn sent(&self) -> usize {
        self.sent.load(Relaxed)
    }

    fn send(&self, to: SocketAddr, d: Datagram) {
        self.sent.fetch_add(1, Relaxed);
        self.net.deliver(self.addr, to, d);
    }

    async fn delivery_loop(
        mut rx: UnboundedReceiver<(SocketAddr, Datagram)>,
        peers: Arc<RwLock<HashSet<SocketAddr>>>,
        receiver: Arc<dyn Receiver>,
    ) {
        while let Some((from, d)) = rx.recv().await {
            match d {
                Datagram::Data(data) => {
                    let new = peers.write().unwrap().insert(from);
                    if new {
                        receiver.on_connect(from);
                    }
                    receiver.on_receive(from, Ok(&data));
                }
                Datagram::Close => {
                    let known = peers.write().unwrap().remove(&from);
                    if known {
                        receiver.on_receive(
                            from,
                            Err(Error::new(ErrorKind::ConnectionAborted, "closed by peer")),
                        );
                    }
                }
                Datagram::Raw(data) => receiver.on_raw(from, &data),
            }
        }
    }
}

impl Transport for MemoryTransport {
    fn dial(&self, addr: SocketAddr) -> Result<Handle> {
        self.peers.write().unwrap().insert(addr);
        Ok(addr)
    }

    fn write(&self, handle: Handle, data: &[u8]) -> Result<()> {
        self.send(handle, Datagram::Data(data.to_vec()));
        Ok(())
    }

    fn close(&self, handle: Handle) {
        let known = self.peers.write().unwrap().remove(&handle);
        if known {
            self.send(handle, Datagram::Close);
        }
    }

    fn send_raw(&self, addr: SocketAddr, data: &[u8]) -> Result<()> {
        self.send(addr, Datagram::Raw(data.to_vec()));
        Ok(())
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.addr)
    }

    fn set_receiver(&self, receiver: Arc<dyn Receiver>) {
        match self.rx.lock().unwrap().take() {
            Some(rx) => {
                spawn(Self::delivery_loop(rx, self.peers.clone(), receiver));
            }
            None => log::warn!("memory transport receiver already set"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::UnboundedSender;
    use tokio::time::{sleep, timeout, Duration};

    struct Collect(UnboundedSender<(SocketAddr, Vec<u8>)>);

    impl Receiver for Collect {
        fn on_connect(&self, _handle: Handle) {}

        fn on_receive(&self, handle: Handle, data: Result<&[u8]>) {
            if let Ok(d) = data {
                let _ = self.0.send((handle, d.to_vec()));
            }
        }

        fn on_raw(&self, from: SocketAddr, data: &[u8]) {
            let _ = self.0.send((from, data.to_vec()));
        }
    }

    #[tokio::test]
    async fn test_drop_filter() {
        let net = MemoryNetwork::new();
        let a_addr: SocketAddr = "10.0.0.1:1".parse().unwrap();
        let b_addr: SocketAddr = "10.0.0.2:1".parse().unwrap();
        let a = net.bind(a_addr);
        let b = net.bind(b_addr);

        let (tx, mut rx) = unbounded_channel();
        b.set_receiver(Arc::new(Collect(tx)));

        net.set_drop_filter(|_, _, kind, _| kind == Kind::Raw);
        a.send_raw(b_addr, b"lost").unwrap();
        a.write(a.dial(b_addr).unwrap(), b"kept").unwrap();

        let (from, data) = timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(from, a_addr);
        assert_eq!(data, b"kept");
        assert_eq!(a.sent(), 2);

        sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }
}
