use super::{Handle, Receiver, Transport};
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::HashMap;
use std::io::{Error, ErrorKind, Result};
use std::net::SocketAddr;
use std::sync::{
    atomic::{AtomicBool, Ordering::Relaxed},
    Arc, RwLock,
};
use std::time::{Duration, Instant};
use tokio::{net::UdpSocket, select, sync::Notify, task::spawn, time::sleep};

const TAG_DATA: u8 = 0xF1;
const TAG_CLOSE: u8 = 0xF2;
const TAG_PING: u8 = 0xF3;

const KEEPALIVE: Duration = Duration::from_secs(10);
const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

type PeerMap = Arc<RwLock<HashMap<SocketAddr, Instant>>>;

/// Udp transport
///
/// One socket carries the rendezvous channel, peer channels and punch
/// datagrams, so the NAT mapping seen by the server is the one peers punch.
/// Channel datagrams are tagged with one leading byte; anything else is
/// handed to [`Receiver::on_raw`].
///
/// ```no_run
/// # async fn run() -> std::io::Result<()> {
/// use teonet::transport::UdpTransport;
///
/// let t = UdpTransport::bind("0.0.0.0:0".parse().unwrap())?;
/// # Ok(())
/// # }
/// ```
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    peers: PeerMap,
    started: AtomicBool,
    exit: Arc<AtomicBool>,
    exit_notify: Arc<Notify>,
}

impl Drop for UdpTransport {
    fn drop(&mut self) {
        self.exit.store(true, Relaxed);
        self.exit_notify.notify_waiters();
    }
}

impl UdpTransport {
    /// Bind a reusable udp socket. Must be called within a tokio runtime.
    pub fn bind(local_addr: SocketAddr) -> Result<Arc<Self>> {
        let socket = Self::create_socket(Domain::for_address(local_addr))?;
        socket.bind(&local_addr.into())?;
        socket.set_nonblocking(true)?;

        Ok(Arc::new(Self {
            socket: Arc::new(UdpSocket::from_std(socket.into())?),
            peers: Default::default(),
            started: AtomicBool::new(false),
            exit: Default::default(),
            exit_notify: Default::default(),
        }))
    }

    fn create_socket(domain: Domain) -> Result<Socket> {
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;

        Ok(socket)
    }

    /// Record traffic from `addr`, returns true if the peer was unknown.
    fn touch(peers: &PeerMap, addr: SocketAddr) -> bool {
        peers.write().unwrap().insert(addr, Instant::now()).is_none()
    }

    fn send_tagged(&self, tag: u8, data: &[u8], addr: SocketAddr) -> Result<()> {
        let mut buf = Vec::with_capacity(data.len() + 1);
        buf.push(tag);
        buf.extend_from_slice(data);
        self.socket.try_send_to(&buf, addr).map(|_| ())
    }

    async fn recv_loop(
        socket: Arc<UdpSocket>,
        peers: PeerMap,
        receiver: Arc<dyn Receiver>,
        exit: Arc<AtomicBool>,
        exit_notify: Arc<Notify>,
    ) {
        let mut buf = vec![0u8; 65536];

        loop {
            let (n, from) = select! {
                _ = exit_notify.notified() => break,
                r = socket.recv_from(&mut buf) => match r {
                    Ok(r) => r,
                    Err(e) => {
                        log::trace!("udp recv: {}", e);
                        continue;
                    }
                },
            };

            if exit.load(Relaxed) {
                break;
            }

            match buf[..n].first() {
                Some(&TAG_DATA) => {
                    if Self::touch(&peers, from) {
                        log::trace!("new connection from {}", from);
                        receiver.on_connect(from);
                    }
                    receiver.on_receive(from, Ok(&buf[1..n]));
                }
                Some(&TAG_PING) => {
                    if let Some(last) = peers.write().unwrap().get_mut(&from) {
                        *last = Instant::now();
                    }
                }
                Some(&TAG_CLOSE) => {
                    let known = peers.write().unwrap().remove(&from).is_some();
                    if known {
                        receiver.on_receive(
                            from,
                            Err(Error::new(ErrorKind::ConnectionAborted, "closed by peer")),
                        );
                    }
                }
                _ => receiver.on_raw(from, &buf[..n]),
            }
        }
    }

    async fn keepalive_loop(
        socket: Arc<UdpSocket>,
        peers: PeerMap,
        receiver: Arc<dyn Receiver>,
        exit: Arc<AtomicBool>,
        exit_notify: Arc<Notify>,
    ) {
        loop {
            select! {
                _ = exit_notify.notified() => break,
                _ = sleep(KEEPALIVE) => {},
            }

            if exit.load(Relaxed) {
                break;
            }

            let expired: Vec<SocketAddr> = {
                let mut peers = peers.write().unwrap();
                let expired = peers
                    .iter()
                    .filter(|(_, last)| last.elapsed() > IDLE_TIMEOUT)
                    .map(|(addr, _)| *addr)
                    .collect::<Vec<_>>();
                for addr in &expired {
                    peers.remove(addr);
                }
                expired
            };

            for addr in expired {
                log::debug!("connection {} idle, dropped", addr);
                receiver.on_receive(addr, Err(Error::new(ErrorKind::TimedOut, "idle timeout")));
            }

            let alive: Vec<SocketAddr> = peers.read().unwrap().keys().copied().collect();
            for addr in alive {
                let _ = socket.try_send_to(&[TAG_PING], addr);
            }
        }
    }
}

impl Transport for UdpTransport {
    fn dial(&self, addr: SocketAddr) -> Result<Handle> {
        self.peers
            .write()
            .unwrap()
            .entry(addr)
            .or_insert_with(Instant::now);
        Ok(addr)
    }

    fn write(&self, handle: Handle, data: &[u8]) -> Result<()> {
        self.send_tagged(TAG_DATA, data, handle)
    }

    fn close(&self, handle: Handle) {
        let known = self.peers.write().unwrap().remove(&handle).is_some();
        if known {
            let _ = self.send_tagged(TAG_CLOSE, &[], handle);
        }
    }

    fn send_raw(&self, addr: SocketAddr, data: &[u8]) -> Result<()> {
        self.socket.try_send_to(data, addr).map(|_| ())
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        self.socket.local_addr()
    }

    fn set_receiver(&self, receiver: Arc<dyn Receiver>) {
        if self.started.swap(true, Relaxed) {
            log::warn!("udp transport receiver already set");
            return;
        }

        spawn(Self::recv_loop(
            self.socket.clone(),
            self.peers.clone(),
            receiver.clone(),
            self.exit.clone(),
            self.exit_notify.clone(),
        ));
        spawn(Self::keepalive_loop(
            self.socket.clone(),
            self.peers.clone(),
            receiver,
            self.exit.clone(),
            self.exit_notify.clone(),
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
    use tokio::time::timeout;

    #[derive(Debug, PartialEq)]
    enum Got {
        Connect(SocketAddr),
        Data(SocketAddr, Vec<u8>),
        Closed(SocketAddr),
        Raw(SocketAddr, Vec<u8>),
    }

    struct Collect(UnboundedSender<Got>);

    impl Receiver for Collect {
        fn on_connect(&self, handle: Handle) {
            let _ = self.0.send(Got::Connect(handle));
        }

        fn on_receive(&self, handle: Handle, data: Result<&[u8]>) {
            let _ = self.0.send(match data {
                Ok(d) => Got::Data(handle, d.to_vec()),
                Err(_) => Got::Closed(handle),
            });
        }

        fn on_raw(&self, from: SocketAddr, data: &[u8]) {
            let _ = self.0.send(Got::Raw(from, data.to_vec()));
        }
    }

    #[tokio::test]
    async fn test_data_raw_close() {
        let a = UdpTransport::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let b = UdpTransport::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let a_addr = a.local_addr().unwrap();
        let b_addr = b.local_addr().unwrap();

        let (tx, mut rx) = unbounded_channel();
        a.set_receiver(Arc::new(Collect(tx)));

        let h = b.dial(a_addr).unwrap();
        b.write(h, b"hello").unwrap();
        b.send_raw(a_addr, b"punch-id").unwrap();
        b.close(h);

        let mut got = vec![];
        for _ in 0..4 {
            let g = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
            got.push(g);
        }

        assert_eq!(
            got,
            vec![
                Got::Connect(b_addr),
                Got::Data(b_addr, b"hello".to_vec()),
                Got::Raw(b_addr, b"punch-id".to_vec()),
                Got::Closed(b_addr),
            ]
        );
    }
}
