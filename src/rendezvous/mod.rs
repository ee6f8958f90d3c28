//! Rendezvous handshake.
//!
//! The client sends its public key, the address it had before (if any) and
//! the last server key it saw. The server answers with the address derived
//! from the key and its own key and address. Peer connect requests are then
//! relayed by the server between its clients.
//!
//! use `Teonet::connect` on a client; set `Config::rendezvous_server` to run
//! a server.

mod client;
mod server;

#[cfg(test)]
mod tests {
    use crate::config::Config;
    use crate::error::Error;
    use crate::event::EventKind;
    use crate::identity::address_from_key;
    use crate::teonet::tests::{client, next_event, recorder, server, test_config, SERVER};
    use crate::transport::{Handle, Kind, MemoryNetwork, MemoryTransport, Receiver, Transport};
    use crate::wire::Frame;
    use crate::Teonet;
    use std::io;
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::time::Duration;

    /// Answers every handshake with somebody else's public key.
    struct WrongKeyServer(Arc<MemoryTransport>);

    impl Receiver for WrongKeyServer {
        fn on_connect(&self, _handle: Handle) {}

        fn on_receive(&self, handle: Handle, data: io::Result<&[u8]>) {
            if let Ok(data) = data {
                if let Some(Ok(Frame::Connect(mut d))) = Frame::parse(data) {
                    d.public_key = vec![7; 32];
                    d.address = b"someone-else".to_vec();
                    d.server_key = vec![1; 32];
                    d.server_address = b"fake".to_vec();
                    let _ = self.0.write(handle, &Frame::Connect(d).marshal().unwrap());
                }
            }
        }

        fn on_raw(&self, _from: SocketAddr, _data: &[u8]) {}
    }

    #[tokio::test]
    async fn test_handshake() {
        let net = MemoryNetwork::new();
        let s = server(&net);
        let (reader, mut rx) = recorder();
        let (c, _) = client(&net, "10.0.0.2:7050", vec![reader]).await;

        next_event(&mut rx, EventKind::RendezvousConnected).await;
        assert!(c.is_connected());
        assert_eq!(c.address(), address_from_key(&c.public_key()));
        assert_eq!(c.server_address(), Some(s.address()));
        assert!(s.channel(&c.address()).is_some());
        assert_eq!(c.inner.auth.read().unwrap().server_key, s.public_key());
    }

    #[tokio::test]
    async fn test_incorrect_server_key() {
        let net = MemoryNetwork::new();
        let _s = server(&net);
        let t = net.bind("10.0.0.2:7050".parse().unwrap());
        let c = Teonet::new(test_config(), t, vec![]).unwrap();
        c.inner.auth.write().unwrap().server_key = vec![9; 32];

        assert!(matches!(c.connect(&[SERVER]).await, Err(Error::IncorrectServerKey)));
        assert!(!c.is_connected());

        // the stale key is forgotten, the next attempt learns the right one
        c.connect(&[SERVER]).await.unwrap();
        assert!(c.is_connected());
    }

    #[tokio::test]
    async fn test_incorrect_public_key() {
        let net = MemoryNetwork::new();
        let fake = net.bind(SERVER.parse().unwrap());
        fake.set_receiver(Arc::new(WrongKeyServer(fake.clone())));

        let c = Teonet::new(test_config(), net.bind("10.0.0.2:7050".parse().unwrap()), vec![]).unwrap();
        assert!(matches!(c.connect(&[SERVER]).await, Err(Error::IncorrectPublicKey)));
        assert!(!c.is_connected());
        assert_eq!(c.address(), "");
        assert!(c.inner.auth.read().unwrap().server_key.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_connect() {
        let net = MemoryNetwork::new();
        let s = server(&net);
        let c = Teonet::new(test_config(), net.bind("10.0.0.2:7050".parse().unwrap()), vec![]).unwrap();

        let started = std::time::Instant::now();
        let (r1, r2) = tokio::join!(c.connect(&[SERVER]), c.connect(&[SERVER]));
        r1.unwrap();
        r2.unwrap();
        assert!(started.elapsed() < test_config().connect_timeout);
        assert!(c.is_connected());
        assert!(s.channel(&c.address()).is_some());
    }

    #[tokio::test]
    async fn test_handshake_timeout() {
        let net = MemoryNetwork::new();
        let _s = server(&net);
        net.set_drop_filter(|_, _, kind, _| kind == Kind::Data);

        let t = net.bind("10.0.0.2:7050".parse().unwrap());
        let config = Config {
            connect_timeout: Duration::from_millis(200),
            ..test_config()
        };
        let c = Teonet::new(config, t, vec![]).unwrap();
        assert!(matches!(c.connect(&[SERVER]).await, Err(Error::Timeout)));
        assert!(matches!(c.connect::<&str>(&[]).await, Err(Error::NoAuthServer)));
    }

    #[tokio::test]
    async fn test_close_fails_handshake() {
        let net = MemoryNetwork::new();
        let _s = server(&net);
        net.set_drop_filter(|_, _, kind, _| kind == Kind::Data);

        let c = Teonet::new(test_config(), net.bind("10.0.0.2:7050".parse().unwrap()), vec![]).unwrap();
        let node = c.clone();
        let handshake = tokio::spawn(async move { node.connect(&[SERVER]).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        c.close();

        let r = tokio::time::timeout(Duration::from_millis(500), handshake)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(r, Err(Error::Closed)));
    }

    #[tokio::test]
    async fn test_reconnect_after_server_restart() {
        let net = MemoryNetwork::new();
        let secret = Some([3u8; 32]);
        let s = Teonet::new(
            Config {
                rendezvous_server: true,
                secret_key: secret,
                ..test_config()
            },
            net.bind(SERVER.parse().unwrap()),
            vec![],
        )
        .unwrap();

        let (reader, mut rx) = recorder();
        let (c, _) = client(&net, "10.0.0.2:7050", vec![reader]).await;
        let address = c.address();
        next_event(&mut rx, EventKind::RendezvousConnected).await;

        // the server drops its side of the channel
        s.close_to(&address).unwrap();
        next_event(&mut rx, EventKind::RendezvousDisconnected).await;
        next_event(&mut rx, EventKind::RendezvousConnected).await;
        assert!(c.is_connected());
        assert_eq!(c.address(), address);
    }
}
