use crate::channel::Channel;
use crate::error::{Error, Result};
use crate::event::{Event, EventKind, Packet};
use crate::teonet::Teonet;
use crate::wire::{ConnectData, Frame};
use std::sync::Arc;
use tokio::{net::lookup_host, sync::oneshot, task::spawn, time::timeout};

impl Teonet {
    /// Connect to a rendezvous server, trying `hints` in order (the
    /// configured servers if empty). On success the node has its network
    /// address; if the server connection drops later it is re-established
    /// in the background.
    pub async fn connect<A: AsRef<str>>(&self, hints: &[A]) -> Result<()> {
        // an application connect may race the reconnect loop
        let _handshake = self.inner.handshake.lock().await;

        let mut servers: Vec<String> = hints.iter().map(|h| h.as_ref().to_string()).collect();
        if servers.is_empty() {
            servers = self.inner.config.auth_servers.clone();
        }

        let mut last = Error::NoAuthServer;
        for server in &servers {
            match self.connect_server(server).await {
                Ok(()) => {
                    self.inner.auth.write().unwrap().hints = servers.clone();
                    return Ok(());
                }
                Err(e) => {
                    log::warn!("rendezvous server {}: {}", server, e);
                    last = e;
                }
            }
        }

        Err(last)
    }

    async fn connect_server(&self, server: &str) -> Result<()> {
        if self.inner.closing.is_closed() {
            return Err(Error::Closed);
        }

        let server_addr = lookup_host(server)
            .await?
            .next()
            .ok_or(Error::NoAuthServer)?;

        let transport = self.inner.transport.clone();
        let handle = transport.dial(server_addr)?;
        let channel = match self.inner.channels.get_by_handle(&handle) {
            Some(c) => c,
            None => {
                let c = Channel::provisional(handle, transport);
                self.inner.channels.add(c.clone());
                c
            }
        };

        match self.handshake(&channel).await {
            Ok(()) => Ok(()),
            Err(e) => {
                if !self.is_auth(&channel) {
                    self.inner.channels.remove(&channel);
                    channel.close();
                }
                Err(e)
            }
        }
    }

    async fn handshake(&self, channel: &Arc<Channel>) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        *self.inner.auth_reply.lock().unwrap() = Some((channel.handle(), tx));

        let req = ConnectData {
            public_key: self.public_key(),
            address: self.address().into_bytes(),
            server_key: self.inner.auth.read().unwrap().server_key.clone(),
            ..Default::default()
        };
        log::debug!("connect to rendezvous server {}", channel.handle());
        channel.send_frame(&Frame::Connect(req))?;

        let reply = match timeout(self.inner.config.connect_timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => return Err(Error::Closed),
            Err(_) => {
                self.inner.auth_reply.lock().unwrap().take();
                return Err(Error::Timeout);
            }
        };

        if !reply.err.is_empty() {
            let err = Error::from_remote(&String::from_utf8_lossy(&reply.err));
            if let Error::IncorrectServerKey = err {
                self.inner.auth.write().unwrap().server_key.clear();
            }
            return Err(err);
        }

        if reply.public_key != self.public_key() {
            return Err(Error::IncorrectPublicKey);
        }

        let address = String::from_utf8(reply.address).map_err(|_| Error::Malformed("address"))?;
        let server_address =
            String::from_utf8(reply.server_address).map_err(|_| Error::Malformed("server address"))?;
        if address.is_empty() || server_address.is_empty() {
            return Err(Error::Malformed("empty address"));
        }

        *self.inner.address.write().unwrap() = address.clone();
        channel.set_address(&server_address);
        self.inner.channels.add(channel.clone());
        {
            let mut auth = self.inner.auth.write().unwrap();
            auth.channel = Some(channel.clone());
            auth.server_key = reply.server_key;
            auth.server_address = server_address.clone();
        }

        log::info!("connected to rendezvous server {} as {}", server_address, address);
        self.dispatch(channel, Packet::default(), Event::new(EventKind::RendezvousConnected));
        Ok(())
    }

    /// Handshake reply, accepted only from the handle we are waiting on.
    pub(crate) fn on_connect_reply(&self, channel: &Arc<Channel>, reply: ConnectData) {
        let tx = {
            let mut slot = self.inner.auth_reply.lock().unwrap();
            match slot.as_ref() {
                Some((handle, _)) if *handle == channel.handle() => slot.take().map(|(_, tx)| tx),
                _ => None,
            }
        };

        match tx {
            Some(tx) => {
                let _ = tx.send(reply);
            }
            None => log::debug!("unexpected handshake reply from {}", channel.handle()),
        }
    }

    /// Rerun the handshake every backoff period until it succeeds.
    pub(crate) fn spawn_auth_reconnect(&self) {
        let node = self.clone();
        let hints = self.inner.auth.read().unwrap().hints.clone();

        spawn(async move {
            let backoff = node.inner.config.reconnect_backoff;
            while node.inner.closing.sleep(backoff).await {
                if node.is_connected() {
                    break;
                }
                match node.connect(&hints).await {
                    Ok(()) => break,
                    Err(e) => log::debug!("reconnect to rendezvous server: {}", e),
                }
            }
        });
    }
}
