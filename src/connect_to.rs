//! Peer connect.
//!
//! ```text
//! client                 rendezvous               peer
//!   | connect-to             |                      |
//!   |----------------------->| connect-to-peer      |
//!   |                        |--------------------->|
//!   |                        | connect-to-peer-answer
//!   |    connect-to-answer   |<---------------------|
//!   |<-----------------------|                      |
//!   |<============ punch (correlation id) =========>|
//!   | new-connection ------------------------------>|
//!   |<------------------------------ new-connection |
//! ```
//!
//! Both sides punch and both listen for punches. Only the client sends
//! new-connection, to the first address a punch arrived from; the peer
//! answers a punch it receives with one more punch so the client learns a
//! working address even when only its own punches got through.

use crate::channel::Channel;
use crate::error::{Error, Result};
use crate::event::{Event, EventKind, Handler, Packet};
use crate::pending::{Completion, PendingRequest};
use crate::puncher::candidates;
use crate::teonet::Teonet;
use crate::wire::{ConnectToData, Frame};
use rand::{distributions::Alphanumeric, Rng};
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::{sync::oneshot, task::spawn, time::sleep, time::timeout};

const ID_LEN: usize = 32;

/// Fresh correlation id.
pub(crate) fn new_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(ID_LEN)
        .map(char::from)
        .collect()
}

impl Teonet {
    /// Open a direct channel to the peer at `address` through the rendezvous
    /// server. Returns at once if the peer is already connected.
    ///
    /// `readers` are subscribed to the new channel. If the peer disconnects
    /// later the connection is re-established in the background, unless
    /// [`reconnect_off`](Teonet::reconnect_off) was called for it.
    pub async fn connect_to(&self, address: &str, readers: Vec<Handler>) -> Result<()> {
        if self.auth_channel().is_none() {
            return Err(Error::NotConnectedToTeonet);
        }
        if self.channel(address).is_some() {
            return Ok(());
        }

        let channel = self.open_channel(address).await?;
        self.attach(&channel, readers);
        Ok(())
    }

    /// Run the connect protocol. A peer that is already connected, for
    /// example because it reconnected to us first, is returned as is.
    async fn open_channel(&self, address: &str) -> Result<Arc<Channel>> {
        let auth = self.auth_channel().ok_or(Error::NotConnectedToTeonet)?;
        if let Some(channel) = self.channel(address) {
            return Ok(channel);
        }

        let (local_ips, local_port) = self.local_candidates();
        let data = ConnectToData {
            id: new_id(),
            from_addr: self.address(),
            to_addr: address.to_string(),
            local_ips,
            local_port,
            ..Default::default()
        };
        let id = data.id.clone();
        log::debug!("connect-to {} {}", id, address);

        let (tx, mut rx) = oneshot::channel();
        let req = PendingRequest::new(data.clone(), Some(tx));
        self.inner.requests.add(req.clone());
        if let Some(waiter) = self.inner.puncher.subscribe(&id) {
            self.spawn_new_connection(req.clone(), waiter);
        }

        if let Err(e) = auth.send_frame(&Frame::ConnectTo(data)) {
            req.finish();
            self.forget_request(&id);
            return Err(e);
        }

        let result: Completion = match timeout(self.inner.config.connect_timeout, &mut rx).await {
            Ok(Ok(result)) => result,
            // finished without an outcome, the sweeper got it first
            Ok(Err(_)) => {
                self.forget_request(&id);
                return Err(Error::Timeout);
            }
            Err(_) => {
                if req.finish() {
                    log::debug!("connect-to {} {}: timeout", id, address);
                    self.forget_request(&id);
                    return Err(Error::Timeout);
                }
                // a completion won the flag; it sends or drops the sender next
                match rx.await {
                    Ok(result) => result,
                    Err(_) => {
                        self.forget_request(&id);
                        return Err(Error::Timeout);
                    }
                }
            }
        };
        self.forget_request(&id);

        if let Some(err) = result {
            log::debug!("connect-to {} {}: {}", id, address, err);
            return Err(Error::from_remote(&err));
        }

        self.channel(address)
            .ok_or_else(|| Error::NotConnected(address.to_string()))
    }

    /// Subscribe `readers` to the channel and watch it for reconnects.
    fn attach(&self, channel: &Arc<Channel>, readers: Vec<Handler>) {
        for reader in &readers {
            self.inner
                .subscribers
                .subscribe(channel.clone(), reader.clone(), false);
        }
        self.watch_reconnect(channel, readers);
    }

    fn forget_request(&self, id: &str) {
        self.inner.requests.del(id);
        self.inner.puncher.unsubscribe(id);
    }

    /// Client side: once a punch tells us where the peer is, send it the
    /// direct handshake until the request finishes.
    fn spawn_new_connection(&self, req: Arc<PendingRequest>, waiter: oneshot::Receiver<SocketAddr>) {
        let node = self.clone();

        spawn(async move {
            let addr = match waiter.await {
                Ok(addr) => addr,
                Err(_) => return,
            };
            if req.is_finished() {
                return;
            }

            let transport = node.inner.transport.clone();
            let handle = match transport.dial(addr) {
                Ok(h) => h,
                Err(e) => {
                    log::warn!("dial {}: {}", addr, e);
                    return;
                }
            };

            let frame = match Frame::NewConnection(ConnectToData {
                id: req.id().to_string(),
                ..Default::default()
            })
            .marshal()
            {
                Ok(f) => f,
                Err(e) => {
                    log::warn!("new-connection {}: {}", req.id(), e);
                    return;
                }
            };

            let interval = node.inner.config.new_connection_interval;
            for _ in 0..node.inner.config.new_connection_retries {
                if req.is_finished() || node.inner.closing.is_closed() {
                    break;
                }
                log::debug!("new-connection {} to {}", req.id(), addr);
                if let Err(e) = transport.write(handle, &frame) {
                    log::debug!("new-connection {}: {}", req.id(), e);
                }
                sleep(interval).await;
            }
        });
    }

    /// Client side: the rendezvous server relayed the peer's answer.
    pub(crate) fn on_connect_to_answer(&self, answer: ConnectToData) {
        let req = match self.inner.requests.get(&answer.id) {
            Some(req) => req,
            None => {
                log::debug!("connect-to answer {}: no pending request", answer.id);
                return;
            }
        };
        if req.is_finished() {
            return;
        }

        if let Some(err) = answer.error() {
            req.complete(Some(err));
            return;
        }

        let targets = candidates(&answer.local_ips, answer.local_port, &answer.ip, answer.port);
        log::debug!("connect-to {}: punch {:?}", answer.id, targets);

        let node = self.clone();
        spawn(async move {
            let stop = {
                let req = req.clone();
                move || req.is_finished()
            };
            let stopped = node
                .inner
                .puncher
                .punch(req.id(), &targets, stop, Duration::ZERO)
                .await;

            if stopped || node.inner.closing.is_closed() || !req.mark_resent() {
                return;
            }

            // no luck yet, ask the peer to punch once more
            let mut data = req.data.clone();
            data.resend = true;
            if let Some(auth) = node.auth_channel() {
                log::debug!("connect-to {}: resend", data.id);
                if let Err(e) = auth.send_frame(&Frame::ConnectTo(data)) {
                    log::warn!("connect-to {} resend: {}", req.id(), e);
                }
            }
        });
    }

    /// Peer side: the rendezvous server forwarded a connect request to us.
    pub(crate) fn on_connect_to_peer(&self, req: ConnectToData) {
        let auth = match self.auth_channel() {
            Some(a) => a,
            None => return,
        };

        let own = self.address();
        let (local_ips, local_port) = self.local_candidates();
        let mut answer = ConnectToData {
            id: req.id.clone(),
            from_addr: own.clone(),
            to_addr: req.from_addr.clone(),
            local_ips,
            local_port,
            resend: req.resend,
            ..Default::default()
        };

        if req.to_addr != own {
            answer.err = format!("wrong destination {}", req.to_addr).into_bytes();
            let _ = auth.send_frame(&Frame::ConnectToPeerAnswer(answer));
            return;
        }

        let pending = match self.inner.requests.get(&req.id) {
            Some(p) => p,
            None => {
                let p = PendingRequest::new(req.clone(), None);
                self.inner.requests.add(p.clone());
                p
            }
        };
        if pending.is_finished() {
            log::debug!("connect-to-peer {}: already connected", req.id);
            return;
        }

        let waiter = self.inner.puncher.subscribe(&req.id);
        log::debug!("connect-to-peer {} from {}", req.id, req.from_addr);
        if let Err(e) = auth.send_frame(&Frame::ConnectToPeerAnswer(answer)) {
            log::warn!("connect-to-peer {} answer: {}", req.id, e);
        }

        let node = self.clone();
        let targets = candidates(&req.local_ips, req.local_port, &req.ip, req.port);
        spawn(async move {
            if let Some(waiter) = waiter {
                let node = node.clone();
                let pending = pending.clone();
                spawn(async move {
                    // a punch reached us: answer it so the client learns the route
                    if let Ok(addr) = waiter.await {
                        if !pending.is_finished() {
                            let _ = node.inner.transport.send_raw(addr, pending.id().as_bytes());
                        }
                    }
                });
            }

            let stop = {
                let pending = pending.clone();
                move || pending.is_finished()
            };
            let delay = node.inner.config.punch_delay;
            node.inner.puncher.punch(pending.id(), &targets, stop, delay).await;
            // stop holding the waiter once punching is over and nothing came
            if !pending.is_finished() {
                node.inner.puncher.unsubscribe(pending.id());
            }
        });
    }

    /// Direct handshake, both roles. The client gets it as the echo of its
    /// own packet; the peer answers with the echo.
    pub(crate) fn on_new_connection(&self, channel: &Arc<Channel>, data: ConnectToData) {
        let req = match self.inner.requests.get(&data.id) {
            Some(req) => req,
            None => {
                log::debug!("new-connection {}: no pending request", data.id);
                return;
            }
        };

        if req.data.from_addr == self.address() {
            if req.is_finished() {
                return;
            }
            let target = req.data.to_addr.clone();
            channel.set_address(&target);
            self.inner.channels.add(channel.clone());
            if req.complete(None) {
                log::info!("connected to peer {}", target);
                self.dispatch(channel, Packet::default(), Event::new(EventKind::PeerConnected));
            }
            return;
        }

        // responder: the record stays until swept so repeats get an echo
        let peer = req.data.from_addr.clone();
        if channel.address() != peer {
            channel.set_address(&peer);
            self.inner.channels.add(channel.clone());
        }

        let echo = Frame::NewConnection(ConnectToData {
            id: data.id.clone(),
            ..Default::default()
        });
        if let Err(e) = channel.send_frame(&echo) {
            log::warn!("new-connection {} echo: {}", data.id, e);
        }

        if req.finish() {
            self.inner.puncher.unsubscribe(&data.id);
            log::info!("peer {} connected", peer);
            self.dispatch(channel, Packet::default(), Event::new(EventKind::PeerConnected));
        }
    }

    /// Reconnect when the peer of `channel` disconnects.
    fn watch_reconnect(&self, channel: &Arc<Channel>, readers: Vec<Handler>) {
        let node: Weak<_> = Arc::downgrade(&self.inner);
        let address = channel.address();

        let handler: Handler = Arc::new(move |ch, _, ev| {
            if ev.kind != EventKind::PeerDisconnected {
                return false;
            }
            let node = match node.upgrade() {
                Some(inner) => Teonet { inner },
                None => return true,
            };
            if ch.is_closing() || node.is_closed() || node.is_reconnect_off(&address) {
                log::debug!("peer {} closed, no reconnect", address);
                return true;
            }
            node.spawn_reconnect(address.clone(), readers.clone());
            true
        });

        self.inner.subscribers.subscribe(channel.clone(), handler, true);
    }

    /// Reopen the channel to `address` and attach `readers` and a new
    /// monitor to it, whoever of the two peers reconnects first.
    fn spawn_reconnect(&self, address: String, readers: Vec<Handler>) {
        let node = self.clone();

        spawn(async move {
            let backoff = node.inner.config.reconnect_backoff;
            while node.inner.closing.sleep(backoff).await {
                if node.is_reconnect_off(&address) {
                    break;
                }
                match node.open_channel(&address).await {
                    Ok(channel) => {
                        log::info!("reconnected to peer {}", address);
                        node.attach(&channel, readers);
                        break;
                    }
                    Err(e) => log::debug!("reconnect to peer {}: {}", address, e),
                }
            }
        });
    }
}
