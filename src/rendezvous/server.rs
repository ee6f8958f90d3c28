use crate::channel::Channel;
use crate::error::Error;
use crate::event::{Event, EventKind, Packet};
use crate::identity::address_from_key;
use crate::teonet::Teonet;
use crate::wire::{ConnectData, ConnectToData, Frame};
use std::sync::Arc;

impl Teonet {
    fn send_frame(channel: &Arc<Channel>, frame: Frame) {
        if let Err(e) = channel.send_frame(&frame) {
            log::warn!("send to {}: {}", channel.address(), e);
        }
    }

    /// Answer a client handshake and register the client under its address.
    pub(crate) fn serve_connect(&self, channel: &Arc<Channel>, req: ConnectData) {
        let own_key = self.public_key();
        let mut reply = req;

        if reply.server_key.is_empty() {
            reply.server_key = own_key;
        } else if reply.server_key != own_key {
            log::debug!("client {} presented a foreign server key", channel.handle());
            reply.err = Error::IncorrectServerKey.to_string().into_bytes();
            Self::send_frame(channel, Frame::Connect(reply));
            return;
        }

        if reply.public_key.is_empty() {
            reply.err = b"empty public key".to_vec();
            Self::send_frame(channel, Frame::Connect(reply));
            return;
        }

        if reply.address.is_empty() {
            reply.address = address_from_key(&reply.public_key).into_bytes();
        }
        let address = match String::from_utf8(reply.address.clone()) {
            Ok(a) => a,
            Err(_) => {
                log::debug!("client {} sent an invalid address", channel.handle());
                return;
            }
        };
        reply.server_address = self.address().into_bytes();
        reply.err.clear();

        channel.set_address(&address);
        self.inner.channels.add(channel.clone());
        Self::send_frame(channel, Frame::Connect(reply));

        log::info!("client {} connected from {}", address, channel.handle());
        self.dispatch(channel, Packet::default(), Event::new(EventKind::PeerConnected));
    }

    /// Observed external address of a channel, as carried in `ConnectToData`.
    fn observed(channel: &Arc<Channel>, data: &mut ConnectToData) {
        let handle = channel.handle();
        data.ip = handle.ip().to_string();
        data.port = handle.port() as u32;
    }

    /// Forward a client's connect request to the target peer, or tell the
    /// client the peer is not here.
    pub(crate) fn relay_connect_to(&self, channel: &Arc<Channel>, req: ConnectToData) {
        if channel.is_provisional() {
            log::debug!("connect-to from unregistered {}", channel.handle());
            return;
        }

        let mut data = req;
        data.from_addr = channel.address();
        data.err.clear();
        Self::observed(channel, &mut data);

        match self.channel(&data.to_addr) {
            Some(peer) if !Arc::ptr_eq(&peer, channel) => {
                log::debug!(
                    "connect-to {} {} -> {}{}",
                    data.id,
                    data.from_addr,
                    data.to_addr,
                    if data.resend { " (resend)" } else { "" }
                );
                Self::send_frame(&peer, Frame::ConnectToPeer(data));
            }
            _ => {
                log::debug!("connect-to {}: peer {} not found", data.id, data.to_addr);
                data.err = Error::NotConnected(data.to_addr.clone())
                    .to_string()
                    .into_bytes();
                Self::send_frame(channel, Frame::ConnectToAnswer(data));
            }
        }
    }

    /// Relay the target peer's answer back to the requesting client.
    pub(crate) fn relay_peer_answer(&self, channel: &Arc<Channel>, answer: ConnectToData) {
        if channel.is_provisional() {
            log::debug!("connect-to answer from unregistered {}", channel.handle());
            return;
        }

        let mut data = answer;
        data.from_addr = channel.address();
        Self::observed(channel, &mut data);

        match self.channel(&data.to_addr) {
            Some(client) => {
                log::debug!("connect-to answer {} {} -> {}", data.id, data.from_addr, data.to_addr);
                Self::send_frame(&client, Frame::ConnectToAnswer(data));
            }
            None => log::debug!("connect-to answer {}: client {} gone", data.id, data.to_addr),
        }
    }
}
