//! Wire formats of the handshake payloads and the control frames carried on
//! channels.
//!
//! All integers are little endian, strings and byte slices carry a 16 bit
//! length prefix.

use crate::error::{Error, Result};

/// Rendezvous handshake payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectData {
    pub public_key: Vec<u8>,
    pub address: Vec<u8>,
    pub server_key: Vec<u8>,
    pub server_address: Vec<u8>,
    pub err: Vec<u8>,
}

/// Peer connect signaling payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectToData {
    /// Correlation id shared by every leg of one connection attempt.
    pub id: String,
    pub from_addr: String,
    pub to_addr: String,
    /// External ip observed by the rendezvous server.
    pub ip: String,
    pub port: u32,
    pub local_ips: Vec<String>,
    pub local_port: u32,
    pub err: Vec<u8>,
    pub resend: bool,
}

impl ConnectData {
    pub fn marshal(&self) -> Result<Vec<u8>> {
        let mut w = Writer::default();
        w.bytes(&self.public_key)?;
        w.bytes(&self.address)?;
        w.bytes(&self.server_key)?;
        w.bytes(&self.server_address)?;
        w.bytes(&self.err)?;
        Ok(w.0)
    }

    pub fn unmarshal(data: &[u8]) -> Result<Self> {
        let mut r = Reader(data);
        let d = Self {
            public_key: r.bytes()?.to_vec(),
            address: r.bytes()?.to_vec(),
            server_key: r.bytes()?.to_vec(),
            server_address: r.bytes()?.to_vec(),
            err: r.bytes()?.to_vec(),
        };
        r.finish()?;
        Ok(d)
    }
}

impl ConnectToData {
    pub fn marshal(&self) -> Result<Vec<u8>> {
        let mut w = Writer::default();
        w.bytes(self.id.as_bytes())?;
        w.bytes(self.from_addr.as_bytes())?;
        w.bytes(self.to_addr.as_bytes())?;
        w.bytes(self.ip.as_bytes())?;
        w.u32(self.port);
        w.len(self.local_ips.len())?;
        for ip in &self.local_ips {
            w.bytes(ip.as_bytes())?;
        }
        w.u32(self.local_port);
        w.bytes(&self.err)?;
        w.0.push(self.resend as u8);
        Ok(w.0)
    }

    pub fn unmarshal(data: &[u8]) -> Result<Self> {
        let mut r = Reader(data);
        let id = r.string()?;
        let from_addr = r.string()?;
        let to_addr = r.string()?;
        let ip = r.string()?;
        let port = r.u32()?;
        let n = r.u16()?;
        let mut local_ips = Vec::with_capacity(n as usize);
        for _ in 0..n {
            local_ips.push(r.string()?);
        }
        let local_port = r.u32()?;
        let err = r.bytes()?.to_vec();
        let resend = match r.take(1)?[0] {
            0 => false,
            1 => true,
            _ => return Err(Error::Malformed("invalid resend flag")),
        };
        r.finish()?;

        Ok(Self {
            id,
            from_addr,
            to_addr,
            ip,
            port,
            local_ips,
            local_port,
            err,
            resend,
        })
    }

    /// Error string carried by the payload, if any.
    pub fn error(&self) -> Option<String> {
        if self.err.is_empty() {
            None
        } else {
            Some(String::from_utf8_lossy(&self.err).into_owned())
        }
    }
}

#[derive(Default)]
struct Writer(Vec<u8>);

impl Writer {
    fn u16(&mut self, v: u16) {
        self.0.extend_from_slice(&v.to_le_bytes());
    }

    fn u32(&mut self, v: u32) {
        self.0.extend_from_slice(&v.to_le_bytes());
    }

    /// 16 bit length prefix; longer fields do not fit the format.
    fn len(&mut self, n: usize) -> Result<()> {
        let n = u16::try_from(n).map_err(|_| Error::Malformed("field longer than 65535"))?;
        self.u16(n);
        Ok(())
    }

    fn bytes(&mut self, b: &[u8]) -> Result<()> {
        self.len(b.len())?;
        self.0.extend_from_slice(b);
        Ok(())
    }
}

struct Reader<'a>(&'a [u8]);

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.0.len() < n {
            return Err(Error::Malformed("unexpected end of data"));
        }
        let (head, tail) = self.0.split_at(n);
        self.0 = tail;
        Ok(head)
    }

    fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn bytes(&mut self) -> Result<&'a [u8]> {
        let n = self.u16()? as usize;
        self.take(n)
    }

    fn string(&mut self) -> Result<String> {
        String::from_utf8(self.bytes()?.to_vec()).map_err(|_| Error::Malformed("invalid utf-8"))
    }

    fn finish(&self) -> Result<()> {
        if self.0.is_empty() {
            Ok(())
        } else {
            Err(Error::Malformed("trailing data"))
        }
    }
}

const CONNECT: &[u8] = b"teonet/connect:";
const CONNECT_TO: &[u8] = b"teonet/connect-to:";
const CONNECT_TO_PEER: &[u8] = b"teonet/connect-to-peer:";
const CONNECT_TO_PEER_ANSWER: &[u8] = b"teonet/connect-to-peer-answer:";
const CONNECT_TO_ANSWER: &[u8] = b"teonet/connect-to-answer:";
const NEW_CONNECTION: &[u8] = b"teonet/new-connection:";

/// Control frames exchanged on channels. Each is an ascii marker followed by
/// the marshaled payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Frame {
    /// Rendezvous handshake request and reply.
    Connect(ConnectData),
    /// Client asks the rendezvous server to introduce it to a peer.
    ConnectTo(ConnectToData),
    /// Rendezvous server forwards the request to the peer.
    ConnectToPeer(ConnectToData),
    /// Peer answers the forwarded request.
    ConnectToPeerAnswer(ConnectToData),
    /// Rendezvous server relays the peer answer back to the client.
    ConnectToAnswer(ConnectToData),
    /// Direct handshake between the two peers once a route is open.
    NewConnection(ConnectToData),
}

impl Frame {
    fn marker(&self) -> &'static [u8] {
        match self {
            Frame::Connect(_) => CONNECT,
            Frame::ConnectTo(_) => CONNECT_TO,
            Frame::ConnectToPeer(_) => CONNECT_TO_PEER,
            Frame::ConnectToPeerAnswer(_) => CONNECT_TO_PEER_ANSWER,
            Frame::ConnectToAnswer(_) => CONNECT_TO_ANSWER,
            Frame::NewConnection(_) => NEW_CONNECTION,
        }
    }

    pub fn marshal(&self) -> Result<Vec<u8>> {
        let payload = match self {
            Frame::Connect(d) => d.marshal()?,
            Frame::ConnectTo(d)
            | Frame::ConnectToPeer(d)
            | Frame::ConnectToPeerAnswer(d)
            | Frame::ConnectToAnswer(d)
            | Frame::NewConnection(d) => d.marshal()?,
        };

        let marker = self.marker();
        let mut buf = Vec::with_capacity(marker.len() + payload.len());
        buf.extend_from_slice(marker);
        buf.extend_from_slice(&payload);
        Ok(buf)
    }

    /// `None` if the packet carries no control marker; otherwise the decoded
    /// frame or the decode error.
    pub fn parse(data: &[u8]) -> Option<Result<Frame>> {
        if let Some(payload) = data.strip_prefix(CONNECT) {
            return Some(ConnectData::unmarshal(payload).map(Frame::Connect));
        }

        let markers: [(&[u8], fn(ConnectToData) -> Frame); 5] = [
            (CONNECT_TO, Frame::ConnectTo),
            (CONNECT_TO_PEER, Frame::ConnectToPeer),
            (CONNECT_TO_PEER_ANSWER, Frame::ConnectToPeerAnswer),
            (CONNECT_TO_ANSWER, Frame::ConnectToAnswer),
            (NEW_CONNECTION, Frame::NewConnection),
        ];
        markers.iter().find_map(|(marker, build)| {
            data.strip_prefix(*marker)
                .map(|payload| ConnectToData::unmarshal(payload).map(build))
        })
    }
}
