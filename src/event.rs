use crate::channel::Channel;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// Node created; delivered once to readers.
    Init,
    RendezvousConnected,
    RendezvousDisconnected,
    PeerConnected,
    PeerDisconnected,
    Data,
}

/// Tag attached to every dispatched packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub kind: EventKind,
    pub err: Option<String>,
}

impl Event {
    pub fn new(kind: EventKind) -> Self {
        Self { kind, err: None }
    }

    pub fn with_err(kind: EventKind, err: impl ToString) -> Self {
        Self {
            kind,
            err: Some(err.to_string()),
        }
    }

    pub fn is_data(&self) -> bool {
        self.kind == EventKind::Data
    }
}

/// Inbound packet: payload and the address of the channel it arrived on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Packet {
    from: String,
    data: Vec<u8>,
}

impl Packet {
    pub fn new(from: String, data: Vec<u8>) -> Self {
        Self { from, data }
    }

    pub fn from_addr(&self) -> &str {
        &self.from
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    /// Leading command byte.
    pub fn command(&self) -> Option<u8> {
        self.data.first().copied()
    }

    /// Trailing little endian packet id.
    pub fn id(&self) -> Option<u32> {
        trailing_id(&self.data)
    }
}

pub(crate) fn trailing_id(data: &[u8]) -> Option<u32> {
    let n = data.len();
    if n < 4 {
        return None;
    }
    let b = &data[n - 4..];
    Some(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

/// Packet handler. Returns true when it handled the packet.
pub type Handler = Arc<dyn Fn(&Arc<Channel>, &Packet, &Event) -> bool + Send + Sync>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_fields() {
        let mut data = vec![7u8, b'h', b'i'];
        data.extend_from_slice(&42u32.to_le_bytes());
        let p = Packet::new("peer".into(), data);
        assert_eq!(p.command(), Some(7));
        assert_eq!(p.id(), Some(42));
        assert_eq!(p.from_addr(), "peer");

        let short = Packet::new("peer".into(), vec![1, 2]);
        assert_eq!(short.id(), None);
        assert_eq!(Packet::default().command(), None);
    }
}
