use crate::transport::{Handle, Transport};
use crate::wire::Frame;
use std::collections::HashMap;
use std::fmt;
use std::io::Result;
use std::sync::{
    atomic::{AtomicBool, Ordering::SeqCst},
    Arc, RwLock,
};

const NEW_PREFIX: &str = "new-";

/// A peer endpoint: one transport handle and the address it is known by.
pub struct Channel {
    address: RwLock<String>,
    handle: Handle,
    closing: AtomicBool,
    transport: Arc<dyn Transport>,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("address", &self.address())
            .field("handle", &self.handle)
            .field("closing", &self.is_closing())
            .finish()
    }
}

impl Channel {
    pub(crate) fn new(address: String, handle: Handle, transport: Arc<dyn Transport>) -> Arc<Self> {
        Arc::new(Self {
            address: RwLock::new(address),
            handle,
            closing: AtomicBool::new(false),
            transport,
        })
    }

    /// Channel for a handle nobody has introduced yet.
    pub(crate) fn provisional(handle: Handle, transport: Arc<dyn Transport>) -> Arc<Self> {
        Self::new(format!("{}{}", NEW_PREFIX, handle), handle, transport)
    }

    pub fn address(&self) -> String {
        self.address.read().unwrap().clone()
    }

    pub(crate) fn set_address(&self, address: &str) {
        *self.address.write().unwrap() = address.to_string();
    }

    /// True until a handshake promoted the channel to a stable address.
    pub fn is_provisional(&self) -> bool {
        self.address.read().unwrap().starts_with(NEW_PREFIX)
    }

    pub fn handle(&self) -> Handle {
        self.handle
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(SeqCst)
    }

    pub(crate) fn set_closing(&self) {
        self.closing.store(true, SeqCst);
    }

    /// Write a packet to the remote side.
    pub fn send(&self, data: &[u8]) -> Result<()> {
        self.transport.write(self.handle, data)
    }

    /// Marshal and write a control frame.
    pub(crate) fn send_frame(&self, frame: &Frame) -> crate::Result<()> {
        self.send(&frame.marshal()?)?;
        Ok(())
    }

    pub(crate) fn close(&self) {
        self.transport.close(self.handle);
    }
}

#[derive(Default)]
struct Maps {
    by_address: HashMap<String, Arc<Channel>>,
    by_handle: HashMap<Handle, Arc<Channel>>,
}

/// Live channels indexed by address and by transport handle.
#[derive(Default)]
pub(crate) struct Channels {
    maps: RwLock<Maps>,
}

impl Channels {
    /// Register `channel` under its current address. Any other channel known
    /// by that address is evicted and its transport handle closed if it is a
    /// different one.
    pub fn add(&self, channel: Arc<Channel>) {
        let address = channel.address();
        let handle = channel.handle();

        let evicted = {
            let mut maps = self.maps.write().unwrap();

            // drop index entries of this handle under a previous address
            maps.by_address
                .retain(|a, c| c.handle() != handle || *a == address);

            let evicted = maps.by_address.insert(address.clone(), channel.clone());
            if let Some(old) = &evicted {
                if old.handle() != handle {
                    maps.by_handle.remove(&old.handle());
                }
            }
            maps.by_handle.insert(handle, channel.clone());

            evicted
        };

        if let Some(old) = evicted {
            if old.handle() != handle {
                log::debug!("channel {} replaced, close {}", address, old.handle());
                old.set_closing();
                old.close();
            }
        }
    }

    pub fn get_by_address(&self, address: &str) -> Option<Arc<Channel>> {
        self.maps.read().unwrap().by_address.get(address).cloned()
    }

    pub fn get_by_handle(&self, handle: &Handle) -> Option<Arc<Channel>> {
        self.maps.read().unwrap().by_handle.get(handle).cloned()
    }

    /// Remove entries that still refer to this channel instance.
    pub fn remove(&self, channel: &Arc<Channel>) -> bool {
        let mut maps = self.maps.write().unwrap();
        let before = maps.by_handle.len() + maps.by_address.len();
        maps.by_address.retain(|_, c| !Arc::ptr_eq(c, channel));
        maps.by_handle.retain(|_, c| !Arc::ptr_eq(c, channel));
        before != maps.by_handle.len() + maps.by_address.len()
    }

    pub fn all(&self) -> Vec<Arc<Channel>> {
        self.maps.read().unwrap().by_handle.values().cloned().collect()
    }
}
