//! Udp hole punching.
//!
//! A punch datagram is the bare correlation id. Sending one to each
//! candidate address of the remote peer opens our NAT/firewall for its
//! traffic; receiving one tells us an address the peer is reachable at.

use crate::transport::Transport;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::sleep;

const PUNCH_ATTEMPTS: u32 = 5;
const PUNCH_STEP: Duration = Duration::from_millis(30);

pub(crate) struct Puncher {
    transport: Arc<dyn Transport>,
    waiters: RwLock<HashMap<String, oneshot::Sender<SocketAddr>>>,
}

impl Puncher {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            waiters: Default::default(),
        }
    }

    /// Wait for a punch carrying `id`. `None` if someone already waits for it.
    pub fn subscribe(&self, id: &str) -> Option<oneshot::Receiver<SocketAddr>> {
        let mut waiters = self.waiters.write().unwrap();
        if waiters.contains_key(id) {
            return None;
        }
        let (tx, rx) = oneshot::channel();
        waiters.insert(id.to_string(), tx);
        Some(rx)
    }

    pub fn unsubscribe(&self, id: &str) {
        self.waiters.write().unwrap().remove(id);
    }

    /// Receive path for raw datagrams. Returns true if a waiter took it.
    pub fn received(&self, from: SocketAddr, data: &[u8]) -> bool {
        let id = match std::str::from_utf8(data) {
            Ok(id) => id,
            Err(_) => {
                log::trace!("non punch datagram from {}", from);
                return false;
            }
        };

        // removing under the lock makes delivery at most once
        let waiter = self.waiters.write().unwrap().remove(id);
        match waiter {
            Some(tx) => {
                log::debug!("punch {} resolved {}", id, from);
                if tx.send(from).is_err() {
                    log::debug!("punch {} waiter gone", id);
                }
                true
            }
            None => {
                log::trace!("punch {} from {} has no waiter", id, from);
                false
            }
        }
    }

    /// Send one punch to every candidate. Returns false if `stop` fired.
    pub fn send(&self, id: &str, candidates: &[SocketAddr], stop: &dyn Fn() -> bool) -> bool {
        for addr in candidates {
            if stop() {
                return false;
            }
            if let Err(e) = self.transport.send_raw(*addr, id.as_bytes()) {
                log::trace!("punch {} to {}: {}", id, addr, e);
            }
        }
        true
    }

    /// Punch in bursts with growing pauses. Returns true if `stop` fired.
    pub async fn punch<F>(&self, id: &str, candidates: &[SocketAddr], stop: F, delay: Duration) -> bool
    where
        F: Fn() -> bool,
    {
        if !delay.is_zero() {
            sleep(delay).await;
        }

        for attempt in 0..PUNCH_ATTEMPTS {
            if !self.send(id, candidates, &stop) {
                return true;
            }
            sleep(PUNCH_STEP * (attempt + 1)).await;
        }

        stop()
    }
}

/// Punch targets: local candidates first, then the externally observed
/// address, without duplicates.
pub(crate) fn candidates(local_ips: &[String], local_port: u32, ip: &str, port: u32) -> Vec<SocketAddr> {
    let mut addrs: Vec<SocketAddr> = vec![];
    let mut push = |ip: &str, port: u32| {
        let port = match u16::try_from(port) {
            Ok(p) if p != 0 => p,
            _ => return,
        };
        match ip.parse::<IpAddr>() {
            Ok(ip) => {
                let addr = SocketAddr::new(ip, port);
                if !addrs.contains(&addr) {
                    addrs.push(addr);
                }
            }
            Err(_) => log::trace!("skip invalid candidate {}", ip),
        }
    };

    for ip in local_ips {
        push(ip, local_port);
    }
    push(ip, port);

    addrs
}

/// Local ip candidates offered to the remote peer.
pub(crate) fn local_ips(bound: SocketAddr, discover: bool) -> Vec<String> {
    let mut ips: Vec<IpAddr> = vec![];
    if !bound.ip().is_unspecified() {
        ips.push(bound.ip());
    }

    if discover {
        match nix::ifaddrs::getifaddrs() {
            Ok(addrs) => {
                for ifa in addrs {
                    let addr = match ifa.address {
                        Some(addr) => addr,
                        None => continue,
                    };
                    let ip = if let Some(sin) = addr.as_sockaddr_in() {
                        IpAddr::V4(sin.ip())
                    } else if let Some(sin6) = addr.as_sockaddr_in6() {
                        IpAddr::V6(sin6.ip())
                    } else {
                        continue;
                    };
                    if usable(&ip, &bound) && !ips.contains(&ip) {
                        ips.push(ip);
                    }
                }
            }
            Err(e) => log::warn!("list interfaces: {}", e),
        }
    }

    ips.iter().map(|ip| ip.to_string()).collect()
}

fn usable(ip: &IpAddr, bound: &SocketAddr) -> bool {
    if ip.is_loopback() || ip.is_unspecified() || ip.is_ipv4() != bound.is_ipv4() {
        return false;
    }
    match ip {
        IpAddr::V6(v6) => v6.segments()[0] & 0xffc0 != 0xfe80,
        IpAddr::V4(_) => true,
    }
}
