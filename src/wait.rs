//! Wait for a correlated answer.

use crate::error::{Error, Result};
use crate::event::{trailing_id, EventKind, Handler};
use crate::teonet::Teonet;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::{sync::oneshot, time::timeout};

/// Options of [`Teonet::wait_from`]. All given conditions must hold.
#[derive(Clone)]
pub enum WaitFilter {
    /// Leading command byte.
    Command(u8),
    /// Trailing little endian packet id, as appended by
    /// [`SendAttr::WithId`](crate::SendAttr::WithId).
    Id(u32),
    /// Custom predicate on the payload.
    Check(Arc<dyn Fn(&[u8]) -> bool + Send + Sync>),
    /// Overrides `Config::wait_timeout`.
    Timeout(Duration),
}

impl fmt::Debug for WaitFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WaitFilter::Command(c) => write!(f, "Command({})", c),
            WaitFilter::Id(id) => write!(f, "Id({})", id),
            WaitFilter::Check(_) => write!(f, "Check(..)"),
            WaitFilter::Timeout(d) => write!(f, "Timeout({:?})", d),
        }
    }
}

#[derive(Default)]
struct Filter {
    command: Option<u8>,
    id: Option<u32>,
    check: Option<Arc<dyn Fn(&[u8]) -> bool + Send + Sync>>,
    timeout: Option<Duration>,
}

impl Filter {
    fn new(filters: &[WaitFilter]) -> Self {
        let mut f = Filter::default();
        for filter in filters {
            match filter {
                WaitFilter::Command(c) => f.command = Some(*c),
                WaitFilter::Id(id) => f.id = Some(*id),
                WaitFilter::Check(check) => f.check = Some(check.clone()),
                WaitFilter::Timeout(d) => f.timeout = Some(*d),
            }
        }
        f
    }

    fn matches(&self, data: &[u8]) -> bool {
        if let Some(cmd) = self.command {
            if data.first() != Some(&cmd) {
                return false;
            }
        }
        if let Some(id) = self.id {
            if trailing_id(data) != Some(id) {
                return false;
            }
        }
        match &self.check {
            Some(check) => check(data),
            None => true,
        }
    }
}

/// One-shot handler passing the first matching packet, or a disconnect, to
/// `tx`. Reports unhandled once nobody listens, so the packet falls through
/// to other handlers.
fn answer_handler(filter: Filter, peer: String, tx: oneshot::Sender<Result<Vec<u8>>>) -> Handler {
    let slot = Mutex::new(Some(tx));

    Arc::new(move |_, p, e| {
        let result = match e.kind {
            EventKind::Data if filter.matches(p.data()) => Ok(p.data().to_vec()),
            EventKind::PeerDisconnected => Err(Error::NotConnected(peer.clone())),
            _ => return false,
        };
        match slot.lock().unwrap().take() {
            Some(tx) => tx.send(result).is_ok(),
            None => false,
        }
    })
}

impl Teonet {
    /// Wait for the next packet from `address` that passes `filters`.
    ///
    /// The answer is taken by a one-shot subscription, so it is not seen by
    /// readers. Fails with [`Error::Timeout`] if nothing matching arrives in
    /// time and with [`Error::NotConnected`] if the peer disconnects first.
    pub async fn wait_from(&self, address: &str, filters: &[WaitFilter]) -> Result<Vec<u8>> {
        let filter = Filter::new(filters);
        let window = filter.timeout.unwrap_or(self.inner.config.wait_timeout);

        let (tx, mut rx) = oneshot::channel();
        let sub = self.subscribe(address, answer_handler(filter, address.to_string(), tx))?;

        match timeout(window, &mut rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::NotConnected(address.to_string())),
            Err(_) => {
                // unsubscribe while rx is alive, then take what slipped in
                self.unsubscribe(&sub);
                match rx.try_recv() {
                    Ok(result) => result,
                    Err(_) => {
                        log::debug!("wait from {}: timeout", address);
                        Err(Error::Timeout)
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Channel;
    use crate::event::{Event, Packet};
    use crate::teonet::tests::{client, server};
    use crate::transport::MemoryNetwork;
    use crate::SendAttr;
    use tokio::time::sleep;

    async fn pair() -> (Arc<MemoryNetwork>, Teonet, Teonet, Teonet) {
        let net = MemoryNetwork::new();
        let s = server(&net);
        let (a, _) = client(&net, "10.0.0.2:7050", vec![]).await;
        let (b, _) = client(&net, "10.0.0.3:7050", vec![]).await;
        a.connect_to(&b.address(), vec![]).await.unwrap();
        (net, s, a, b)
    }

    #[tokio::test]
    async fn test_wait_command() {
        let (_net, _s, a, b) = pair().await;

        let sender = b.clone();
        let to = a.address();
        tokio::spawn(async move {
            sleep(Duration::from_millis(20)).await;
            sender.send_to_with(&to, b"skip", &[SendAttr::Command(1)]).unwrap();
            sender.send_to_with(&to, b"take", &[SendAttr::Command(2)]).unwrap();
        });

        let data = a
            .wait_from(&b.address(), &[WaitFilter::Command(2)])
            .await
            .unwrap();
        assert_eq!(data, b"\x02take");
    }

    #[tokio::test]
    async fn test_wait_id_and_check() {
        let (_net, _s, a, b) = pair().await;

        let sender = b.clone();
        let to = a.address();
        tokio::spawn(async move {
            sleep(Duration::from_millis(20)).await;
            sender.send_to_with(&to, b"one", &[SendAttr::WithId]).unwrap();
            sender.send_to_with(&to, b"two", &[SendAttr::WithId]).unwrap();
            sender.send_to_with(&to, b"two", &[SendAttr::WithId]).unwrap();
        });

        let check: Arc<dyn Fn(&[u8]) -> bool + Send + Sync> = Arc::new(|d| d.starts_with(b"two"));
        let data = a
            .wait_from(&b.address(), &[WaitFilter::Id(3), WaitFilter::Check(check)])
            .await
            .unwrap();
        assert_eq!(&data[..3], b"two");
        assert_eq!(trailing_id(&data), Some(3));
    }

    #[tokio::test]
    async fn test_abandoned_wait_passes_packet_on() {
        let net = MemoryNetwork::new();
        let t = net.bind("10.0.0.1:1".parse().unwrap());
        let channel = Channel::new("peer".into(), "10.0.0.2:1".parse().unwrap(), t);
        let packet = Packet::new("peer".into(), b"\x05late".to_vec());
        let data = Event::new(EventKind::Data);

        let (tx, rx) = oneshot::channel();
        let h = answer_handler(Filter::new(&[WaitFilter::Command(5)]), "peer".into(), tx);
        drop(rx);
        assert!(!h(&channel, &packet, &data));

        let (tx, rx) = oneshot::channel();
        let h = answer_handler(Filter::new(&[WaitFilter::Command(5)]), "peer".into(), tx);
        assert!(!h(&channel, &Packet::new("peer".into(), b"\x06".to_vec()), &data));
        assert!(h(&channel, &packet, &data));
        assert!(!h(&channel, &packet, &data));
        assert_eq!(rx.await.unwrap().unwrap(), b"\x05late");
    }

    #[tokio::test]
    async fn test_wait_timeout() {
        let (_net, _s, a, b) = pair().await;

        let subs = a.inner.subscribers.len();
        let started = std::time::Instant::now();
        let r = a
            .wait_from(
                &b.address(),
                &[WaitFilter::Command(7), WaitFilter::Timeout(Duration::from_millis(100))],
            )
            .await;
        assert!(matches!(r, Err(Error::Timeout)));
        assert!(started.elapsed() >= Duration::from_millis(100));

        // nothing left behind to swallow later packets
        assert_eq!(a.inner.subscribers.len(), subs);
        assert!(matches!(
            a.wait_from("nobody", &[]).await,
            Err(Error::NotConnected(_))
        ));
    }
}
