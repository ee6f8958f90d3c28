//! Per-channel subscriptions.
//!
//! Slots are tombstoned on removal and never compacted, so an index stays
//! valid while deliveries iterate over a snapshot. Free slots are reused.

use crate::channel::Channel;
use crate::event::{Event, Handler, Packet};
use std::sync::{
    atomic::{AtomicBool, Ordering::SeqCst},
    Arc, RwLock,
};

pub struct Subscription {
    channel: Arc<Channel>,
    handler: Handler,
    once: bool,
    slot: usize,
    removed: AtomicBool,
}

impl Subscription {
    pub fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }

    pub fn is_removed(&self) -> bool {
        self.removed.load(SeqCst)
    }
}

#[derive(Default)]
pub(crate) struct Subscribers {
    slots: RwLock<Vec<Option<Arc<Subscription>>>>,
}

impl Subscribers {
    /// Add a handler for packets of `channel`. A `once` subscription is
    /// removed as soon as it reports handled.
    pub fn subscribe(&self, channel: Arc<Channel>, handler: Handler, once: bool) -> Arc<Subscription> {
        let mut slots = self.slots.write().unwrap();
        let slot = slots.iter().position(Option::is_none).unwrap_or(slots.len());

        let sub = Arc::new(Subscription {
            channel,
            handler,
            once,
            slot,
            removed: AtomicBool::new(false),
        });

        if slot == slots.len() {
            slots.push(Some(sub.clone()));
        } else {
            slots[slot] = Some(sub.clone());
        }
        sub
    }

    /// Idempotent. Returns true if this call removed it.
    pub fn unsubscribe(&self, sub: &Subscription) -> bool {
        if sub.removed.swap(true, SeqCst) {
            return false;
        }

        let mut slots = self.slots.write().unwrap();
        if let Some(slot) = slots.get_mut(sub.slot) {
            if matches!(slot, Some(s) if std::ptr::eq(s.as_ref(), sub)) {
                *slot = None;
            }
        }
        true
    }

    /// Remove every subscription bound to `channel`.
    pub fn unsubscribe_channel(&self, channel: &Arc<Channel>) {
        for sub in self.snapshot(channel) {
            self.unsubscribe(&sub);
        }
    }

    fn snapshot(&self, channel: &Arc<Channel>) -> Vec<Arc<Subscription>> {
        self.slots
            .read()
            .unwrap()
            .iter()
            .flatten()
            .filter(|s| Arc::ptr_eq(&s.channel, channel))
            .cloned()
            .collect()
    }

    /// Offer a packet to the subscriptions of `channel` in order. A data
    /// packet stops at the first handler that takes it; other events reach
    /// every subscription. Returns true if anyone handled it.
    pub fn deliver(&self, channel: &Arc<Channel>, packet: &Packet, event: &Event) -> bool {
        let mut handled = false;

        for sub in self.snapshot(channel) {
            if sub.is_removed() {
                continue;
            }
            if !(sub.handler)(channel, packet, event) {
                continue;
            }
            if sub.once {
                self.unsubscribe(&sub);
            }
            handled = true;
            if event.is_data() {
                break;
            }
        }

        handled
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.slots.read().unwrap().iter().flatten().count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventKind;
    use crate::transport::MemoryNetwork;
    use std::sync::atomic::AtomicUsize;

    fn counter(n: &Arc<AtomicUsize>, result: bool) -> Handler {
        let n = n.clone();
        Arc::new(move |_, _, _| {
            n.fetch_add(1, SeqCst);
            result
        })
    }

    #[tokio::test]
    async fn test_once_and_order() {
        let net = MemoryNetwork::new();
        let t = net.bind("10.0.0.1:1".parse().unwrap());
        let ch = Channel::new("peer".into(), "10.0.0.2:1".parse().unwrap(), t.clone());
        let other = Channel::new("other".into(), "10.0.0.3:1".parse().unwrap(), t);

        let subs = Subscribers::default();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        subs.subscribe(ch.clone(), counter(&first, true), true);
        subs.subscribe(ch.clone(), counter(&second, true), false);

        let data = Event::new(EventKind::Data);
        let p = Packet::new("peer".into(), b"x".to_vec());

        assert!(!subs.deliver(&other, &p, &data));
        assert!(subs.deliver(&ch, &p, &data));
        assert_eq!(first.load(SeqCst), 1);
        assert_eq!(second.load(SeqCst), 0);

        // the one-shot is gone, the persistent one takes over
        assert!(subs.deliver(&ch, &p, &data));
        assert_eq!(first.load(SeqCst), 1);
        assert_eq!(second.load(SeqCst), 1);
        assert_eq!(subs.len(), 1);
    }

    #[tokio::test]
    async fn test_events_broadcast_and_slot_reuse() {
        let net = MemoryNetwork::new();
        let t = net.bind("10.0.0.1:1".parse().unwrap());
        let ch = Channel::new("peer".into(), "10.0.0.2:1".parse().unwrap(), t);

        let subs = Subscribers::default();
        let a = Arc::new(AtomicUsize::new(0));
        let b = Arc::new(AtomicUsize::new(0));
        let sa = subs.subscribe(ch.clone(), counter(&a, true), false);
        subs.subscribe(ch.clone(), counter(&b, true), false);

        let ev = Event::new(EventKind::PeerDisconnected);
        assert!(subs.deliver(&ch, &Packet::default(), &ev));
        assert_eq!((a.load(SeqCst), b.load(SeqCst)), (1, 1));

        assert!(subs.unsubscribe(&sa));
        assert!(!subs.unsubscribe(&sa));
        let c = Arc::new(AtomicUsize::new(0));
        let sc = subs.subscribe(ch.clone(), counter(&c, false), true);
        assert_eq!(sc.slot, sa.slot);

        // a handler that declines stays subscribed
        subs.deliver(&ch, &Packet::default(), &Event::new(EventKind::Data));
        assert!(!sc.is_removed());

        subs.unsubscribe_channel(&ch);
        assert_eq!(subs.len(), 0);
    }
}
