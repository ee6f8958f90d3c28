//! In-flight connect requests keyed by correlation id.

use crate::shutdown::Closing;
use crate::wire::ConnectToData;
use std::collections::HashMap;
use std::sync::{
    atomic::{AtomicBool, Ordering::SeqCst},
    Arc, Mutex, RwLock,
};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::task::spawn;

/// Outcome delivered to the initiator: `None` on success, or the error text.
pub(crate) type Completion = Option<String>;

pub(crate) struct PendingRequest {
    pub data: ConnectToData,
    created: Instant,
    finished: AtomicBool,
    tx: Mutex<Option<oneshot::Sender<Completion>>>,
    resent: AtomicBool,
}

impl PendingRequest {
    pub fn new(data: ConnectToData, tx: Option<oneshot::Sender<Completion>>) -> Arc<Self> {
        Arc::new(Self {
            data,
            created: Instant::now(),
            finished: AtomicBool::new(false),
            tx: Mutex::new(tx),
            resent: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> &str {
        &self.data.id
    }

    pub fn age(&self) -> Duration {
        self.created.elapsed()
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(SeqCst)
    }

    /// Only the caller that wins the flip may touch the completion channel.
    fn flip(&self) -> bool {
        self.finished
            .compare_exchange(false, true, SeqCst, SeqCst)
            .is_ok()
    }

    /// Finish without an outcome. The completion sender is dropped, so a
    /// waiter that lost the flip sees the channel closed instead of hanging.
    pub fn finish(&self) -> bool {
        if !self.flip() {
            return false;
        }
        self.tx.lock().unwrap().take();
        true
    }

    /// Finish and signal the waiting caller, at most once.
    pub fn complete(&self, result: Completion) -> bool {
        if !self.flip() {
            return false;
        }
        if let Some(tx) = self.tx.lock().unwrap().take() {
            let _ = tx.send(result);
        }
        true
    }

    /// True the first time only.
    pub fn mark_resent(&self) -> bool {
        !self.resent.swap(true, SeqCst)
    }
}

/// Storage of pending requests.
pub(crate) trait RequestStore: Send + Sync {
    fn add(&self, req: Arc<PendingRequest>);
    fn get(&self, id: &str) -> Option<Arc<PendingRequest>>;
    fn del(&self, id: &str) -> Option<Arc<PendingRequest>>;
    #[cfg(test)]
    fn len(&self) -> usize;

    /// Delete every request older than `ttl`, one at a time. Returns how
    /// many were removed.
    fn sweep(&self, ttl: Duration) -> usize;
}

#[derive(Default)]
pub(crate) struct ConnectRequests {
    map: RwLock<HashMap<String, Arc<PendingRequest>>>,
}

impl RequestStore for ConnectRequests {
    fn add(&self, req: Arc<PendingRequest>) {
        self.map.write().unwrap().insert(req.id().to_string(), req);
    }

    fn get(&self, id: &str) -> Option<Arc<PendingRequest>> {
        self.map.read().unwrap().get(id).cloned()
    }

    fn del(&self, id: &str) -> Option<Arc<PendingRequest>> {
        self.map.write().unwrap().remove(id)
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.map.read().unwrap().len()
    }

    fn sweep(&self, ttl: Duration) -> usize {
        let mut removed = 0;
        loop {
            let expired = self
                .map
                .read()
                .unwrap()
                .values()
                .find(|r| r.age() > ttl)
                .map(|r| r.id().to_string());

            match expired {
                Some(id) => {
                    if let Some(req) = self.del(&id) {
                        log::debug!("connect request {} expired", id);
                        req.finish();
                        removed += 1;
                    }
                }
                None => break,
            }
        }
        removed
    }
}

/// Sweep `store` every `ttl` until closing.
pub(crate) fn spawn_sweeper(store: Arc<dyn RequestStore>, ttl: Duration, closing: Arc<Closing>) {
    spawn(async move {
        while closing.sleep(ttl).await {
            store.sweep(ttl);
        }
        log::trace!("pending request sweeper stopped");
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(id: &str) -> Arc<PendingRequest> {
        PendingRequest::new(
            ConnectToData {
                id: id.into(),
                ..Default::default()
            },
            None,
        )
    }

    #[test]
    fn test_complete_once() {
        let (tx, mut rx) = oneshot::channel();
        let r = PendingRequest::new(ConnectToData::default(), Some(tx));
        assert!(r.complete(None));
        assert!(!r.complete(Some("late".into())));
        assert_eq!(rx.try_recv().unwrap(), None);
        assert!(r.is_finished());
    }

    #[tokio::test]
    async fn test_losing_finish_sees_outcome() {
        // completion won: the outcome is already sent when finish loses
        let (tx, rx) = oneshot::channel();
        let r = PendingRequest::new(ConnectToData::default(), Some(tx));
        let completer = {
            let r = r.clone();
            std::thread::spawn(move || r.complete(Some("peer gone".into())))
        };
        let won = completer.join().unwrap();
        assert!(won);
        assert!(!r.finish());
        assert_eq!(rx.await.unwrap(), Some("peer gone".into()));

        // plain finish (timeout, sweeper) closes the channel instead
        let (tx, rx) = oneshot::channel::<Completion>();
        let r = PendingRequest::new(ConnectToData::default(), Some(tx));
        assert!(r.finish());
        assert!(!r.complete(None));
        assert!(rx.await.is_err());
    }

    #[test]
    fn test_sweep() {
        let store = ConnectRequests::default();
        store.add(request("old1"));
        store.add(request("old2"));
        std::thread::sleep(Duration::from_millis(60));
        store.add(request("young"));

        assert_eq!(store.sweep(Duration::from_millis(40)), 2);
        assert!(store.get("old1").is_none());
        assert!(store.get("old2").is_none());
        assert!(store.get("young").is_some());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_sweeper_task() {
        let store: Arc<dyn RequestStore> = Arc::new(ConnectRequests::default());
        let closing = Arc::new(Closing::default());
        store.add(request("a"));

        spawn_sweeper(store.clone(), Duration::from_millis(30), closing.clone());
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(store.get("a").is_none());
        closing.close();
    }
}
