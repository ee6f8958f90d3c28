//! Process wide closing signal.

use std::sync::atomic::{AtomicBool, Ordering::SeqCst};
use std::time::Duration;
use tokio::{select, sync::Notify, time::sleep};

/// Closed exactly once; long lived loops check it before every attempt.
#[derive(Default)]
pub(crate) struct Closing {
    closed: AtomicBool,
    notify: Notify,
}

impl Closing {
    /// Returns false if it was already closed.
    pub fn close(&self) -> bool {
        if self
            .closed
            .compare_exchange(false, true, SeqCst, SeqCst)
            .is_err()
        {
            return false;
        }
        self.notify.notify_waiters();
        true
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(SeqCst)
    }

    /// Sleep for `d`. Returns false if closing interrupted the sleep.
    pub async fn sleep(&self, d: Duration) -> bool {
        let notified = self.notify.notified();
        if self.is_closed() {
            return false;
        }
        select! {
            _ = notified => false,
            _ = sleep(d) => !self.is_closed(),
        }
    }
}
