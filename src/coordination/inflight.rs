//! Tracks placements between submission and final ack so shutdown can drain
//! them and the kill switch can stop the ones not yet sent.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::debug;

#[derive(Debug, Default)]
pub struct InFlightTracker {
    count: AtomicUsize,
    closed: AtomicBool,
    idle: Notify,
}

/// Held for the lifetime of one placement
#[derive(Debug)]
pub struct InFlightGuard {
    tracker: Arc<InFlightTracker>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.tracker.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.tracker.idle.notify_waiters();
        }
    }
}

impl InFlightTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a placement; `None` once the tracker is closed for shutdown
    pub fn enter(self: &Arc<Self>) -> Option<InFlightGuard> {
        if self.closed.load(Ordering::SeqCst) {
            return None;
        }
        self.count.fetch_add(1, Ordering::SeqCst);
        // Re-check so a close racing with this enter is not missed by drain
        if self.closed.load(Ordering::SeqCst) {
            if self.count.fetch_sub(1, Ordering::SeqCst) == 1 {
                self.idle.notify_waiters();
            }
            return None;
        }
        Some(InFlightGuard {
            tracker: Arc::clone(self),
        })
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    /// Wait until no placement is in flight; false on timeout
    pub async fn drain(&self, timeout: Duration) -> bool {
        let wait = async {
            loop {
                let notified = self.idle.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                let remaining = self.in_flight();
                if remaining == 0 {
                    return;
                }
                debug!(remaining, "Waiting for in-flight placements");
                notified.await;
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }
}
