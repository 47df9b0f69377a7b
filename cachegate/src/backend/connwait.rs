//! Per-backend FIFO admission queue (§3 `Connwait`, §4.2 step 2).
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum WaitState {
    DoConnect,
    Queued,
    Dequeued,
    BeBusy,
}

/// One reservation node in a backend's wait queue.
pub struct ConnWait {
    notify: Arc<Notify>,
}

impl ConnWait {
    #[must_use]
    pub fn new() -> Self {
        Self { notify: Arc::new(Notify::new()) }
    }

    #[must_use]
    pub fn handle(&self) -> Arc<Notify> {
        Arc::clone(&self.notify)
    }
}

impl Default for ConnWait {
    fn default() -> Self {
        Self::new()
    }
}

/// FIFO of waiters for a capacity-limited backend, guarded by the caller's own mutex (the
/// director holds this behind its `tokio::sync::Mutex`, per §5's per-director-mutex rule).
#[derive(Default)]
pub struct WaitQueue {
    waiters: VecDeque<Arc<Notify>>,
}

impl WaitQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }

    /// Enqueue a new waiter at the tail and return its notify handle plus a future that resolves
    /// on notify or `timeout`, whichever comes first.
    pub fn enqueue(&mut self) -> Arc<Notify> {
        let notify = Arc::new(Notify::new());
        self.waiters.push_back(Arc::clone(&notify));
        notify
    }

    /// Wake and dequeue the head waiter, if any (called once a slot frees up).
    pub fn wake_next(&mut self) {
        if let Some(notify) = self.waiters.pop_front() {
            notify.notify_one();
        }
    }

    pub fn remove(&mut self, target: &Arc<Notify>) {
        self.waiters.retain(|n| !Arc::ptr_eq(n, target));
    }
}

/// Wait on `notify` until woken or `deadline` elapses; returns `true` if woken, `false` on
/// timeout (§4.2 step 2: `cond_wait_until`).
pub async fn wait_until(notify: &Notify, deadline: Duration) -> bool {
    tokio::select! {
        () = notify.notified() => true,
        () = tokio::time::sleep(deadline) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn wake_next_releases_head_waiter() {
        let mut queue = WaitQueue::new();
        let notify = queue.enqueue();
        let waiter = tokio::spawn({
            let notify = Arc::clone(&notify);
            async move { wait_until(&notify, Duration::from_secs(5)).await }
        });
        tokio::task::yield_now().await;
        queue.wake_next();
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn wait_times_out_without_wake() {
        let notify = Notify::new();
        let woken = wait_until(&notify, Duration::from_millis(10)).await;
        assert!(!woken);
    }
}
