//! FIFO work queue with join semantics.
//!
//! Items are put once and taken by exactly one worker. Every `get` must be
//! matched by a `task_done` once the item is fully processed; `join` waits
//! until the number of unfinished items drops to zero. `close` wakes idle
//! workers so they can exit after the queue has drained.

use tokio::sync::{Mutex, mpsc, watch};
use tokio_util::sync::CancellationToken;

pub struct WorkQueue<T> {
    tx: mpsc::UnboundedSender<T>,
    rx: Mutex<mpsc::UnboundedReceiver<T>>,
    unfinished: watch::Sender<usize>,
    closed: CancellationToken,
}

impl<T: Send> WorkQueue<T> {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (unfinished, _) = watch::channel(0);
        Self {
            tx,
            rx: Mutex::new(rx),
            unfinished,
            closed: CancellationToken::new(),
        }
    }

    /// Enqueues an item. Counts as unfinished until `task_done`.
    pub fn put(&self, item: T) {
        self.unfinished.send_modify(|n| *n += 1);
        if self.tx.send(item).is_err() {
            // The receiver lives as long as the queue; this cannot happen.
            self.unfinished.send_modify(|n| *n = n.saturating_sub(1));
        }
    }

    /// Waits for the next item. Returns `None` once the queue is closed.
    pub async fn get(&self) -> Option<T> {
        let mut rx = tokio::select! {
            biased;
            _ = self.closed.cancelled() => return None,
            guard = self.rx.lock() => guard,
        };
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => None,
            item = rx.recv() => item,
        }
    }

    /// Marks one item taken with `get` as fully processed.
    pub fn task_done(&self) {
        self.unfinished.send_modify(|n| *n = n.saturating_sub(1));
    }

    /// Returns a guard that calls `task_done` when dropped.
    pub fn done_on_drop(&self) -> TaskDone<'_, T> {
        TaskDone { queue: self }
    }

    /// Waits until every item put so far has been marked done.
    pub async fn join(&self) {
        let mut rx = self.unfinished.subscribe();
        // The sender is owned by `self`, so this only ends on zero.
        let _ = rx.wait_for(|n| *n == 0).await;
    }

    /// Wakes all waiting workers; further `get` calls return `None`.
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Number of items put but not yet marked done.
    pub fn unfinished(&self) -> usize {
        *self.unfinished.borrow()
    }
}

impl<T: Send> Default for WorkQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Calls [`WorkQueue::task_done`] on drop, including during unwinding.
pub struct TaskDone<'a, T: Send> {
    queue: &'a WorkQueue<T>,
}

impl<T: Send> Drop for TaskDone<'_, T> {
    fn drop(&mut self) {
        self.queue.task_done();
    }
}
