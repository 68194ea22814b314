//! A FIFO queue with blocking, non blocking and timed receive.
//!
//! The network layer keeps one [`Mailbox`] per protocol for received packets. Readers either poll
//! it, or wait until something is pushed.

use std::{collections::VecDeque, sync::Mutex, time::Duration};

use tokio::sync::Notify;

/// Returned by a non blocking pop on an empty queue. This is an expected condition, not a
/// failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("queue is empty")]
pub struct QueueEmpty;

/// A multi producer, multi consumer FIFO queue.
pub struct Mailbox<T> {
    items: Mutex<VecDeque<T>>,
    notify: Notify,
}

impl<T> Mailbox<T> {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    /// Add an item to the back of the queue, and wake up all waiting readers.
    pub fn push(&self, item: T) {
        self.items.lock().unwrap().push_back(item);
        self.notify.notify_waiters();
    }

    /// Take the item at the front of the queue, if any.
    pub fn try_pop(&self) -> Result<T, QueueEmpty> {
        self.items.lock().unwrap().pop_front().ok_or(QueueEmpty)
    }

    /// Wait until an item is available, and take it.
    pub async fn pop(&self) -> T {
        loop {
            // Register before checking, so a push between the check and the await is not lost.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Ok(item) = self.try_pop() {
                return item;
            }
            notified.await;
        }
    }

    /// Like [`pop`](Self::pop), but give up after `timeout`.
    pub async fn pop_timeout(&self, timeout: Duration) -> Result<T, QueueEmpty> {
        tokio::time::timeout(timeout, self.pop())
            .await
            .map_err(|_| QueueEmpty)
    }

    /// Amount of items in the queue.
    pub fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for Mailbox<T> {
    fn default() -> Self {
        Self::new()
    }
}
