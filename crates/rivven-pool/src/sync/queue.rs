//! Blocking hand-off queues backed by [`Semaphore`]
//!
//! Items are appended and removed under a queue-local lock; the semaphore
//! counts items (and, for the bounded queue, free slots) so consumers and
//! producers can wait without holding the lock.
//!
//! Ordering: items leave the queue in insertion order, but concurrent waiters
//! are not served in arrival order. Whichever waiter wins a permit takes the
//! current head, so under contention FIFO holds per item, not per waiter.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

use super::semaphore::{deadline_after, Semaphore};

/// Unbounded FIFO queue. Producers never wait; consumers wait for an item.
#[derive(Debug)]
pub struct BlockingQueue<T> {
    items: Mutex<VecDeque<T>>,
    available: Semaphore,
}

impl<T> BlockingQueue<T> {
    /// Create an empty queue
    pub fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            available: Semaphore::unbounded(),
        }
    }

    /// Append an item and signal one consumer
    pub fn add(&self, item: T) {
        self.items.lock().push_back(item);
        self.available.release(1);
    }

    /// Wait for an item and remove it
    pub async fn remove(&self) -> T {
        loop {
            self.available.acquire().await;
            if let Some(item) = self.items.lock().pop_front() {
                return item;
            }
        }
    }

    /// Wait at most `timeout` for an item
    pub async fn remove_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = deadline_after(timeout);
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if !self.available.acquire_timeout(remaining).await {
                return None;
            }
            if let Some(item) = self.items.lock().pop_front() {
                return Some(item);
            }
        }
    }

    /// Remove the head if one is immediately available
    pub fn try_remove(&self) -> Option<T> {
        if self.available.try_acquire() {
            self.items.lock().pop_front()
        } else {
            None
        }
    }

    /// Snapshot of the number of queued items
    pub fn size(&self) -> usize {
        self.items.lock().len()
    }

    /// Whether the queue is empty at this instant
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }
}

impl<T> Default for BlockingQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// FIFO queue holding at most `capacity` items. Producers wait while it is full.
#[derive(Debug)]
pub struct BoundedBlockingQueue<T> {
    items: Mutex<VecDeque<T>>,
    capacity: usize,
    free_slots: Semaphore,
    available: Semaphore,
}

impl<T> BoundedBlockingQueue<T> {
    /// Create an empty queue. A capacity of zero is raised to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            free_slots: Semaphore::new(capacity, capacity),
            available: Semaphore::new(0, capacity),
        }
    }

    /// Maximum number of queued items
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Wait for a free slot, then append
    pub async fn add(&self, item: T) {
        self.free_slots.acquire().await;
        self.push(item);
    }

    /// Wait at most `timeout` for a free slot. Gives the item back on timeout.
    pub async fn add_timeout(&self, item: T, timeout: Duration) -> Result<(), T> {
        if self.free_slots.acquire_timeout(timeout).await {
            self.push(item);
            Ok(())
        } else {
            Err(item)
        }
    }

    /// Append only if a slot is free right now
    pub fn try_add(&self, item: T) -> Result<(), T> {
        if self.free_slots.try_acquire() {
            self.push(item);
            Ok(())
        } else {
            Err(item)
        }
    }

    /// Wait for a free slot without enqueueing. Cancelling the wait takes no
    /// slot; a completed wait must be followed by [`push_reserved`](Self::push_reserved).
    pub(crate) async fn reserve(&self) {
        self.free_slots.acquire().await;
    }

    /// Append into a slot taken by [`reserve`](Self::reserve)
    pub(crate) fn push_reserved(&self, item: T) {
        self.push(item);
    }

    fn push(&self, item: T) {
        self.items.lock().push_back(item);
        self.available.release(1);
    }

    fn pop(&self) -> Option<T> {
        let item = self.items.lock().pop_front();
        if item.is_some() {
            self.free_slots.release(1);
        }
        item
    }

    /// Wait for an item and remove it
    pub async fn remove(&self) -> T {
        loop {
            self.available.acquire().await;
            if let Some(item) = self.pop() {
                return item;
            }
        }
    }

    /// Wait at most `timeout` for an item
    pub async fn remove_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = deadline_after(timeout);
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if !self.available.acquire_timeout(remaining).await {
                return None;
            }
            if let Some(item) = self.pop() {
                return Some(item);
            }
        }
    }

    /// Remove the head if one is immediately available
    pub fn try_remove(&self) -> Option<T> {
        if self.available.try_acquire() {
            self.pop()
        } else {
            None
        }
    }

    /// Snapshot of the number of queued items
    pub fn size(&self) -> usize {
        self.items.lock().len()
    }

    /// Whether the queue is empty at this instant
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }
}
