//! Bounded, non-blocking work queue.
//!
//! The queue is the back-pressure valve between producers and the flush
//! cycle: when a capacity is configured and reached, new items are dropped
//! instead of blocking the producer or growing memory.

use crossbeam::queue::SegQueue;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Maximum number of items the queue may hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueueLimit {
    #[default]
    Unbounded,
    Bounded(usize),
}

impl QueueLimit {
    /// `None` maps to [`QueueLimit::Unbounded`].
    pub fn from_option(limit: Option<usize>) -> Self {
        limit.map_or(QueueLimit::Unbounded, QueueLimit::Bounded)
    }
}

/// Thread-safe FIFO with an optional maximum size.
pub struct BoundedWorkQueue<T> {
    items: SegQueue<T>,
    limit: QueueLimit,
    // Counts items that are in the queue or about to be pushed. Only
    // maintained for bounded queues.
    count: AtomicUsize,
}

impl<T> BoundedWorkQueue<T> {
    pub fn new(limit: QueueLimit) -> Self {
        Self {
            items: SegQueue::new(),
            limit,
            count: AtomicUsize::new(0),
        }
    }

    pub fn unbounded() -> Self {
        Self::new(QueueLimit::Unbounded)
    }

    pub fn bounded(capacity: usize) -> Self {
        Self::new(QueueLimit::Bounded(capacity))
    }

    pub fn limit(&self) -> QueueLimit {
        self.limit
    }

    /// `None` for an unbounded queue.
    pub fn capacity(&self) -> Option<usize> {
        match self.limit {
            QueueLimit::Unbounded => None,
            QueueLimit::Bounded(capacity) => Some(capacity),
        }
    }

    /// Enqueue without blocking. Returns `false` if the item was dropped
    /// because the queue is full.
    pub fn try_enqueue(&self, item: T) -> bool {
        if let QueueLimit::Bounded(capacity) = self.limit {
            let size = self.count.fetch_add(1, Ordering::AcqRel) + 1;
            if size > capacity {
                self.count.fetch_sub(1, Ordering::AcqRel);
                return false;
            }
        }
        self.items.push(item);
        true
    }

    /// Dequeue the oldest item, if any.
    pub fn try_dequeue(&self) -> Option<T> {
        let item = self.items.pop()?;
        if matches!(self.limit, QueueLimit::Bounded(_)) {
            self.count.fetch_sub(1, Ordering::AcqRel);
        }
        Some(item)
    }

    /// Pop and drop everything currently queued. Returns how many items were
    /// discarded.
    pub fn drain_discard(&self) -> usize {
        let mut dropped = 0;
        while self.try_dequeue().is_some() {
            dropped += 1;
        }
        dropped
    }

    /// Number of queued items. Approximate while producers are active.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl<T> Default for BoundedWorkQueue<T> {
    fn default() -> Self {
        Self::unbounded()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounded_queue_rejects_past_capacity() {
        let queue = BoundedWorkQueue::bounded(2);
        assert!(queue.try_enqueue(1));
        assert!(queue.try_enqueue(2));
        assert!(!queue.try_enqueue(3));
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.try_dequeue(), Some(1));
        assert!(queue.try_enqueue(4));
        assert_eq!(queue.try_dequeue(), Some(2));
        assert_eq!(queue.try_dequeue(), Some(4));
        assert_eq!(queue.try_dequeue(), None);
    }

    #[test]
    fn dequeue_on_empty_does_not_free_capacity() {
        let queue = BoundedWorkQueue::bounded(1);
        assert_eq!(queue.try_dequeue(), None);
        assert_eq!(queue.try_dequeue(), None);
        assert!(queue.try_enqueue("a"));
        assert!(!queue.try_enqueue("b"));
    }
}
