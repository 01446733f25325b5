//! FIFO queue that suppresses duplicate membership.
//!
//! Used as the manager's idle-worker queue: the same worker, reported
//! idle twice by two different completion paths, must only be queued
//! once, and workers must be handed out in the order they became idle.

use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::Notify;

struct Inner<T> {
    order: VecDeque<T>,
    members: HashSet<T>,
}

/// A thread-safe, async-aware FIFO queue where inserting an item already
/// present is a no-op.
pub struct OrderedSetQueue<T: Eq + Hash + Clone> {
    inner: Mutex<Inner<T>>,
    notify: Notify,
}

impl<T: Eq + Hash + Clone> Default for OrderedSetQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Eq + Hash + Clone> OrderedSetQueue<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner { order: VecDeque::new(), members: HashSet::new() }),
            notify: Notify::new(),
        }
    }

    /// Insert an item at the back of the queue. A no-op if the item is
    /// already present.
    pub fn put(&self, item: T) {
        let mut inner = self.inner.lock();
        if inner.members.insert(item.clone()) {
            inner.order.push_back(item);
            drop(inner);
            self.notify.notify_one();
        }
    }

    /// Remove and return the front item, waiting until one is available.
    pub async fn get(&self) -> T {
        loop {
            {
                let mut inner = self.inner.lock();
                if let Some(item) = inner.order.pop_front() {
                    inner.members.remove(&item);
                    return item;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Number of items currently queued, without removing any.
    pub fn len(&self) -> usize {
        self.inner.lock().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// Self is already `Send + Sync` via `Mutex`/`Notify`; no Arc needed to
// share, but allocator code commonly holds one behind `Arc` anyway.
pub type SharedOrderedSetQueue<T> = Arc<OrderedSetQueue<T>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn duplicate_put_is_a_no_op() {
        let q: OrderedSetQueue<u32> = OrderedSetQueue::new();
        q.put(1);
        q.put(1);
        q.put(2);
        assert_eq!(q.len(), 2);
        assert_eq!(q.get().await, 1);
        assert_eq!(q.get().await, 2);
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn get_blocks_until_item_available() {
        let q: Arc<OrderedSetQueue<u32>> = Arc::new(OrderedSetQueue::new());
        let q2 = Arc::clone(&q);
        let handle = tokio::spawn(async move { q2.get().await });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        q.put(42);
        assert_eq!(handle.await.unwrap(), 42);
    }

    #[tokio::test]
    async fn reinserting_after_removal_is_allowed() {
        let q: OrderedSetQueue<u32> = OrderedSetQueue::new();
        q.put(7);
        assert_eq!(q.get().await, 7);
        q.put(7);
        assert_eq!(q.get().await, 7);
    }

    proptest::proptest! {
        #[test]
        fn draining_yields_each_item_once_in_first_occurrence_order(items in proptest::collection::vec(0u32..20, 0..100)) {
            let q: OrderedSetQueue<u32> = OrderedSetQueue::new();
            for &item in &items {
                q.put(item);
            }
            let mut expected = Vec::new();
            for &item in &items {
                if !expected.contains(&item) {
                    expected.push(item);
                }
            }
            let rt = tokio::runtime::Runtime::new().unwrap();
            let mut drained = Vec::new();
            while !q.is_empty() {
                drained.push(rt.block_on(q.get()));
            }
            proptest::prop_assert_eq!(drained, expected);
        }
    }
}
