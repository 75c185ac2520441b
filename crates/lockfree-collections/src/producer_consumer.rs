//! Grouped and unique-element producer/consumer adapters (C6).

use crate::queue::{Batch, Queue};
use crate::set::Set;
use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hash};

/// A multi-producer, multi-consumer channel built on [`Queue`]. `count()`
/// reports `0` or `1`: "is there work or not", matching the reference's
/// batch-oriented consumption model rather than a precise item count.
pub struct GroupedProducerConsumer<T> {
    queue: Queue<T>,
}

impl<T> Default for GroupedProducerConsumer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> GroupedProducerConsumer<T> {
    pub fn new() -> Self {
        Self { queue: Queue::new() }
    }

    pub fn add(&self, item: T) {
        self.queue.enqueue(item);
    }

    pub fn add_range(&self, items: impl IntoIterator<Item = T>) -> usize {
        self.queue.enqueue_range(items)
    }

    pub fn try_take(&self) -> Option<T> {
        self.queue.try_dequeue()
    }

    pub fn try_take_all(&self) -> Batch<T> {
        self.queue.atomic_dequeue_all()
    }

    /// `0` if empty, `1` if there is any work at all.
    pub fn count(&self) -> usize {
        usize::from(!self.queue.is_empty())
    }
}

/// A producer/consumer channel that only ever holds one instance of any
/// given element, built on [`Set`]. Unlike [`GroupedProducerConsumer`], a
/// duplicate `try_add` of an already-present element is a no-op.
pub struct UniqueElementProducerConsumer<T, S = RandomState> {
    set: Set<T, S>,
}

impl<T> Default for UniqueElementProducerConsumer<T, RandomState> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> UniqueElementProducerConsumer<T, RandomState> {
    pub fn new() -> Self {
        Self { set: Set::new() }
    }
}

impl<T, S> UniqueElementProducerConsumer<T, S>
where
    T: Hash + Eq + Clone,
    S: BuildHasher,
{
    /// Adds `item`. Returns `false` if an equal element was already present.
    pub fn try_add(&self, item: T) -> bool {
        self.set.add(item)
    }

    /// Removes and returns an arbitrary element, or `None` if empty. No
    /// ordering guarantee.
    pub fn try_take(&self) -> Option<T> {
        crate::table::take_any(self.set.inner().root()).map(|(k, _)| k)
    }

    pub fn len(&self) -> usize {
        self.set.len()
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grouped_add_and_take_all() {
        let pc = GroupedProducerConsumer::new();
        pc.add_range(1..=5);
        assert_eq!(pc.count(), 1);
        let batch: Vec<_> = pc.try_take_all().collect();
        assert_eq!(batch, vec![1, 2, 3, 4, 5]);
        assert_eq!(pc.count(), 0);
    }

    #[test]
    fn unique_producer_consumer_rejects_duplicates() {
        let pc = UniqueElementProducerConsumer::new();
        assert!(pc.try_add(1));
        assert!(!pc.try_add(1));
        assert_eq!(pc.len(), 1);
    }

    #[test]
    fn unique_producer_consumer_take_drains_eventually() {
        let pc = UniqueElementProducerConsumer::new();
        for i in 0..10 {
            pc.try_add(i);
        }
        let mut taken = Vec::new();
        while let Some(v) = pc.try_take() {
            taken.push(v);
        }
        taken.sort_unstable();
        assert_eq!(taken, (0..10).collect::<Vec<_>>());
        assert!(pc.is_empty());
    }
}
