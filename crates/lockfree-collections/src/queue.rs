//! Lock-free FIFO queue (C3): a Michael-Scott queue with bulk enqueue, atomic
//! drain, and snapshot extensions.

use crate::epoch::Collector;
use std::cell::UnsafeCell;
use std::fmt;
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Arc;

struct Node<T> {
    item: UnsafeCell<MaybeUninit<T>>,
    next: AtomicPtr<Node<T>>,
}

impl<T> Node<T> {
    fn boxed(item: T) -> *mut Self {
        Box::into_raw(Box::new(Self {
            item: UnsafeCell::new(MaybeUninit::new(item)),
            next: AtomicPtr::new(ptr::null_mut()),
        }))
    }

    fn sentinel() -> *mut Self {
        Box::into_raw(Box::new(Self {
            item: UnsafeCell::new(MaybeUninit::uninit()),
            next: AtomicPtr::new(ptr::null_mut()),
        }))
    }

    /// # Safety
    /// Caller must guarantee this node's item was initialized (it is not the
    /// sentinel) and that `take_item` is called at most once for this node.
    unsafe fn take_item(&self) -> T {
        (*self.item.get()).as_ptr().read()
    }
}

/// A lock-free, unbounded, multi-producer multi-consumer FIFO queue.
///
/// `head` always points at the current sentinel; user items begin at
/// `head.next`. `tail` may lag the true last node by at most one link;
/// helpers observe `tail.next` and advance `tail` via CAS on its behalf.
pub struct Queue<T> {
    head: AtomicPtr<Node<T>>,
    tail: AtomicPtr<Node<T>>,
    collector: Arc<Collector>,
}

// Safety: all mutable access to node contents goes through atomics and the
// single-owner discipline of the Michael-Scott protocol.
unsafe impl<T: Send> Send for Queue<T> {}
unsafe impl<T: Send> Sync for Queue<T> {}

impl<T> Default for Queue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Queue<T> {
    /// Creates an empty queue.
    pub fn new() -> Self {
        let sentinel = Node::sentinel();
        Self {
            head: AtomicPtr::new(sentinel),
            tail: AtomicPtr::new(sentinel),
            collector: Collector::new(),
        }
    }

    /// Appends `item`. Never fails, never blocks.
    pub fn enqueue(&self, item: T) {
        let guard = self.collector.pin();
        let new_node = Node::boxed(item);
        loop {
            let tail = self.tail.load(Ordering::Acquire);
            // SAFETY: tail is always a live node owned by this queue.
            let next = unsafe { (*tail).next.load(Ordering::Acquire) };
            if next.is_null() {
                match unsafe { (*tail).next.compare_exchange(
                    ptr::null_mut(),
                    new_node,
                    Ordering::Release,
                    Ordering::Relaxed,
                ) } {
                    Ok(_) => {
                        let _ = self.tail.compare_exchange(
                            tail,
                            new_node,
                            Ordering::Release,
                            Ordering::Relaxed,
                        );
                        break;
                    }
                    Err(_) => continue,
                }
            } else {
                // Another thread linked a node but hasn't swung tail yet; assist.
                let _ = self.tail.compare_exchange(tail, next, Ordering::Release, Ordering::Relaxed);
            }
        }
        drop(guard);
    }

    /// Appends every item of `items` as one contiguous run. The run is built
    /// before being linked in (not atomic with other enqueues during
    /// construction), but once linked via a single CAS on `tail.next`, all of
    /// its items remain contiguous and in order. Returns the number appended.
    pub fn enqueue_range(&self, items: impl IntoIterator<Item = T>) -> usize {
        let mut iter = items.into_iter();
        let Some(first_item) = iter.next() else {
            return 0;
        };
        let first = Node::boxed(first_item);
        let mut last = first;
        let mut count = 1;
        for item in iter {
            let node = Node::boxed(item);
            unsafe { (*last).next.store(node, Ordering::Relaxed) };
            last = node;
            count += 1;
        }

        let guard = self.collector.pin();
        loop {
            let tail = self.tail.load(Ordering::Acquire);
            let next = unsafe { (*tail).next.load(Ordering::Acquire) };
            if next.is_null() {
                match unsafe {
                    (*tail).next.compare_exchange(ptr::null_mut(), first, Ordering::Release, Ordering::Relaxed)
                } {
                    Ok(_) => {
                        let _ = self.tail.compare_exchange(tail, last, Ordering::Release, Ordering::Relaxed);
                        break;
                    }
                    Err(_) => continue,
                }
            } else {
                let _ = self.tail.compare_exchange(tail, next, Ordering::Release, Ordering::Relaxed);
            }
        }
        drop(guard);
        count
    }

    /// Removes and returns the front item, or `None` if the queue was
    /// observed empty. Does not mutate `head`/`tail` when empty.
    pub fn try_dequeue(&self) -> Option<T> {
        let guard = self.collector.pin();
        loop {
            let head = self.head.load(Ordering::Acquire);
            let tail = self.tail.load(Ordering::Acquire);
            let next = unsafe { (*head).next.load(Ordering::Acquire) };

            if head == tail {
                if next.is_null() {
                    return None;
                }
                // tail lags; assist before retrying.
                let _ = self.tail.compare_exchange(tail, next, Ordering::Release, Ordering::Relaxed);
                continue;
            }

            if self.head.compare_exchange(head, next, Ordering::AcqRel, Ordering::Acquire).is_ok() {
                // SAFETY: we won the CAS that makes `next` the new sentinel,
                // so we are the unique thread entitled to take its item.
                let item = unsafe { (*next).take_item() };
                guard.defer(move || unsafe { drop(Box::from_raw(head)) });
                return Some(item);
            }
        }
    }

    /// Lazily dequeues one item at a time via repeated [`try_dequeue`](Self::try_dequeue)
    /// calls, stopping the first time the queue is observed empty. Unlike
    /// [`atomic_dequeue_all`](Self::atomic_dequeue_all), this is not one
    /// atomic operation: concurrent enqueues and dequeues may interleave
    /// between successive items yielded by the returned iterator.
    pub fn dequeue_all(&self) -> DequeueAll<'_, T> {
        DequeueAll { queue: self }
    }

    /// Removes and returns all currently-visible items as one batch via a
    /// single CAS that advances `head` to the observed `tail`. Enqueues that
    /// complete after the CAS are not included. Returns an empty batch if the
    /// queue was observed empty.
    pub fn atomic_dequeue_all(&self) -> Batch<T> {
        let guard = self.collector.pin();
        loop {
            let old_head = self.head.load(Ordering::Acquire);
            let mut tail = self.tail.load(Ordering::Acquire);
            loop {
                let tail_next = unsafe { (*tail).next.load(Ordering::Acquire) };
                if tail_next.is_null() {
                    break;
                }
                let _ = self.tail.compare_exchange(tail, tail_next, Ordering::Release, Ordering::Relaxed);
                tail = tail_next;
            }

            if self.head.compare_exchange(old_head, tail, Ordering::AcqRel, Ordering::Acquire).is_ok() {
                let start = if old_head == tail {
                    ptr::null_mut()
                } else {
                    unsafe { (*old_head).next.load(Ordering::Acquire) }
                };
                if old_head != tail {
                    guard.defer(move || unsafe { drop(Box::from_raw(old_head)) });
                }
                return Batch {
                    current: start,
                    end_inclusive: tail,
                    done: start.is_null(),
                    guard,
                };
            }
        }
    }

    /// Returns a clone of the front item without removing it, or `None` if
    /// empty.
    pub fn try_peek(&self) -> Option<T>
    where
        T: Clone,
    {
        let _guard = self.collector.pin();
        let head = self.head.load(Ordering::Acquire);
        let next = unsafe { (*head).next.load(Ordering::Acquire) };
        if next.is_null() {
            return None;
        }
        // SAFETY: next holds an initialized item as long as it remains
        // reachable from head, which the pinned guard ensures for this call.
        Some(unsafe { (*(*next).item.get()).assume_init_ref().clone() })
    }

    /// Returns `true` iff the queue was observed empty.
    pub fn is_empty(&self) -> bool {
        let _guard = self.collector.pin();
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        let next = unsafe { (*head).next.load(Ordering::Acquire) };
        head == tail && next.is_null()
    }

    /// Walks from `head.next` to the observed `tail`, counting items.
    /// Approximate under concurrent mutation; O(n).
    pub fn len(&self) -> usize {
        let _guard = self.collector.pin();
        let mut count = 0usize;
        let mut current = unsafe { (*self.head.load(Ordering::Acquire)).next.load(Ordering::Acquire) };
        while !current.is_null() {
            count += 1;
            current = unsafe { (*current).next.load(Ordering::Acquire) };
        }
        count
    }

    /// Drains and discards all currently-visible items.
    pub fn clear(&self) {
        let _ = self.atomic_dequeue_all();
    }

    /// Captures `head`/`tail` at this instant and clones every item observed
    /// between them. Loosely timed: may omit concurrent dequeues and include
    /// concurrent enqueues made before the tail sample.
    pub fn snapshot(&self) -> Vec<T>
    where
        T: Clone,
    {
        let _guard = self.collector.pin();
        let tail = self.tail.load(Ordering::Acquire);
        let mut out = Vec::new();
        let mut current = unsafe { (*self.head.load(Ordering::Acquire)).next.load(Ordering::Acquire) };
        loop {
            if current.is_null() {
                break;
            }
            // SAFETY: nodes between head and the sampled tail remain
            // reachable (and thus unretired) for the life of this guard.
            out.push(unsafe { (*(*current).item.get()).assume_init_ref().clone() });
            if current == tail {
                break;
            }
            current = unsafe { (*current).next.load(Ordering::Acquire) };
        }
        out
    }

    /// Atomically drains `self` and materializes the batch into a `Vec`.
    pub fn drain_to_vec(&self) -> Vec<T> {
        self.atomic_dequeue_all().collect()
    }

    /// Atomically drains `self` into a freshly constructed queue in O(1) (the
    /// captured chain is re-spliced, not copied item by item). `self` is left
    /// logically empty.
    pub fn transfer(&self) -> Queue<T> {
        let guard = self.collector.pin();
        loop {
            let old_head = self.head.load(Ordering::Acquire);
            let mut tail = self.tail.load(Ordering::Acquire);
            loop {
                let tail_next = unsafe { (*tail).next.load(Ordering::Acquire) };
                if tail_next.is_null() {
                    break;
                }
                let _ = self.tail.compare_exchange(tail, tail_next, Ordering::Release, Ordering::Relaxed);
                tail = tail_next;
            }

            if self.head.compare_exchange(old_head, tail, Ordering::AcqRel, Ordering::Acquire).is_ok() {
                let new_queue = Queue::new();
                if old_head != tail {
                    // Re-splice the drained chain as the new queue's backbone:
                    // the captured range's own sentinel (old_head) becomes the
                    // new queue's sentinel directly, no per-item copy.
                    let new_queue_old_sentinel = new_queue.head.swap(old_head, Ordering::AcqRel);
                    new_queue.tail.store(tail, Ordering::Release);
                    unsafe { drop(Box::from_raw(new_queue_old_sentinel)) };
                }
                tracing::trace!(emptied = old_head != tail, "queue.transfer");
                drop(guard);
                return new_queue;
            }
        }
    }
}

impl<T> fmt::Debug for Queue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue").field("len", &self.len()).finish()
    }
}

impl<T> Drop for Queue<T> {
    fn drop(&mut self) {
        let mut current = *self.head.get_mut();
        // The sentinel's item slot was never initialized.
        let mut next = unsafe { (*current).next.load(Ordering::Relaxed) };
        unsafe { drop(Box::from_raw(current)) };
        while !next.is_null() {
            current = next;
            next = unsafe { (*current).next.load(Ordering::Relaxed) };
            let mut node = unsafe { Box::from_raw(current) };
            unsafe { ptr::drop_in_place(node.item.get_mut().as_mut_ptr()) };
        }
    }
}

/// The result of [`Queue::atomic_dequeue_all`]: an owning iterator over the
/// drained range. Items not consumed by iteration are dropped (and their
/// nodes reclaimed) when the batch itself is dropped.
pub struct Batch<T> {
    current: *mut Node<T>,
    end_inclusive: *mut Node<T>,
    done: bool,
    guard: crate::epoch::Guard,
}

unsafe impl<T: Send> Send for Batch<T> {}

impl<T> Iterator for Batch<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        if self.done {
            return None;
        }
        let node = self.current;
        // SAFETY: node is part of the range this batch exclusively owns
        // (captured by the CAS in atomic_dequeue_all); taken at most once.
        let item = unsafe { (*node).take_item() };
        if node == self.end_inclusive {
            self.done = true;
        } else {
            self.current = unsafe { (*node).next.load(Ordering::Acquire) };
        }
        if node != self.end_inclusive {
            // Deferred rather than freed synchronously: a concurrent reader
            // (`len`, `snapshot`, `try_peek`) may be mid-walk through a range
            // that overlaps this batch and is only holding a short pin, not
            // this batch's guard.
            self.guard.defer(move || unsafe { drop(Box::from_raw(node)) });
        }
        Some(item)
    }
}

impl<T> Drop for Batch<T> {
    fn drop(&mut self) {
        for item in self.by_ref() {
            drop(item);
        }
    }
}

/// The result of [`Queue::dequeue_all`]: a lazy iterator that dequeues one
/// item at a time via [`Queue::try_dequeue`]. Unlike [`Batch`], consecutive
/// items are not drawn from a single point-in-time snapshot — concurrent
/// producers and consumers may interleave between any two `next()` calls.
pub struct DequeueAll<'a, T> {
    queue: &'a Queue<T>,
}

impl<'a, T> Iterator for DequeueAll<'a, T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.queue.try_dequeue()
    }
}
