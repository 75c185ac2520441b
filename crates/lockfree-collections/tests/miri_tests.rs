//! Miri-compatible tests for detecting undefined behavior.
//!
//! Run with: `cargo +nightly miri test --test miri_tests`
//!
//! Miri is an interpreter for Rust's MIR that detects undefined behavior:
//! use of uninitialized memory, out-of-bounds access, use-after-free, and
//! invalid pointer alignment. These tests are designed to exercise the
//! unsafe tagged-pointer and raw-node manipulation in the table and queue.

use lockfree_collections::{Config, Dictionary, Queue, Set};
use std::sync::Arc;
use std::thread;

/// Basic insert/lookup/remove through the table's CAS-based slot machinery.
#[test]
fn miri_dictionary_basic_operations() {
    let dict: Dictionary<i32, String> = Dictionary::with_config(Config::new(4, 1, false));

    dict.try_add(1, String::from("one")).unwrap();
    dict.try_add(2, String::from("two")).unwrap();
    assert_eq!(dict.get(&1), Some(String::from("one")));

    let removed = dict.remove(&1);
    assert_eq!(removed, Some(String::from("one")));
    assert_eq!(dict.get(&1), None);
}

/// Forces at least one resize-by-copy migration (tiny initial capacity,
/// small copy chunk) to exercise the tagged `Primed` pointer path and the
/// cooperative copy loop.
#[test]
fn miri_dictionary_resize_migration() {
    let dict: Dictionary<i32, i32> = Dictionary::with_config(Config::new(2, 1, false));

    for i in 0..40 {
        dict.try_add(i, i * i).unwrap();
    }
    for i in 0..40 {
        assert_eq!(dict.get(&i), Some(i * i));
    }
    assert_eq!(dict.len(), 40);
}

/// Repeated add/remove of the same keys exercises the tombstone (`Tomb`)
/// path and its slot reuse, not just fresh insertion.
#[test]
fn miri_dictionary_tombstone_reuse() {
    let dict: Dictionary<i32, i32> = Dictionary::with_config(Config::new(4, 1, false));

    for round in 0..5 {
        for i in 0..8 {
            dict.try_add(i, round).unwrap();
        }
        for i in 0..8 {
            dict.remove(&i);
        }
    }
    assert!(dict.is_empty());
}

/// Dropping a `Dictionary` with live entries still installed must free every
/// boxed key/value pair without double-freeing or leaking.
#[test]
fn miri_dictionary_drop_with_live_entries() {
    let dict: Dictionary<i32, String> = Dictionary::new();
    for i in 0..16 {
        dict.try_add(i, format!("value-{i}")).unwrap();
    }
    drop(dict);
}

/// Two threads racing to insert into a shared dictionary must leave exactly
/// one winner per key with no corrupted slot state.
#[test]
fn miri_dictionary_concurrent_insert() {
    let dict: Arc<Dictionary<i32, i32>> = Arc::new(Dictionary::with_config(Config::new(4, 1, false)));
    let d1 = Arc::clone(&dict);
    let d2 = Arc::clone(&dict);

    let t1 = thread::spawn(move || {
        for i in 0..20 {
            let _ = d1.try_add(i, 1);
        }
    });
    let t2 = thread::spawn(move || {
        for i in 0..20 {
            let _ = d2.try_add(i, 2);
        }
    });
    t1.join().unwrap();
    t2.join().unwrap();

    assert_eq!(dict.len(), 20);
    for i in 0..20 {
        assert!(dict.get(&i).is_some());
    }
}

/// Enqueue then fully drain via `try_dequeue`, exercising the Michael-Scott
/// node unlinking and retirement path.
#[test]
fn miri_queue_enqueue_then_drain() {
    let q: Queue<String> = Queue::new();
    q.enqueue(String::from("a"));
    q.enqueue(String::from("b"));
    q.enqueue(String::from("c"));

    assert_eq!(q.try_dequeue(), Some(String::from("a")));
    assert_eq!(q.try_dequeue(), Some(String::from("b")));
    assert_eq!(q.try_dequeue(), Some(String::from("c")));
    assert_eq!(q.try_dequeue(), None);
}

/// `atomic_dequeue_all` produces a `Batch` iterator; dropping it partway
/// through must still release every remaining node without a leak or UAF.
#[test]
fn miri_queue_batch_dropped_without_full_consumption() {
    let q: Queue<i32> = Queue::new();
    for i in 0..10 {
        q.enqueue(i);
    }

    {
        let mut batch = q.atomic_dequeue_all();
        assert_eq!(batch.next(), Some(0));
        assert_eq!(batch.next(), Some(1));
        // batch drops here with 8 items still unconsumed
    }

    assert!(q.is_empty());
}

/// Dropping a `Queue` that still holds unconsumed items must run every
/// item's destructor exactly once.
#[test]
fn miri_queue_drop_with_items() {
    let q: Queue<String> = Queue::new();
    q.enqueue(String::from("hello"));
    q.enqueue(String::from("world"));
    drop(q);
}

/// `enqueue_range` followed by `snapshot` (a non-destructive read) must not
/// disturb the live queue content.
#[test]
fn miri_queue_snapshot_is_non_destructive() {
    let q: Queue<i32> = Queue::new();
    q.enqueue_range(0..5);

    let snap = q.snapshot();
    assert_eq!(snap, vec![0, 1, 2, 3, 4]);
    assert_eq!(q.len(), 5);

    let drained = q.drain_to_vec();
    assert_eq!(drained, vec![0, 1, 2, 3, 4]);
}

/// `transfer` moves every node to a freshly returned queue without copying
/// payloads; the source must end up empty and the destination complete.
#[test]
fn miri_queue_transfer_moves_all_nodes() {
    let q: Queue<i32> = Queue::new();
    q.enqueue_range(0..8);

    let moved = q.transfer();
    assert!(q.is_empty());
    assert_eq!(moved.drain_to_vec(), (0..8).collect::<Vec<_>>());
}

/// Concurrent producers racing to enqueue, drained from a single consumer
/// after both finish, must conserve every item exactly once.
#[test]
fn miri_queue_concurrent_producers() {
    let q: Arc<Queue<i32>> = Arc::new(Queue::new());
    let q1 = Arc::clone(&q);
    let q2 = Arc::clone(&q);

    let t1 = thread::spawn(move || {
        for i in 0..15 {
            q1.enqueue(i);
        }
    });
    let t2 = thread::spawn(move || {
        for i in 15..30 {
            q2.enqueue(i);
        }
    });
    t1.join().unwrap();
    t2.join().unwrap();

    let mut all = q.drain_to_vec();
    all.sort_unstable();
    assert_eq!(all, (0..30).collect::<Vec<_>>());
}

/// `find_or_store` on a `Set` of heap-allocated elements exercises the
/// dictionary's key/value-are-the-same-allocation sharing path.
#[test]
fn miri_set_find_or_store_shares_allocation() {
    let set: Set<Arc<str>> = Set::new();
    let a = set.find_or_store(Arc::from("shared"));
    let b = set.find_or_store(Arc::from("shared"));
    assert!(Arc::ptr_eq(&a, &b));
}
