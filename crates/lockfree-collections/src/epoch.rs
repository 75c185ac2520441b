//! Minimal epoch-based reclamation.
//!
//! A garbage-collected host would retire "no longer reachable" tables, slot
//! payloads, and queue nodes for free. Rust has no such collector, so every
//! place this crate relies on "this object is freed once nothing points at
//! it any more" has to say so explicitly.
//!
//! Rather than take `crossbeam-epoch` as a hard dependency, this module
//! reimplements its core idea at a scale that matches this crate: a global
//! epoch counter plus a three-generation garbage bag per [`Collector`]. A
//! thread [`pin`](Collector::pin)s for the duration of one public operation
//! (`get`, `put_if_match`, `enqueue`, `try_dequeue`, ...); objects retired
//! while other threads are pinned are only dropped once every participant has
//! observed a later epoch.
//!
//! Participant bookkeeping (registration, epoch advancement) goes through a
//! `Mutex`-guarded registry. That is a deliberate simplification: it is rare
//! and off the hot path (one registration per thread per collector, one
//! advance attempt per retire), unlike the lock-free record/slot/node CAS
//! loops this module exists to support.

use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

const GENERATIONS: usize = 3;

type Deferred = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct Bag {
    items: Vec<Deferred>,
}

struct Participant {
    pinned: AtomicBool,
    /// Global epoch observed at the most recent `pin()`. Meaningless while
    /// `pinned` is false.
    local_epoch: AtomicU64,
}

impl Participant {
    fn new() -> Self {
        Self {
            pinned: AtomicBool::new(false),
            local_epoch: AtomicU64::new(0),
        }
    }
}

static NEXT_COLLECTOR_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// Per-thread participant handles, keyed by collector id. A thread only
    /// ever touches a handful of collectors (one per `Dictionary`/`Set`/
    /// `Queue` it uses), so a linear scan is fine.
    static REGISTRY: RefCell<Vec<(u64, Arc<Participant>)>> = const { RefCell::new(Vec::new()) };
}

/// Owns the global epoch and retired-object bags for one lock-free structure.
///
/// Each `Dictionary`, `Set`, and `Queue` owns its own collector rather than
/// sharing a single process-wide instance: this keeps reclamation latency for
/// one structure independent of how busy an unrelated structure is, at the
/// cost of one epoch counter and bag set per instance (negligible next to the
/// record array / node chain it is already paying for).
pub(crate) struct Collector {
    id: u64,
    global_epoch: AtomicU64,
    participants: Mutex<Vec<Arc<Participant>>>,
    bags: Mutex<[Bag; GENERATIONS]>,
}

impl Collector {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_COLLECTOR_ID.fetch_add(1, Ordering::Relaxed),
            global_epoch: AtomicU64::new(0),
            participants: Mutex::new(Vec::new()),
            bags: Mutex::new([Bag::default(), Bag::default(), Bag::default()]),
        })
    }

    fn participant(&self) -> Arc<Participant> {
        REGISTRY.with(|registry| {
            let mut registry = registry.borrow_mut();
            if let Some((_, p)) = registry.iter().find(|(id, _)| *id == self.id) {
                return Arc::clone(p);
            }
            let p = Arc::new(Participant::new());
            self.participants.lock().unwrap().push(Arc::clone(&p));
            registry.push((self.id, Arc::clone(&p)));
            p
        })
    }

    /// Pins the calling thread in the current epoch. Held for the duration of
    /// one public operation.
    pub(crate) fn pin(self: &Arc<Self>) -> Guard {
        let participant = self.participant();
        let epoch = self.global_epoch.load(Ordering::Acquire);
        participant.local_epoch.store(epoch, Ordering::Relaxed);
        participant.pinned.store(true, Ordering::Release);
        Guard {
            collector: Arc::clone(self),
            participant,
        }
    }

    /// Advances the global epoch if every pinned participant has observed the
    /// current one, then drains the bag that is now two generations stale.
    fn try_advance(&self) {
        let Ok(participants) = self.participants.try_lock() else {
            // Another thread is already advancing or registering; skip this
            // opportunistic attempt rather than block a CAS-retry hot path.
            return;
        };
        let current = self.global_epoch.load(Ordering::Acquire);
        let all_caught_up = participants.iter().all(|p| {
            !p.pinned.load(Ordering::Acquire) || p.local_epoch.load(Ordering::Relaxed) == current
        });
        if !all_caught_up {
            return;
        }
        let next = current.wrapping_add(1);
        if self
            .global_epoch
            .compare_exchange(current, next, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            return;
        }
        drop(participants);
        let stale_generation = (next as usize + 1) % GENERATIONS;
        let stale = {
            let mut bags = self.bags.lock().unwrap();
            std::mem::take(&mut bags[stale_generation])
        };
        for item in stale.items {
            item();
        }
    }

    fn defer(&self, f: impl FnOnce() + Send + 'static) {
        let generation = self.global_epoch.load(Ordering::Acquire) as usize % GENERATIONS;
        self.bags.lock().unwrap()[generation].items.push(Box::new(f));
        self.try_advance();
    }
}

/// RAII pin. Retired objects deferred through this guard (or any guard on the
/// same collector) are reclaimed once every participant has advanced past the
/// epoch active when they were retired.
pub(crate) struct Guard {
    collector: Arc<Collector>,
    participant: Arc<Participant>,
}

impl Guard {
    /// Schedules `f` to run once it is safe to assume nobody still holds a
    /// reference obtained while pinned at or before the current epoch.
    pub(crate) fn defer(&self, f: impl FnOnce() + Send + 'static) {
        self.collector.defer(f);
    }
}

impl Drop for Guard {
    fn drop(&mut self) {
        self.participant.pinned.store(false, Ordering::Release);
        self.collector.try_advance();
    }
}
