//! Concurrent hash table (C4): open-addressed, linear-probed, with lazy
//! tombstones and incremental resize-by-copy. Shared by [`crate::Dictionary`]
//! and [`crate::Set`].

use crate::backoff::Backoff;
use crate::config::Config;
use crate::counter::Counter;
use crate::epoch::Collector;
use crate::filter::filter_hash;
use crate::invariants::{
    debug_assert_copy_done_bounded, debug_assert_monotone_hash, debug_assert_no_duplicate_live_key,
    debug_assert_no_zero_hash_live,
};
use crate::metrics::Metrics;
use std::hash::{BuildHasher, Hash, Hasher};
use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{AtomicI32, AtomicPtr, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// The `Live`/`Tomb` payload of one record, heap-boxed behind a tagged
/// pointer (see [`SlotPtr`]).
///
/// `#[repr(align(2))]` guarantees the allocation's address has its low bit
/// clear, leaving that bit free to tag "primed" without a second allocation.
#[repr(align(2))]
enum Boxed<K, V> {
    Live(K, V),
    Tomb(K),
}

/// The four legal occupancy states of a [`Record`], plus "absent".
enum SlotView<'a, K, V> {
    Absent,
    Live(&'a K, &'a V),
    Tomb(&'a K),
    Primed,
    Dead,
}

/// Returns the address used as this table's process-wide `Dead` sentinel.
///
/// One instance is generated per monomorphization of `K, V` (the static is
/// local to this generic function body), giving every `Table<K, V>` in the
/// process a single, stable, pointer-identity-comparable `Dead` marker
/// without a per-value allocation.
fn dead_sentinel<K, V>() -> *mut Boxed<K, V> {
    #[repr(align(2))]
    struct Marker(u8);
    static DEAD: Marker = Marker(0);
    (&DEAD as *const Marker).cast_mut().cast()
}

const PRIMED_BIT: usize = 1;

fn tag_primed<K, V>(ptr: *mut Boxed<K, V>) -> *mut Boxed<K, V> {
    (ptr as usize | PRIMED_BIT) as *mut Boxed<K, V>
}

fn untag<K, V>(ptr: *mut Boxed<K, V>) -> *mut Boxed<K, V> {
    (ptr as usize & !PRIMED_BIT) as *mut Boxed<K, V>
}

fn is_primed<K, V>(ptr: *mut Boxed<K, V>) -> bool {
    (ptr as usize & PRIMED_BIT) != 0
}

/// One slot of the record array: a one-shot hash and an atomically-swapped,
/// tagged slot pointer.
struct Record<K, V> {
    hash: AtomicI32,
    slot: AtomicPtr<Boxed<K, V>>,
}

impl<K, V> Default for Record<K, V> {
    fn default() -> Self {
        Self {
            hash: AtomicI32::new(0),
            slot: AtomicPtr::new(ptr::null_mut()),
        }
    }
}

impl<K, V> Record<K, V> {
    fn view(&self) -> SlotView<'_, K, V> {
        let raw = self.slot.load(Ordering::Acquire);
        if raw.is_null() {
            return SlotView::Absent;
        }
        if raw == dead_sentinel::<K, V>() {
            return SlotView::Dead;
        }
        if is_primed(raw) {
            return SlotView::Primed;
        }
        // SAFETY: a non-null, untagged, non-Dead slot pointer always
        // addresses a live `Boxed<K, V>` allocation owned by this record
        // (or a predecessor record whose box this one now shares via
        // migration, which is never freed while reachable).
        match unsafe { &*raw } {
            Boxed::Live(k, v) => SlotView::Live(k, v),
            Boxed::Tomb(k) => SlotView::Tomb(k),
        }
    }
}

/// What a [`put_if_match`](Table::put_if_match) call requires of the slot it
/// is about to replace.
pub(crate) enum MatchPredicate<'a, V> {
    Any,
    AbsentOrTomb,
    Live,
    EqualTo(&'a V, &'a dyn Fn(&V, &V) -> bool),
    Predicate(&'a dyn Fn(&V) -> bool),
}

impl<'a, V> MatchPredicate<'a, V> {
    fn matches(&self, current: Option<&V>) -> bool {
        match self {
            MatchPredicate::Any => true,
            MatchPredicate::AbsentOrTomb => current.is_none(),
            MatchPredicate::Live => current.is_some(),
            MatchPredicate::EqualTo(expected, eq) => current.is_some_and(|v| eq(v, expected)),
            MatchPredicate::Predicate(p) => current.is_some_and(|v| p(v)),
        }
    }
}

/// Lazily derives the value to install. The first successfully *installed*
/// output is cached by the caller of `put_if_match` (not re-invoked across
/// lost-CAS retries that reuse the same `Producer`).
pub(crate) enum Producer<'a, V> {
    Value(V),
    FromFn(&'a mut dyn FnMut(Option<&V>) -> V),
}

impl<'a, V: Clone> Producer<'a, V> {
    fn produce(&mut self, current: Option<&V>) -> V {
        match self {
            Producer::Value(v) => v.clone(),
            Producer::FromFn(f) => f(current),
        }
    }
}

/// The outcome of a successful [`Table::put_if_match`].
pub(crate) enum PutOutcome<V> {
    /// The predicate rejected the current slot; carries the value observed
    /// at rejection time, if any (not a lookup — read during the same pass
    /// that rejected the predicate).
    Unchanged(Option<V>),
    /// A new slot was installed. `prior` is the value that was live before
    /// (`None` for a fresh insert). `new` is the value just installed
    /// (`None` when the installed slot is a tombstone, as in a removal).
    Installed { prior: Option<V>, new: Option<V> },
}

const REASON_REPROBE_EXHAUSTED: &str = "reprobe_exhausted";
const REASON_LOAD_FACTOR: &str = "load_factor";
const REASON_TOMB_HEAVY: &str = "tomb_heavy";

pub(crate) struct Table<K, V> {
    records: Box<[Record<K, V>]>,
    capacity: usize,
    mask: usize,
    reprobe_limit: usize,
    pub(crate) size_counter: Arc<Counter>,
    slots_counter: Counter,
    prev_size: usize,
    next_table: AtomicPtr<Table<K, V>>,
    copy_idx: AtomicUsize,
    copy_done: AtomicUsize,
    resizers_in_flight: AtomicUsize,
    config: Config,
    _marker: PhantomData<(K, V)>,
}

fn reprobe_limit_for(capacity: usize) -> usize {
    ((capacity >> 5) + 5).clamp(1, capacity)
}

impl<K, V> Table<K, V> {
    fn new(capacity: usize, prev_size: usize, size_counter: Arc<Counter>, config: Config) -> Self {
        let capacity = capacity.next_power_of_two().max(1);
        let mut records = Vec::with_capacity(capacity);
        records.resize_with(capacity, Record::default);
        Self {
            records: records.into_boxed_slice(),
            capacity,
            mask: capacity - 1,
            reprobe_limit: reprobe_limit_for(capacity),
            size_counter,
            slots_counter: Counter::new(0),
            prev_size,
            next_table: AtomicPtr::new(ptr::null_mut()),
            copy_idx: AtomicUsize::new(0),
            copy_done: AtomicUsize::new(0),
            resizers_in_flight: AtomicUsize::new(0),
            config,
            _marker: PhantomData,
        }
    }

    pub(crate) fn fresh(capacity: usize, config: Config) -> Self {
        Self::new(capacity, 0, Arc::new(Counter::new(0)), config)
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    fn next(&self) -> *mut Table<K, V> {
        self.next_table.load(Ordering::Acquire)
    }
}

impl<K, V> Drop for Table<K, V> {
    fn drop(&mut self) {
        for record in self.records.iter() {
            let raw = *record.slot.get_mut();
            if raw.is_null() || raw == dead_sentinel::<K, V>() {
                continue;
            }
            // SAFETY: this table owns every not-yet-reclaimed slot pointer
            // it still holds at drop time; a primed tag never changes the
            // underlying allocation's validity.
            unsafe { drop(Box::from_raw(untag(raw))) };
        }
        let next = *self.next_table.get_mut();
        if !next.is_null() {
            // SAFETY: `next_table` is either null or an allocation this
            // table exclusively owns until the root advances past it and
            // retires it through the epoch bag; reaching `Drop` means no
            // such retirement raced us.
            unsafe { drop(Box::from_raw(next)) };
        }
    }
}

/// Owns the `current_table` root, the shared hasher, the epoch collector and
/// the optional metrics for one logical dictionary/set.
pub(crate) struct Root<K, V, S> {
    current: AtomicPtr<Table<K, V>>,
    pub(crate) hasher: S,
    pub(crate) collector: Arc<Collector>,
    pub(crate) metrics: Metrics,
    pub(crate) config: Config,
    /// Forces `Root<K, V, S>`'s auto-derived `Send`/`Sync` to depend on
    /// `K`/`V`: every reachable `Table<K, V>` keeps its keys and values
    /// behind `AtomicPtr`, which is `Send`/`Sync` for any `T` regardless of
    /// whether `T` itself is — without this marker, a `Root<Rc<_>, _, _>`
    /// would incorrectly auto-implement `Send`.
    _marker: std::marker::PhantomData<(K, V)>,
}

impl<K, V, S: BuildHasher + Default> Root<K, V, S> {
    pub(crate) fn new(config: Config) -> Self {
        Self::with_hasher(config, S::default())
    }
}

impl<K, V, S: BuildHasher> Root<K, V, S> {
    pub(crate) fn with_hasher(config: Config, hasher: S) -> Self {
        let capacity = config.normalized_initial_capacity();
        let table = Box::into_raw(Box::new(Table::fresh(capacity, config)));
        Self {
            current: AtomicPtr::new(table),
            hasher,
            collector: Collector::new(),
            metrics: Metrics::default(),
            config,
            _marker: std::marker::PhantomData,
        }
    }

    fn filtered_hash(&self, key: &K) -> i32
    where
        K: Hash,
    {
        let mut hasher = self.hasher.build_hasher();
        key.hash(&mut hasher);
        filter_hash(hasher.finish() as i32, self.config.zero_hash_sentinel)
    }

    /// Borrows the current root table. Valid for the life of `guard`.
    fn current<'g>(&self, _guard: &'g crate::epoch::Guard) -> &'g Table<K, V> {
        // SAFETY: the root table, and every table reachable from it via
        // `next_table`, remains allocated at least until the pinning
        // guard's epoch has been fully retired.
        unsafe { &*self.current.load(Ordering::Acquire) }
    }

    pub(crate) fn get(&self, key: &K) -> Option<V>
    where
        K: Hash + Eq,
        V: Clone,
    {
        let guard = self.collector.pin();
        let h = self.filtered_hash(key);
        let mut table = self.current(&guard);
        loop {
            match lookup(table, h, key) {
                LookupResult::Found(v) => return Some(v),
                LookupResult::AbsentHere => return None,
                LookupResult::AssistAndContinue(next) => {
                    help_copy(self, table, &guard);
                    table = next;
                }
                LookupResult::ContinueInNext(next) => table = next,
                LookupResult::NoNext => return None,
            }
        }
    }

    pub(crate) fn contains_key(&self, key: &K) -> bool
    where
        K: Hash + Eq,
        V: Clone,
    {
        self.get(key).is_some()
    }

    pub(crate) fn put_if_match(
        &self,
        key: K,
        predicate: MatchPredicate<'_, V>,
        mut producer: Producer<'_, V>,
    ) -> PutOutcome<V>
    where
        K: Hash + Eq + Clone,
        V: Clone,
    {
        let guard = self.collector.pin();
        let h = self.filtered_hash(&key);
        let mut table: &Table<K, V> = self.current(&guard);
        let mut cached: Option<V> = None;
        loop {
            match put_if_match_in(self, table, h, &key, &predicate, &mut producer, &mut cached, &guard) {
                PutStep::Done(outcome) => return outcome,
                PutStep::Retry(next) => table = next,
            }
        }
    }

    pub(crate) fn len(&self) -> usize {
        let guard = self.collector.pin();
        let table = self.current(&guard);
        table.size_counter.read().max(0) as usize
    }

    pub(crate) fn capacity(&self) -> usize {
        let guard = self.collector.pin();
        self.current(&guard).capacity()
    }

    /// Replaces the root with a freshly sized, empty table.
    pub(crate) fn clear(&self) {
        let fresh = Box::into_raw(Box::new(Table::fresh(self.config.normalized_initial_capacity(), self.config)));
        let guard = self.collector.pin();
        let old = self.current.swap(fresh, Ordering::AcqRel);
        guard.defer(move || unsafe { drop(Box::from_raw(old)) });
    }

    /// Loosely-consistent iteration across every table linked from the root
    /// at the moment iteration starts.
    pub(crate) fn for_each(&self, mut f: impl FnMut(&K, &V))
    where
        K: Hash + Eq + Clone,
        V: Clone,
    {
        let guard = self.collector.pin();
        let mut table = self.current(&guard);
        loop {
            #[cfg(debug_assertions)]
            let mut seen_this_table = std::collections::HashSet::new();
            for idx in 0..table.capacity() {
                let record = &table.records[idx];
                match record.view() {
                    SlotView::Live(k, v) => {
                        #[cfg(debug_assertions)]
                        {
                            let already_seen = !seen_this_table.insert(k.clone());
                            debug_assert_no_duplicate_live_key!(already_seen);
                        }
                        f(k, v)
                    }
                    SlotView::Primed => {
                        help_copy(self, table, &guard);
                    }
                    _ => {}
                }
            }
            let next = table.next();
            if next.is_null() {
                break;
            }
            // SAFETY: reachable from a root we pinned; stays allocated for
            // the life of this guard.
            table = unsafe { &*next };
        }
    }

    /// Opens a [`Cursor`] for lazy, step-at-a-time iteration starting at the
    /// table current as of this call.
    pub(crate) fn cursor(&self) -> Cursor<K, V> {
        let guard = self.collector.pin();
        let table = self.current(&guard) as *const Table<K, V>;
        Cursor { table, idx: 0, guard }
    }
}

/// Drives lazy iteration across every table linked from a root, one record
/// at a time. Holds its own pinned [`crate::epoch::Guard`] for its entire
/// life, so every table and slot it visits stays valid to dereference
/// regardless of concurrent resizes or removals.
pub(crate) struct Cursor<K, V> {
    table: *const Table<K, V>,
    idx: usize,
    guard: crate::epoch::Guard,
}

// Safety: all access to `table` goes through the same atomic-loaded-pointer
// discipline as `Root`/`Table` themselves; the raw pointer carries no
// thread-affinity of its own.
unsafe impl<K: Send, V: Send> Send for Cursor<K, V> {}

impl<K, V> Cursor<K, V> {
    /// Advances to the next live pair, helping along any `Primed` slot it
    /// passes through. Returns `None` once every linked table is exhausted.
    pub(crate) fn advance<S>(&mut self, root: &Root<K, V, S>) -> Option<(K, V)>
    where
        K: Hash + Eq + Clone,
        V: Clone,
    {
        loop {
            // SAFETY: obtained from a pin held by `self.guard`, which stays
            // pinned for the cursor's entire life, so every table reachable
            // from it at construction time (and everything it links to)
            // remains allocated.
            let table = unsafe { &*self.table };
            if self.idx >= table.capacity() {
                let next = table.next();
                if next.is_null() {
                    return None;
                }
                self.table = next;
                self.idx = 0;
                continue;
            }
            let record = &table.records[self.idx];
            self.idx += 1;
            match record.view() {
                SlotView::Live(k, v) => return Some((k.clone(), v.clone())),
                SlotView::Primed => help_copy(root, table, &self.guard),
                _ => {}
            }
        }
    }
}

enum LookupResult<'g, K, V> {
    Found(V),
    AbsentHere,
    AssistAndContinue(&'g Table<K, V>),
    ContinueInNext(&'g Table<K, V>),
    NoNext,
}

fn lookup<'g, K: Hash + Eq, V: Clone>(table: &'g Table<K, V>, h: i32, key: &K) -> LookupResult<'g, K, V> {
    let mut idx = (h as u32 as usize) & table.mask;
    let mut remaining = table.reprobe_limit;
    let start = idx;
    loop {
        let record = &table.records[idx];
        let recorded_hash = record.hash.load(Ordering::Acquire);
        if recorded_hash == h {
            return match record.view() {
                SlotView::Absent => LookupResult::AbsentHere,
                SlotView::Primed | SlotView::Dead => next_table_or(table, LookupResult::AssistAndContinue),
                SlotView::Tomb(k) if k == key => LookupResult::AbsentHere,
                SlotView::Live(k, v) if k == key => LookupResult::Found(v.clone()),
                _ => {
                    idx = (idx + 1) & table.mask;
                    if idx == start || {
                        remaining -= 1;
                        remaining == 0
                    } {
                        return next_table_or(table, LookupResult::ContinueInNext);
                    }
                    continue;
                }
            };
        }
        if recorded_hash == 0 {
            debug_assert_no_zero_hash_live!(recorded_hash, matches!(record.view(), SlotView::Absent | SlotView::Dead));
            return LookupResult::AbsentHere;
        }
        idx = (idx + 1) & table.mask;
        remaining -= 1;
        if idx == start || remaining == 0 {
            return next_table_or(table, LookupResult::ContinueInNext);
        }
    }
}

fn next_table_or<'g, K, V>(
    table: &'g Table<K, V>,
    wrap: impl FnOnce(&'g Table<K, V>) -> LookupResult<'g, K, V>,
) -> LookupResult<'g, K, V> {
    let next = table.next();
    if next.is_null() {
        LookupResult::NoNext
    } else {
        // SAFETY: successor tables stay allocated while reachable and a
        // guard is pinned.
        wrap(unsafe { &*next })
    }
}

enum PutStep<'g, K, V> {
    Done(PutOutcome<V>),
    Retry(&'g Table<K, V>),
}

#[allow(clippy::too_many_arguments)]
fn put_if_match_in<'g, K, V, S>(
    root: &Root<K, V, S>,
    table: &'g Table<K, V>,
    h: i32,
    key: &K,
    predicate: &MatchPredicate<'_, V>,
    producer: &mut Producer<'_, V>,
    cached: &mut Option<V>,
    guard: &crate::epoch::Guard,
) -> PutStep<'g, K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    let mut idx = (h as u32 as usize) & table.mask;
    let mut remaining = table.reprobe_limit;
    let start = idx;

    loop {
        let record = &table.records[idx];
        let recorded_hash = record.hash.load(Ordering::Acquire);

        if recorded_hash == 0 {
            if matches!(predicate, MatchPredicate::Live) {
                // A Tomb-targeted, live-only-matching put against a record
                // that has never been written can never match; this is a
                // "no change" outcome, not a reprobe.
                return PutStep::Done(PutOutcome::Unchanged(None));
            }
            match record.hash.compare_exchange(0, h, Ordering::Release, Ordering::Acquire) {
                Ok(_) => {
                    // fall through: treat as our freshly claimed record.
                }
                Err(witness) => {
                    debug_assert_monotone_hash!(0i32, witness);
                    if witness != h {
                        idx = (idx + 1) & table.mask;
                        remaining -= 1;
                        if idx == start || remaining == 0 {
                            return PutStep::Retry(ensure_resized(root, table, guard, REASON_REPROBE_EXHAUSTED));
                        }
                        continue;
                    }
                    // witness == h: someone else claimed this exact slot for
                    // our hash; fall through to treat it as ours.
                }
            }
        } else if recorded_hash != h {
            idx = (idx + 1) & table.mask;
            remaining -= 1;
            if idx == start || remaining == 0 {
                return PutStep::Retry(ensure_resized(root, table, guard, REASON_REPROBE_EXHAUSTED));
            }
            continue;
        }

        // recorded_hash == h (ours or a match).
        loop {
            let current_raw = record.slot.load(Ordering::Acquire);
            if current_raw == dead_sentinel::<K, V>() {
                return PutStep::Retry(ensure_resized(root, table, guard, REASON_REPROBE_EXHAUSTED));
            }
            if is_primed(current_raw) {
                help_copy_record(root, table, idx, guard);
                return PutStep::Retry(ensure_resized(root, table, guard, REASON_REPROBE_EXHAUSTED));
            }
            if current_raw.is_null() {
                if !predicate.matches(None) {
                    return PutStep::Done(PutOutcome::Unchanged(None));
                }
                let value = cached.get_or_insert_with(|| producer.produce(None)).clone();
                let installed = value.clone();
                let new_box = Box::into_raw(Box::new(Boxed::Live(key.clone(), value)));
                match record.slot.compare_exchange(ptr::null_mut(), new_box, Ordering::Release, Ordering::Acquire) {
                    Ok(_) => {
                        table.slots_counter.increment();
                        table.size_counter.add(1);
                        return PutStep::Done(PutOutcome::Installed { prior: None, new: Some(installed) });
                    }
                    Err(_) => {
                        // SAFETY: never published, no other thread has seen it.
                        unsafe { drop(Box::from_raw(new_box)) };
                        continue;
                    }
                }
            }

            // SAFETY: current_raw is non-null, untagged, not Dead: it
            // addresses a live `Boxed<K, V>` allocation.
            let boxed = unsafe { &*current_raw };
            let record_key = match boxed {
                Boxed::Live(k, _) | Boxed::Tomb(k) => k,
            };
            if record_key != key {
                // Hash collision with a different key; reprobe the table.
                idx = (idx + 1) & table.mask;
                remaining -= 1;
                if idx == start || remaining == 0 {
                    return PutStep::Retry(ensure_resized(root, table, guard, REASON_REPROBE_EXHAUSTED));
                }
                break;
            }

            if !table.next().is_null() {
                help_copy_record(root, table, idx, guard);
                return PutStep::Retry(unsafe { &*table.next() });
            }

            let current_value = match boxed {
                Boxed::Live(_, v) => Some(v),
                Boxed::Tomb(_) => None,
            };
            if !predicate.matches(current_value) {
                return PutStep::Done(PutOutcome::Unchanged(current_value.cloned()));
            }

            let new_value = cached.get_or_insert_with(|| producer.produce(current_value)).clone();
            let installed = new_value.clone();
            let was_live = current_value.is_some();
            let new_box = Box::into_raw(Box::new(Boxed::Live(key.clone(), new_value)));
            match record.slot.compare_exchange(current_raw, new_box, Ordering::Release, Ordering::Acquire) {
                Ok(_) => {
                    let prior = current_value.cloned();
                    if !was_live {
                        table.size_counter.add(1);
                    }
                    guard.defer(move || unsafe { drop(Box::from_raw(untag(current_raw))) });
                    return PutStep::Done(PutOutcome::Installed { prior, new: Some(installed) });
                }
                Err(witness) => {
                    // SAFETY: never published, no other thread has seen it.
                    unsafe { drop(Box::from_raw(new_box)) };
                    if witness == dead_sentinel::<K, V>() {
                        return PutStep::Retry(ensure_resized(root, table, guard, REASON_REPROBE_EXHAUSTED));
                    }
                    if is_primed(witness) {
                        help_copy_record(root, table, idx, guard);
                        return PutStep::Retry(ensure_resized(root, table, guard, REASON_REPROBE_EXHAUSTED));
                    }
                    continue;
                }
            }
        }
    }
}

/// `remove`'s `Tomb`-install path, used by the public `Dictionary`/`Set`
/// facades rather than `put_if_match` directly (the removal's new slot is a
/// `Tomb`, which `put_if_match`'s `Producer` abstraction is not shaped for).
pub(crate) fn remove_live<K, V, S>(root: &Root<K, V, S>, key: &K) -> Option<V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    remove_if_live(root, key, &|_| true)
}

/// Forces a resize check against the current root table, used by
/// [`crate::iterators::RemoveWhere`]'s `Drop` after a bulk removal to relieve
/// a table that just became tomb-heavy without waiting for the next mutating
/// call to stumble into the same trigger.
pub(crate) fn maybe_compact<K, V, S>(root: &Root<K, V, S>)
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    let guard = root.collector.pin();
    let table = root.current(&guard);
    if !table.next().is_null() {
        help_copy(root, table, &guard);
        return;
    }
    let slots = table.slots_counter.read().max(0) as usize;
    let sz = table.size_counter.read().max(0) as usize;
    if slots >= 2 * sz.max(1) {
        let _ = ensure_resized(root, table, &guard, REASON_TOMB_HEAVY);
    }
}

/// Removes and returns an arbitrary live `(key, value)` pair, or `None` if
/// the table (and every linked successor) is empty. No ordering guarantee;
/// used by [`crate::producer_consumer::UniqueElementProducerConsumer::try_take`].
pub(crate) fn take_any<K, V, S>(root: &Root<K, V, S>) -> Option<(K, V)>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    let guard = root.collector.pin();
    let mut table = root.current(&guard);
    loop {
        for idx in 0..table.capacity() {
            let candidate_key = match table.records[idx].view() {
                SlotView::Live(k, _) => Some(k.clone()),
                SlotView::Primed => {
                    help_copy(root, table, &guard);
                    None
                }
                _ => None,
            };
            if let Some(key) = candidate_key {
                if let Some(value) = remove_if_live(root, &key, &|_| true) {
                    return Some((key, value));
                }
            }
        }
        let next = table.next();
        if next.is_null() {
            return None;
        }
        // SAFETY: reachable from a root we pinned.
        table = unsafe { &*next };
    }
}

/// Removes `key` only if `predicate(&current_value)` holds, installing a
/// `Tomb` in its place. Unlike [`Root::put_if_match`], which only ever
/// installs `Live` slots, this path exists specifically to publish `Tomb`.
pub(crate) fn remove_if_live<K, V, S>(root: &Root<K, V, S>, key: &K, predicate: &dyn Fn(&V) -> bool) -> Option<V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    let guard = root.collector.pin();
    let h = root.filtered_hash(key);
    let mut table = root.current(&guard);
    loop {
        match remove_in(root, table, h, key, predicate, &guard) {
            PutStep::Done(PutOutcome::Installed { prior, .. }) => return prior,
            PutStep::Done(PutOutcome::Unchanged(_)) => return None,
            PutStep::Retry(next) => table = next,
        }
    }
}

fn remove_in<'g, K, V, S>(
    root: &Root<K, V, S>,
    table: &'g Table<K, V>,
    h: i32,
    key: &K,
    predicate: &dyn Fn(&V) -> bool,
    guard: &crate::epoch::Guard,
) -> PutStep<'g, K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    let mut idx = (h as u32 as usize) & table.mask;
    let mut remaining = table.reprobe_limit;
    let start = idx;
    loop {
        let record = &table.records[idx];
        let recorded_hash = record.hash.load(Ordering::Acquire);
        if recorded_hash == 0 {
            debug_assert_no_zero_hash_live!(recorded_hash, matches!(record.view(), SlotView::Absent | SlotView::Dead));
            return PutStep::Done(PutOutcome::Unchanged(None));
        }
        if recorded_hash != h {
            idx = (idx + 1) & table.mask;
            remaining -= 1;
            if idx == start || remaining == 0 {
                return PutStep::Retry(ensure_resized(root, table, guard, REASON_REPROBE_EXHAUSTED));
            }
            continue;
        }
        loop {
            let current_raw = record.slot.load(Ordering::Acquire);
            if current_raw.is_null() {
                return PutStep::Done(PutOutcome::Unchanged(None));
            }
            if current_raw == dead_sentinel::<K, V>() {
                return PutStep::Retry(ensure_resized(root, table, guard, REASON_REPROBE_EXHAUSTED));
            }
            if is_primed(current_raw) {
                help_copy_record(root, table, idx, guard);
                return PutStep::Retry(ensure_resized(root, table, guard, REASON_REPROBE_EXHAUSTED));
            }
            // SAFETY: current_raw is non-null, untagged, not Dead.
            let boxed = unsafe { &*current_raw };
            match boxed {
                Boxed::Tomb(k) if k == key => return PutStep::Done(PutOutcome::Unchanged(None)),
                Boxed::Tomb(_) => break,
                Boxed::Live(k, _) if k != key => break,
                Boxed::Live(_, v) => {
                    if !predicate(v) {
                        return PutStep::Done(PutOutcome::Unchanged(Some(v.clone())));
                    }
                    if !table.next().is_null() {
                        help_copy_record(root, table, idx, guard);
                        return PutStep::Retry(unsafe { &*table.next() });
                    }
                    let prior = v.clone();
                    let new_box = Box::into_raw(Box::new(Boxed::Tomb(key.clone())));
                    match record.slot.compare_exchange(current_raw, new_box, Ordering::Release, Ordering::Acquire) {
                        Ok(_) => {
                            table.size_counter.add(-1);
                            guard.defer(move || unsafe { drop(Box::from_raw(untag(current_raw))) });
                            return PutStep::Done(PutOutcome::Installed { prior: Some(prior), new: None });
                        }
                        Err(_) => {
                            // SAFETY: never published.
                            unsafe { drop(Box::from_raw(new_box)) };
                            continue;
                        }
                    }
                }
            }
        }
        idx = (idx + 1) & table.mask;
        remaining -= 1;
        if idx == start || remaining == 0 {
            return PutStep::Retry(ensure_resized(root, table, guard, REASON_REPROBE_EXHAUSTED));
        }
    }
}

/// Ensures `table` has a successor (creating one and emitting the resize
/// trigger event on first arrival), then drives one unit of cooperative
/// copy, returning the table the caller should retry against.
fn ensure_resized<'g, K, V, S>(
    root: &Root<K, V, S>,
    table: &'g Table<K, V>,
    guard: &crate::epoch::Guard,
    reason: &'static str,
) -> &'g Table<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    let next = table.next();
    let next = if next.is_null() {
        install_successor(root, table, reason)
    } else {
        next
    };
    help_copy(root, table, guard);
    // SAFETY: the successor stays allocated for the life of the guard.
    unsafe { &*next }
}

fn next_capacity<K, V>(table: &Table<K, V>) -> usize {
    let sz = table.size_counter.read().max(0) as usize;
    let cap = table.capacity;
    let slots = table.slots_counter.read().max(0) as usize;

    if slots >= 2 * sz.max(1) {
        // Tomb-heavy: a same-capacity sweep reclaims tombstones without
        // growing, productive whenever there has been net growth in live
        // size since this table was created (sz != prev_size). When sz
        // hasn't moved since the last resize, a same-size resize would be
        // indistinguishable from the previous one and risks looping, so
        // growth wins instead.
        return if sz == table.prev_size {
            (cap * 2).next_power_of_two()
        } else {
            cap
        };
    }

    let mut new_cap = if sz >= 3 * cap / 4 {
        sz * 8
    } else if sz >= cap / 2 {
        sz * 4
    } else if sz >= cap / 4 {
        sz * 2
    } else {
        sz
    };
    if new_cap < cap {
        new_cap = cap;
    }
    if sz == table.prev_size {
        new_cap = new_cap.max(cap * 2);
    }
    new_cap.max(1).next_power_of_two()
}

/// CAS-installs a freshly allocated successor if none exists yet. Returns
/// whichever successor ends up installed (ours, or a racing thread's).
fn install_successor<K, V, S>(root: &Root<K, V, S>, table: &Table<K, V>, reason: &'static str) -> *mut Table<K, V>
where
    K: Hash + Eq,
    V: Clone,
{
    let new_cap = next_capacity(table);
    maybe_backpressure(root, table, new_cap);

    let sz = table.size_counter.read().max(0) as usize;
    let successor = Box::into_raw(Box::new(Table::new(new_cap, sz, Arc::clone(&table.size_counter), table.config)));

    match table.next_table.compare_exchange(ptr::null_mut(), successor, Ordering::AcqRel, Ordering::Acquire) {
        Ok(_) => {
            if table.config.enable_metrics {
                root.metrics.record_resize_triggered();
            }
            tracing::debug!(
                old_capacity = table.capacity,
                new_capacity = new_cap,
                reason,
                "table.resize.start"
            );
            successor
        }
        Err(witness) => {
            // SAFETY: never published.
            unsafe { drop(Box::from_raw(successor)) };
            witness
        }
    }
}

fn maybe_backpressure<K, V, S>(root: &Root<K, V, S>, table: &Table<K, V>, new_cap: usize) {
    if new_cap <= table.config.resize_backpressure_threshold {
        return;
    }
    let resizers = table.resizers_in_flight.fetch_add(1, Ordering::AcqRel) + 1;
    if resizers > 2 {
        let mb = (new_cap / (1024 * 1024)).max(1) as u64;
        let sleep_ms = (mb * 5 * resizers as u64).max(200);
        if table.config.enable_metrics {
            root.metrics.record_backpressure_sleep();
        }
        tracing::trace!(sleep_ms, resizers_in_flight = resizers, "table.resize.backpressure");
        let mut backoff = Backoff::new();
        while !backoff.is_completed() {
            backoff.snooze();
        }
        std::thread::sleep(Duration::from_millis(sleep_ms));
    }
    table.resizers_in_flight.fetch_sub(1, Ordering::AcqRel);
}

/// Drives one cooperative-copy unit for `table`, promoting the root if this
/// call completes the last unit.
fn help_copy<K, V, S>(root: &Root<K, V, S>, table: &Table<K, V>, guard: &crate::epoch::Guard)
where
    K: Hash + Eq,
    V: Clone,
{
    let next_raw = table.next();
    if next_raw.is_null() {
        return;
    }
    // SAFETY: stays allocated for the life of the guard.
    let next = unsafe { &*next_raw };

    let chunk = table.config.copy_chunk_size.max(1);
    if table.capacity <= chunk {
        copy_range(root, table, next, 0, table.capacity, guard);
    } else {
        let start = table.copy_idx.fetch_add(chunk, Ordering::AcqRel);
        if start < table.capacity {
            let end = (start + chunk).min(table.capacity);
            copy_range(root, table, next, start, end, guard);
        }
    }

    if table.copy_done.load(Ordering::Acquire) >= table.capacity {
        promote(root, table, next_raw, guard);
    }
}

/// Migrates a single record the caller already knows is `Primed`/mid-copy,
/// used by `get`/`put_if_match`/`remove` callers that stumble on one slot
/// rather than driving a whole chunk.
fn help_copy_record<K, V, S>(root: &Root<K, V, S>, table: &Table<K, V>, idx: usize, guard: &crate::epoch::Guard)
where
    K: Hash + Eq,
    V: Clone,
{
    let next_raw = table.next();
    if next_raw.is_null() {
        return;
    }
    // SAFETY: stays allocated for the life of the guard.
    let next = unsafe { &*next_raw };
    if copy_one_slot(root, table, next, idx, guard) {
        table.copy_done.fetch_add(1, Ordering::AcqRel);
        if table.config.enable_metrics {
            root.metrics.record_copy_units(1);
        }
    }
    if table.copy_done.load(Ordering::Acquire) >= table.capacity {
        promote(root, table, next_raw, guard);
    }
}

fn copy_range<K, V, S>(
    root: &Root<K, V, S>,
    table: &Table<K, V>,
    next: &Table<K, V>,
    start: usize,
    end: usize,
    guard: &crate::epoch::Guard,
) where
    K: Hash + Eq,
    V: Clone,
{
    let mut copied = 0u64;
    for idx in start..end {
        if copy_one_slot(root, table, next, idx, guard) {
            copied += 1;
        }
    }
    if copied > 0 {
        let done = table.copy_done.fetch_add(copied as usize, Ordering::AcqRel) + copied as usize;
        debug_assert_copy_done_bounded!(done, table.capacity);
        if table.config.enable_metrics {
            root.metrics.record_copy_units(copied);
        }
    }
}

/// Migrates the single record at `idx` from `table` into `next`. Returns
/// `true` if this call is the one that completed the migration for that
/// record (so the caller's `copy_done` tally stays accurate under races).
fn copy_one_slot<K, V, S>(
    root: &Root<K, V, S>,
    table: &Table<K, V>,
    next: &Table<K, V>,
    idx: usize,
    guard: &crate::epoch::Guard,
) -> bool
where
    K: Hash + Eq,
    V: Clone,
{
    let record = &table.records[idx];
    loop {
        let raw = record.slot.load(Ordering::Acquire);
        if raw == dead_sentinel::<K, V>() {
            return false;
        }
        if raw.is_null() {
            return record
                .slot
                .compare_exchange(raw, dead_sentinel::<K, V>(), Ordering::Release, Ordering::Acquire)
                .is_ok();
        }
        if is_primed(raw) {
            return install_into_successor(root, table, next, idx, untag(raw));
        }
        // SAFETY: non-null, untagged, not Dead.
        match unsafe { &*raw } {
            Boxed::Tomb(_) => {
                if record
                    .slot
                    .compare_exchange(raw, dead_sentinel::<K, V>(), Ordering::Release, Ordering::Acquire)
                    .is_ok()
                {
                    // SAFETY: this record exclusively owned `raw` until the
                    // CAS just replaced it with the shared `Dead` sentinel;
                    // no other reader can still be mid-dereference of it once
                    // every participant has passed the epoch this guard is
                    // pinned at.
                    guard.defer(move || unsafe { drop(Box::from_raw(raw)) });
                    return true;
                }
                return false;
            }
            Boxed::Live(_, _) => {
                let primed = tag_primed(raw);
                match record.slot.compare_exchange(raw, primed, Ordering::Release, Ordering::Acquire) {
                    Ok(_) => return install_into_successor(root, table, next, idx, raw),
                    Err(witness) if witness == dead_sentinel::<K, V>() => return false,
                    Err(_) => continue,
                }
            }
        }
    }
}

fn install_into_successor<K, V, S>(
    root: &Root<K, V, S>,
    table: &Table<K, V>,
    next: &Table<K, V>,
    idx: usize,
    boxed_ptr: *mut Boxed<K, V>,
) -> bool
where
    K: Hash + Eq,
    V: Clone,
{
    // SAFETY: boxed_ptr was a valid Live allocation; it is only ever freed
    // after this record reaches Dead, which we have not yet installed.
    let h = table.records[idx].hash.load(Ordering::Acquire);
    if let Boxed::Live(k, _) = unsafe { &*boxed_ptr } {
        let _ = k;
        install_copy_only(root, next, h, boxed_ptr);
    }
    table.records[idx]
        .slot
        .compare_exchange(tag_primed(boxed_ptr), dead_sentinel::<K, V>(), Ordering::Release, Ordering::Acquire)
        .is_ok()
}

/// A restricted `put_if_match` used only during migration: succeeds solely
/// when the destination slot is absent, so it never overwrites a value a
/// concurrent writer already installed directly into the successor.
fn install_copy_only<K, V, S>(root: &Root<K, V, S>, table: &Table<K, V>, h: i32, boxed_ptr: *mut Boxed<K, V>)
where
    K: Hash + Eq,
    V: Clone,
{
    let mut table = table;
    loop {
        let mut idx = (h as u32 as usize) & table.mask;
        let mut remaining = table.reprobe_limit;
        let start = idx;
        loop {
            let record = &table.records[idx];
            let recorded_hash = record.hash.load(Ordering::Acquire);
            if recorded_hash == 0 {
                if record.hash.compare_exchange(0, h, Ordering::Release, Ordering::Acquire).is_err()
                    && record.hash.load(Ordering::Acquire) != h
                {
                    idx = (idx + 1) & table.mask;
                    remaining -= 1;
                    if idx == start || remaining == 0 {
                        break;
                    }
                    continue;
                }
            } else if recorded_hash != h {
                idx = (idx + 1) & table.mask;
                remaining -= 1;
                if idx == start || remaining == 0 {
                    break;
                }
                continue;
            }

            if record
                .slot
                .compare_exchange(ptr::null_mut(), boxed_ptr, Ordering::Release, Ordering::Acquire)
                .is_ok()
            {
                table.slots_counter.increment();
                return;
            }
            // Destination already occupied (by a direct concurrent write or
            // another migrator); the value is already represented there.
            return;
        }

        let next = table.next();
        if next.is_null() {
            let new_cap = next_capacity(table);
            let successor = install_successor(root, table, REASON_LOAD_FACTOR);
            let _ = new_cap;
            // SAFETY: stays allocated for at least as long as `table` does.
            table = unsafe { &*successor };
        } else {
            // SAFETY: reachable from `table`, which the caller keeps alive.
            table = unsafe { &*next };
        }
    }
}

fn promote<K, V, S>(root: &Root<K, V, S>, table: &Table<K, V>, next_raw: *mut Table<K, V>, guard: &crate::epoch::Guard)
where
    K: Hash + Eq,
{
    let table_ptr = table as *const Table<K, V> as *mut Table<K, V>;
    let mut predecessor_slot = &root.current;
    loop {
        let candidate = predecessor_slot.load(Ordering::Acquire);
        if candidate == table_ptr {
            if predecessor_slot
                .compare_exchange(table_ptr, next_raw, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                if table.config.enable_metrics {
                    root.metrics.record_resize_promoted();
                }
                tracing::debug!(capacity = table.capacity, "table.resize.promote");
                let stale = table_ptr;
                guard.defer(move || unsafe {
                    // Detach the now-promoted successor link so Table::drop
                    // does not also try to free it through its parent.
                    (*stale).next_table.store(ptr::null_mut(), Ordering::Relaxed);
                    drop(Box::from_raw(stale));
                });
            }
            return;
        }
        if candidate.is_null() {
            return;
        }
        // SAFETY: candidate is reachable from the root and stays allocated
        // for the life of this guard.
        let candidate_ref = unsafe { &*candidate };
        let next = &candidate_ref.next_table;
        if next.load(Ordering::Acquire) == table_ptr {
            predecessor_slot = next;
            continue;
        }
        return;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::hash_map::RandomState;
    use std::sync::Arc as StdArc;
    use std::thread;

    fn fresh_root() -> Root<i32, String, RandomState> {
        Root::new(Config::new(4, 2, false))
    }

    #[test]
    fn insert_then_get_roundtrips() {
        let root = fresh_root();
        let outcome = root.put_if_match(1, MatchPredicate::AbsentOrTomb, Producer::Value("a".to_string()));
        assert!(matches!(outcome, PutOutcome::Installed { prior: None, .. }));
        assert_eq!(root.get(&1), Some("a".to_string()));
        assert_eq!(root.len(), 1);
    }

    #[test]
    fn remove_then_get_is_none() {
        let root = fresh_root();
        let _ = root.put_if_match(1, MatchPredicate::AbsentOrTomb, Producer::Value("a".to_string()));
        let removed = remove_live(&root, &1);
        assert_eq!(removed, Some("a".to_string()));
        assert_eq!(root.get(&1), None);
        assert_eq!(root.len(), 0);
    }

    #[test]
    fn resize_under_load_preserves_all_keys() {
        let root: Root<i32, i32, RandomState> = Root::new(Config::new(16, 64, false));
        for i in 0..10_000 {
            let _ = root.put_if_match(i, MatchPredicate::AbsentOrTomb, Producer::Value(i));
        }
        assert_eq!(root.len(), 10_000);
        for i in 0..10_000 {
            assert_eq!(root.get(&i), Some(i));
        }
        assert!(root.capacity() >= 16384);
    }

    #[test]
    fn concurrent_resize_with_readers_sees_consistent_values() {
        let root: StdArc<Root<i32, i32, RandomState>> = StdArc::new(Root::new(Config::new(16, 64, false)));
        let writer = {
            let root = StdArc::clone(&root);
            thread::spawn(move || {
                for i in 0..10_000 {
                    let _ = root.put_if_match(i, MatchPredicate::AbsentOrTomb, Producer::Value(i));
                }
            })
        };
        let mut readers = Vec::new();
        for _ in 0..4 {
            let root = StdArc::clone(&root);
            readers.push(thread::spawn(move || {
                for i in 0..2_000 {
                    if let Some(v) = root.get(&i) {
                        assert_eq!(v, i);
                    }
                }
            }));
        }
        writer.join().unwrap();
        for r in readers {
            r.join().unwrap();
        }
        assert_eq!(root.len(), 10_000);
    }

    #[test]
    fn contended_increment_via_add_or_update_is_exact_after_quiescence() {
        let root: StdArc<Root<&'static str, i64, RandomState>> = StdArc::new(Root::new(Config::default()));
        let _ = root.put_if_match("k", MatchPredicate::AbsentOrTomb, Producer::Value(0i64));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let root = StdArc::clone(&root);
            handles.push(thread::spawn(move || {
                for _ in 0..10_000 {
                    loop {
                        let current = root.get(&"k").unwrap();
                        let outcome = root.put_if_match(
                            "k",
                            MatchPredicate::EqualTo(&current, &|a: &i64, b: &i64| a == b),
                            Producer::Value(current + 1),
                        );
                        if matches!(outcome, PutOutcome::Installed { .. }) {
                            break;
                        }
                    }
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(root.get(&"k"), Some(80_000));
    }

    #[test]
    fn iteration_yields_every_inserted_pair() {
        let root: Root<i32, i32, RandomState> = Root::new(Config::new(4, 2, false));
        for i in 0..3 {
            let _ = root.put_if_match(i, MatchPredicate::AbsentOrTomb, Producer::Value(i * 10));
        }
        let mut seen = Vec::new();
        root.for_each(|k, v| seen.push((*k, *v)));
        seen.sort_unstable();
        assert_eq!(seen, vec![(0, 0), (1, 10), (2, 20)]);
    }

    #[test]
    fn clear_empties_and_resets_capacity() {
        let root: Root<i32, i32, RandomState> = Root::new(Config::new(4, 2, false));
        for i in 0..20 {
            let _ = root.put_if_match(i, MatchPredicate::AbsentOrTomb, Producer::Value(i));
        }
        root.clear();
        assert_eq!(root.len(), 0);
        assert_eq!(root.get(&0), None);
    }

    fn table_with(capacity: usize, prev_size: usize, size: isize, slots: isize) -> Table<i32, i32> {
        let config = Config::new(capacity, 1024, false);
        let table = Table::new(capacity, prev_size, StdArc::new(Counter::new(0)), config);
        table.size_counter.exchange(size);
        table.slots_counter.exchange(slots);
        table
    }

    #[test]
    fn prop_resize_ladder_monotonic() {
        // Plain load-factor growth: the ladder never shrinks as `sz` grows,
        // for a fixed capacity and no tombstone pressure.
        let mut prev_cap = 0;
        for sz in [1usize, 2, 4, 8, 12, 16, 24, 40] {
            let table = table_with(16, 999, sz as isize, sz as isize);
            let next = next_capacity(&table);
            assert!(next >= prev_cap, "ladder regressed at sz={sz}: {next} < {prev_cap}");
            assert!(next >= 16, "resize never shrinks below current capacity");
            prev_cap = next;
        }
    }

    #[test]
    fn tomb_heavy_resize_keeps_capacity_when_size_grew_since_last_resize() {
        // slots (10) >= 2 * sz (4), and sz (4) != prev_size (0): same-capacity
        // cleanup, not growth.
        let table = table_with(16, 0, 4, 10);
        assert_eq!(next_capacity(&table), 16);
    }

    #[test]
    fn tomb_heavy_resize_doubles_when_size_is_unchanged_since_last_resize() {
        // slots (10) >= 2 * sz (4), and sz (4) == prev_size (4): a same-size
        // resize would be indistinguishable from the last one, so double.
        let table = table_with(16, 4, 4, 10);
        assert_eq!(next_capacity(&table), 32);
    }

    #[test]
    fn maybe_compact_trigger_matches_next_capacity_threshold() {
        // maybe_compact's own trigger condition (slots >= 2 * sz.max(1)) must
        // be the same threshold next_capacity branches on, or the documented
        // tie-break and the code that invokes it could disagree about when a
        // table is "tomb-heavy".
        let grows = table_with(16, 0, 4, 10);
        assert_eq!(next_capacity(&grows), 16);
        let doubles = table_with(16, 4, 4, 10);
        assert_eq!(next_capacity(&doubles), 32);
        let not_tomb_heavy = table_with(16, 0, 1, 1);
        assert_eq!(next_capacity(&not_tomb_heavy), 16);
    }
}
