//! Public concurrent dictionary façade (C4) over [`crate::table`].

use crate::config::Config;
use crate::error::Error;
use crate::table::{remove_live, MatchPredicate, PutOutcome, Producer, Root};
use std::collections::hash_map::RandomState;
use std::collections::HashMap;
use std::hash::{BuildHasher, Hash};

/// A lock-free concurrent map.
///
/// Every operation is internally retried on contention and never blocks.
/// Cloning a `Dictionary` is cheap and shares the same underlying table (like
/// `Arc<Mutex<HashMap<_, _>>>`, but lock-free).
pub struct Dictionary<K, V, S = RandomState> {
    root: std::sync::Arc<Root<K, V, S>>,
}

impl<K, V> Dictionary<K, V, RandomState> {
    /// Creates a dictionary with [`Config::default`].
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    /// Creates a dictionary tuned by `config`.
    pub fn with_config(config: Config) -> Self {
        Self {
            root: std::sync::Arc::new(Root::new(config)),
        }
    }
}

impl<K, V> Default for Dictionary<K, V, RandomState> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, S> Clone for Dictionary<K, V, S> {
    fn clone(&self) -> Self {
        Self {
            root: std::sync::Arc::clone(&self.root),
        }
    }
}

impl<K, V, S: BuildHasher> Dictionary<K, V, S> {
    /// Creates a dictionary with a custom hasher and configuration.
    pub fn with_hasher_and_config(config: Config, hasher: S) -> Self {
        Self {
            root: std::sync::Arc::new(Root::with_hasher(config, hasher)),
        }
    }

    pub(crate) fn root(&self) -> &Root<K, V, S> {
        &self.root
    }
}

impl<K, V, S> Dictionary<K, V, S>
where
    K: Hash + Eq + Clone,
    V: Clone,
    S: BuildHasher,
{
    /// Forces a resize check on the current table if it has become
    /// tomb-heavy, without waiting for the next mutation to trigger it.
    pub(crate) fn compact(&self) {
        crate::table::maybe_compact(&self.root);
    }
}

impl<K, V, S> Dictionary<K, V, S>
where
    K: Hash + Eq + Clone,
    V: Clone,
    S: BuildHasher,
{
    /// Returns a clone of the value stored for `key`, if live.
    pub fn get(&self, key: &K) -> Option<V> {
        self.root.get(key)
    }

    /// Like [`get`](Self::get), but returns [`Error::KeyNotFound`] instead of
    /// `None` for callers that want the `?`-propagating shape.
    pub fn get_strict(&self, key: &K) -> Result<V, Error> {
        self.get(key).ok_or(Error::KeyNotFound)
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.root.contains_key(key)
    }

    /// Inserts `(key, value)` only if `key` is absent or tombstoned. On
    /// failure, hands `value` back to the caller.
    pub fn try_add(&self, key: K, value: V) -> Result<(), V> {
        let outcome = self.root.put_if_match(key, MatchPredicate::AbsentOrTomb, Producer::Value(value.clone()));
        match outcome {
            PutOutcome::Installed { .. } => Ok(()),
            PutOutcome::Unchanged(_) => Err(value),
        }
    }

    /// Like [`try_add`](Self::try_add), but returns [`Error::DuplicateKey`]
    /// and never hands the value back (for callers that do not need it).
    pub fn add_strict(&self, key: K, value: V) -> Result<(), Error> {
        if self.contains_key(&key) {
            return Err(Error::DuplicateKey);
        }
        match self.try_add(key, value) {
            Ok(()) => Ok(()),
            Err(_) => Err(Error::DuplicateKey),
        }
    }

    /// Inserts a value computed by `factory` only if `key` is absent.
    /// Returns whether insertion happened.
    pub fn try_add_with(&self, key: K, mut factory: impl FnMut() -> V) -> bool {
        let outcome = self.root.put_if_match(
            key,
            MatchPredicate::AbsentOrTomb,
            Producer::FromFn(&mut |_| factory()),
        );
        matches!(outcome, PutOutcome::Installed { .. })
    }

    /// Replaces the value for `key` with `new` iff the current value equals
    /// `expected`. Returns whether the update happened.
    pub fn update(&self, key: K, new: V, expected: &V) -> bool
    where
        V: PartialEq,
    {
        self.update_by(key, new, |current| current == expected)
    }

    /// Replaces the value for `key` with `new` iff `predicate(current)`.
    pub fn update_by(&self, key: K, new: V, predicate: impl Fn(&V) -> bool) -> bool {
        let outcome = self.root.put_if_match(key, MatchPredicate::Predicate(&predicate), Producer::Value(new));
        matches!(outcome, PutOutcome::Installed { .. })
    }

    /// Inserts `add` if absent, else replaces the current value with
    /// `updater(&key, &current)`. Returns the value now stored.
    pub fn add_or_update(&self, key: K, add: V, mut updater: impl FnMut(&K, &V) -> V) -> V {
        let key_for_updater = key.clone();
        let outcome = self.root.put_if_match(
            key,
            MatchPredicate::Any,
            Producer::FromFn(&mut |current| match current {
                None => add.clone(),
                Some(v) => updater(&key_for_updater, v),
            }),
        );
        match outcome {
            PutOutcome::Installed { new, .. } => new.expect("put_if_match always installs a Live value"),
            PutOutcome::Unchanged(prior) => prior.expect("Any predicate never rejects"),
        }
    }

    /// Like [`add_or_update`](Self::add_or_update), deriving the insert
    /// value lazily via `factory` (invoked only on absence).
    pub fn add_or_update_with(
        &self,
        key: K,
        mut factory: impl FnMut() -> V,
        mut updater: impl FnMut(&K, &V) -> V,
    ) -> V {
        let key_for_updater = key.clone();
        let outcome = self.root.put_if_match(
            key,
            MatchPredicate::Any,
            Producer::FromFn(&mut |current| match current {
                None => factory(),
                Some(v) => updater(&key_for_updater, v),
            }),
        );
        match outcome {
            PutOutcome::Installed { new, .. } => new.expect("put_if_match always installs a Live value"),
            PutOutcome::Unchanged(prior) => prior.expect("Any predicate never rejects"),
        }
    }

    /// Returns the existing value for `key`, or inserts and returns `value`.
    pub fn get_or_add(&self, key: K, value: V) -> V {
        self.get_or_add_with(key, || value.clone())
    }

    /// Like [`get_or_add`](Self::get_or_add), deriving the value lazily.
    /// `factory` may be invoked and discarded if another thread wins the
    /// race to install first.
    pub fn get_or_add_with(&self, key: K, mut factory: impl FnMut() -> V) -> V {
        let outcome = self.root.put_if_match(
            key,
            MatchPredicate::AbsentOrTomb,
            Producer::FromFn(&mut |_| factory()),
        );
        match outcome {
            PutOutcome::Installed { new, .. } => new.expect("put_if_match always installs a Live value"),
            PutOutcome::Unchanged(current) => current.expect("AbsentOrTomb rejection means a Live value exists"),
        }
    }

    /// Removes `key` if live, returning its prior value.
    pub fn remove(&self, key: &K) -> Option<V> {
        remove_live(&self.root, key)
    }

    /// Removes `key` only if its current value equals `value`.
    pub fn remove_if(&self, key: &K, value: &V) -> Option<V>
    where
        V: PartialEq,
    {
        self.remove_if_by(key, |current| current == value)
    }

    /// Removes `key` only if `predicate(current_value)`.
    pub fn remove_if_by(&self, key: &K, predicate: impl Fn(&V) -> bool) -> Option<V> {
        crate::table::remove_if_live(&self.root, key, &predicate)
    }

    /// Replaces the root table with a fresh, empty one at default capacity.
    pub fn clear(&self) {
        self.root.clear();
    }

    /// Approximate logical entry count; the backing counter is weakly consistent under concurrent mutation.
    pub fn len(&self) -> usize {
        self.root.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current root table capacity (a power of two).
    pub fn capacity(&self) -> usize {
        self.root.capacity()
    }

    /// Loosely-consistent snapshot of every currently-live pair.
    pub fn to_snapshot(&self) -> HashMap<K, V>
    where
        K: std::hash::Hash + Eq,
    {
        let mut out = HashMap::with_capacity(self.len());
        self.root.for_each(|k, v| {
            out.insert(k.clone(), v.clone());
        });
        out
    }

    /// Visits every currently-live pair exactly once across the tables
    /// walked during this call. Loosely consistent, not a snapshot.
    pub fn for_each(&self, f: impl FnMut(&K, &V)) {
        self.root.for_each(f);
    }

    /// Returns a lazy iterator over every currently-live pair. Unlike
    /// [`to_snapshot`](Self::to_snapshot), no copy is materialized up front:
    /// each `next()` call walks forward from where the last left off,
    /// helping along any `Primed` slot (mid-resize) it passes through and
    /// skipping tombstoned or dead ones. Loosely consistent, not a snapshot —
    /// concurrent mutation may be observed or missed depending on timing.
    pub fn iter(&self) -> Iter<'_, K, V, S> {
        Iter { dict: self, cursor: self.root.cursor() }
    }

    /// Copies a loosely-consistent snapshot of every live pair into `dest`,
    /// returning the number written. Fails rather than truncating if `dest`
    /// cannot hold every pair observed at the time of the size check.
    pub fn copy_to_slice(&self, dest: &mut [(K, V)]) -> Result<usize, Error> {
        let required = self.len();
        if dest.len() < required {
            return Err(Error::CopyTargetTooSmall { required, actual: dest.len() });
        }
        let mut written = 0;
        self.root.for_each(|k, v| {
            if written < dest.len() {
                dest[written] = (k.clone(), v.clone());
                written += 1;
            }
        });
        Ok(written)
    }
}

impl<K, S> Dictionary<K, i64, S>
where
    K: Hash + Eq + Clone,
    S: BuildHasher,
{
    /// Atomically adds 1 to the value for `key` (defaulting absent to `0`
    /// before incrementing), returning the new value.
    pub fn increment(&self, key: K) -> i64 {
        self.plus(key, 1)
    }

    /// Atomically subtracts 1, returning the new value.
    pub fn decrement(&self, key: K) -> i64 {
        self.plus(key, -1)
    }

    /// Atomically adds `n` (which may be negative), returning the new value.
    pub fn plus(&self, key: K, n: i64) -> i64 {
        self.add_or_update(key, n, |_, current| current + n)
    }
}

impl<K, V, S> std::fmt::Debug for Dictionary<K, V, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dictionary").field("len", &self.root.len()).finish()
    }
}

/// A lazy iterator over a [`Dictionary`]'s live pairs, returned by
/// [`Dictionary::iter`] and `&Dictionary`'s [`IntoIterator`] impl.
pub struct Iter<'a, K, V, S> {
    dict: &'a Dictionary<K, V, S>,
    cursor: crate::table::Cursor<K, V>,
}

impl<'a, K, V, S> Iterator for Iter<'a, K, V, S>
where
    K: Hash + Eq + Clone,
    V: Clone,
    S: BuildHasher,
{
    type Item = (K, V);

    fn next(&mut self) -> Option<(K, V)> {
        self.cursor.advance(self.dict.root())
    }
}

impl<'a, K, V, S> IntoIterator for &'a Dictionary<K, V, S>
where
    K: Hash + Eq + Clone,
    V: Clone,
    S: BuildHasher,
{
    type Item = (K, V);
    type IntoIter = Iter<'a, K, V, S>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_thread_insert_then_lookup_and_enumerate() {
        let d = Dictionary::new();
        d.try_add(1, "a").unwrap();
        d.try_add(2, "b").unwrap();
        d.try_add(3, "c").unwrap();
        assert_eq!(d.get(&2), Some("b"));
        assert_eq!(d.len(), 3);
        let mut seen = Vec::new();
        d.for_each(|k, v| seen.push((*k, *v)));
        seen.sort_unstable();
        assert_eq!(seen, vec![(1, "a"), (2, "b"), (3, "c")]);
    }

    #[test]
    fn iter_visits_every_pair_exactly_once() {
        let d = Dictionary::new();
        for i in 0..10 {
            d.try_add(i, i * i).unwrap();
        }
        let mut seen: Vec<_> = d.iter().collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..10).map(|i| (i, i * i)).collect::<Vec<_>>());
    }

    #[test]
    fn into_iter_on_reference_matches_iter() {
        let d = Dictionary::new();
        d.try_add("a", 1).unwrap();
        d.try_add("b", 2).unwrap();
        let mut via_into_iter: Vec<_> = (&d).into_iter().collect();
        via_into_iter.sort_unstable();
        assert_eq!(via_into_iter, vec![("a", 1), ("b", 2)]);
    }

    #[test]
    fn iter_follows_live_entries_across_a_resize() {
        let d: Dictionary<i32, i32> = Dictionary::with_config(Config::new(2, 1, false));
        for i in 0..50 {
            d.try_add(i, i).unwrap();
        }
        let mut seen: Vec<_> = d.iter().map(|(k, _)| k).collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..50).collect::<Vec<_>>());
    }

    #[test]
    fn insert_then_remove_leaves_key_absent_and_size_unchanged() {
        let d = Dictionary::new();
        d.try_add("k", 1).unwrap();
        let before = d.len();
        assert_eq!(d.remove(&"k"), Some(1));
        assert_eq!(d.get(&"k"), None);
        assert_eq!(d.len(), before - 1);
    }

    #[test]
    fn get_or_add_matches_subsequent_get() {
        let d = Dictionary::new();
        let v = d.get_or_add_with("k", || 42);
        assert_eq!(d.get(&"k"), Some(v));
    }

    #[test]
    fn get_strict_reports_missing_key() {
        let d: Dictionary<i32, i32> = Dictionary::new();
        assert_eq!(d.get_strict(&1), Err(Error::KeyNotFound));
    }

    #[test]
    fn add_strict_rejects_duplicate() {
        let d = Dictionary::new();
        d.add_strict(1, "a").unwrap();
        assert_eq!(d.add_strict(1, "b"), Err(Error::DuplicateKey));
    }

    #[test]
    fn typed_arithmetic_increment_decrement_plus() {
        let d: Dictionary<&str, i64> = Dictionary::new();
        assert_eq!(d.increment("counter"), 1);
        assert_eq!(d.increment("counter"), 2);
        assert_eq!(d.decrement("counter"), 1);
        assert_eq!(d.plus("counter", 10), 11);
    }

    #[test]
    fn snapshot_then_reinsert_preserves_observed_pairs() {
        let d = Dictionary::new();
        for i in 0..10 {
            d.try_add(i, i * i).unwrap();
        }
        let snap = d.to_snapshot();
        let rebuilt = Dictionary::new();
        for (k, v) in &snap {
            rebuilt.try_add(*k, *v).unwrap();
        }
        for (k, v) in &snap {
            assert_eq!(rebuilt.get(k), Some(*v));
        }
    }

    #[test]
    fn copy_to_slice_fills_every_pair_or_reports_too_small() {
        let d = Dictionary::new();
        for i in 0..4 {
            d.try_add(i, i.to_string()).unwrap();
        }
        let mut too_small = vec![(0, String::new()); 2];
        assert_eq!(
            d.copy_to_slice(&mut too_small),
            Err(Error::CopyTargetTooSmall { required: 4, actual: 2 })
        );

        let mut dest = vec![(0, String::new()); 4];
        let written = d.copy_to_slice(&mut dest).unwrap();
        assert_eq!(written, 4);
        dest.sort_unstable();
        assert_eq!(dest, vec![(0, "0".into()), (1, "1".into()), (2, "2".into()), (3, "3".into())]);
    }
}
