//! Concurrent set adapter (C5): the table algorithm with the element stored
//! as both key and value, so [`find`](Set::find)/[`find_or_store`](Set::find_or_store)
//! can hand back the instance actually installed (meaningful for interning
//! `T`s that are `==`-equal but distinct allocations, e.g. `Arc<str>`).

use crate::config::Config;
use crate::dictionary::Dictionary;
use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hash};

pub struct Set<T, S = RandomState> {
    inner: Dictionary<T, T, S>,
}

impl<T> Set<T, RandomState> {
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Self {
        Self {
            inner: Dictionary::with_config(config),
        }
    }
}

impl<T> Default for Set<T, RandomState> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, S> Clone for Set<T, S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T, S> Set<T, S>
where
    T: Hash + Eq + Clone,
    S: BuildHasher,
{
    /// Inserts `e`. Returns `true` if it was newly added.
    pub fn add(&self, e: T) -> bool {
        self.inner.try_add(e.clone(), e).is_ok()
    }

    pub fn contains(&self, e: &T) -> bool {
        self.inner.contains_key(e)
    }

    pub fn remove(&self, e: &T) -> bool {
        self.inner.remove(e).is_some()
    }

    /// Returns the instance of an equal element actually stored, if any.
    pub fn find(&self, e: &T) -> Option<T> {
        self.inner.get(e)
    }

    /// Returns the instance of an equal element actually stored, inserting
    /// `e` first if none exists yet.
    pub fn find_or_store(&self, e: T) -> T {
        self.inner.get_or_add_with(e.clone(), || e.clone())
    }

    /// Removes and returns an arbitrary element, or `None` if empty. Useful
    /// for work-stealing pools that don't care which element they get.
    pub fn try_take(&self) -> Option<T> {
        crate::table::take_any(self.inner().root()).map(|(k, _)| k)
    }

    pub fn clear(&self) {
        self.inner.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity()
    }

    pub fn to_vec(&self) -> Vec<T> {
        let mut out = Vec::with_capacity(self.len());
        self.inner.for_each(|_, v| out.push(v.clone()));
        out
    }

    /// Copies a loosely-consistent snapshot of every element into `dest`,
    /// returning the number written. Fails rather than truncating if `dest`
    /// cannot hold every element observed at the time of the size check.
    pub fn copy_to_slice(&self, dest: &mut [T]) -> Result<usize, crate::error::Error> {
        let required = self.len();
        if dest.len() < required {
            return Err(crate::error::Error::CopyTargetTooSmall { required, actual: dest.len() });
        }
        let mut written = 0;
        self.inner.for_each(|_, v| {
            if written < dest.len() {
                dest[written] = v.clone();
                written += 1;
            }
        });
        Ok(written)
    }

    /// Adds every element of `other` not already present. Not atomic: `other`
    /// is iterated once while concurrent mutation of `self` may interleave.
    pub fn union_with(&self, other: impl IntoIterator<Item = T>) {
        for e in other {
            self.add(e);
        }
    }

    /// Removes every element of `self` not present in `other`.
    pub fn intersect_with(&self, other: &Set<T, S>) {
        let keep: std::collections::HashSet<T> = other.to_vec().into_iter().collect();
        let removed: Vec<T> = self
            .to_vec()
            .into_iter()
            .filter(|e| !keep.contains(e))
            .collect();
        for e in removed {
            self.remove(&e);
        }
    }

    /// Removes every element also present in `other`.
    pub fn except_with(&self, other: impl IntoIterator<Item = T>) {
        for e in other {
            self.remove(&e);
        }
    }

    /// For each element of `other`: removes it if present in `self`, else
    /// adds it.
    pub fn symmetric_except_with(&self, other: impl IntoIterator<Item = T>) {
        for e in other {
            if !self.remove(&e) {
                self.add(e);
            }
        }
    }

    pub fn is_subset_of(&self, other: &Set<T, S>) -> bool {
        if self.len() > other.len() {
            return false;
        }
        self.to_vec().iter().all(|e| other.contains(e))
    }

    pub fn is_superset_of(&self, other: &Set<T, S>) -> bool {
        other.is_subset_of(self)
    }

    pub fn is_proper_subset_of(&self, other: &Set<T, S>) -> bool {
        self.len() < other.len() && self.is_subset_of(other)
    }

    pub fn is_proper_superset_of(&self, other: &Set<T, S>) -> bool {
        other.is_proper_subset_of(self)
    }

    pub fn overlaps(&self, other: &Set<T, S>) -> bool {
        self.to_vec().iter().any(|e| other.contains(e))
    }

    pub fn set_equals(&self, other: &Set<T, S>) -> bool {
        self.len() == other.len() && self.is_subset_of(other)
    }

    /// Lazily inserts each element of `seq`, yielding only the ones newly
    /// added.
    pub fn filter_add<'a, I>(&'a self, seq: I) -> crate::iterators::FilterAdd<'a, I::IntoIter, T, S>
    where
        I: IntoIterator<Item = T>,
    {
        crate::iterators::FilterAdd::new(self, seq.into_iter())
    }

    /// Lazily removes each live element matching `predicate`, yielding it.
    pub fn remove_where<'a, P>(&'a self, predicate: P) -> crate::iterators::RemoveWhere<'a, T, S, P>
    where
        P: FnMut(&T) -> bool,
    {
        crate::iterators::RemoveWhere::new(self, predicate)
    }

    pub(crate) fn inner(&self) -> &Dictionary<T, T, S> {
        &self.inner
    }

    pub(crate) fn compact(&self) {
        self.inner.compact();
    }
}

impl<T, S> std::fmt::Debug for Set<T, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Set").field("len", &self.len()).finish()
    }
}
