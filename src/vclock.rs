//! Version vectors and versioned values.
//!
//! Every piece of cluster metadata that more than one node may edit is stored
//! as a [`Versioned`] value: the set of maximal `(value, clock)` versions seen
//! so far. Merging two versioned values unions their versions and discards the
//! ones strictly dominated by another, which makes [`Merge::merge`]
//! commutative, associative and idempotent.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity of a writer in a [`VectorClock`]. Writers are cluster machines.
pub type WriterId = Uuid;

/// Join-semilattice merge used to reconcile concurrently edited metadata.
pub trait Merge {
    /// Fold `other` into `self`.
    fn merge(&mut self, other: &Self);
}

/// Per-writer version counters.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VectorClock {
    counters: BTreeMap<WriterId, u64>,
}

impl VectorClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counter recorded for `writer` (zero when the writer never wrote).
    pub fn get(&self, writer: &WriterId) -> u64 {
        self.counters.get(writer).copied().unwrap_or(0)
    }

    /// Record one more write by `writer`.
    pub fn increment(&mut self, writer: WriterId) {
        *self.counters.entry(writer).or_insert(0) += 1;
    }

    /// Pointwise maximum of both clocks.
    pub fn join(&self, other: &Self) -> Self {
        let mut counters = self.counters.clone();
        for (writer, count) in &other.counters {
            let entry = counters.entry(*writer).or_insert(0);
            *entry = (*entry).max(*count);
        }
        Self { counters }
    }

    /// Causal comparison. `None` means the clocks are concurrent.
    pub fn causal_cmp(&self, other: &Self) -> Option<Ordering> {
        let mut less = false;
        let mut greater = false;
        for writer in self.counters.keys().chain(other.counters.keys()) {
            match self.get(writer).cmp(&other.get(writer)) {
                Ordering::Less => less = true,
                Ordering::Greater => greater = true,
                Ordering::Equal => {}
            }
            if less && greater {
                return None;
            }
        }
        match (less, greater) {
            (false, false) => Some(Ordering::Equal),
            (true, false) => Some(Ordering::Less),
            (false, true) => Some(Ordering::Greater),
            (true, true) => None,
        }
    }

    /// True when `self` strictly supersedes `other`.
    pub fn dominates(&self, other: &Self) -> bool {
        self.causal_cmp(other) == Some(Ordering::Greater)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
struct Version<T> {
    clock: VectorClock,
    value: T,
}

/// Resolution state of a [`Versioned`] value.
#[derive(Debug, PartialEq, Eq)]
pub enum VersionState<'a, T> {
    Resolved(&'a T),
    /// Concurrent writes left different values; ordered by clock.
    Conflicted(Vec<&'a T>),
}

/// A value annotated with the version history of its writers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Versioned<T> {
    versions: Vec<Version<T>>,
}

impl<T: Clone + Ord> Versioned<T> {
    /// A fresh value written once by `writer`.
    pub fn new(value: T, writer: WriterId) -> Self {
        let mut clock = VectorClock::new();
        clock.increment(writer);
        Self {
            versions: vec![Version { clock, value }],
        }
    }

    pub fn state(&self) -> VersionState<'_, T> {
        match self.versions.split_first() {
            Some((first, rest)) if rest.iter().all(|v| v.value == first.value) => {
                VersionState::Resolved(&first.value)
            }
            _ => VersionState::Conflicted(self.versions.iter().map(|v| &v.value).collect()),
        }
    }

    /// The value, unless concurrent writes left it in conflict.
    pub fn get(&self) -> Option<&T> {
        match self.state() {
            VersionState::Resolved(value) => Some(value),
            VersionState::Conflicted(_) => None,
        }
    }

    pub fn in_conflict(&self) -> bool {
        self.get().is_none()
    }

    /// Join of every version clock currently held.
    pub fn clock(&self) -> VectorClock {
        self.versions
            .iter()
            .fold(VectorClock::new(), |acc, v| acc.join(&v.clock))
    }

    /// Overwrite with a version that dominates everything seen so far.
    ///
    /// This is also how a conflict is resolved.
    pub fn set(&mut self, value: T, writer: WriterId) {
        let mut clock = self.clock();
        clock.increment(writer);
        self.versions = vec![Version { clock, value }];
    }

    fn normalize(&mut self) {
        let versions = std::mem::take(&mut self.versions);
        let mut kept: Vec<Version<T>> = versions
            .iter()
            .filter(|v| !versions.iter().any(|o| o.clock.dominates(&v.clock)))
            .cloned()
            .collect();
        kept.sort();
        kept.dedup();
        self.versions = kept;
    }
}

impl<T: Clone + Ord> Merge for Versioned<T> {
    fn merge(&mut self, other: &Self) {
        self.versions.extend(other.versions.iter().cloned());
        self.normalize();
    }
}
