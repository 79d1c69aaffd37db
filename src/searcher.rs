//! Predicate lookups over an id → [`MetadataRecord`] map.
//!
//! Tombstoned records never match. A name predicate never matches an entity
//! whose name is in conflict, so conflicted entities take no part in
//! uniqueness checks; a parent-only predicate ignores the name entirely.

use uuid::Uuid;

use crate::metadata::{
    DatabaseMeta, DatacenterMeta, MachineMeta, Name, NamespaceMeta, RecordMap,
};
use crate::vclock::Versioned;

/// Entities that can be looked up by name and, optionally, parent id.
pub trait Searchable {
    fn name(&self) -> &Versioned<Name>;

    fn parent(&self) -> Option<Uuid> {
        None
    }
}

impl Searchable for DatabaseMeta {
    fn name(&self) -> &Versioned<Name> {
        &self.name
    }
}

impl Searchable for DatacenterMeta {
    fn name(&self) -> &Versioned<Name> {
        &self.name
    }
}

impl Searchable for MachineMeta {
    fn name(&self) -> &Versioned<Name> {
        &self.name
    }
}

impl Searchable for NamespaceMeta {
    fn name(&self) -> &Versioned<Name> {
        &self.name
    }

    fn parent(&self) -> Option<Uuid> {
        Some(self.database)
    }
}

#[derive(Clone, Copy, Debug)]
pub enum Predicate<'a> {
    Any,
    Name(&'a Name),
    Parent(Uuid),
    NameAndParent(&'a Name, Uuid),
}

impl Predicate<'_> {
    pub fn matches<E: Searchable>(&self, entity: &E) -> bool {
        let named = |name: &Name| entity.name().get() == Some(name);
        match *self {
            Predicate::Any => true,
            Predicate::Name(name) => named(name),
            Predicate::Parent(parent) => entity.parent() == Some(parent),
            Predicate::NameAndParent(name, parent) => {
                entity.parent() == Some(parent) && named(name)
            }
        }
    }
}

/// Outcome of a uniqueness lookup.
#[derive(Debug, PartialEq, Eq)]
pub enum Lookup<T> {
    Found(T),
    NotFound,
    Ambiguous,
}

impl<T> Lookup<T> {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Lookup::NotFound)
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Lookup<U> {
        match self {
            Lookup::Found(found) => Lookup::Found(f(found)),
            Lookup::NotFound => Lookup::NotFound,
            Lookup::Ambiguous => Lookup::Ambiguous,
        }
    }
}

pub struct MetadataSearcher<'a, E> {
    records: &'a RecordMap<E>,
}

impl<'a, E: Searchable> MetadataSearcher<'a, E> {
    pub fn new(records: &'a RecordMap<E>) -> Self {
        Self { records }
    }

    /// Alive entities matching `pred`, in id order.
    pub fn find_all<'p>(&self, pred: Predicate<'p>) -> impl Iterator<Item = (Uuid, &'a E)> {
        self.records.iter().filter_map(move |(id, record)| {
            record
                .get()
                .filter(|entity| pred.matches(*entity))
                .map(|entity| (*id, entity))
        })
    }

    pub fn find_unique(&self, pred: Predicate<'_>) -> Lookup<(Uuid, &'a E)> {
        let mut matches = self.find_all(pred);
        match (matches.next(), matches.next()) {
            (None, _) => Lookup::NotFound,
            (Some(found), None) => Lookup::Found(found),
            (Some(_), Some(_)) => Lookup::Ambiguous,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::any_datacenter;
    use crate::record::MetadataRecord;
    use crate::vclock::Merge;
    use std::collections::BTreeMap;

    fn name(raw: &str) -> Name {
        Name::new(raw).unwrap()
    }

    #[test]
    fn find_unique_reports_found_missing_and_ambiguous() {
        let w = Uuid::new_v4();
        let mut dbs: RecordMap<DatabaseMeta> = BTreeMap::new();
        let a = Uuid::new_v4();
        dbs.insert(a, MetadataRecord::live(DatabaseMeta::new(name("a"), w)));
        dbs.insert(Uuid::new_v4(), MetadataRecord::live(DatabaseMeta::new(name("b"), w)));
        dbs.insert(Uuid::new_v4(), MetadataRecord::live(DatabaseMeta::new(name("b"), w)));

        let searcher = MetadataSearcher::new(&dbs);
        let target = name("a");
        match searcher.find_unique(Predicate::Name(&target)) {
            Lookup::Found((id, _)) => assert_eq!(id, a),
            other => panic!("unexpected {other:?}"),
        }
        assert!(searcher.find_unique(Predicate::Name(&name("zzz"))).is_not_found());
        assert_eq!(
            searcher.find_unique(Predicate::Name(&name("b"))),
            Lookup::Ambiguous
        );
        assert_eq!(searcher.find_all(Predicate::Any).count(), 3);
    }

    #[test]
    fn tombstones_and_conflicts_are_invisible_to_name_lookups() {
        let (w1, w2) = (Uuid::new_v4(), Uuid::new_v4());
        let db = Uuid::new_v4();
        let mut tables: RecordMap<NamespaceMeta> = BTreeMap::new();

        let dropped = Uuid::new_v4();
        let mut record =
            MetadataRecord::live(NamespaceMeta::new(w1, db, any_datacenter(), name("t"), "id"));
        record.mark_deleted();
        tables.insert(dropped, record);

        let base = NamespaceMeta::new(w1, db, any_datacenter(), name("c"), "id");
        let mut left = base.clone();
        left.name.set(name("c1"), w1);
        let mut right = base;
        right.name.set(name("c2"), w2);
        left.merge(&right);
        let conflicted = Uuid::new_v4();
        tables.insert(conflicted, MetadataRecord::live(left));

        let searcher = MetadataSearcher::new(&tables);
        assert!(searcher
            .find_unique(Predicate::NameAndParent(&name("t"), db))
            .is_not_found());
        assert!(searcher
            .find_unique(Predicate::NameAndParent(&name("c1"), db))
            .is_not_found());

        // Parent lookups still see the conflicted table so cascades reach it.
        let children: Vec<Uuid> = searcher
            .find_all(Predicate::Parent(db))
            .map(|(id, _)| id)
            .collect();
        assert_eq!(children, vec![conflicted]);
        assert_eq!(searcher.find_all(Predicate::Parent(Uuid::new_v4())).count(), 0);
    }
}
