use serde::{Deserialize, Serialize};

use crate::vclock::Merge;

/// Soft-deletable container for a metadata entity.
///
/// Records are never removed from the snapshot; dropping an entity leaves a
/// tombstone so that nodes which have not yet seen the drop converge to it
/// on merge. A tombstone always wins a merge.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "entity", rename_all = "snake_case")]
pub enum MetadataRecord<E> {
    Live(E),
    Deleted,
}

impl<E> MetadataRecord<E> {
    pub fn live(entity: E) -> Self {
        Self::Live(entity)
    }

    pub fn is_deleted(&self) -> bool {
        matches!(self, Self::Deleted)
    }

    /// Tombstone the record. Deletion is permanent.
    pub fn mark_deleted(&mut self) {
        *self = Self::Deleted;
    }

    pub fn get(&self) -> Option<&E> {
        match self {
            Self::Live(entity) => Some(entity),
            Self::Deleted => None,
        }
    }

    pub fn get_mut(&mut self) -> Option<&mut E> {
        match self {
            Self::Live(entity) => Some(entity),
            Self::Deleted => None,
        }
    }
}

impl<E: Merge> Merge for MetadataRecord<E> {
    fn merge(&mut self, other: &Self) {
        if other.is_deleted() {
            self.mark_deleted();
            return;
        }
        if let (Self::Live(mine), Self::Live(theirs)) = (self, other) {
            mine.merge(theirs);
        }
    }
}
