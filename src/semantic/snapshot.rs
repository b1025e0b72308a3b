//! Immutable index snapshots and the handle that publishes them.
//!
//! Queries clone the current `Arc` and drop the lock right away, so a
//! rebuild never blocks readers and readers never see a half-built index.
//! Publishing a new snapshot is a pointer swap.

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use rusty_ulid::Ulid;

use crate::catalog::CatalogId;
use crate::semantic::id_map::{IdMap, UnknownOrdinalError};
use crate::semantic::index::{IndexError, SearchHit, SimilarityIndex};
use crate::semantic::normalize::UnitVector;

/// Identifies one index build. Written into both halves of a persisted pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildTag(Ulid);

impl BuildTag {
    pub fn generate() -> Self {
        Self(Ulid::generate())
    }

    pub fn from_u128(value: u128) -> Self {
        Self(Ulid::from(value))
    }

    pub fn as_u128(&self) -> u128 {
        u128::from(self.0)
    }

    pub fn built_at(&self) -> DateTime<Utc> {
        self.0.datetime()
    }
}

impl fmt::Display for BuildTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for BuildTag {
    type Err = rusty_ulid::DecodingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ulid::from_str(s).map(Self)
    }
}

/// A similarity index and its id map. Never mutated once published.
#[derive(Debug, Clone)]
pub struct IndexSnapshot {
    pub index: SimilarityIndex,
    pub id_map: IdMap,
    pub build_tag: BuildTag,
}

/// Errors raised while assembling a snapshot.
#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error(transparent)]
    Index(#[from] IndexError),

    #[error(transparent)]
    IdMap(#[from] UnknownOrdinalError),
}

impl IndexSnapshot {
    pub fn empty(dimensions: usize) -> Self {
        Self {
            index: SimilarityIndex::new(dimensions),
            id_map: IdMap::new(),
            build_tag: BuildTag::generate(),
        }
    }

    /// Build a snapshot from (id, vector) pairs, adding to the index and the
    /// id map in lockstep.
    pub fn from_entries(
        dimensions: usize,
        entries: Vec<(CatalogId, UnitVector)>,
    ) -> Result<Self, SnapshotError> {
        let mut snapshot = Self::empty(dimensions);
        snapshot.append_in_place(entries)?;
        Ok(snapshot)
    }

    /// Copy of this snapshot with `entries` appended under a fresh build tag.
    /// The receiver is left untouched.
    pub fn appended(&self, entries: Vec<(CatalogId, UnitVector)>) -> Result<Self, SnapshotError> {
        let mut next = self.clone();
        next.append_in_place(entries)?;
        next.build_tag = BuildTag::generate();
        Ok(next)
    }

    fn append_in_place(&mut self, entries: Vec<(CatalogId, UnitVector)>) -> Result<(), SnapshotError> {
        let (ids, vectors): (Vec<_>, Vec<_>) = entries.into_iter().unzip();
        let ordinals = self.index.add(vectors)?;
        self.id_map.extend(&ordinals, ids)?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn search(&self, query: &UnitVector, k: usize) -> Result<Vec<SearchHit>, IndexError> {
        self.index.search(query, k)
    }

    pub fn resolve(&self, hit: &SearchHit) -> Result<&CatalogId, UnknownOrdinalError> {
        self.id_map.resolve(hit.ordinal)
    }
}

/// Shared, swappable reference to the snapshot currently being served.
#[derive(Default)]
pub struct SnapshotHandle {
    current: RwLock<Option<Arc<IndexSnapshot>>>,
}

impl SnapshotHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_snapshot(snapshot: IndexSnapshot) -> Self {
        Self {
            current: RwLock::new(Some(Arc::new(snapshot))),
        }
    }

    /// Snapshot in service, if any has been published.
    pub fn current(&self) -> Option<Arc<IndexSnapshot>> {
        match self.current.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Publish `snapshot`, returning the one it replaced.
    pub fn publish(&self, snapshot: IndexSnapshot) -> Option<Arc<IndexSnapshot>> {
        let next = Some(Arc::new(snapshot));
        match self.current.write() {
            Ok(mut guard) => std::mem::replace(&mut *guard, next),
            Err(poisoned) => std::mem::replace(&mut *poisoned.into_inner(), next),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::semantic::normalize::normalize;

    fn entry(id: &str, v: &[f32]) -> (CatalogId, UnitVector) {
        (CatalogId::from(id), normalize(v).unwrap())
    }

    #[test]
    fn test_build_tag_string_round_trip() {
        let tag = BuildTag::generate();
        let parsed: BuildTag = tag.to_string().parse().unwrap();
        assert_eq!(parsed, tag);
        assert_eq!(BuildTag::from_u128(tag.as_u128()), tag);
    }

    #[test]
    fn test_from_entries_keeps_index_and_map_in_lockstep() {
        let snapshot = IndexSnapshot::from_entries(
            2,
            vec![entry("a", &[1.0, 0.0]), entry("b", &[0.0, 1.0])],
        )
        .unwrap();

        assert_eq!(snapshot.index.len(), snapshot.id_map.len());
        let hits = snapshot.search(&normalize(&[0.0, 1.0]).unwrap(), 1).unwrap();
        assert_eq!(snapshot.resolve(&hits[0]).unwrap().as_str(), "b");
    }

    #[test]
    fn test_from_entries_dimension_mismatch_leaves_nothing() {
        let result = IndexSnapshot::from_entries(2, vec![entry("a", &[1.0, 0.0, 0.0])]);
        assert!(matches!(result, Err(SnapshotError::Index(IndexError::DimensionMismatch { .. }))));
    }

    #[test]
    fn test_appended_does_not_touch_original() {
        let base = IndexSnapshot::from_entries(2, vec![entry("a", &[1.0, 0.0])]).unwrap();
        let next = base.appended(vec![entry("b", &[0.0, 1.0])]).unwrap();

        assert_eq!(base.len(), 1);
        assert_eq!(next.len(), 2);
        assert_ne!(base.build_tag, next.build_tag);
        assert_eq!(next.id_map.resolve(1).unwrap().as_str(), "b");
    }

    #[test]
    fn test_publish_swaps_and_readers_keep_old_arc() {
        let handle = SnapshotHandle::new();
        assert!(handle.current().is_none());

        let first = IndexSnapshot::from_entries(2, vec![entry("a", &[1.0, 0.0])]).unwrap();
        let first_tag = first.build_tag;
        handle.publish(first);

        let reader = handle.current().unwrap();

        let second = IndexSnapshot::from_entries(
            2,
            vec![entry("a", &[1.0, 0.0]), entry("b", &[0.0, 1.0])],
        )
        .unwrap();
        let replaced = handle.publish(second).unwrap();

        assert_eq!(replaced.build_tag, first_tag);
        assert_eq!(reader.len(), 1);
        assert_eq!(handle.current().unwrap().len(), 2);
    }
}
