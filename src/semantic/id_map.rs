//! Ordinal to catalog identifier mapping, built in lockstep with the index.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::catalog::CatalogId;
use crate::semantic::index::Ordinal;

/// An ordinal with no catalog identifier. Means the persisted index and map
/// have diverged; not recoverable.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("ordinal {ordinal} has no catalog id (map holds {len} entries)")]
pub struct UnknownOrdinalError {
    pub ordinal: Ordinal,
    pub len: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdMap {
    ids: Vec<CatalogId>,
}

impl IdMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            ids: Vec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Record catalog ids for freshly assigned ordinals.
    ///
    /// `ordinals` must be the value returned by the matching
    /// `SimilarityIndex::add` call.
    pub fn extend(&mut self, ordinals: &[Ordinal], ids: Vec<CatalogId>) -> Result<(), UnknownOrdinalError> {
        let len = self.ids.len();

        if ordinals.len() != ids.len() {
            return Err(UnknownOrdinalError {
                ordinal: len + ordinals.len().min(ids.len()),
                len,
            });
        }

        if let Some(ordinal) = ordinals
            .iter()
            .enumerate()
            .find_map(|(offset, &ordinal)| (ordinal != len + offset).then_some(ordinal))
        {
            return Err(UnknownOrdinalError { ordinal, len });
        }

        self.ids.extend(ids);
        Ok(())
    }

    pub fn resolve(&self, ordinal: Ordinal) -> Result<&CatalogId, UnknownOrdinalError> {
        self.ids.get(ordinal).ok_or(UnknownOrdinalError {
            ordinal,
            len: self.ids.len(),
        })
    }

    pub fn ids(&self) -> &[CatalogId] {
        &self.ids
    }

    /// First catalog id that appears under more than one ordinal.
    pub fn first_duplicate(&self) -> Option<&CatalogId> {
        let mut seen = HashSet::with_capacity(self.ids.len());
        self.ids.iter().find(|id| !seen.insert(*id))
    }
}

impl From<Vec<CatalogId>> for IdMap {
    fn from(ids: Vec<CatalogId>) -> Self {
        Self { ids }
    }
}
