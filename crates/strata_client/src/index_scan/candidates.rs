//! In-memory candidate accumulation.

use std::collections::BTreeMap;
use std::mem;
use std::sync::Arc;

use bytes::Bytes;

/// What produced a candidate row: the owning column family and the
/// index entry's timestamp. Carried into the staging table on a flush.
#[derive(Debug, Clone)]
pub(crate) struct Candidate {
    pub column_family: Arc<str>,
    pub timestamp: i64,
}

/// Per-candidate bookkeeping overhead charged against the staging
/// cutoff, on top of the row-key bytes.
const CANDIDATE_RECORD_SIZE: usize = mem::size_of::<Bytes>() + mem::size_of::<Candidate>();

/// The buffered candidate store: unique primary row keys in byte
/// order, plus the running size estimate that decides the switch to
/// the staging table.
///
/// Row keys are `Bytes` slices of the index batches they arrived in,
/// so the map itself keeps the source buffers alive until `clear`.
#[derive(Debug, Default)]
pub(crate) struct CandidateSet {
    keys: BTreeMap<Bytes, Candidate>,
    accumulated: usize,
}

impl CandidateSet {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Charge one offered candidate against the cutoff accounting.
    /// Called for every surviving index entry, duplicates included.
    pub(crate) fn account(&mut self, row_len: usize) {
        self.accumulated += row_len + CANDIDATE_RECORD_SIZE;
    }

    /// Insert if the row key is new; returns whether it was.
    pub(crate) fn insert(&mut self, row: Bytes, column_family: Arc<str>, timestamp: i64) -> bool {
        match self.keys.entry(row) {
            std::collections::btree_map::Entry::Vacant(slot) => {
                slot.insert(Candidate {
                    column_family,
                    timestamp,
                });
                true
            }
            std::collections::btree_map::Entry::Occupied(_) => false,
        }
    }

    pub(crate) fn over_cutoff(&self, cutoff: usize) -> bool {
        self.accumulated > cutoff
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.keys.len()
    }

    /// Row keys in byte order.
    pub(crate) fn rows(&self) -> impl Iterator<Item = &Bytes> {
        self.keys.keys()
    }

    /// Take the whole set, leaving it empty; used by the flush to the
    /// staging mutator.
    pub(crate) fn drain(&mut self) -> BTreeMap<Bytes, Candidate> {
        mem::take(&mut self.keys)
    }

    /// Drop all buffered keys, releasing the retained source buffers.
    pub(crate) fn clear(&mut self) {
        self.keys.clear();
    }
}
