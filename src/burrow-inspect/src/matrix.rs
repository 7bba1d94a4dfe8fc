//! Sparse symmetric co-occurrence matrix keyed by interned session ids.

use std::collections::HashMap;
use std::mem::size_of;

use crate::overlap::OverlapKernel;
use crate::session::{SessionId, SessionIndex, TimestampStore};

/// Upper-triangular sparse matrix of pairwise overlap totals.
///
/// Stored cells always satisfy `i < j` and `total > 0`; symmetry holds by
/// construction because only the canonical orientation is stored and reads
/// normalise their argument order. Absent cells read as 0.
#[derive(Debug, Clone, Default)]
pub struct CoOccurrence {
    data: HashMap<u64, HashMap<u64, u64>>,
    index: SessionIndex,
}

impl CoOccurrence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a matrix by applying `kernel` to every unordered session pair
    /// in `store`. Sessions are registered in lexicographic order so the
    /// canonical id order matches the session-id order.
    pub fn build(store: &TimestampStore, kernel: &dyn OverlapKernel) -> Self {
        let mut matrix = Self::new();
        let mut sids: Vec<&SessionId> = store.iter().map(|(sid, _)| sid).collect();
        sids.sort_unstable();

        for sid in &sids {
            matrix.add_session(sid);
        }
        for (i, a) in sids.iter().enumerate() {
            let Some(times_a) = store.get(a) else { continue };
            for b in &sids[i + 1..] {
                let Some(times_b) = store.get(b) else { continue };
                let total = kernel.overlap(times_a, times_b);
                matrix.set(a, b, total);
            }
        }
        matrix
    }

    /// Register a session row even if it never overlaps anything, so it
    /// still appears in the persisted matrix. Returns its id.
    pub fn add_session(&mut self, sid: &SessionId) -> u64 {
        let cid = self.index.intern(sid);
        self.data.entry(cid).or_default();
        cid
    }

    /// Record `total` for the unordered pair, overwriting any previous
    /// value. Self-pairs and zero totals are not stored.
    pub fn set(&mut self, a: &SessionId, b: &SessionId, total: u64) {
        if a == b || total == 0 {
            return;
        }
        let ca = self.index.intern(a);
        let cb = self.index.intern(b);
        let (i, j) = if ca < cb { (ca, cb) } else { (cb, ca) };
        self.data.entry(i).or_default().insert(j, total);
    }

    /// Total for the unordered pair; unknown sessions and absent cells read
    /// as 0.
    pub fn get(&self, a: &SessionId, b: &SessionId) -> u64 {
        let (Some(ca), Some(cb)) = (self.index.get(a), self.index.get(b)) else {
            return 0;
        };
        if ca == cb {
            return 0;
        }
        let (i, j) = if ca < cb { (ca, cb) } else { (cb, ca) };
        self.data
            .get(&i)
            .and_then(|inner| inner.get(&j))
            .copied()
            .unwrap_or(0)
    }

    /// The session id ↔ matrix id mapping.
    pub fn index(&self) -> &SessionIndex {
        &self.index
    }

    /// Flat enumeration of stored cells as `(i, j, total)`.
    pub fn cells(&self) -> impl Iterator<Item = (u64, u64, u64)> + '_ {
        self.data.iter().flat_map(|(&i, inner)| {
            inner.iter().map(move |(&j, &total)| (i, j, total))
        })
    }

    /// All stored totals (every one is non-zero).
    pub fn non_zero_totals(&self) -> impl Iterator<Item = u64> + '_ {
        self.data.values().flat_map(|inner| inner.values().copied())
    }

    /// Number of stored cells.
    pub fn len(&self) -> usize {
        self.data.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Byte sizes of `(data, id mapping)`: one key per outer row plus a
    /// key/value pair per cell, and per mapping entry the session-id string
    /// length plus its id.
    pub fn memory_size(&self) -> (u64, u64) {
        let cell = size_of::<u64>() as u64;
        let mut data_size = 0u64;
        for inner in self.data.values() {
            data_size += cell + inner.len() as u64 * 2 * cell;
        }
        let mut id_size = 0u64;
        for (sid, _) in self.index.iter() {
            id_size += sid.as_str().len() as u64 + cell;
        }
        (data_size, id_size)
    }

    pub(crate) fn from_parts(data: HashMap<u64, HashMap<u64, u64>>, index: SessionIndex) -> Self {
        Self { data, index }
    }

    pub(crate) fn data(&self) -> &HashMap<u64, HashMap<u64, u64>> {
        &self.data
    }
}
