//! # Memtable
//!
//! The in-memory ordered table that receives every committed write before it
//! reaches disk.
//!
//! Entries are keyed by [`InternalKey`], so one user key may appear several
//! times (one entry per write) and the newest write always sorts first. A
//! memtable is shared through `Arc<MemTable>`: the engine keeps one mutable
//! table plus at most one frozen table awaiting flush, and readers clone the
//! `Arc`s they need before dropping the engine lock.
//!
//! ## Concurrency
//!
//! Only the current writer-queue leader inserts, and it takes the write side
//! of the internal `RwLock` once per batch. Readers only ever take the read
//! side. After the engine freezes a memtable nothing writes to it again.
//!
//! ## Sizing
//!
//! [`MemTable::approximate_memory_usage`] counts key and value bytes plus a
//! fixed per-entry overhead. The engine compares it against the configured
//! write buffer size to decide when to switch to a fresh memtable.

#[cfg(test)]
mod tests;

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::RwLock;
use tracing::trace;

use crate::batch::BatchOp;
use crate::key::{Entry, HexKey, InternalKey, SequenceNumber, ValueType};

/// Bookkeeping bytes charged per entry on top of key and value bytes.
pub const ENTRY_OVERHEAD: usize = 16;

/// Outcome of a point lookup in one layer of the tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupResult {
    /// The newest visible entry is a value.
    Found(Vec<u8>),
    /// The newest visible entry is a tombstone; older layers must not be consulted.
    Deleted,
    /// This layer holds nothing visible for the key.
    NotFound,
}

impl LookupResult {
    /// `true` when the lookup settled the key (value or tombstone).
    pub fn is_resolved(&self) -> bool {
        !matches!(self, LookupResult::NotFound)
    }

    /// Collapse to the user-facing value.
    pub fn into_value(self) -> Option<Vec<u8>> {
        match self {
            LookupResult::Found(v) => Some(v),
            LookupResult::Deleted | LookupResult::NotFound => None,
        }
    }
}

/// In-memory ordered table of internal keys.
#[derive(Default)]
pub struct MemTable {
    table: RwLock<BTreeMap<InternalKey, Vec<u8>>>,
    usage: AtomicUsize,
}

impl std::fmt::Debug for MemTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemTable")
            .field("entries", &self.len())
            .field("usage", &self.approximate_memory_usage())
            .finish()
    }
}

impl MemTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a single entry.
    ///
    /// Sequence numbers are unique, so an insert never replaces an existing
    /// entry.
    pub fn insert(&self, sequence: SequenceNumber, value_type: ValueType, key: &[u8], value: &[u8]) {
        trace!(key = %HexKey(key), sequence, ?value_type, "memtable insert");
        let charge = key.len() + value.len() + ENTRY_OVERHEAD;
        self.table
            .write()
            .insert(InternalKey::new(key, sequence, value_type), value.to_vec());
        self.usage.fetch_add(charge, Ordering::Relaxed);
    }

    /// Insert every operation of a batch, numbering them from `base`.
    ///
    /// The write lock is held once for the whole batch.
    pub(crate) fn insert_batch(&self, base: SequenceNumber, ops: &[BatchOp]) {
        let mut table = self.table.write();
        let mut charge = 0;
        for (i, op) in ops.iter().enumerate() {
            let sequence = base + i as u64;
            let (key, value) = match op {
                BatchOp::Put { key, value } => (key, value.clone()),
                BatchOp::Delete { key } => (key, Vec::new()),
            };
            charge += key.len() + value.len() + ENTRY_OVERHEAD;
            table.insert(InternalKey::new(key.clone(), sequence, op.value_type()), value);
        }
        drop(table);
        self.usage.fetch_add(charge, Ordering::Relaxed);
    }

    /// Newest entry for `user_key` with a sequence number at or below `sequence`.
    pub fn get(&self, user_key: &[u8], sequence: SequenceNumber) -> LookupResult {
        let lookup = InternalKey::for_lookup(user_key, sequence);
        let table = self.table.read();
        match table.range((Bound::Included(lookup), Bound::Unbounded)).next() {
            Some((key, value)) if key.user_key() == user_key => match key.value_type() {
                ValueType::Value => LookupResult::Found(value.clone()),
                ValueType::Deletion => LookupResult::Deleted,
            },
            _ => LookupResult::NotFound,
        }
    }

    /// Ordered copy of every entry.
    ///
    /// The returned iterator owns its data, so it can be restarted by calling
    /// `iter` again and outlives any lock on the table.
    pub fn iter(&self) -> std::vec::IntoIter<Entry> {
        let table = self.table.read();
        table
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect::<Vec<_>>()
            .into_iter()
    }

    /// Ordered copy of every entry whose user key lies in `[start, end)`.
    pub fn range(&self, start: &[u8], end: &[u8]) -> Vec<Entry> {
        let from = InternalKey::for_lookup(start, crate::key::MAX_SEQUENCE_NUMBER);
        let table = self.table.read();
        table
            .range((Bound::Included(from), Bound::Unbounded))
            .take_while(|(k, _)| k.user_key() < end)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Bytes charged to this table so far.
    pub fn approximate_memory_usage(&self) -> usize {
        self.usage.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.table.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.read().is_empty()
    }
}
