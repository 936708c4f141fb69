//! Heap-based k-way merge over sorted entry streams.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::key::{Entry, InternalKey};
use crate::sstable::SSTableError;

/// A sorted stream of entries that may fail mid-way (table reads).
pub type EntryStream = Box<dyn Iterator<Item = Result<Entry, SSTableError>> + Send>;

struct HeapEntry {
    key: InternalKey,
    value: Vec<u8>,
    source: usize,
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Min-heap on internal key; for equal keys the earlier source wins.
        self.key
            .cmp(&other.key)
            .then_with(|| self.source.cmp(&other.source))
            .reverse()
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

/// Merges several internally-sorted [`EntryStream`]s into one stream in
/// internal-key order.
///
/// Sources are listed newest first. The first error from any source is
/// yielded once and ends the merge.
pub struct MergingIterator {
    sources: Vec<EntryStream>,
    heap: BinaryHeap<HeapEntry>,
    pending_error: Option<SSTableError>,
    failed: bool,
}

impl MergingIterator {
    pub fn new(sources: Vec<EntryStream>) -> Self {
        let mut merge = Self {
            heap: BinaryHeap::with_capacity(sources.len()),
            sources,
            pending_error: None,
            failed: false,
        };
        for idx in 0..merge.sources.len() {
            merge.pull(idx);
        }
        merge
    }

    /// Wrap an infallible sorted iterator (a memtable) as a source.
    pub fn infallible<I>(iter: I) -> EntryStream
    where
        I: Iterator<Item = Entry> + Send + 'static,
    {
        Box::new(iter.map(Ok))
    }

    fn pull(&mut self, source: usize) {
        match self.sources[source].next() {
            Some(Ok((key, value))) => self.heap.push(HeapEntry { key, value, source }),
            Some(Err(e)) => {
                if self.pending_error.is_none() {
                    self.pending_error = Some(e);
                }
            }
            None => {}
        }
    }
}

impl Iterator for MergingIterator {
    type Item = Result<Entry, SSTableError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        if let Some(e) = self.pending_error.take() {
            self.failed = true;
            return Some(Err(e));
        }

        let entry = self.heap.pop()?;
        self.pull(entry.source);
        Some(Ok((entry.key, entry.value)))
    }
}
