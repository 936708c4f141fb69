//! Visibility filter for merged entry streams.
//!
//! [`VisibilityFilter`] wraps a stream sorted in internal-key order
//! (user key ascending, sequence descending) and yields only the
//! **live** key-value pairs a reader at one sequence number should see.

use crate::key::{Entry, SequenceNumber};
use crate::sstable::SSTableError;

/// Filters a sorted entry stream down to what a read at `sequence` sees.
///
/// - Entries newer than `sequence` are invisible.
/// - For each user key only the newest visible entry counts; older ones
///   are skipped.
/// - If that entry is a tombstone the key is hidden.
/// - The stream ends at the first user key `>= end`.
///
/// The input **must** be sorted by internal key, as produced by
/// [`MergingIterator`](crate::compaction::MergingIterator).
pub struct VisibilityFilter<I>
where
    I: Iterator<Item = Result<Entry, SSTableError>>,
{
    /// Underlying merged stream.
    input: I,
    sequence: SequenceNumber,
    end: Vec<u8>,
    /// The user key most recently emitted or suppressed.
    current_key: Option<Vec<u8>>,
    done: bool,
}

impl<I> VisibilityFilter<I>
where
    I: Iterator<Item = Result<Entry, SSTableError>>,
{
    pub fn new(input: I, sequence: SequenceNumber, end: &[u8]) -> Self {
        Self {
            input,
            sequence,
            end: end.to_vec(),
            current_key: None,
            done: false,
        }
    }
}

impl<I> Iterator for VisibilityFilter<I>
where
    I: Iterator<Item = Result<Entry, SSTableError>>,
{
    type Item = Result<(Vec<u8>, Vec<u8>), SSTableError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        for item in self.input.by_ref() {
            let (key, value) = match item {
                Ok(entry) => entry,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            };

            if key.user_key() >= self.end.as_slice() {
                self.done = true;
                return None;
            }
            if key.sequence() > self.sequence {
                continue;
            }
            // Skip if this key was already decided by a newer entry
            if self.current_key.as_deref() == Some(key.user_key()) {
                continue;
            }
            self.current_key = Some(key.user_key().to_vec());

            if key.is_deletion() {
                continue;
            }
            return Some(Ok((key.into_user_key(), value)));
        }

        self.done = true;
        None
    }
}
