//! Read snapshots.

use std::fmt;
use std::sync::Arc;

use tracing::trace;

use super::EngineInner;
use crate::key::SequenceNumber;

/// A consistent point-in-time view of the database.
///
/// Reads through a snapshot see exactly the writes with a sequence number
/// at or below [`Snapshot::sequence`]. While the handle lives, compaction
/// keeps every entry such reads may need. Dropping it releases the view.
pub struct Snapshot {
    sequence: SequenceNumber,
    inner: Arc<EngineInner>,
}

impl Snapshot {
    pub(crate) fn acquire(inner: &Arc<EngineInner>) -> Self {
        let mut state = inner.state.lock();
        let sequence = state.versions.last_sequence();
        *state.snapshots.entry(sequence).or_insert(0) += 1;
        trace!(sequence, "snapshot acquired");
        Self {
            sequence,
            inner: Arc::clone(inner),
        }
    }

    pub fn sequence(&self) -> SequenceNumber {
        self.sequence
    }
}

impl Drop for Snapshot {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock();
        if let Some(count) = state.snapshots.get_mut(&self.sequence) {
            *count -= 1;
            if *count == 0 {
                state.snapshots.remove(&self.sequence);
            }
        }
        trace!(sequence = self.sequence, "snapshot released");
    }
}

impl fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Snapshot")
            .field("sequence", &self.sequence)
            .finish_non_exhaustive()
    }
}
