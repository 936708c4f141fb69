//! Which entries a major compaction may drop.

use crate::key::{InternalKey, MAX_SEQUENCE_NUMBER, SequenceNumber};

/// Stateful drop decision over a stream in internal-key order.
///
/// For each user key the newest entry is always kept. An older entry is
/// dropped once a newer entry of the same key at or below the oldest live
/// snapshot has been seen: no reader can look past that one. A tombstone
/// at or below the oldest snapshot is dropped too when no deeper level
/// can hold the key, because there is nothing left for it to hide.
#[derive(Debug)]
pub struct CompactionFilter {
    smallest_snapshot: SequenceNumber,
    current_user_key: Option<Vec<u8>>,
    last_sequence_for_key: SequenceNumber,
}

impl CompactionFilter {
    pub fn new(smallest_snapshot: SequenceNumber) -> Self {
        Self {
            smallest_snapshot,
            current_user_key: None,
            last_sequence_for_key: MAX_SEQUENCE_NUMBER,
        }
    }

    /// Decide the fate of `key`. `is_base_level` is consulted only for
    /// tombstones old enough to be dropped.
    pub fn should_drop<F>(&mut self, key: &InternalKey, is_base_level: F) -> bool
    where
        F: FnOnce(&[u8]) -> bool,
    {
        if self.current_user_key.as_deref() != Some(key.user_key()) {
            self.current_user_key = Some(key.user_key().to_vec());
            self.last_sequence_for_key = MAX_SEQUENCE_NUMBER;
        }

        let drop = if self.last_sequence_for_key <= self.smallest_snapshot {
            // Hidden by a newer entry every snapshot can see.
            true
        } else {
            key.is_deletion()
                && key.sequence() <= self.smallest_snapshot
                && is_base_level(key.user_key())
        };

        self.last_sequence_for_key = key.sequence();
        drop
    }
}
