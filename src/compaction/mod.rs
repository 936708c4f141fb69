//! # Compaction Module
//!
//! Everything the background worker needs to decide *what* to compact and
//! *which entries survive*; the engine performs the actual table I/O.
//!
//! ## Minor compaction
//!
//! The immutable memtable is written to one table. Nothing is dropped. The
//! table is placed at level 0, or deeper when
//! [`Version::pick_level_for_memtable_output`] allows it.
//!
//! ## Major compaction
//!
//! A [`Compaction`] names the input files of `level` and `level + 1`.
//! Their entries are merged by [`MergingIterator`] and filtered by
//! [`CompactionFilter`]; the survivors are written to new files at
//! `level + 1`, cut at `max_file_size` or earlier when
//! [`Compaction::should_stop_before`] sees too much overlap building up
//! with `level + 2`.
//!
//! A compaction with a single input file and nothing to merge with is a
//! *trivial move*: the file is re-registered one level down without being
//! rewritten.
//!
//! ## Picking
//!
//! The picker lives in [`picker`] as methods on
//! [`VersionSet`](crate::version::VersionSet). Size-triggered compactions
//! take priority over seek-triggered ones; manual range compactions are
//! built by [`VersionSet::compact_range`](crate::version::VersionSet::compact_range).

pub mod filter;
pub mod merge;
pub mod picker;

#[cfg(test)]
mod tests;

use std::sync::Arc;

use crate::engine::EngineConfig;
use crate::key::InternalKey;
use crate::version::{FileMetaData, Version, VersionEdit, total_file_size};

pub use filter::CompactionFilter;
pub use merge::{EntryStream, MergingIterator};

/// One major compaction: inputs, bookkeeping for output cutting, and the
/// edit that will record the result.
#[derive(Debug)]
pub struct Compaction {
    level: usize,
    input_version: Arc<Version>,

    /// `inputs[0]` at `level`, `inputs[1]` at `level + 1`.
    pub(crate) inputs: [Vec<Arc<FileMetaData>>; 2],

    /// Files at `level + 2` overlapping the compaction's key range.
    pub(crate) grandparents: Vec<Arc<FileMetaData>>,

    max_output_file_size: u64,
    max_grandparent_overlap_bytes: u64,
    manual: bool,

    grandparent_index: usize,
    seen_key: bool,
    overlapped_bytes: u64,

    /// Per level, how far `is_base_level_for_key` has scanned. Keys arrive
    /// in increasing order, so the scan never needs to move backwards.
    level_ptrs: Vec<usize>,

    edit: VersionEdit,
}

impl Compaction {
    pub(crate) fn new(config: &EngineConfig, level: usize, input_version: Arc<Version>, manual: bool) -> Self {
        let num_levels = input_version.num_levels();
        Self {
            level,
            input_version,
            inputs: [Vec::new(), Vec::new()],
            grandparents: Vec::new(),
            max_output_file_size: config.max_file_size,
            max_grandparent_overlap_bytes: config.max_grandparent_overlap_bytes,
            manual,
            grandparent_index: 0,
            seen_key: false,
            overlapped_bytes: 0,
            level_ptrs: vec![0; num_levels],
            edit: VersionEdit::new(),
        }
    }

    /// Level whose files are pushed down.
    pub fn level(&self) -> usize {
        self.level
    }

    pub fn output_level(&self) -> usize {
        self.level + 1
    }

    #[cfg(test)]
    pub fn is_manual(&self) -> bool {
        self.manual
    }

    pub fn input_version(&self) -> &Arc<Version> {
        &self.input_version
    }

    /// Input files; `which` is 0 for `level`, 1 for `level + 1`.
    pub fn inputs(&self, which: usize) -> &[Arc<FileMetaData>] {
        &self.inputs[which]
    }

    pub fn max_output_file_size(&self) -> u64 {
        self.max_output_file_size
    }

    pub fn input_bytes(&self) -> u64 {
        total_file_size(&self.inputs[0]) + total_file_size(&self.inputs[1])
    }

    #[cfg(test)]
    pub fn edit(&self) -> &VersionEdit {
        &self.edit
    }

    pub fn edit_mut(&mut self) -> &mut VersionEdit {
        &mut self.edit
    }

    pub fn into_edit(self) -> VersionEdit {
        self.edit
    }

    /// `true` when the single input file can simply be re-registered one
    /// level down.
    ///
    /// Refused when the file would land on top of too much `level + 2`
    /// data: that would only make its eventual merge expensive.
    pub fn is_trivial_move(&self) -> bool {
        !self.manual
            && self.inputs[0].len() == 1
            && self.inputs[1].is_empty()
            && total_file_size(&self.grandparents) <= self.max_grandparent_overlap_bytes
    }

    /// Record the removal of every input file.
    pub fn add_input_deletions(&mut self) {
        for (which, files) in self.inputs.iter().enumerate() {
            for f in files {
                self.edit.delete_file(self.level + which, f.number);
            }
        }
    }

    /// `true` if no level below the output level can hold `user_key`, so a
    /// tombstone for it shadows nothing.
    pub fn is_base_level_for_key(&mut self, user_key: &[u8]) -> bool {
        for lvl in self.level + 2..self.input_version.num_levels() {
            let files = self.input_version.files(lvl);
            while let Some(f) = files.get(self.level_ptrs[lvl]) {
                if user_key <= f.largest.user_key() {
                    if user_key >= f.smallest.user_key() {
                        return false;
                    }
                    break;
                }
                self.level_ptrs[lvl] += 1;
            }
        }
        true
    }

    /// `true` if the current output file should be closed before `key` is
    /// added, because it already overlaps too many `level + 2` bytes.
    pub fn should_stop_before(&mut self, key: &InternalKey) -> bool {
        while let Some(gp) = self.grandparents.get(self.grandparent_index) {
            if *key <= gp.largest {
                break;
            }
            if self.seen_key {
                self.overlapped_bytes += gp.file_size;
            }
            self.grandparent_index += 1;
        }
        self.seen_key = true;

        if self.overlapped_bytes > self.max_grandparent_overlap_bytes {
            self.overlapped_bytes = 0;
            true
        } else {
            false
        }
    }

    /// `"3@0 + 2@1 files"`-style summary for logs.
    pub fn input_summary(&self) -> String {
        format!(
            "{}@{} + {}@{} files",
            self.inputs[0].len(),
            self.level,
            self.inputs[1].len(),
            self.level + 1
        )
    }
}
