//! # Versions
//!
//! A [`Version`] is an immutable snapshot of which table files live at
//! which level. Level 0 files may overlap one another; every deeper level
//! holds disjoint files sorted by smallest key.
//!
//! Versions are shared as `Arc<Version>`. Readers and compactions clone the
//! current `Arc` under the engine lock and then work without it; the
//! [`VersionSet`] keeps superseded versions in its history only while
//! someone still holds them, so their files stay on disk exactly that long.
//!
//! ## Sub-modules
//!
//! - [`edit`]: [`VersionEdit`], the delta recorded in the manifest.
//! - [`builder`]: [`VersionBuilder`], which applies edits to a base version.
//! - [`set`]: [`VersionSet`], the owner of the current version, the manifest
//!   and the file/sequence counters.

pub mod builder;
pub mod edit;
pub mod set;

#[cfg(test)]
mod tests;

pub use builder::VersionBuilder;
pub use edit::{NewFile, VersionEdit};
pub use set::{PendingApply, VersionSet};

use std::collections::HashSet;
use std::fmt::Write as _;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use parking_lot::Mutex;
use thiserror::Error;
use tracing::debug;

use crate::encoding::EncodingError;
use crate::engine::EngineConfig;
use crate::key::{InternalKey, MAX_SEQUENCE_NUMBER, SequenceNumber};
use crate::manifest::ManifestError;
use crate::memtable::LookupResult;
use crate::sstable::{SSTableError, TableCache};

/// Bytes of table data that one wasted seek is worth.
const SEEK_COST_BYTES: u64 = 16 * 1024;

/// Floor on the seek allowance of small files.
const MIN_ALLOWED_SEEKS: i64 = 100;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by version-set operations.
#[derive(Debug, Error)]
pub enum VersionError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Manifest read or write failed.
    #[error("Manifest error: {0}")]
    Manifest(#[from] ManifestError),

    /// Encoding / decoding error.
    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// Persistent state is inconsistent (missing fields or files).
    #[error("Corruption: {0}")]
    Corruption(String),

    /// An edit would break a structural invariant of the tree.
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),
}

// ------------------------------------------------------------------------------------------------
// FileMetaData
// ------------------------------------------------------------------------------------------------

/// One table file as referenced by versions.
#[derive(Debug)]
pub struct FileMetaData {
    pub number: u64,
    pub file_size: u64,
    pub smallest: InternalKey,
    pub largest: InternalKey,

    /// Reads that may still miss in this file before it is compacted.
    allowed_seeks: AtomicI64,
}

impl FileMetaData {
    pub fn new(number: u64, file_size: u64, smallest: InternalKey, largest: InternalKey) -> Self {
        let allowed = i64::try_from(file_size / SEEK_COST_BYTES)
            .unwrap_or(i64::MAX)
            .max(MIN_ALLOWED_SEEKS);
        Self {
            number,
            file_size,
            smallest,
            largest,
            allowed_seeks: AtomicI64::new(allowed),
        }
    }

    pub fn from_new_file(file: &NewFile) -> Self {
        Self::new(
            file.number,
            file.file_size,
            file.smallest.clone(),
            file.largest.clone(),
        )
    }

    #[cfg(test)]
    pub fn allowed_seeks(&self) -> i64 {
        self.allowed_seeks.load(Ordering::Relaxed)
    }

    /// Charge one wasted seek; `true` once the allowance is used up.
    fn charge_seek(&self) -> bool {
        self.allowed_seeks.fetch_sub(1, Ordering::Relaxed) <= 1
    }

    /// `true` if `[smallest, largest]` user-key range intersects `[begin, end]`.
    /// `None` bounds are open.
    fn overlaps_user_range(&self, begin: Option<&[u8]>, end: Option<&[u8]>) -> bool {
        let before = end.is_some_and(|end| end < self.smallest.user_key());
        let after = begin.is_some_and(|begin| begin > self.largest.user_key());
        !before && !after
    }
}

impl PartialEq for FileMetaData {
    fn eq(&self, other: &Self) -> bool {
        self.number == other.number
            && self.file_size == other.file_size
            && self.smallest == other.smallest
            && self.largest == other.largest
    }
}

/// Sum of file sizes.
pub fn total_file_size(files: &[Arc<FileMetaData>]) -> u64 {
    files.iter().map(|f| f.file_size).sum()
}

/// Smallest and largest internal keys spanned by `files`.
pub fn key_range<'a, I>(files: I) -> Option<(InternalKey, InternalKey)>
where
    I: IntoIterator<Item = &'a Arc<FileMetaData>>,
{
    let mut range: Option<(&InternalKey, &InternalKey)> = None;
    for f in files {
        range = Some(match range {
            None => (&f.smallest, &f.largest),
            Some((lo, hi)) => (lo.min(&f.smallest), hi.max(&f.largest)),
        });
    }
    range.map(|(lo, hi)| (lo.clone(), hi.clone()))
}

// ------------------------------------------------------------------------------------------------
// Version
// ------------------------------------------------------------------------------------------------

/// The file consulted first by a read that had to look at a second file.
#[derive(Debug, Clone)]
pub struct SeekCharge {
    pub level: usize,
    pub file: Arc<FileMetaData>,
}

/// Immutable file-to-level assignment.
#[derive(Debug)]
pub struct Version {
    files: Vec<Vec<Arc<FileMetaData>>>,

    /// Highest per-level score; `>= 1.0` means a size compaction is due.
    compaction_score: f64,
    compaction_level: usize,

    /// File whose seek allowance ran out, with its level.
    file_to_compact: Mutex<Option<(usize, Arc<FileMetaData>)>>,
}

impl Version {
    pub fn new(num_levels: usize) -> Self {
        Self {
            files: vec![Vec::new(); num_levels],
            compaction_score: -1.0,
            compaction_level: 0,
            file_to_compact: Mutex::new(None),
        }
    }

    pub(crate) fn from_levels(files: Vec<Vec<Arc<FileMetaData>>>) -> Self {
        Self {
            files,
            compaction_score: -1.0,
            compaction_level: 0,
            file_to_compact: Mutex::new(None),
        }
    }

    pub fn num_levels(&self) -> usize {
        self.files.len()
    }

    pub fn files(&self, level: usize) -> &[Arc<FileMetaData>] {
        &self.files[level]
    }

    pub fn num_files(&self, level: usize) -> usize {
        self.files.get(level).map_or(0, Vec::len)
    }

    pub fn level_bytes(&self, level: usize) -> u64 {
        total_file_size(&self.files[level])
    }

    pub fn compaction_score(&self) -> f64 {
        self.compaction_score
    }

    pub fn compaction_level(&self) -> usize {
        self.compaction_level
    }

    pub fn file_to_compact(&self) -> Option<(usize, Arc<FileMetaData>)> {
        self.file_to_compact.lock().clone()
    }

    /// Work out which level most needs compaction.
    ///
    /// Level 0 scores by file count against the compaction trigger: many
    /// small level-0 files hurt reads because every one is consulted.
    /// Deeper levels score by bytes against their capacity.
    pub fn finalize(&mut self, config: &EngineConfig) {
        let mut best_level = 0;
        let mut best_score = -1.0;
        for level in 0..self.files.len().saturating_sub(1) {
            let score = if level == 0 {
                self.files[0].len() as f64 / config.l0_compaction_trigger as f64
            } else {
                self.level_bytes(level) as f64 / config.max_bytes_for_level(level)
            };
            if score > best_score {
                best_level = level;
                best_score = score;
            }
        }
        self.compaction_level = best_level;
        self.compaction_score = best_score;
    }

    /// Carry an unresolved seek-compaction candidate over from `base`, if
    /// the file survived into this version.
    pub(crate) fn inherit_file_to_compact(&self, base: &Version) {
        if let Some((level, file)) = base.file_to_compact()
            && self.files[level].iter().any(|f| f.number == file.number)
        {
            *self.file_to_compact.lock() = Some((level, file));
        }
    }

    /// Add every file number referenced by this version to `live`.
    pub fn add_live_files(&self, live: &mut HashSet<u64>) {
        for level in &self.files {
            live.extend(level.iter().map(|f| f.number));
        }
    }

    /// Files at `level` whose user-key range intersects `[begin, end]`.
    ///
    /// Level-0 files may overlap one another, so at level 0 the range is
    /// widened to cover every file picked and the search restarts until
    /// it stops growing.
    pub fn overlapping_inputs(
        &self,
        level: usize,
        begin: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> Vec<Arc<FileMetaData>> {
        let mut begin = begin.map(<[u8]>::to_vec);
        let mut end = end.map(<[u8]>::to_vec);
        let mut inputs = Vec::new();

        let mut i = 0;
        while i < self.files[level].len() {
            let file = &self.files[level][i];
            i += 1;
            if !file.overlaps_user_range(begin.as_deref(), end.as_deref()) {
                continue;
            }
            inputs.push(Arc::clone(file));

            if level == 0 {
                let lo = file.smallest.user_key();
                let hi = file.largest.user_key();
                if begin.as_deref().is_some_and(|b| lo < b) {
                    begin = Some(lo.to_vec());
                    inputs.clear();
                    i = 0;
                } else if end.as_deref().is_some_and(|e| hi > e) {
                    end = Some(hi.to_vec());
                    inputs.clear();
                    i = 0;
                }
            }
        }
        inputs
    }

    /// `true` if any file at `level` overlaps the user-key range.
    pub fn overlap_in_level(&self, level: usize, smallest: Option<&[u8]>, largest: Option<&[u8]>) -> bool {
        let files = &self.files[level];
        if level == 0 {
            return files.iter().any(|f| f.overlaps_user_range(smallest, largest));
        }

        // Disjoint and sorted: only the first file ending at or after
        // `smallest` can overlap.
        let idx = match smallest {
            Some(key) => files.partition_point(|f| f.largest.user_key() < key),
            None => 0,
        };
        idx < files.len() && files[idx].overlaps_user_range(smallest, largest)
    }

    /// Level at which a freshly flushed memtable spanning
    /// `[smallest, largest]` should be placed.
    ///
    /// Pushing it below level 0 skips work later, but only while it does
    /// not overlap the next level and its overlap with the level after
    /// that stays small.
    pub fn pick_level_for_memtable_output(
        &self,
        smallest: &[u8],
        largest: &[u8],
        config: &EngineConfig,
    ) -> usize {
        let mut level = 0;
        if self.overlap_in_level(0, Some(smallest), Some(largest)) {
            return level;
        }
        while level < config.max_mem_compact_level && level + 1 < self.files.len() {
            if self.overlap_in_level(level + 1, Some(smallest), Some(largest)) {
                break;
            }
            if level + 2 < self.files.len() {
                let grandparents = self.overlapping_inputs(level + 2, Some(smallest), Some(largest));
                if total_file_size(&grandparents) > config.max_grandparent_overlap_bytes {
                    break;
                }
            }
            level += 1;
        }
        level
    }

    /// Files that may hold `user_key`, in the order a read must consult
    /// them: level-0 files newest first, then at most one file per level.
    fn files_for_key(&self, user_key: &[u8], lookup: &InternalKey) -> Vec<(usize, Arc<FileMetaData>)> {
        let mut candidates: Vec<(usize, Arc<FileMetaData>)> = self.files[0]
            .iter()
            .filter(|f| f.overlaps_user_range(Some(user_key), Some(user_key)))
            .map(|f| (0, Arc::clone(f)))
            .collect();
        candidates.sort_by(|a, b| b.1.number.cmp(&a.1.number));

        for (level, files) in self.files.iter().enumerate().skip(1) {
            let idx = files.partition_point(|f| f.largest < *lookup);
            if let Some(file) = files.get(idx)
                && file.smallest.user_key() <= user_key
            {
                candidates.push((level, Arc::clone(file)));
            }
        }
        candidates
    }

    /// Newest entry for `user_key` visible at `sequence` in the table files.
    ///
    /// Also returns the seek charge the caller should feed back through
    /// [`Version::update_stats`], if the read consulted more than one file.
    pub fn get(
        &self,
        user_key: &[u8],
        sequence: SequenceNumber,
        cache: &TableCache,
    ) -> Result<(LookupResult, Option<SeekCharge>), SSTableError> {
        let lookup = InternalKey::for_lookup(user_key, sequence);
        let mut charge = None;
        let mut last_read: Option<SeekCharge> = None;

        for (level, file) in self.files_for_key(user_key, &lookup) {
            if charge.is_none() {
                charge = last_read.take();
            }
            last_read = Some(SeekCharge {
                level,
                file: Arc::clone(&file),
            });

            match cache.lookup(file.number, user_key, sequence)? {
                LookupResult::NotFound => {}
                resolved => return Ok((resolved, charge)),
            }
        }
        Ok((LookupResult::NotFound, charge))
    }

    /// Apply a seek charge; `true` if a seek compaction became due.
    pub fn update_stats(&self, charge: SeekCharge) -> bool {
        if charge.file.charge_seek() {
            let mut slot = self.file_to_compact.lock();
            if slot.is_none() {
                debug!(file = charge.file.number, level = charge.level, "seek compaction due");
                *slot = Some((charge.level, charge.file));
                return true;
            }
        }
        false
    }

    /// Files of every level that may hold keys in `[start, end)`, newest
    /// level first.
    pub fn files_for_range(&self, start: &[u8], end: &[u8]) -> Vec<Arc<FileMetaData>> {
        let mut out = Vec::new();
        for level in 0..self.files.len() {
            out.extend(
                self.overlapping_inputs(level, Some(start), Some(end))
                    .into_iter()
                    .filter(|f| f.smallest.user_key() < end),
            );
        }
        out
    }

    /// One-line file count per level, e.g. `files[ 3 1 0 0 0 0 0 ]`.
    pub fn level_summary(&self) -> String {
        let mut s = String::from("files[");
        for level in &self.files {
            let _ = write!(s, " {}", level.len());
        }
        s.push_str(" ]");
        s
    }

    /// Snapshot edit that recreates this version's file set from nothing.
    pub(crate) fn snapshot_files(&self, edit: &mut VersionEdit) {
        for (level, files) in self.files.iter().enumerate() {
            for f in files {
                edit.add_file(level, f.number, f.file_size, f.smallest.clone(), f.largest.clone());
            }
        }
    }
}

/// Lookup key that sorts before every entry of `user_key`.
pub(crate) fn range_start_key(user_key: &[u8]) -> InternalKey {
    InternalKey::for_lookup(user_key, MAX_SEQUENCE_NUMBER)
}
