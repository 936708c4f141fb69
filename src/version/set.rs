//! The version set: current version, manifest and counters.
//!
//! ## Applying an edit
//!
//! [`VersionSet::log_and_apply`] runs in three steps so the engine can drop
//! its lock during manifest I/O:
//!
//! 1. [`VersionSet::begin_apply`] fills in the edit's log and counter fields,
//!    builds and scores the next version. Needs `&mut self`.
//! 2. [`PendingApply::persist`] appends the edit to the manifest, first
//!    creating a new manifest holding a snapshot of the whole tree when
//!    none is open. Touches only the filesystem.
//! 3. [`VersionSet::finish_apply`] installs the new version on success or
//!    throws it away on failure. Needs `&mut self`.
//!
//! Only one apply may be in flight at a time. The engine guarantees this
//! because edits come from open, recovery and the single background worker.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::{Version, VersionBuilder, VersionEdit, VersionError};
use crate::engine::EngineConfig;
use crate::filename::{manifest_file_name, table_file_name};
use crate::key::{InternalKey, SequenceNumber};
use crate::manifest::{ManifestWriter, read_current_file, read_manifest, set_current_file};

/// An edit that has been validated and built but not yet made durable.
#[derive(Debug)]
pub struct PendingApply {
    edit: VersionEdit,
    version: Version,

    /// Open manifest, or `None` when `persist` must start a new one.
    writer: Option<ManifestWriter>,

    /// Full-state record written first into a new manifest.
    snapshot: Option<VersionEdit>,

    manifest_number: u64,
    fresh_manifest: bool,
}

impl PendingApply {
    /// Make the edit durable.
    ///
    /// A new manifest only becomes live once `CURRENT` names it; if any
    /// step before that fails the half-written manifest is removed.
    pub fn persist(&mut self, dir: &Path) -> Result<(), VersionError> {
        let result = self.append_records(dir).and_then(|()| {
            if self.fresh_manifest {
                set_current_file(dir, self.manifest_number)?;
            }
            Ok(())
        });

        if result.is_err() && self.fresh_manifest {
            self.writer = None;
            let path = manifest_file_name(dir, self.manifest_number);
            if let Err(e) = fs::remove_file(&path) {
                warn!(path = %path.display(), error = %e, "failed to remove abandoned manifest");
            }
        }
        result
    }

    fn append_records(&mut self, dir: &Path) -> Result<(), VersionError> {
        let writer = match self.writer.take() {
            Some(writer) => writer,
            None => {
                info!(manifest = self.manifest_number, "creating manifest");
                ManifestWriter::create(dir, self.manifest_number)?
            }
        };
        let writer = self.writer.insert(writer);
        if let Some(snapshot) = self.snapshot.take() {
            writer.append(&snapshot)?;
        }
        writer.append(&self.edit)?;
        Ok(())
    }
}

/// Owner of the current [`Version`], the older versions still in use, the
/// manifest and the file-number and sequence counters.
#[derive(Debug)]
pub struct VersionSet {
    dir: PathBuf,
    pub(crate) config: EngineConfig,

    current: Arc<Version>,

    /// Superseded versions that may still be referenced elsewhere.
    history: Vec<Arc<Version>>,

    next_file_number: u64,
    manifest_file_number: u64,
    last_sequence: SequenceNumber,
    log_number: u64,
    prev_log_number: u64,

    /// Per level: largest key of the last size compaction started there.
    pub(crate) compaction_pointers: Vec<Option<InternalKey>>,

    manifest: Option<ManifestWriter>,
}

impl VersionSet {
    /// An empty set; call [`VersionSet::recover`] to load state from disk.
    pub fn new(dir: impl Into<PathBuf>, config: EngineConfig) -> Self {
        let num_levels = config.num_levels;
        Self {
            dir: dir.into(),
            config,
            current: Arc::new(Version::new(num_levels)),
            history: Vec::new(),
            next_file_number: 2,
            manifest_file_number: 0,
            last_sequence: 0,
            log_number: 0,
            prev_log_number: 0,
            compaction_pointers: vec![None; num_levels],
            manifest: None,
        }
    }

    /// Write the initial manifest and `CURRENT` of an empty database.
    pub fn create_new_db(dir: &Path) -> Result<(), VersionError> {
        const FIRST_MANIFEST: u64 = 1;

        let mut edit = VersionEdit::new();
        edit.set_log_number(0);
        edit.set_next_file_number(FIRST_MANIFEST + 1);
        edit.set_last_sequence(0);

        let result = ManifestWriter::create(dir, FIRST_MANIFEST)
            .and_then(|mut writer| writer.append(&edit))
            .and_then(|()| set_current_file(dir, FIRST_MANIFEST));
        if let Err(e) = result {
            let _ = fs::remove_file(manifest_file_name(dir, FIRST_MANIFEST));
            return Err(e.into());
        }
        info!(dir = %dir.display(), "created new database");
        Ok(())
    }

    /// Rebuild state by replaying the manifest `CURRENT` names.
    ///
    /// Every table file the recovered version references must exist. The
    /// recovered manifest is never appended to: the next edit starts a new
    /// one.
    pub fn recover(&mut self) -> Result<(), VersionError> {
        let manifest_number = read_current_file(&self.dir)?
            .ok_or_else(|| VersionError::Corruption("CURRENT file does not exist".into()))?;
        let edits: Vec<VersionEdit> = read_manifest(&self.dir, manifest_number)?;
        if edits.is_empty() {
            return Err(VersionError::Corruption(format!(
                "manifest {manifest_number} holds no records"
            )));
        }

        let mut builder = VersionBuilder::new(Arc::clone(&self.current));
        let mut log_number = None;
        let mut prev_log_number = None;
        let mut next_file_number = None;
        let mut last_sequence = None;

        for edit in &edits {
            builder.apply(edit)?;
            for (level, key) in &edit.compaction_pointers {
                let slot = self.compaction_pointers.get_mut(*level).ok_or_else(|| {
                    VersionError::Corruption(format!("compaction pointer for level {level}"))
                })?;
                *slot = Some(key.clone());
            }
            log_number = edit.log_number.or(log_number);
            prev_log_number = edit.prev_log_number.or(prev_log_number);
            next_file_number = edit.next_file_number.or(next_file_number);
            last_sequence = edit.last_sequence.or(last_sequence);
        }

        let missing = |field: &str| VersionError::Corruption(format!("no {field} entry in manifest"));
        let next_file_number = next_file_number.ok_or_else(|| missing("next file number"))?;
        let log_number = log_number.ok_or_else(|| missing("log number"))?;
        let last_sequence = last_sequence.ok_or_else(|| missing("last sequence"))?;
        let prev_log_number = prev_log_number.unwrap_or(0);

        let mut version = builder.build()?;
        for level in 0..version.num_levels() {
            for file in version.files(level) {
                let path = table_file_name(&self.dir, file.number);
                if !path.try_exists()? {
                    return Err(VersionError::Corruption(format!(
                        "missing table file {} referenced at level {level}",
                        path.display()
                    )));
                }
            }
        }
        version.finalize(&self.config);

        self.next_file_number = next_file_number;
        self.mark_file_number_used(prev_log_number);
        self.mark_file_number_used(log_number);
        self.install(version);
        self.log_number = log_number;
        self.prev_log_number = prev_log_number;
        self.last_sequence = last_sequence;
        self.manifest = None;
        self.manifest_file_number = self.new_file_number();

        info!(
            manifest = manifest_number,
            records = edits.len(),
            log_number,
            last_sequence,
            next_file = self.next_file_number,
            summary = %self.current.level_summary(),
            "recovered version set"
        );
        Ok(())
    }

    /// Validate `edit` and build the version it produces.
    pub fn begin_apply(&mut self, mut edit: VersionEdit) -> Result<PendingApply, VersionError> {
        let log_number = *edit.log_number.get_or_insert(self.log_number);
        edit.prev_log_number.get_or_insert(self.prev_log_number);
        if log_number < self.log_number || log_number >= self.next_file_number {
            return Err(VersionError::InvariantViolation(format!(
                "edit log number {log_number} outside [{}, {})",
                self.log_number, self.next_file_number
            )));
        }
        if let Some((level, _)) = edit
            .compaction_pointers
            .iter()
            .find(|(level, _)| *level >= self.config.num_levels)
        {
            return Err(VersionError::InvariantViolation(format!(
                "compaction pointer for level {level}"
            )));
        }
        edit.set_next_file_number(self.next_file_number);
        edit.set_last_sequence(self.last_sequence);

        let mut builder = VersionBuilder::new(Arc::clone(&self.current));
        builder.apply(&edit)?;
        let mut version = builder.build()?;
        version.finalize(&self.config);
        version.inherit_file_to_compact(&self.current);

        let writer = self.manifest.take();
        let fresh_manifest = writer.is_none();
        let snapshot = fresh_manifest.then(|| self.snapshot_edit());

        Ok(PendingApply {
            edit,
            version,
            writer,
            snapshot,
            manifest_number: self.manifest_file_number,
            fresh_manifest,
        })
    }

    /// Install or discard the result of [`PendingApply::persist`].
    pub fn finish_apply(
        &mut self,
        pending: PendingApply,
        result: Result<(), VersionError>,
    ) -> Result<(), VersionError> {
        if let Err(e) = result {
            warn!(error = %e, "manifest write failed, discarding new version");
            // The open manifest may hold a partial record; start over.
            self.manifest = None;
            self.manifest_file_number = self.new_file_number();
            return Err(e);
        }

        let PendingApply {
            edit,
            version,
            writer,
            ..
        } = pending;
        for (level, key) in &edit.compaction_pointers {
            self.compaction_pointers[*level] = Some(key.clone());
        }
        if let Some(n) = edit.log_number {
            self.log_number = n;
        }
        if let Some(n) = edit.prev_log_number {
            self.prev_log_number = n;
        }
        self.manifest = writer;
        self.install(version);

        debug!(
            added = edit.new_files.len(),
            deleted = edit.deleted_files.len(),
            summary = %self.current.level_summary(),
            "applied version edit"
        );
        Ok(())
    }

    /// Persist `edit` and make the resulting version current.
    pub fn log_and_apply(&mut self, edit: VersionEdit) -> Result<(), VersionError> {
        let mut pending = self.begin_apply(edit)?;
        let result = pending.persist(&self.dir);
        self.finish_apply(pending, result)
    }

    fn install(&mut self, version: Version) {
        let old = std::mem::replace(&mut self.current, Arc::new(version));
        self.history.push(old);
        self.gc_history();
    }

    fn gc_history(&mut self) {
        self.history.retain(|v| Arc::strong_count(v) > 1);
    }

    /// Edit recreating the whole current state, written first into every
    /// new manifest.
    fn snapshot_edit(&self) -> VersionEdit {
        let mut edit = VersionEdit::new();
        for (level, key) in self.compaction_pointers.iter().enumerate() {
            if let Some(key) = key {
                edit.set_compaction_pointer(level, key.clone());
            }
        }
        self.current.snapshot_files(&mut edit);
        edit
    }

    pub fn current(&self) -> Arc<Version> {
        Arc::clone(&self.current)
    }

    #[cfg(test)]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn new_file_number(&mut self) -> u64 {
        let n = self.next_file_number;
        self.next_file_number += 1;
        n
    }

    /// Make sure `number` is never handed out again.
    pub fn mark_file_number_used(&mut self, number: u64) {
        if self.next_file_number <= number {
            self.next_file_number = number + 1;
        }
    }

    /// Give back a number from [`VersionSet::new_file_number`] if nothing
    /// else was allocated since.
    pub fn reuse_file_number(&mut self, number: u64) {
        if self.next_file_number == number + 1 {
            self.next_file_number = number;
        }
    }

    pub fn next_file_number(&self) -> u64 {
        self.next_file_number
    }

    pub fn manifest_file_number(&self) -> u64 {
        self.manifest_file_number
    }

    pub fn last_sequence(&self) -> SequenceNumber {
        self.last_sequence
    }

    pub fn set_last_sequence(&mut self, sequence: SequenceNumber) {
        debug_assert!(sequence >= self.last_sequence);
        self.last_sequence = sequence;
    }

    pub fn log_number(&self) -> u64 {
        self.log_number
    }

    pub fn prev_log_number(&self) -> u64 {
        self.prev_log_number
    }

    pub fn num_level_files(&self, level: usize) -> usize {
        self.current.num_files(level)
    }

    /// Every table file referenced by the current version or by an older
    /// version someone still holds.
    pub fn live_files(&mut self) -> HashSet<u64> {
        self.gc_history();
        let mut live = HashSet::new();
        for version in self.history.iter().chain(std::iter::once(&self.current)) {
            version.add_live_files(&mut live);
        }
        live
    }
}
