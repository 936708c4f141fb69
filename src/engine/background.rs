//! Background worker: memtable flushes and compactions.
//!
//! Exactly one background call runs at a time. Each call does one unit of
//! work, chosen in this order:
//!
//! 1. flush the immutable memtable, if there is one;
//! 2. the pending manual compaction, one round of it;
//! 3. whatever [`VersionSet::pick_compaction`](crate::version::VersionSet::pick_compaction)
//!    chooses.
//!
//! and then reschedules itself if more work is due.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use parking_lot::MutexGuard;
use tracing::{debug, info, warn};

use super::{BackgroundTask, EngineError, EngineInner, EngineState, StateGuard};
use crate::compaction::{Compaction, CompactionFilter, EntryStream, MergingIterator};
use crate::filename::table_file_name;
use crate::key::{Entry, InternalKey, SequenceNumber};
use crate::memtable::MemTable;
use crate::sstable::{TableBuilder, TableCache};
use crate::version::{FileMetaData, Version, VersionEdit};

/// Write `entries` (sorted) to table `number`.
///
/// Returns `None`, and leaves nothing on disk, when there are no entries.
pub(crate) fn build_table<I>(
    dir: &Path,
    number: u64,
    mut entries: I,
    block_size: usize,
    cache: &TableCache,
) -> Result<Option<FileMetaData>, EngineError>
where
    I: Iterator<Item = Entry>,
{
    let Some((first_key, first_value)) = entries.next() else {
        return Ok(None);
    };

    let mut builder = TableBuilder::create(table_file_name(dir, number), block_size)?;
    let smallest = first_key.clone();
    let mut largest = first_key;
    if let Err(e) = builder.add(&largest, &first_value) {
        builder.abandon();
        return Err(e.into());
    }
    for (key, value) in entries {
        if let Err(e) = builder.add(&key, &value) {
            builder.abandon();
            return Err(e.into());
        }
        largest = key;
    }
    let file_size = builder.finish()?;

    // Make sure the table reads back before anything references it.
    cache.get(number)?;
    Ok(Some(FileMetaData::new(number, file_size, smallest, largest)))
}

/// One table written by a compaction.
#[derive(Debug)]
struct CompactionOutput {
    number: u64,
    file_size: u64,
    smallest: InternalKey,
    largest: InternalKey,
}

/// Progress of one merging compaction.
struct CompactionRun {
    compaction: Compaction,
    smallest_snapshot: SequenceNumber,

    /// Open builder for the last entry of `outputs`.
    builder: Option<TableBuilder>,
    outputs: Vec<CompactionOutput>,
}

impl CompactionRun {
    fn output_bytes(&self) -> u64 {
        self.outputs.iter().map(|o| o.file_size).sum()
    }
}

impl EngineInner {
    // --------------------------------------------------------------------------------------------
    // Scheduling
    // --------------------------------------------------------------------------------------------

    /// Ask the worker for a background call if one is due and none is
    /// already scheduled.
    pub(crate) fn maybe_schedule_compaction(&self, state: &mut EngineState) {
        if state.bg_scheduled || self.shutting_down.load(Ordering::Acquire) || state.bg_error.is_some() {
            return;
        }
        let manual_pending = state.manual.as_ref().is_some_and(|m| !m.done);
        if state.imm.is_none() && !manual_pending && !state.versions.needs_compaction() {
            return;
        }

        state.bg_scheduled = true;
        if let Err(e) = self.bg_tx.try_send(BackgroundTask::Compact) {
            warn!(error = %e, "could not schedule background work");
            state.bg_scheduled = false;
        }
    }

    /// Entry point of the worker thread for one unit of work.
    pub(crate) fn background_call(&self) {
        let mut state = self.state.lock();
        if !self.shutting_down.load(Ordering::Acquire) && state.bg_error.is_none() {
            self.background_compaction(&mut state);
        }
        state.bg_scheduled = false;

        // The last round may have left a level over capacity.
        self.maybe_schedule_compaction(&mut state);
        self.bg_done.notify_all();
    }

    fn background_compaction(&self, state: &mut StateGuard<'_>) {
        if state.imm.is_some() {
            if let Err(e) = self.compact_memtable(state) {
                self.handle_background_failure(state, e);
            }
            return;
        }

        let manual = state
            .manual
            .as_ref()
            .filter(|m| !m.done)
            .map(|m| (m.level, m.begin.clone(), m.end.clone()));
        let is_manual = manual.is_some();
        let compaction = match &manual {
            Some((level, begin, end)) => state.versions.compact_range(*level, begin.as_ref(), end.as_ref()),
            None => state.versions.pick_compaction(),
        };
        let manual_end = compaction
            .as_ref()
            .and_then(|c| c.inputs(0).last())
            .map(|f| f.largest.clone());

        let result = match compaction {
            None => Ok(()),
            Some(c) if c.is_trivial_move() => self.trivial_move(state, c),
            Some(c) => self.do_compaction_work(state, c),
        };
        let failed = result.is_err();
        if let Err(e) = result {
            self.handle_background_failure(state, e);
        }

        if is_manual && let Some(m) = state.manual.as_mut() {
            match manual_end {
                Some(end) if !failed => {
                    debug!(level = m.level, resume = %end, "manual compaction round done");
                    m.begin = Some(end);
                }
                _ => m.done = true,
            }
        }
    }

    fn handle_background_failure(&self, state: &mut EngineState, error: EngineError) {
        if self.shutting_down.load(Ordering::Acquire) || matches!(error, EngineError::ShuttingDown) {
            debug!(error = %error, "background work abandoned during shutdown");
        } else {
            self.record_background_error(state, Arc::new(error));
        }
    }

    // --------------------------------------------------------------------------------------------
    // Minor compaction
    // --------------------------------------------------------------------------------------------

    /// Write the immutable memtable to a table and install it.
    ///
    /// On failure the immutable memtable stays in place.
    pub(crate) fn compact_memtable(&self, state: &mut StateGuard<'_>) -> Result<(), EngineError> {
        let Some(imm) = state.imm.clone() else {
            return Ok(());
        };
        let base = state.versions.current();

        let mut edit = VersionEdit::new();
        self.write_level0_table(state, &imm, &mut edit, Some(&base))?;

        if self.shutting_down.load(Ordering::Acquire) {
            return Err(EngineError::ShuttingDown);
        }

        // Logs older than the current one are no longer needed.
        edit.set_prev_log_number(0);
        edit.set_log_number(state.log_number);
        self.log_and_apply(state, edit)?;

        state.imm = None;
        self.has_imm.store(false, Ordering::Release);
        state.stats.flushes += 1;
        self.remove_obsolete_files(state);
        Ok(())
    }

    /// Build a table from `mem` and record it in `edit`.
    ///
    /// With a `base` version the table may be placed below level 0.
    fn write_level0_table(
        &self,
        state: &mut StateGuard<'_>,
        mem: &MemTable,
        edit: &mut VersionEdit,
        base: Option<&Version>,
    ) -> Result<(), EngineError> {
        let number = state.versions.new_file_number();
        state.pending_outputs.insert(number);
        info!(file = number, entries = mem.len(), "flushing memtable");

        let block_size = self.config.block_size;
        let built = MutexGuard::unlocked(state, || {
            build_table(&self.dir, number, mem.iter(), block_size, &self.table_cache)
        });
        state.pending_outputs.remove(&number);

        let Some(meta) = built? else {
            debug!(file = number, "memtable was empty, no table written");
            state.versions.reuse_file_number(number);
            return Ok(());
        };

        let level = base
            .map(|v| v.pick_level_for_memtable_output(meta.smallest.user_key(), meta.largest.user_key(), &self.config))
            .unwrap_or(0);
        edit.add_file(level, meta.number, meta.file_size, meta.smallest.clone(), meta.largest.clone());

        info!(file = number, level, bytes = meta.file_size, "memtable flushed");
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Major compaction
    // --------------------------------------------------------------------------------------------

    fn trivial_move(&self, state: &mut StateGuard<'_>, mut c: Compaction) -> Result<(), EngineError> {
        let level = c.level();
        let file = Arc::clone(&c.inputs(0)[0]);
        c.edit_mut().delete_file(level, file.number);
        c.edit_mut()
            .add_file(level + 1, file.number, file.file_size, file.smallest.clone(), file.largest.clone());
        self.log_and_apply(state, c.into_edit())?;

        state.stats.trivial_moves += 1;
        debug!(
            file = file.number,
            from = level,
            to = level + 1,
            bytes = file.file_size,
            summary = %state.versions.current().level_summary(),
            "trivial move"
        );
        Ok(())
    }

    /// Merge the inputs of `c` into new tables at `c.output_level()`.
    pub(super) fn do_compaction_work(&self, state: &mut StateGuard<'_>, c: Compaction) -> Result<(), EngineError> {
        let smallest_snapshot = EngineInner::smallest_snapshot(state);
        info!(
            level = c.level(),
            inputs = %c.input_summary(),
            bytes = c.input_bytes(),
            smallest_snapshot,
            "compaction started"
        );

        let mut run = CompactionRun {
            compaction: c,
            smallest_snapshot,
            builder: None,
            outputs: Vec::new(),
        };
        let merged = MutexGuard::unlocked(state, || self.merge_inputs(&mut run));
        if let Some(builder) = run.builder.take() {
            builder.abandon();
        }

        let result = merged.and_then(|()| self.install_compaction_results(state, &mut run));
        for out in &run.outputs {
            state.pending_outputs.remove(&out.number);
        }
        result?;

        state.stats.compactions += 1;
        state.stats.compaction_bytes_read += run.compaction.input_bytes();
        state.stats.compaction_bytes_written += run.output_bytes();
        info!(
            level = run.compaction.level(),
            outputs = run.outputs.len(),
            bytes = run.output_bytes(),
            summary = %state.versions.current().level_summary(),
            "compaction finished"
        );
        self.remove_obsolete_files(state);
        Ok(())
    }

    /// Stream every input entry through the drop rules into output tables.
    ///
    /// Runs without the state lock.
    fn merge_inputs(&self, run: &mut CompactionRun) -> Result<(), EngineError> {
        let mut sources: Vec<EntryStream> = Vec::new();
        for which in 0..2 {
            for f in run.compaction.inputs(which) {
                sources.push(Box::new(self.table_cache.iter(f.number)?));
            }
        }

        let mut filter = CompactionFilter::new(run.smallest_snapshot);
        let mut stop_pending = false;

        for item in MergingIterator::new(sources) {
            if self.shutting_down.load(Ordering::Acquire) {
                return Err(EngineError::ShuttingDown);
            }
            if self.has_imm.load(Ordering::Acquire) {
                let mut state = self.state.lock();
                if state.imm.is_some() {
                    self.compact_memtable(&mut state)?;
                    self.bg_done.notify_all();
                }
            }

            let (key, value) = item?;
            stop_pending |= run.compaction.should_stop_before(&key);

            let compaction = &mut run.compaction;
            if filter.should_drop(&key, |user_key| compaction.is_base_level_for_key(user_key)) {
                continue;
            }

            // Never split one user key across two outputs.
            let cut = match (&run.builder, run.outputs.last()) {
                (Some(builder), Some(out)) => {
                    out.largest.user_key() != key.user_key()
                        && (stop_pending || builder.file_size() >= run.compaction.max_output_file_size())
                }
                _ => false,
            };
            if cut {
                self.finish_output(run)?;
                stop_pending = false;
            }

            if run.builder.is_none() {
                self.open_output(run, &key)?;
            }
            if let (Some(builder), Some(out)) = (run.builder.as_mut(), run.outputs.last_mut()) {
                builder.add(&key, &value)?;
                out.largest = key;
            }
        }

        if run.builder.is_some() {
            self.finish_output(run)?;
        }
        Ok(())
    }

    fn open_output(&self, run: &mut CompactionRun, first: &InternalKey) -> Result<(), EngineError> {
        let number = {
            let mut state = self.state.lock();
            let number = state.versions.new_file_number();
            state.pending_outputs.insert(number);
            number
        };
        run.outputs.push(CompactionOutput {
            number,
            file_size: 0,
            smallest: first.clone(),
            largest: first.clone(),
        });
        run.builder = Some(TableBuilder::create(
            table_file_name(&self.dir, number),
            self.config.block_size,
        )?);
        Ok(())
    }

    fn finish_output(&self, run: &mut CompactionRun) -> Result<(), EngineError> {
        let (Some(builder), Some(out)) = (run.builder.take(), run.outputs.last_mut()) else {
            return Ok(());
        };
        let entries = builder.num_entries();
        out.file_size = builder.finish()?;
        self.table_cache.get(out.number)?;
        debug!(
            file = out.number,
            level = run.compaction.output_level(),
            entries,
            bytes = out.file_size,
            "compaction output finished"
        );
        Ok(())
    }

    fn install_compaction_results(&self, state: &mut StateGuard<'_>, run: &mut CompactionRun) -> Result<(), EngineError> {
        let level = run.compaction.output_level();
        run.compaction.add_input_deletions();
        for out in &run.outputs {
            run.compaction
                .edit_mut()
                .add_file(level, out.number, out.file_size, out.smallest.clone(), out.largest.clone());
        }
        let edit = std::mem::take(run.compaction.edit_mut());
        self.log_and_apply(state, edit)
    }
}
