//! Writer queue, group commit and write admission.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, info, trace, warn};

use super::{EngineError, EngineInner, EngineState, StateGuard};
use crate::batch::WriteBatch;
use crate::filename::log_file_name;
use crate::memtable::MemTable;
use crate::wal::{LogWriter, WalError};

/// Groups whose first batch is at most this big only absorb this many
/// more bytes, so small writes are not held up by a huge merged group.
const SMALL_BATCH_BYTES: usize = 128 * 1024;

/// Pause applied once to a write while level 0 is crowded.
const SLOWDOWN_DELAY: Duration = Duration::from_millis(1);

/// One caller waiting in the writer queue.
///
/// `batch` is `None` for a forced memtable switch.
#[derive(Debug)]
pub(crate) struct Writer {
    batch: Option<WriteBatch>,
    sync: bool,

    /// Set by the leader that committed this writer's batch.
    outcome: Mutex<Option<Result<(), EngineError>>>,
    cv: Condvar,
}

impl Writer {
    fn new(batch: Option<WriteBatch>, sync: bool) -> Self {
        Self {
            batch,
            sync,
            outcome: Mutex::new(None),
            cv: Condvar::new(),
        }
    }

    fn take_outcome(&self) -> Option<Result<(), EngineError>> {
        self.outcome.lock().take()
    }

    fn complete(&self, outcome: Result<(), EngineError>) {
        *self.outcome.lock() = Some(outcome);
        self.cv.notify_one();
    }
}

/// Why a write group did not commit.
#[derive(Debug)]
enum CommitFailure {
    /// Refused before any byte reached the log. Only the group fails.
    Rejected(EngineError),
    /// The log append or sync failed; the log may hold part of the group.
    Log(EngineError),
}

impl EngineInner {
    /// Queue a write and run it, either as leader or merged into another
    /// leader's group.
    pub(crate) fn write(&self, batch: Option<WriteBatch>, sync: bool) -> Result<(), EngineError> {
        let writer = Arc::new(Writer::new(batch, sync));

        let mut state = self.state.lock();
        state.writers.push_back(Arc::clone(&writer));
        loop {
            if let Some(outcome) = writer.take_outcome() {
                return outcome;
            }
            if state.writers.front().is_some_and(|w| Arc::ptr_eq(w, &writer)) {
                break;
            }
            writer.cv.wait(&mut state);
        }

        // Leader from here on.
        let force = writer.batch.is_none();
        let mut result = self.make_room_for_write(&mut state, force);
        let mut last_writer = Arc::clone(&writer);
        let mut group_error: Option<Arc<EngineError>> = None;

        if result.is_ok()
            && let Some(lead) = &writer.batch
        {
            let (mut group, last, group_size) = self.build_group(&state, &writer, lead);
            last_writer = last;
            let sync = writer.sync;

            let last_sequence = state.versions.last_sequence();
            group.set_sequence(last_sequence + 1);
            let new_last = last_sequence + group.count() as u64;
            let mem = Arc::clone(&state.mem);

            let io = MutexGuard::unlocked(&mut state, || self.append_group(&group, sync, &mem));
            let failure = match io {
                Ok(()) => {
                    state.versions.set_last_sequence(new_last);
                    state.stats.write_groups += 1;
                    state.stats.batches_written += group_size as u64;
                    None
                }
                Err(CommitFailure::Rejected(e)) => {
                    warn!(error = %e, batches = group_size, "write group rejected before reaching the log");
                    Some(Arc::new(e))
                }
                Err(CommitFailure::Log(e)) => {
                    // The log may now hold part of the group: fail closed.
                    let shared = Arc::new(e);
                    self.record_background_error(&mut state, Arc::clone(&shared));
                    Some(shared)
                }
            };
            if let Some(shared) = failure {
                group_error = Some(Arc::clone(&shared));
                result = Err(EngineError::GroupCommit(shared));
            }
        }

        while let Some(ready) = state.writers.pop_front() {
            let is_last = Arc::ptr_eq(&ready, &last_writer);
            if !Arc::ptr_eq(&ready, &writer) {
                ready.complete(match &group_error {
                    None => Ok(()),
                    Some(e) => Err(EngineError::GroupCommit(Arc::clone(e))),
                });
            }
            if is_last {
                break;
            }
        }
        if let Some(front) = state.writers.front() {
            front.cv.notify_one();
        }
        result
    }

    /// Append the group to the log and, once it is there, to the memtable.
    ///
    /// Runs without the state lock; the caller is the only active leader.
    fn append_group(&self, group: &WriteBatch, sync: bool, mem: &MemTable) -> Result<(), CommitFailure> {
        let record = group
            .encode()
            .map_err(|e| CommitFailure::Rejected(e.into()))?;
        {
            let mut log = self.log.lock();
            if record.len() > log.max_record_size() {
                return Err(CommitFailure::Rejected(WalError::RecordTooLarge(record.len()).into()));
            }
            log.append(&record).map_err(|e| CommitFailure::Log(e.into()))?;
            if sync {
                log.sync().map_err(|e| CommitFailure::Log(e.into()))?;
            }
        }
        group.insert_into(mem);
        trace!(
            sequence = group.sequence(),
            records = group.count(),
            bytes = record.len(),
            sync,
            "write group committed"
        );
        Ok(())
    }

    /// Merge the batches queued behind the leader into one group.
    ///
    /// Returns the group, the last writer it covers and how many batches
    /// it holds. A sync writer is never merged behind a non-sync leader,
    /// and a forced switch ends the group.
    fn build_group(
        &self,
        state: &EngineState,
        leader: &Arc<Writer>,
        lead: &WriteBatch,
    ) -> (WriteBatch, Arc<Writer>, usize) {
        let mut group = WriteBatch::new();
        group.append(lead);
        let mut last = Arc::clone(leader);
        let mut count = 1;

        let mut size = lead.approximate_size();
        let mut max_size = self.config.max_group_commit_bytes;
        if size <= SMALL_BATCH_BYTES {
            max_size = max_size.min(size + SMALL_BATCH_BYTES);
        }

        for w in state.writers.iter().skip(1) {
            if w.sync && !leader.sync {
                break;
            }
            let Some(batch) = &w.batch else {
                break;
            };
            size += batch.approximate_size();
            if size > max_size {
                break;
            }
            group.append(batch);
            last = Arc::clone(w);
            count += 1;
        }
        if count > 1 {
            trace!(batches = count, bytes = size, "merged write group");
        }
        (group, last, count)
    }

    /// Loop until the memtable has room for the next group.
    ///
    /// With `force` the memtable is switched even when it has room.
    pub(crate) fn make_room_for_write(&self, state: &mut StateGuard<'_>, force: bool) -> Result<(), EngineError> {
        let mut allow_delay = !force;
        let mut force = force;

        loop {
            if let Some(e) = &state.bg_error {
                return Err(EngineError::Background(Arc::clone(e)));
            }
            if self.shutting_down.load(Ordering::Acquire) {
                return Err(EngineError::ShuttingDown);
            }

            let level0 = state.versions.num_level_files(0);
            if allow_delay && level0 >= self.config.l0_slowdown_writes_trigger {
                allow_delay = false;
                state.stats.write_delays += 1;
                MutexGuard::unlocked(state, || std::thread::sleep(SLOWDOWN_DELAY));
                continue;
            }

            if !force && state.mem.approximate_memory_usage() <= self.config.write_buffer_size {
                return Ok(());
            }

            if state.imm.is_some() {
                debug!("memtable full, waiting for pending flush");
                state.stats.write_stalls += 1;
                self.bg_done.wait(state);
                continue;
            }

            if level0 >= self.config.l0_stop_writes_trigger {
                info!(level0, "too many level-0 files, stalling writes");
                state.stats.write_stalls += 1;
                self.bg_done.wait(state);
                continue;
            }

            self.switch_memtable(state)?;
            force = false;
        }
    }

    /// Start a new log and memtable and hand the full one to the worker.
    fn switch_memtable(&self, state: &mut StateGuard<'_>) -> Result<(), EngineError> {
        let number = state.versions.new_file_number();
        let log = match LogWriter::create(log_file_name(&self.dir, number), number) {
            Ok(log) => log,
            Err(e) => {
                state.versions.reuse_file_number(number);
                return Err(e.into());
            }
        };
        let old_log = std::mem::replace(&mut *self.log.lock(), log);
        let old_number = old_log.number();
        drop(old_log);

        state.log_number = number;
        let full = std::mem::replace(&mut state.mem, Arc::new(MemTable::new()));
        info!(
            old_log = old_number,
            new_log = number,
            entries = full.len(),
            bytes = full.approximate_memory_usage(),
            "switched to new memtable"
        );
        state.imm = Some(full);
        self.has_imm.store(true, Ordering::Release);
        state.stats.memtable_switches += 1;

        self.maybe_schedule_compaction(state);
        Ok(())
    }
}
