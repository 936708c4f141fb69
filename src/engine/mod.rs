//! # Storage Engine
//!
//! The engine ties the write path, the version set and the background
//! worker together. It owns:
//!
//! 1. **The writer queue.** Concurrent writers line up; the writer at the
//!    front becomes leader, merges the batches queued behind it into one
//!    group, appends the group to the write-ahead log and inserts it into
//!    the memtable with the engine lock released.
//! 2. **Write admission.** Before each group the leader makes room: it
//!    slows down or stalls writers while level 0 is crowded and switches to
//!    a fresh memtable and log when the current one is full.
//! 3. **The background worker.** One thread flushes the immutable memtable
//!    and runs the compactions the picker asks for. Requests are coalesced
//!    through a one-slot channel and a `bg_scheduled` flag.
//! 4. **Reads.** Point lookups and range scans clone the memtables and the
//!    current [`Version`](crate::version::Version) under the lock and then
//!    read without it.
//!
//! ## Concurrency Model
//!
//! All metadata lives in [`EngineState`] behind one `parking_lot::Mutex`.
//! The log writer has its own mutex, taken only by the current leader (and
//! by the memtable switch, which also runs as leader). Lock order is state
//! before log. Bulk I/O (log appends, table builds, manifest writes) always
//! runs with the state lock released; `Arc` keeps memtables and versions
//! alive meanwhile.
//!
//! ## Errors
//!
//! A failed log append, a failed flush or a failed compaction is recorded
//! once as the background error. From then on every write fails fast with
//! [`EngineError::Background`] until the engine is reopened. Reads keep
//! working against the last good state. A group refused before anything
//! reached the log, such as one too large for a log record, fails on its
//! own and leaves the engine writable.

mod background;
mod config;
mod obsolete;
mod recovery;
mod snapshot;
mod visibility;
mod write;

#[cfg(test)]
mod tests;

pub use config::EngineConfig;
pub use snapshot::Snapshot;
pub use visibility::VisibilityFilter;

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use crossbeam::channel::{Receiver, Sender};
use parking_lot::{Condvar, Mutex, MutexGuard};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::batch::WriteBatch;
use crate::compaction::{EntryStream, MergingIterator};
use crate::encoding::EncodingError;
use crate::key::{InternalKey, SequenceNumber, ValueType};
use crate::manifest::ManifestError;
use crate::memtable::MemTable;
use crate::sstable::{SSTableError, TableCache};
use crate::version::{VersionError, VersionSet, range_start_key};
use crate::wal::{LogWriter, WalError};

use write::Writer;

/// A user key and its value, as returned by [`Engine::scan`].
pub type KeyValue = (Vec<u8>, Vec<u8>);

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors that can occur during engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Write-ahead log failure.
    #[error("Log error: {0}")]
    Wal(#[from] WalError),

    /// Table read or write failure.
    #[error("SSTable error: {0}")]
    SSTable(#[from] SSTableError),

    /// Version set failure, including invariant violations.
    #[error("Version error: {0}")]
    Version(#[from] VersionError),

    /// Manifest failure outside of a version edit.
    #[error("Manifest error: {0}")]
    Manifest(#[from] ManifestError),

    /// Encoding / decoding error.
    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// Underlying filesystem I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Persistent data is malformed.
    #[error("Corruption: {0}")]
    Corruption(String),

    /// A background error was recorded earlier; writes are refused.
    #[error("Background error: {0}")]
    Background(Arc<EngineError>),

    /// The write group this request was merged into failed.
    #[error("Group commit failed: {0}")]
    GroupCommit(Arc<EngineError>),

    /// The engine is closing.
    #[error("Engine is shutting down")]
    ShuttingDown,

    /// Internal invariant violation (panicked worker, unexpected state, etc.).
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Statistics
// ------------------------------------------------------------------------------------------------

/// Counters describing what the engine has done since it was opened.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineStats {
    /// Write groups appended to the log.
    pub write_groups: u64,
    /// Batches committed; exceeds `write_groups` when batches were merged.
    pub batches_written: u64,
    /// Writes delayed once because level 0 was crowded.
    pub write_delays: u64,
    /// Times a writer blocked on a pending flush or a full level 0.
    pub write_stalls: u64,
    pub memtable_switches: u64,
    /// Immutable memtables written to tables (empty ones included).
    pub flushes: u64,
    /// Merging compactions completed.
    pub compactions: u64,
    pub trivial_moves: u64,
    pub compaction_bytes_read: u64,
    pub compaction_bytes_written: u64,
    /// Obsolete files removed from disk.
    pub files_deleted: u64,
}

// ------------------------------------------------------------------------------------------------
// Shared state
// ------------------------------------------------------------------------------------------------

/// Message to the background worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BackgroundTask {
    Compact,
    Shutdown,
}

/// A caller-requested compaction of `[begin, end]` at one level.
///
/// The worker advances `begin` after each round and sets `done` once the
/// range is exhausted or a round fails.
#[derive(Debug)]
pub(crate) struct ManualCompaction {
    id: u64,
    level: usize,
    begin: Option<InternalKey>,
    end: Option<InternalKey>,
    done: bool,
}

/// Everything guarded by the engine mutex.
#[derive(Debug)]
pub(crate) struct EngineState {
    pub(crate) versions: VersionSet,

    pub(crate) mem: Arc<MemTable>,
    pub(crate) imm: Option<Arc<MemTable>>,

    /// Number of the log backing `mem`.
    log_number: u64,

    writers: VecDeque<Arc<Writer>>,

    bg_scheduled: bool,
    pub(crate) bg_error: Option<Arc<EngineError>>,

    manual: Option<ManualCompaction>,
    next_manual_id: u64,

    /// Table numbers being written right now; never reclaimed.
    pending_outputs: HashSet<u64>,

    /// Live snapshot sequences and how many handles hold each.
    snapshots: BTreeMap<SequenceNumber, usize>,

    pub(crate) stats: EngineStats,
}

pub(crate) type StateGuard<'a> = MutexGuard<'a, EngineState>;

/// Shared core of an [`Engine`]; also held by the background worker and
/// by every [`Snapshot`].
#[derive(Debug)]
pub(crate) struct EngineInner {
    dir: PathBuf,
    config: EngineConfig,

    pub(crate) state: Mutex<EngineState>,

    /// Signalled whenever background work finishes or fails.
    bg_done: Condvar,

    table_cache: TableCache,

    shutting_down: AtomicBool,

    /// Mirrors `state.imm.is_some()` so a running compaction can poll it
    /// without the lock.
    has_imm: AtomicBool,

    log: Mutex<LogWriter>,

    bg_tx: Sender<BackgroundTask>,
}

impl EngineInner {
    /// Oldest sequence some snapshot may still read at.
    fn smallest_snapshot(state: &EngineState) -> SequenceNumber {
        state
            .snapshots
            .keys()
            .next()
            .copied()
            .unwrap_or_else(|| state.versions.last_sequence())
    }

    /// Persist `edit` and install the resulting version, with the lock
    /// released during manifest I/O.
    pub(crate) fn log_and_apply(
        &self,
        state: &mut StateGuard<'_>,
        edit: crate::version::VersionEdit,
    ) -> Result<(), EngineError> {
        let mut pending = state.versions.begin_apply(edit)?;
        let result = MutexGuard::unlocked(state, || pending.persist(&self.dir));
        state.versions.finish_apply(pending, result)?;
        Ok(())
    }

    /// Make `error` the persistent background error, unless one is set.
    pub(crate) fn record_background_error(&self, state: &mut EngineState, error: Arc<EngineError>) {
        if state.bg_error.is_none() {
            tracing::error!(error = %error, "background error recorded, refusing further writes");
            state.bg_error = Some(error);
            self.bg_done.notify_all();
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Engine
// ------------------------------------------------------------------------------------------------

/// The LSM storage engine handle.
///
/// Thread-safe: every method takes `&self`.
#[derive(Debug)]
pub struct Engine {
    inner: Arc<EngineInner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Engine {
    // --------------------------------------------------------------------------------------------
    // Lifecycle
    // --------------------------------------------------------------------------------------------

    /// Opens (or creates) an engine rooted at `path`.
    ///
    /// Replays the manifest and every log that is not yet covered by a
    /// table, writes the recovered data to level 0, starts a new log and a
    /// new manifest, and removes files nothing references.
    pub fn open(path: impl AsRef<Path>, config: EngineConfig) -> Result<Self, EngineError> {
        let dir = path.as_ref().to_path_buf();
        let table_cache = TableCache::new(&dir);
        let recovered = recovery::recover(&dir, &config, &table_cache)?;

        let (bg_tx, bg_rx) = crossbeam::channel::bounded(1);
        let inner = Arc::new(EngineInner {
            state: Mutex::new(EngineState {
                versions: recovered.versions,
                mem: Arc::new(MemTable::new()),
                imm: None,
                log_number: recovered.log.number(),
                writers: VecDeque::new(),
                bg_scheduled: false,
                bg_error: None,
                manual: None,
                next_manual_id: 0,
                pending_outputs: HashSet::new(),
                snapshots: BTreeMap::new(),
                stats: EngineStats::default(),
            }),
            dir,
            config,
            bg_done: Condvar::new(),
            table_cache,
            shutting_down: AtomicBool::new(false),
            has_imm: AtomicBool::new(false),
            log: Mutex::new(recovered.log),
            bg_tx,
        });

        {
            let mut state = inner.state.lock();
            inner.remove_obsolete_files(&mut state);
        }

        let worker = spawn_worker(Arc::clone(&inner), bg_rx)?;
        {
            let mut state = inner.state.lock();
            inner.maybe_schedule_compaction(&mut state);
            info!(
                dir = %inner.dir.display(),
                last_sequence = state.versions.last_sequence(),
                log = state.log_number,
                summary = %state.versions.current().level_summary(),
                "engine opened"
            );
        }

        Ok(Self {
            inner,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Stops the background worker and syncs the log.
    ///
    /// A compaction in progress notices the shutdown flag and gives up
    /// without installing anything. Waiting writers fail with
    /// [`EngineError::ShuttingDown`]. Calling `close` twice is harmless.
    pub fn close(&self) -> Result<(), EngineError> {
        let Some(worker) = self.worker.lock().take() else {
            return Ok(());
        };

        self.inner.shutting_down.store(true, Ordering::Release);
        {
            let mut state = self.inner.state.lock();
            while state.bg_scheduled {
                self.inner.bg_done.wait(&mut state);
            }
        }
        self.inner.bg_done.notify_all();

        if self.inner.bg_tx.send(BackgroundTask::Shutdown).is_err() {
            warn!("background worker already gone");
        }
        if worker.join().is_err() {
            return Err(EngineError::Internal("background worker panicked".into()));
        }

        self.inner.log.lock().sync()?;
        info!(dir = %self.inner.dir.display(), "engine closed");
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Writes
    // --------------------------------------------------------------------------------------------

    /// Commit `batch` atomically. With `sync` the log is fsynced before
    /// the write is acknowledged.
    pub fn write(&self, batch: WriteBatch, sync: bool) -> Result<(), EngineError> {
        if batch.is_empty() {
            return Ok(());
        }
        self.inner.write(Some(batch), sync)
    }

    /// Freeze the current memtable, even if it is not full, and wait
    /// until it has been written to a table.
    pub fn flush(&self) -> Result<(), EngineError> {
        self.inner.write(None, false)?;

        let mut state = self.inner.state.lock();
        loop {
            if let Some(e) = &state.bg_error {
                return Err(EngineError::Background(Arc::clone(e)));
            }
            if state.imm.is_none() {
                return Ok(());
            }
            if self.inner.shutting_down.load(Ordering::Acquire) {
                return Err(EngineError::ShuttingDown);
            }
            self.inner.bg_done.wait(&mut state);
        }
    }

    /// Compact every level that holds data in `[begin, end]` (open bounds
    /// when `None`), after flushing the memtable.
    ///
    /// The deepest level holding such data is merged one level further
    /// down as well, unless it is the bottom level, so deletions and
    /// shadowed values in the range are dropped once no snapshot needs
    /// them.
    pub fn compact_range(&self, begin: Option<&[u8]>, end: Option<&[u8]>) -> Result<(), EngineError> {
        self.flush()?;

        let (deepest, num_levels) = {
            let state = self.inner.state.lock();
            let current = state.versions.current();
            let deepest = (0..current.num_levels())
                .filter(|&level| current.overlap_in_level(level, begin, end))
                .max();
            (deepest, current.num_levels())
        };
        let Some(deepest) = deepest else {
            debug!("nothing to compact in range");
            return Ok(());
        };

        for level in 0..=deepest.min(num_levels.saturating_sub(2)) {
            self.inner.manual_compaction(level, begin, end)?;
        }
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Reads
    // --------------------------------------------------------------------------------------------

    /// Current value of `key`.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, EngineError> {
        self.inner.get(key, None)
    }

    /// Value of `key` as of `snapshot`.
    pub fn get_at(&self, key: &[u8], snapshot: &Snapshot) -> Result<Option<Vec<u8>>, EngineError> {
        self.inner.get(key, Some(snapshot.sequence()))
    }

    /// Live pairs with `start <= key < end`, ascending, as of `snapshot`
    /// or the latest write.
    pub fn scan(
        &self,
        start: &[u8],
        end: &[u8],
        snapshot: Option<&Snapshot>,
    ) -> Result<Vec<KeyValue>, EngineError> {
        self.inner.scan(start, end, snapshot.map(Snapshot::sequence))
    }

    /// Pin the current state for repeatable reads.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot::acquire(&self.inner)
    }

    // --------------------------------------------------------------------------------------------
    // Introspection
    // --------------------------------------------------------------------------------------------

    /// Number of tables at `level` in the current version; zero for a
    /// level past the last.
    pub fn num_files_at_level(&self, level: usize) -> usize {
        self.inner.state.lock().versions.num_level_files(level)
    }

    /// File count per level, e.g. `files[ 3 1 0 0 0 0 0 ]`.
    pub fn level_summary(&self) -> String {
        self.inner.state.lock().versions.current().level_summary()
    }

    /// Snapshot of the counters gathered since the engine was opened.
    pub fn stats(&self) -> EngineStats {
        self.inner.state.lock().stats.clone()
    }

    /// Sequence number of the most recent committed write.
    #[cfg(test)]
    pub fn last_sequence(&self) -> SequenceNumber {
        self.inner.state.lock().versions.last_sequence()
    }

    /// Directory the engine was opened on.
    pub fn dir(&self) -> &Path {
        &self.inner.dir
    }

    /// Run obsolete-file reclamation now; returns the number of files removed.
    #[cfg(test)]
    pub(crate) fn remove_obsolete_files(&self) -> usize {
        let mut state = self.inner.state.lock();
        self.inner.remove_obsolete_files(&mut state)
    }

    #[cfg(test)]
    pub(crate) fn inner(&self) -> &Arc<EngineInner> {
        &self.inner
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            debug!(error = %e, "error while closing engine on drop");
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Reads
// ------------------------------------------------------------------------------------------------

impl EngineInner {
    fn get(&self, key: &[u8], snapshot: Option<SequenceNumber>) -> Result<Option<Vec<u8>>, EngineError> {
        let (mem, imm, version, sequence) = {
            let state = self.state.lock();
            (
                Arc::clone(&state.mem),
                state.imm.clone(),
                state.versions.current(),
                snapshot.unwrap_or_else(|| state.versions.last_sequence()),
            )
        };

        let result = mem.get(key, sequence);
        if result.is_resolved() {
            return Ok(result.into_value());
        }
        if let Some(imm) = &imm {
            let result = imm.get(key, sequence);
            if result.is_resolved() {
                return Ok(result.into_value());
            }
        }

        let (result, charge) = version.get(key, sequence, &self.table_cache)?;
        if let Some(charge) = charge
            && version.update_stats(charge)
        {
            let mut state = self.state.lock();
            self.maybe_schedule_compaction(&mut state);
        }
        Ok(result.into_value())
    }

    fn scan(
        &self,
        start: &[u8],
        end: &[u8],
        snapshot: Option<SequenceNumber>,
    ) -> Result<Vec<KeyValue>, EngineError> {
        if start >= end {
            return Ok(Vec::new());
        }

        let (mem, imm, version, sequence) = {
            let state = self.state.lock();
            (
                Arc::clone(&state.mem),
                state.imm.clone(),
                state.versions.current(),
                snapshot.unwrap_or_else(|| state.versions.last_sequence()),
            )
        };

        let mut sources: Vec<EntryStream> = vec![MergingIterator::infallible(mem.range(start, end).into_iter())];
        if let Some(imm) = &imm {
            sources.push(MergingIterator::infallible(imm.range(start, end).into_iter()));
        }
        let seek = range_start_key(start);
        for file in version.files_for_range(start, end) {
            let table = self.table_cache.get(file.number)?;
            sources.push(Box::new(table.iter_from(&seek)?));
        }

        let rows = VisibilityFilter::new(MergingIterator::new(sources), sequence, end)
            .collect::<Result<Vec<_>, _>>()?;
        debug!(rows = rows.len(), sequence, "scan finished");
        Ok(rows)
    }

    /// Queue a manual compaction of one level and wait until it is done.
    fn manual_compaction(&self, level: usize, begin: Option<&[u8]>, end: Option<&[u8]>) -> Result<(), EngineError> {
        let begin = begin.map(range_start_key);
        let end = end.map(|k| InternalKey::new(k, 0, ValueType::Deletion));

        let mut state = self.state.lock();
        state.next_manual_id += 1;
        let id = state.next_manual_id;
        let mut installed = false;

        loop {
            if let Some(e) = &state.bg_error {
                let e = EngineError::Background(Arc::clone(e));
                if installed {
                    state.manual = None;
                }
                return Err(e);
            }
            if self.shutting_down.load(Ordering::Acquire) {
                if installed {
                    state.manual = None;
                }
                return Err(EngineError::ShuttingDown);
            }

            let ours = match &state.manual {
                Some(m) => Some(m.id == id && m.done),
                None => None,
            };
            match ours {
                Some(true) => {
                    state.manual = None;
                    debug!(level, "manual compaction finished");
                    // Another caller may be waiting to queue theirs.
                    self.bg_done.notify_all();
                    return Ok(());
                }
                Some(false) => self.bg_done.wait(&mut state),
                None => {
                    debug!(level, "manual compaction queued");
                    state.manual = Some(ManualCompaction {
                        id,
                        level,
                        begin: begin.clone(),
                        end: end.clone(),
                        done: false,
                    });
                    installed = true;
                    self.maybe_schedule_compaction(&mut state);
                }
            }
        }
    }
}

fn spawn_worker(inner: Arc<EngineInner>, rx: Receiver<BackgroundTask>) -> Result<JoinHandle<()>, EngineError> {
    let handle = thread::Builder::new()
        .name("stratadb-bg".into())
        .spawn(move || {
            while let Ok(task) = rx.recv() {
                match task {
                    BackgroundTask::Compact => inner.background_call(),
                    BackgroundTask::Shutdown => break,
                }
            }
            debug!("background worker exiting");
        })?;
    Ok(handle)
}
