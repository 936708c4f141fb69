//! # StrataDB
//!
//! An embeddable, persistent key-value store built on a **leveled
//! Log-Structured Merge Tree**. Writes are serialized through a group-commit
//! queue, versions of the file layout are recorded in a manifest, and a
//! background worker flushes memtables and compacts levels.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use stratadb::{Db, DbConfig, WriteBatch, WriteOptions};
//!
//! let db = Db::open("/tmp/my_db", DbConfig::default()).unwrap();
//!
//! // Single writes
//! db.put(b"hello", b"world").unwrap();
//! assert_eq!(db.get(b"hello").unwrap(), Some(b"world".to_vec()));
//!
//! // Atomic batch, fsynced before it is acknowledged
//! let mut batch = WriteBatch::new();
//! batch.put("a", "1").put("b", "2").delete("hello");
//! db.write(batch, WriteOptions { sync: true }).unwrap();
//!
//! // Repeatable reads
//! let snapshot = db.snapshot();
//! db.put(b"a", b"changed").unwrap();
//! assert_eq!(db.get_at(b"a", &snapshot).unwrap(), Some(b"1".to_vec()));
//!
//! // Scan
//! let rows = db.scan(b"a", b"c").unwrap();
//! assert_eq!(rows.len(), 2);
//!
//! // Graceful shutdown
//! db.close().unwrap();
//! ```
//!
//! ## Features
//!
//! - **Group commit**: concurrent writers are merged into one log append.
//! - **Write-ahead logging**: every batch is in the log before it is visible.
//! - **Leveled compaction**: size, seek and manual triggers, trivial moves.
//! - **Snapshots**: consistent point-in-time reads that compaction respects.
//! - **Bloom filters** and **CRC32 integrity** on every table block.
//! - **Crash recovery** from the manifest and the logs on open.


pub(crate) mod batch;
pub(crate) mod compaction;
pub(crate) mod encoding;
pub(crate) mod engine;
pub(crate) mod filename;
pub(crate) mod key;
pub(crate) mod manifest;
pub(crate) mod memtable;
pub(crate) mod sstable;
pub(crate) mod version;
pub(crate) mod wal;

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use engine::{Engine, EngineConfig};
use thiserror::Error;
use tracing::{debug, info};

pub use batch::{BatchOp, WriteBatch};
pub use engine::{EngineError, EngineStats, KeyValue, Snapshot};

// ------------------------------------------------------------------------------------------------
// Configuration
// ------------------------------------------------------------------------------------------------

/// Configuration for a [`Db`] instance.
///
/// All fields have defaults via [`DbConfig::default()`]. The configuration
/// is validated when passed to [`Db::open`].
///
/// # Example
///
/// ```rust
/// use stratadb::DbConfig;
///
/// // Use defaults (4 MiB buffer, 7 levels)
/// let config = DbConfig::default();
///
/// // Or customize
/// let config = DbConfig {
///     write_buffer_size: 64 * 1024,
///     l0_compaction_trigger: 2,
///     ..DbConfig::default()
/// };
/// ```
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Size of the in-memory write buffer in bytes.
    ///
    /// When the buffer is full it is frozen, a new log is started and the
    /// frozen buffer is written to a table in the background.
    ///
    /// Default: 4 MiB. Must be ≥ 1024.
    pub write_buffer_size: usize,

    /// Number of level-0 tables that makes level 0 a compaction candidate.
    ///
    /// Default: 4. Must be ≥ 1.
    pub l0_compaction_trigger: usize,

    /// Number of level-0 tables at which each write is delayed by 1 ms.
    ///
    /// Default: 8. Must be ≥ `l0_compaction_trigger`.
    pub l0_slowdown_writes_trigger: usize,

    /// Number of level-0 tables at which writes stop until compaction
    /// catches up.
    ///
    /// Default: 12. Must be ≥ `l0_slowdown_writes_trigger`.
    pub l0_stop_writes_trigger: usize,

    /// Number of levels.
    ///
    /// Default: 7. Must be in `2..=16`.
    pub num_levels: usize,

    /// Byte capacity of level 1.
    ///
    /// Default: 10 MiB. Must be > 0.
    pub max_bytes_for_level_base: u64,

    /// Capacity growth factor from one level to the next.
    ///
    /// Default: 10. Must be ≥ 2.
    pub level_size_multiplier: u64,

    /// Size at which compaction output files are cut.
    ///
    /// Default: 2 MiB. Must be ≥ 1024.
    pub max_file_size: u64,

    /// Bytes of `level + 2` overlap after which an output file is cut early.
    ///
    /// Default: 20 MiB. Must be > 0.
    pub max_grandparent_overlap_bytes: u64,

    /// Upper bound on one compaction's input after expansion.
    ///
    /// Default: 50 MiB. Must be ≥ `max_file_size`.
    pub expanded_compaction_byte_limit: u64,

    /// Deepest level a flushed memtable may be placed at directly.
    ///
    /// Default: 2. Must be < `num_levels - 1`.
    pub max_mem_compact_level: usize,

    /// Target size of a table data block.
    ///
    /// Default: 4 KiB. Must be ≥ 64.
    pub block_size: usize,

    /// Upper bound on the bytes merged into one group commit.
    ///
    /// Default: 1 MiB. Must be ≥ 1.
    pub max_group_commit_bytes: usize,
}

impl Default for DbConfig {
    fn default() -> Self {
        let engine = EngineConfig::default();
        Self {
            write_buffer_size: engine.write_buffer_size,
            l0_compaction_trigger: engine.l0_compaction_trigger,
            l0_slowdown_writes_trigger: engine.l0_slowdown_writes_trigger,
            l0_stop_writes_trigger: engine.l0_stop_writes_trigger,
            num_levels: engine.num_levels,
            max_bytes_for_level_base: engine.max_bytes_for_level_base,
            level_size_multiplier: engine.level_size_multiplier,
            max_file_size: engine.max_file_size,
            max_grandparent_overlap_bytes: engine.max_grandparent_overlap_bytes,
            expanded_compaction_byte_limit: engine.expanded_compaction_byte_limit,
            max_mem_compact_level: engine.max_mem_compact_level,
            block_size: engine.block_size,
            max_group_commit_bytes: engine.max_group_commit_bytes,
        }
    }
}

impl DbConfig {
    /// Validates all configuration parameters.
    fn validate(&self) -> Result<(), DbError> {
        let invalid = |msg: &str| Err(DbError::InvalidConfig(msg.into()));

        if self.write_buffer_size < 1024 {
            return invalid("write_buffer_size must be >= 1024");
        }
        if self.l0_compaction_trigger < 1 {
            return invalid("l0_compaction_trigger must be >= 1");
        }
        if self.l0_slowdown_writes_trigger < self.l0_compaction_trigger {
            return invalid("l0_slowdown_writes_trigger must be >= l0_compaction_trigger");
        }
        if self.l0_stop_writes_trigger < self.l0_slowdown_writes_trigger {
            return invalid("l0_stop_writes_trigger must be >= l0_slowdown_writes_trigger");
        }
        if !(2..=16).contains(&self.num_levels) {
            return invalid("num_levels must be in 2..=16");
        }
        if self.max_bytes_for_level_base == 0 {
            return invalid("max_bytes_for_level_base must be > 0");
        }
        if self.level_size_multiplier < 2 {
            return invalid("level_size_multiplier must be >= 2");
        }
        if self.max_file_size < 1024 {
            return invalid("max_file_size must be >= 1024");
        }
        if self.max_grandparent_overlap_bytes == 0 {
            return invalid("max_grandparent_overlap_bytes must be > 0");
        }
        if self.expanded_compaction_byte_limit < self.max_file_size {
            return invalid("expanded_compaction_byte_limit must be >= max_file_size");
        }
        if self.max_mem_compact_level >= self.num_levels - 1 {
            return invalid("max_mem_compact_level must be < num_levels - 1");
        }
        if self.block_size < 64 {
            return invalid("block_size must be >= 64");
        }
        if self.max_group_commit_bytes < 1 {
            return invalid("max_group_commit_bytes must be >= 1");
        }
        Ok(())
    }

    /// Converts to the internal engine configuration.
    fn to_engine_config(&self) -> EngineConfig {
        EngineConfig {
            write_buffer_size: self.write_buffer_size,
            l0_compaction_trigger: self.l0_compaction_trigger,
            l0_slowdown_writes_trigger: self.l0_slowdown_writes_trigger,
            l0_stop_writes_trigger: self.l0_stop_writes_trigger,
            num_levels: self.num_levels,
            max_bytes_for_level_base: self.max_bytes_for_level_base,
            level_size_multiplier: self.level_size_multiplier,
            max_file_size: self.max_file_size,
            max_grandparent_overlap_bytes: self.max_grandparent_overlap_bytes,
            expanded_compaction_byte_limit: self.expanded_compaction_byte_limit,
            max_mem_compact_level: self.max_mem_compact_level,
            block_size: self.block_size,
            max_group_commit_bytes: self.max_group_commit_bytes,
        }
    }
}

/// Per-write options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteOptions {
    /// Fsync the log before the write is acknowledged.
    ///
    /// Without it a write survives a process crash but may be lost if the
    /// machine goes down.
    pub sync: bool,
}

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors returned by [`Db`] operations.
#[derive(Debug, Error)]
pub enum DbError {
    /// The database has been closed.
    #[error("database is closed")]
    Closed,

    /// Invalid configuration parameter.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Key constraint violated.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// An engine-internal error occurred.
    #[error("{0}")]
    Engine(#[from] EngineError),
}

// ------------------------------------------------------------------------------------------------
// Database handle
// ------------------------------------------------------------------------------------------------

/// The main database handle.
///
/// # Thread safety
///
/// `Db` is `Send + Sync` and can be shared across threads via `Arc<Db>`.
/// Concurrent writes are merged into group commits; reads never wait for
/// writes.
///
/// # Background work
///
/// One worker thread flushes full memtables and compacts levels whose size
/// or level-0 file count exceeds its budget. [`Db::flush`] and
/// [`Db::compact_range`] trigger the same work on demand and wait for it.
///
/// # Shutdown
///
/// Call [`Db::close`] for a graceful shutdown. If the handle is dropped
/// without calling `close`, the destructor closes it and ignores errors.
pub struct Db {
    engine: Engine,
    closed: AtomicBool,
}

impl std::fmt::Debug for Db {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Db")
            .field("dir", &self.engine.dir())
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Db {
    /// Opens (or creates) a database in the given directory.
    ///
    /// On an existing directory the manifest and the logs are replayed to
    /// recover the last acknowledged state.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::InvalidConfig`] if any configuration parameter
    /// is out of range, or an engine error if recovery finds corruption.
    pub fn open(path: impl AsRef<Path>, config: DbConfig) -> Result<Self, DbError> {
        config.validate()?;

        let engine = Engine::open(&path, config.to_engine_config())?;
        info!(path = %path.as_ref().display(), "database opened");

        Ok(Self {
            engine,
            closed: AtomicBool::new(false),
        })
    }

    /// Gracefully shuts down the database.
    ///
    /// Lets the running background job stop at its next check, joins the
    /// worker and syncs the log. Subsequent operations on this handle
    /// return [`DbError::Closed`]. Calling `close` more than once is
    /// harmless.
    pub fn close(&self) -> Result<(), DbError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.engine.close()?;
        info!("database closed");
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Write operations
    // --------------------------------------------------------------------------------------------

    /// Inserts or updates a key-value pair.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::InvalidArgument`] if `key` is empty.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<(), DbError> {
        let mut batch = WriteBatch::new();
        batch.put(key, value);
        self.write(batch, WriteOptions::default())
    }

    /// Deletes a key by writing a tombstone.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::InvalidArgument`] if `key` is empty.
    pub fn delete(&self, key: &[u8]) -> Result<(), DbError> {
        let mut batch = WriteBatch::new();
        batch.delete(key);
        self.write(batch, WriteOptions::default())
    }

    /// Applies every operation of `batch` atomically.
    ///
    /// Readers see all of the batch or none of it. An empty batch is a
    /// no-op.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::InvalidArgument`] if any key in the batch is
    /// empty. Once a background error has been recorded every write fails
    /// with it until the database is reopened.
    pub fn write(&self, batch: WriteBatch, options: WriteOptions) -> Result<(), DbError> {
        self.check_open()?;

        if batch.ops().iter().any(|op| op.key().is_empty()) {
            return Err(DbError::InvalidArgument("key must not be empty".into()));
        }

        self.engine.write(batch, options.sync)?;
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Read operations
    // --------------------------------------------------------------------------------------------

    /// Retrieves the value associated with a key.
    ///
    /// Returns `Ok(None)` if the key does not exist or has been deleted.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::InvalidArgument`] if `key` is empty.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, DbError> {
        self.check_open()?;
        check_key(key)?;
        Ok(self.engine.get(key)?)
    }

    /// Retrieves the value a key had when `snapshot` was taken.
    pub fn get_at(&self, key: &[u8], snapshot: &Snapshot) -> Result<Option<Vec<u8>>, DbError> {
        self.check_open()?;
        check_key(key)?;
        Ok(self.engine.get_at(key, snapshot)?)
    }

    /// Pins the current state for repeatable reads.
    ///
    /// Compaction keeps every entry the snapshot can see until it is
    /// dropped, so long-lived snapshots hold on to disk space.
    pub fn snapshot(&self) -> Snapshot {
        self.engine.snapshot()
    }

    /// Scans all live key-value pairs in the half-open range `[start, end)`.
    ///
    /// Returns pairs sorted by key in ascending order. Deleted keys are
    /// excluded. Returns an empty `Vec` if `start >= end`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::InvalidArgument`] if `start` or `end` is empty.
    pub fn scan(&self, start: &[u8], end: &[u8]) -> Result<Vec<KeyValue>, DbError> {
        self.scan_inner(start, end, None)
    }

    /// Like [`Db::scan`], as of `snapshot`.
    pub fn scan_at(&self, start: &[u8], end: &[u8], snapshot: &Snapshot) -> Result<Vec<KeyValue>, DbError> {
        self.scan_inner(start, end, Some(snapshot))
    }

    fn scan_inner(&self, start: &[u8], end: &[u8], snapshot: Option<&Snapshot>) -> Result<Vec<KeyValue>, DbError> {
        self.check_open()?;

        if start.is_empty() || end.is_empty() {
            return Err(DbError::InvalidArgument(
                "start and end keys must not be empty".into(),
            ));
        }
        if start >= end {
            return Ok(Vec::new());
        }

        Ok(self.engine.scan(start, end, snapshot)?)
    }

    // --------------------------------------------------------------------------------------------
    // Flush and compaction
    // --------------------------------------------------------------------------------------------

    /// Writes the current memtable to a table, even if it is not full, and
    /// waits until it is installed. A no-op when nothing has been written.
    pub fn flush(&self) -> Result<(), DbError> {
        self.check_open()?;
        Ok(self.engine.flush()?)
    }

    /// Compacts every level holding data in `[begin, end]`; `None` leaves
    /// that side unbounded.
    ///
    /// This is a **blocking** operation: the memtable is flushed first and
    /// the call returns once each level has been merged into the next.
    /// Deleted and overwritten entries no snapshot needs are dropped.
    pub fn compact_range(&self, begin: Option<&[u8]>, end: Option<&[u8]>) -> Result<(), DbError> {
        self.check_open()?;
        debug!(?begin, ?end, "manual compaction requested");
        Ok(self.engine.compact_range(begin, end)?)
    }

    // --------------------------------------------------------------------------------------------
    // Introspection
    // --------------------------------------------------------------------------------------------

    /// Number of table files at `level`.
    pub fn num_files_at_level(&self, level: usize) -> usize {
        self.engine.num_files_at_level(level)
    }

    /// File count per level, e.g. `files[ 3 1 0 0 0 0 0 ]`.
    pub fn level_summary(&self) -> String {
        self.engine.level_summary()
    }

    pub fn stats(&self) -> EngineStats {
        self.engine.stats()
    }

    // --------------------------------------------------------------------------------------------
    // Internal helpers
    // --------------------------------------------------------------------------------------------

    /// Returns `Err(DbError::Closed)` if the database has been closed.
    fn check_open(&self) -> Result<(), DbError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DbError::Closed);
        }
        Ok(())
    }
}

fn check_key(key: &[u8]) -> Result<(), DbError> {
    if key.is_empty() {
        return Err(DbError::InvalidArgument("key must not be empty".into()));
    }
    Ok(())
}

impl Drop for Db {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::Acquire)
            && let Err(e) = self.close()
        {
            debug!(error = %e, "error while closing database on drop");
        }
    }
}
