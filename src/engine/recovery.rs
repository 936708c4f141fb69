//! Opening a database directory: manifest replay and log recovery.
//!
//! 1. Create the directory and, if there is no `CURRENT`, an empty
//!    database.
//! 2. Replay the manifest into a [`VersionSet`].
//! 3. Replay every log not yet covered by a table (numbered at or above
//!    the manifest's log number, plus the previous log) in ascending
//!    order. Their batches are written to level-0 tables.
//! 4. Start a fresh log and record everything in a new manifest.
//!
//! A log whose final record is torn or fails its checksum was being
//! appended when the process died; the write was never acknowledged and
//! the record is dropped with a warning. Damage anywhere else is reported
//! as corruption.

use std::fs;
use std::path::Path;

use tracing::{debug, info, warn};

use super::EngineError;
use super::background::build_table;
use crate::batch::WriteBatch;
use crate::engine::EngineConfig;
use crate::filename::{FileType, log_file_name, parse_file_name};
use crate::key::SequenceNumber;
use crate::manifest::read_current_file;
use crate::memtable::MemTable;
use crate::sstable::TableCache;
use crate::version::{VersionEdit, VersionSet};
use crate::wal::{LOG_HEADER_SIZE, LogReader, LogWriter, WalError};

/// State handed to the engine once recovery has finished.
pub(crate) struct Recovered {
    pub(crate) versions: VersionSet,
    pub(crate) log: LogWriter,
}

pub(crate) fn recover(dir: &Path, config: &EngineConfig, cache: &TableCache) -> Result<Recovered, EngineError> {
    fs::create_dir_all(dir)?;
    if read_current_file(dir)?.is_none() {
        VersionSet::create_new_db(dir)?;
    }

    let mut versions = VersionSet::new(dir, config.clone());
    versions.recover()?;

    let mut edit = VersionEdit::new();
    let mut max_sequence = versions.last_sequence();
    for number in logs_to_replay(dir, &versions)? {
        versions.mark_file_number_used(number);
        replay_log(dir, number, config, cache, &mut versions, &mut edit, &mut max_sequence)?;
    }
    if max_sequence > versions.last_sequence() {
        versions.set_last_sequence(max_sequence);
    }

    let number = versions.new_file_number();
    let log = LogWriter::create(log_file_name(dir, number), number)?;
    edit.set_log_number(number);
    edit.set_prev_log_number(0);
    versions.log_and_apply(edit)?;

    info!(
        log = number,
        last_sequence = versions.last_sequence(),
        manifest = versions.manifest_file_number(),
        "recovery complete"
    );
    Ok(Recovered { versions, log })
}

/// Numbers of the logs that may hold writes no table has yet, ascending.
fn logs_to_replay(dir: &Path, versions: &VersionSet) -> Result<Vec<u64>, EngineError> {
    let min_log = versions.log_number();
    let prev_log = versions.prev_log_number();

    let mut logs = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        if let Some((FileType::Log, number)) = name.to_str().and_then(parse_file_name)
            && (number >= min_log || (prev_log != 0 && number == prev_log))
        {
            logs.push(number);
        }
    }
    logs.sort_unstable();
    Ok(logs)
}

fn replay_log(
    dir: &Path,
    number: u64,
    config: &EngineConfig,
    cache: &TableCache,
    versions: &mut VersionSet,
    edit: &mut VersionEdit,
    max_sequence: &mut SequenceNumber,
) -> Result<(), EngineError> {
    let path = log_file_name(dir, number);
    match fs::metadata(&path)?.len() {
        0 => {
            debug!(path = %path.display(), "skipping zero-length log");
            return Ok(());
        }
        // The crash hit while the header was being written.
        len if len < (LOG_HEADER_SIZE + 4) as u64 => {
            warn!(path = %path.display(), len, "skipping log with an incomplete header");
            return Ok(());
        }
        _ => {}
    }

    let mut reader = LogReader::open(&path)?;
    let mut mem = MemTable::new();
    let mut records = 0usize;

    while let Some(item) = reader.next() {
        let record = match item {
            Ok(record) => record,
            Err(WalError::UnexpectedEof { offset }) => {
                warn!(path = %path.display(), offset, "dropping torn record at end of log");
                break;
            }
            Err(WalError::ChecksumMismatch { offset }) if reader.is_exhausted()? => {
                warn!(path = %path.display(), offset, "dropping damaged record at end of log");
                break;
            }
            Err(e) => return Err(e.into()),
        };

        let batch = WriteBatch::decode(&record).map_err(|e| {
            EngineError::Corruption(format!("log {number} record {records}: {e}"))
        })?;
        batch.insert_into(&mem);
        records += 1;
        if !batch.is_empty() {
            *max_sequence = (*max_sequence).max(batch.last_sequence());
        }

        if mem.approximate_memory_usage() > config.write_buffer_size {
            flush_recovered(dir, config, cache, versions, edit, &mem)?;
            mem = MemTable::new();
        }
    }

    if !mem.is_empty() {
        flush_recovered(dir, config, cache, versions, edit, &mem)?;
    }
    if records == 0 {
        debug!(log = number, "log holds no records");
    } else {
        info!(log = number, records, "replayed log");
    }
    Ok(())
}

/// Write a recovered memtable to a level-0 table recorded in `edit`.
fn flush_recovered(
    dir: &Path,
    config: &EngineConfig,
    cache: &TableCache,
    versions: &mut VersionSet,
    edit: &mut VersionEdit,
    mem: &MemTable,
) -> Result<(), EngineError> {
    let number = versions.new_file_number();
    match build_table(dir, number, mem.iter(), config.block_size, cache)? {
        Some(meta) => {
            debug!(file = number, bytes = meta.file_size, "recovered memtable written");
            edit.add_file(0, meta.number, meta.file_size, meta.smallest, meta.largest);
        }
        None => versions.reuse_file_number(number),
    }
    Ok(())
}
