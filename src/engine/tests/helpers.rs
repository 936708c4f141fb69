use std::fs;
use std::path::Path;

use tracing_subscriber::EnvFilter;

use crate::batch::WriteBatch;
use crate::engine::{Engine, EngineConfig};
use crate::filename::{FileType, parse_file_name};
use crate::key::Entry;

/// Initialize tracing subscriber controlled by `RUST_LOG` env var.
/// Only the first call takes effect.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Buffer large enough that nothing is flushed unless a test asks for it.
pub fn memtable_only_config() -> EngineConfig {
    init_tracing();
    EngineConfig {
        write_buffer_size: 64 * 1024 * 1024,
        ..EngineConfig::default()
    }
}

/// Flushed memtables always land in level 0, so level-0 behavior is
/// deterministic.
pub fn level0_config(write_buffer_size: usize) -> EngineConfig {
    init_tracing();
    EngineConfig {
        write_buffer_size,
        max_mem_compact_level: 0,
        ..EngineConfig::default()
    }
}

/// Tiny buffer and small files: every few writes switch the memtable and
/// compactions run constantly.
pub fn small_buffer_config() -> EngineConfig {
    init_tracing();
    EngineConfig {
        write_buffer_size: 1024,
        max_bytes_for_level_base: 16 * 1024,
        max_file_size: 4 * 1024,
        max_grandparent_overlap_bytes: 40 * 1024,
        expanded_compaction_byte_limit: 100 * 1024,
        block_size: 512,
        ..EngineConfig::default()
    }
}

pub fn key(i: usize) -> Vec<u8> {
    format!("key-{i:04}").into_bytes()
}

pub fn value(i: usize) -> Vec<u8> {
    format!("value-{i:04}").into_bytes()
}

pub fn put(engine: &Engine, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
    let mut batch = WriteBatch::new();
    batch.put(key, value);
    engine.write(batch, false).unwrap();
}

pub fn delete(engine: &Engine, key: impl Into<Vec<u8>>) {
    let mut batch = WriteBatch::new();
    batch.delete(key);
    engine.write(batch, false).unwrap();
}

/// Numbers of the directory's files of `kind`, ascending.
pub fn files_of(dir: &Path, kind: FileType) -> Vec<u64> {
    let mut numbers: Vec<u64> = fs::read_dir(dir)
        .unwrap()
        .filter_map(|entry| {
            let name = entry.unwrap().file_name();
            match name.to_str().and_then(parse_file_name) {
                Some((k, number)) if k == kind => Some(number),
                _ => None,
            }
        })
        .collect();
    numbers.sort_unstable();
    numbers
}

/// Every entry stored in table `number`, in file order.
pub fn table_entries(engine: &Engine, number: u64) -> Vec<Entry> {
    engine
        .inner()
        .table_cache
        .iter(number)
        .unwrap()
        .collect::<Result<Vec<_>, _>>()
        .unwrap()
}

/// Every entry stored in any live table, level by level.
pub fn all_table_entries(engine: &Engine) -> Vec<Entry> {
    let version = engine.inner().state.lock().versions.current();
    let mut entries = Vec::new();
    for level in 0..version.num_levels() {
        for file in version.files(level) {
            entries.extend(table_entries(engine, file.number));
        }
    }
    entries
}

pub fn total_files(engine: &Engine) -> usize {
    let levels = engine.inner().config.num_levels;
    (0..levels).map(|l| engine.num_files_at_level(l)).sum()
}

/// Block until the background worker has nothing scheduled.
pub fn wait_for_background(engine: &Engine) {
    let inner = engine.inner();
    let mut state = inner.state.lock();
    while state.bg_scheduled {
        inner.bg_done.wait(&mut state);
    }
}
