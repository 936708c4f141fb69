//! Shared fixtures for version tests.

use std::path::Path;
use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use crate::engine::EngineConfig;
use crate::key::{InternalKey, ValueType};
use crate::sstable::TableBuilder;
use crate::filename::table_file_name;
use crate::version::{FileMetaData, Version, VersionBuilder, VersionEdit};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn ik(key: &str, seq: u64) -> InternalKey {
    InternalKey::new(key.as_bytes(), seq, ValueType::Value)
}

pub fn meta(number: u64, smallest: &str, largest: &str, size: u64) -> Arc<FileMetaData> {
    Arc::new(FileMetaData::new(number, size, ik(smallest, 10), ik(largest, 1)))
}

/// Config with seven levels and otherwise default knobs.
pub fn config() -> EngineConfig {
    EngineConfig::default()
}

/// Version holding `(level, number, smallest, largest, size)` files.
pub fn version_with(files: &[(usize, u64, &str, &str, u64)]) -> Version {
    let mut edit = VersionEdit::new();
    for &(level, number, smallest, largest, size) in files {
        edit.add_file(level, number, size, ik(smallest, 10), ik(largest, 1));
    }
    let mut builder = VersionBuilder::new(Arc::new(Version::new(config().num_levels)));
    builder.apply(&edit).unwrap();
    let mut version = builder.build().unwrap();
    version.finalize(&config());
    version
}

pub fn numbers(files: &[Arc<FileMetaData>]) -> Vec<u64> {
    let mut out: Vec<u64> = files.iter().map(|f| f.number).collect();
    out.sort_unstable();
    out
}

/// Write table `number` holding `key@seq` puts; returns its size.
pub fn write_table(dir: &Path, number: u64, entries: &[(&str, u64)]) -> u64 {
    let mut keys: Vec<InternalKey> = entries.iter().map(|(k, s)| ik(k, *s)).collect();
    keys.sort();
    let mut builder = TableBuilder::create(table_file_name(dir, number), 4096).unwrap();
    for key in &keys {
        let value = format!("{}@{}", String::from_utf8_lossy(key.user_key()), key.sequence());
        builder.add(key, value.as_bytes()).unwrap();
    }
    builder.finish().unwrap()
}
