//! Shared fixtures for compaction tests.

use std::path::Path;

use tracing_subscriber::EnvFilter;

use crate::engine::EngineConfig;
use crate::key::{InternalKey, ValueType};
use crate::version::{VersionEdit, VersionSet};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn ik(key: &str, seq: u64) -> InternalKey {
    InternalKey::new(key.as_bytes(), seq, ValueType::Value)
}

pub fn del(key: &str, seq: u64) -> InternalKey {
    InternalKey::new(key.as_bytes(), seq, ValueType::Deletion)
}

/// Version set whose current version holds `(level, number, smallest,
/// largest, size)` files. The table files themselves are never opened.
pub fn set_with(dir: &Path, config: EngineConfig, files: &[(usize, u64, &str, &str, u64)]) -> VersionSet {
    let mut vs = VersionSet::new(dir, config);
    let mut edit = VersionEdit::new();
    for &(level, number, smallest, largest, size) in files {
        vs.mark_file_number_used(number);
        edit.add_file(level, number, size, ik(smallest, 100), ik(largest, 1));
    }
    vs.log_and_apply(edit).unwrap();
    vs
}

pub fn numbers(files: &[std::sync::Arc<crate::version::FileMetaData>]) -> Vec<u64> {
    let mut out: Vec<u64> = files.iter().map(|f| f.number).collect();
    out.sort_unstable();
    out
}
