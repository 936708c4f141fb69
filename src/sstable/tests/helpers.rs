//! Shared fixtures for table tests.

use std::path::Path;

use crate::key::{InternalKey, ValueType};
use crate::sstable::TableBuilder;

pub fn put(key: &str, seq: u64) -> (InternalKey, Vec<u8>) {
    (
        InternalKey::new(key.as_bytes(), seq, ValueType::Value),
        format!("{key}@{seq}").into_bytes(),
    )
}

pub fn del(key: &str, seq: u64) -> (InternalKey, Vec<u8>) {
    (InternalKey::new(key.as_bytes(), seq, ValueType::Deletion), Vec::new())
}

/// Builds a table from `entries` (sorted by the caller) and returns its size.
pub fn build(path: &Path, block_size: usize, mut entries: Vec<(InternalKey, Vec<u8>)>) -> u64 {
    entries.sort_by(|a, b| a.0.cmp(&b.0));
    let mut builder = TableBuilder::create(path, block_size).unwrap();
    for (key, value) in &entries {
        builder.add(key, value).unwrap();
    }
    builder.finish().unwrap()
}

/// `count` puts `key-0000 ..` with sequence numbers `1..=count`.
pub fn sequential(count: usize) -> Vec<(InternalKey, Vec<u8>)> {
    (0..count)
        .map(|i| put(&format!("key-{i:04}"), i as u64 + 1))
        .collect()
}
