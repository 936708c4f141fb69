//! File naming inside a database directory.
//!
//! | File                 | Name               |
//! |----------------------|--------------------|
//! | write-ahead log      | `000007.log`       |
//! | sorted table         | `000012.sst`       |
//! | manifest             | `MANIFEST-000003`  |
//! | current pointer      | `CURRENT`          |
//! | temporary            | `000004.dbtmp`     |
//!
//! All numbered files draw from the single counter owned by the version set.

use std::path::{Path, PathBuf};

/// Kind of a file found in the database directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    Log,
    Table,
    Manifest,
    Current,
    Temp,
}

pub fn log_file_name(dir: &Path, number: u64) -> PathBuf {
    dir.join(format!("{number:06}.log"))
}

pub fn table_file_name(dir: &Path, number: u64) -> PathBuf {
    dir.join(format!("{number:06}.sst"))
}

pub fn manifest_file_name(dir: &Path, number: u64) -> PathBuf {
    dir.join(format!("MANIFEST-{number:06}"))
}

pub fn current_file_name(dir: &Path) -> PathBuf {
    dir.join("CURRENT")
}

pub fn temp_file_name(dir: &Path, number: u64) -> PathBuf {
    dir.join(format!("{number:06}.dbtmp"))
}

/// Classify a bare file name. Returns `None` for files the engine does not own.
///
/// `CURRENT` has no number and is reported with number 0.
pub fn parse_file_name(name: &str) -> Option<(FileType, u64)> {
    if name == "CURRENT" {
        return Some((FileType::Current, 0));
    }
    if let Some(rest) = name.strip_prefix("MANIFEST-") {
        return parse_number(rest).map(|n| (FileType::Manifest, n));
    }

    let (stem, ext) = name.split_once('.')?;
    let number = parse_number(stem)?;
    let file_type = match ext {
        "log" => FileType::Log,
        "sst" => FileType::Table,
        "dbtmp" => FileType::Temp,
        _ => return None,
    };
    Some((file_type, number))
}

fn parse_number(digits: &str) -> Option<u64> {
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}
