//! # Manifest Component
//!
//! The manifest is the durable history of the LSM tree's shape. Each record
//! is one encoded version edit; replaying every record of the current
//! manifest, in order, rebuilds the file set of every level, the log
//! number, the next file number and the last sequence number.
//!
//! ## Files
//!
//! - `MANIFEST-NNNNNN`: a record log (see [`crate::wal`]) of edits. The first
//!   record of a fresh manifest is a snapshot of the whole tree; later
//!   records are deltas.
//! - `CURRENT`: one line naming the live manifest, e.g. `MANIFEST-000005\n`.
//!
//! ## Durability
//!
//! [`ManifestWriter::append`] syncs every record before returning.
//! [`set_current_file`] writes the new pointer to a temporary file, syncs it,
//! renames it over `CURRENT` and then syncs the directory, so a crash leaves
//! `CURRENT` naming either the old or the new manifest.
//!
//! ## Recovery
//!
//! A torn or checksum-failing final record is the trace of a crash during
//! an append whose caller never saw success, so [`read_manifest`] stops
//! there, as log replay does. Damage before the last record is reported as
//! an error.


use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

use thiserror::Error;
use tracing::{info, warn};

use crate::encoding::{self, Decode, Encode, EncodingError};
use crate::filename::{FileType, current_file_name, manifest_file_name, parse_file_name, temp_file_name};
use crate::wal::{LogReader, LogWriter, WalError};

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by manifest operations.
#[derive(Debug, Error)]
pub enum ManifestError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Underlying record log failure.
    #[error("Log error: {0}")]
    Wal(#[from] WalError),

    /// Encoding / decoding error.
    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// `CURRENT` or a manifest record is malformed.
    #[error("Corruption: {0}")]
    Corruption(String),
}

// ------------------------------------------------------------------------------------------------
// Writer
// ------------------------------------------------------------------------------------------------

/// Appends edit records to one manifest file.
#[derive(Debug)]
pub struct ManifestWriter {
    log: LogWriter,
}

impl ManifestWriter {
    /// Create `MANIFEST-<number>` in `dir`.
    pub fn create(dir: &Path, number: u64) -> Result<Self, ManifestError> {
        let log = LogWriter::create(manifest_file_name(dir, number), number)?;
        Ok(Self { log })
    }

    /// Append and sync one record.
    pub fn append<T: Encode>(&mut self, record: &T) -> Result<(), ManifestError> {
        let bytes = encoding::encode_to_vec(record)?;
        self.log.append(&bytes)?;
        self.log.sync()?;
        Ok(())
    }

    #[cfg(test)]
    pub fn number(&self) -> u64 {
        self.log.number()
    }

    /// Bytes written so far.
    #[cfg(test)]
    pub fn size(&self) -> u64 {
        self.log.len()
    }
}

// ------------------------------------------------------------------------------------------------
// Reader
// ------------------------------------------------------------------------------------------------

/// Decode every record of `MANIFEST-<number>`, stopping at a damaged tail.
pub fn read_manifest<T: Decode>(dir: &Path, number: u64) -> Result<Vec<T>, ManifestError> {
    let path = manifest_file_name(dir, number);
    let mut records = Vec::new();
    let mut reader = LogReader::open(&path)?;
    while let Some(item) = reader.next() {
        match item {
            Ok(bytes) => {
                let (record, consumed) = encoding::decode_from_slice::<T>(&bytes)?;
                if consumed != bytes.len() {
                    return Err(ManifestError::Corruption(format!(
                        "manifest record {} has {} trailing bytes",
                        records.len(),
                        bytes.len() - consumed
                    )));
                }
                records.push(record);
            }
            Err(WalError::UnexpectedEof { offset }) => {
                warn!(path = %path.display(), offset, "ignoring torn manifest tail");
                break;
            }
            Err(WalError::ChecksumMismatch { offset }) if reader.is_exhausted()? => {
                warn!(path = %path.display(), offset, "ignoring damaged final manifest record");
                break;
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(records)
}

// ------------------------------------------------------------------------------------------------
// CURRENT
// ------------------------------------------------------------------------------------------------

/// Point `CURRENT` at `MANIFEST-<number>`, atomically.
pub fn set_current_file(dir: &Path, number: u64) -> Result<(), ManifestError> {
    let contents = format!("MANIFEST-{number:06}\n");
    let tmp_path = temp_file_name(dir, number);
    {
        let mut f = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;
        f.write_all(contents.as_bytes())?;
        f.sync_all()?;
    }

    if let Err(e) = fs::rename(&tmp_path, current_file_name(dir)) {
        let _ = fs::remove_file(&tmp_path);
        return Err(e.into());
    }
    fsync_dir(dir)?;

    info!(manifest = number, "CURRENT updated");
    Ok(())
}

/// Number of the manifest `CURRENT` names, or `None` if there is no `CURRENT`.
pub fn read_current_file(dir: &Path) -> Result<Option<u64>, ManifestError> {
    let contents = match fs::read_to_string(current_file_name(dir)) {
        Ok(s) => s,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let name = contents
        .strip_suffix('\n')
        .ok_or_else(|| ManifestError::Corruption("CURRENT does not end with a newline".into()))?;
    match parse_file_name(name) {
        Some((FileType::Manifest, number)) => Ok(Some(number)),
        _ => Err(ManifestError::Corruption(format!(
            "CURRENT names {name:?}, not a manifest"
        ))),
    }
}

/// Make a rename inside `dir` durable.
pub fn fsync_dir(dir: &Path) -> Result<(), ManifestError> {
    File::open(dir)?.sync_all()?;
    Ok(())
}
