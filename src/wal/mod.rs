//! Record log: the framing shared by the write-ahead log and the manifest.
//!
//! A log file is an append-only sequence of opaque records, each protected
//! by a CRC32 ([`crc32fast`]). The write path appends one encoded
//! [`WriteBatch`](crate::batch::WriteBatch) per group commit; the version set
//! appends one encoded [`VersionEdit`](crate::version::VersionEdit) per
//! manifest update. Both replay the file front-to-back with [`LogReader`].
//!
//! # On-disk layout
//!
//! ```text
//! [LogHeader][HEADER_CRC32_LE]
//! [REC_LEN_LE][REC_BYTES][REC_CRC32_LE]
//! [REC_LEN_LE][REC_BYTES][REC_CRC32_LE]
//! ...
//! ```
//!
//! - **Header**: magic `SLOG`, format version, maximum record size and the
//!   file number the log was created under, followed by a CRC32 of those bytes.
//! - **Record**: 4-byte little-endian length, payload, and a CRC32 computed
//!   over `len || payload`.
//!
//! # Durability
//!
//! [`LogWriter::append`] hands the whole frame to the OS in one write but
//! does not fsync; [`LogWriter::sync`] does. Callers decide per write whether
//! the sync is needed.
//!
//! # Torn tails
//!
//! A crash in the middle of an append leaves a short final frame. The reader
//! reports it as [`WalError::UnexpectedEof`]; recovery treats that as the end
//! of the log. A checksum failure is reported as
//! [`WalError::ChecksumMismatch`] and is never silently skipped here; the
//! caller decides, using [`LogReader::is_exhausted`], whether it hit the
//! final frame.

#[cfg(test)]
mod tests;

use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};

use crc32fast::Hasher as Crc32;
use thiserror::Error;
use tracing::{debug, error, info, trace};

use crate::encoding::{self, Decode, Encode, EncodingError, Reader};

const U32_SIZE: usize = std::mem::size_of::<u32>();

/// Encoded size of [`LogHeader`].
pub const LOG_HEADER_SIZE: usize = 20;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by log operations.
#[derive(Debug, Error)]
pub enum WalError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Header encoding / decoding error.
    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// A record's stored CRC did not match its contents.
    #[error("Checksum mismatch in record at offset {offset}")]
    ChecksumMismatch {
        /// Byte offset of the damaged frame.
        offset: u64,
    },

    /// Record exceeds the log's maximum record size.
    #[error("Record size exceeds limit ({0} bytes)")]
    RecordTooLarge(usize),

    /// The final frame is truncated.
    #[error("Unexpected end of file at offset {offset}")]
    UnexpectedEof {
        /// Byte offset of the truncated frame.
        offset: u64,
    },

    /// The file header failed validation.
    #[error("Invalid header: {0}")]
    InvalidHeader(String),
}

// ------------------------------------------------------------------------------------------------
// Header
// ------------------------------------------------------------------------------------------------

/// Metadata written at the start of every log file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogHeader {
    /// Magic constant identifying log files (`b"SLOG"`).
    pub magic: [u8; 4],

    /// Format version.
    pub version: u32,

    /// Largest record payload accepted by this log.
    pub max_record_size: u32,

    /// File number the log was created under.
    pub number: u64,
}

impl LogHeader {
    pub const MAGIC: [u8; 4] = *b"SLOG";
    pub const VERSION: u32 = 1;

    /// Default maximum record size (64 MiB).
    pub const DEFAULT_MAX_RECORD_SIZE: u32 = 64 * 1024 * 1024;

    pub fn new(number: u64, max_record_size: u32) -> Self {
        Self {
            magic: Self::MAGIC,
            version: Self::VERSION,
            max_record_size,
            number,
        }
    }
}

impl Encode for LogHeader {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.magic.encode_to(buf)?;
        self.version.encode_to(buf)?;
        self.max_record_size.encode_to(buf)?;
        self.number.encode_to(buf)
    }
}

impl Decode for LogHeader {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut r = Reader::new(buf);
        let header = Self {
            magic: r.read()?,
            version: r.read()?,
            max_record_size: r.read()?,
            number: r.read()?,
        };
        Ok((header, r.consumed()))
    }
}

fn crc_of(parts: &[&[u8]]) -> u32 {
    let mut hasher = Crc32::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize()
}

// ------------------------------------------------------------------------------------------------
// LogWriter
// ------------------------------------------------------------------------------------------------

/// Appends CRC-framed records to a freshly created log file.
#[derive(Debug)]
pub struct LogWriter {
    file: File,
    path: PathBuf,
    header: LogHeader,
    offset: u64,
}

impl LogWriter {
    /// Create (or truncate) the log at `path` and write its header.
    pub fn create(path: impl AsRef<Path>, number: u64) -> Result<Self, WalError> {
        Self::create_with_limit(path, number, LogHeader::DEFAULT_MAX_RECORD_SIZE)
    }

    pub fn create_with_limit(
        path: impl AsRef<Path>,
        number: u64,
        max_record_size: u32,
    ) -> Result<Self, WalError> {
        let path = path.as_ref();
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;

        let header = LogHeader::new(number, max_record_size);
        let mut bytes = encoding::encode_to_vec(&header)?;
        let checksum = crc_of(&[&bytes]);
        bytes.extend_from_slice(&checksum.to_le_bytes());
        file.write_all(&bytes)?;
        file.sync_all()?;

        info!(path = %path.display(), number, "created log file");

        Ok(Self {
            file,
            path: path.to_path_buf(),
            header,
            offset: bytes.len() as u64,
        })
    }

    /// Append one record. The frame reaches the OS but is not fsynced.
    pub fn append(&mut self, record: &[u8]) -> Result<(), WalError> {
        if record.len() > self.header.max_record_size as usize {
            return Err(WalError::RecordTooLarge(record.len()));
        }
        let len = (record.len() as u32).to_le_bytes();
        let checksum = crc_of(&[&len, record]);

        let mut frame = Vec::with_capacity(U32_SIZE + record.len() + U32_SIZE);
        frame.extend_from_slice(&len);
        frame.extend_from_slice(record);
        frame.extend_from_slice(&checksum.to_le_bytes());
        self.file.write_all(&frame)?;
        self.offset += frame.len() as u64;

        trace!(len = record.len(), checksum, "appended log record");
        Ok(())
    }

    /// Largest record [`append`](Self::append) accepts.
    pub fn max_record_size(&self) -> usize {
        self.header.max_record_size as usize
    }

    /// Force every appended record to stable storage.
    pub fn sync(&mut self) -> Result<(), WalError> {
        self.file.sync_data()?;
        trace!(path = %self.path.display(), bytes = self.offset, "log synced");
        Ok(())
    }

    #[cfg(test)]
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn number(&self) -> u64 {
        self.header.number
    }

    /// Bytes written so far, header included.
    #[cfg(test)]
    pub fn len(&self) -> u64 {
        self.offset
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.offset <= (LOG_HEADER_SIZE + U32_SIZE) as u64
    }
}

// ------------------------------------------------------------------------------------------------
// LogReader
// ------------------------------------------------------------------------------------------------

/// Streams records back out of a log file, verifying every checksum.
///
/// Iteration stops after the first error.
pub struct LogReader {
    reader: BufReader<File>,
    header: LogHeader,
    offset: u64,
    failed: bool,
}

impl LogReader {
    /// Open `path` and validate its header.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, WalError> {
        let path = path.as_ref();
        let mut reader = BufReader::new(File::open(path)?);

        let mut bytes = [0u8; LOG_HEADER_SIZE + U32_SIZE];
        reader.read_exact(&mut bytes).map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                WalError::InvalidHeader("file shorter than header".into())
            } else {
                WalError::Io(e)
            }
        })?;

        let (head, crc) = bytes.split_at(LOG_HEADER_SIZE);
        let stored = u32::from_le_bytes([crc[0], crc[1], crc[2], crc[3]]);
        if stored != crc_of(&[head]) {
            return Err(WalError::InvalidHeader("header checksum mismatch".into()));
        }

        let (header, _) = encoding::decode_from_slice::<LogHeader>(head)?;
        if header.magic != LogHeader::MAGIC {
            return Err(WalError::InvalidHeader("bad magic".into()));
        }
        if header.version != LogHeader::VERSION {
            return Err(WalError::InvalidHeader(format!(
                "unsupported version {}",
                header.version
            )));
        }

        debug!(path = %path.display(), number = header.number, "opened log for replay");

        Ok(Self {
            reader,
            header,
            offset: bytes.len() as u64,
            failed: false,
        })
    }

    #[cfg(test)]
    pub fn header(&self) -> &LogHeader {
        &self.header
    }

    /// `true` once every byte of the file has been consumed.
    ///
    /// After a [`WalError::ChecksumMismatch`] this tells whether the damaged
    /// frame was the last one in the file.
    pub fn is_exhausted(&mut self) -> Result<bool, WalError> {
        Ok(self.reader.fill_buf()?.is_empty())
    }

    fn read_record(&mut self) -> Option<Result<Vec<u8>, WalError>> {
        let start = self.offset;
        let eof = |e: io::Error| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                WalError::UnexpectedEof { offset: start }
            } else {
                WalError::Io(e)
            }
        };

        let mut len_bytes = [0u8; U32_SIZE];
        let mut filled = 0;
        while filled < U32_SIZE {
            match self.reader.read(&mut len_bytes[filled..]) {
                Ok(0) if filled == 0 => return None,
                Ok(0) => return Some(Err(WalError::UnexpectedEof { offset: start })),
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Some(Err(WalError::Io(e))),
            }
        }

        let len = u32::from_le_bytes(len_bytes) as usize;
        if len > self.header.max_record_size as usize {
            return Some(Err(WalError::RecordTooLarge(len)));
        }

        let mut record = vec![0u8; len];
        if let Err(e) = self.reader.read_exact(&mut record) {
            return Some(Err(eof(e)));
        }
        let mut crc = [0u8; U32_SIZE];
        if let Err(e) = self.reader.read_exact(&mut crc) {
            return Some(Err(eof(e)));
        }

        if u32::from_le_bytes(crc) != crc_of(&[&len_bytes, &record]) {
            error!(offset = start, len, "log record checksum mismatch");
            return Some(Err(WalError::ChecksumMismatch { offset: start }));
        }

        self.offset += (U32_SIZE + len + U32_SIZE) as u64;
        Some(Ok(record))
    }
}

impl Iterator for LogReader {
    type Item = Result<Vec<u8>, WalError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let item = self.read_record();
        if matches!(item, Some(Err(_))) {
            self.failed = true;
        }
        item
    }
}
