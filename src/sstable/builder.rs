//! Table writer: builds a complete table file one entry at a time.
//!
//! Entries must be added in strictly increasing internal-key order. Data
//! blocks are cut once they reach the configured block size; the bloom
//! filter, properties, metaindex, index and footer are written by
//! [`TableBuilder::finish`].
//!
//! # Atomicity
//!
//! 1. Write everything to a temporary sibling file.
//! 2. Flush and sync the file.
//! 3. Rename it onto the final path.
//!
//! A crash cannot leave a partially-written table under its final name.
//! [`TableBuilder::abandon`] removes the temporary file instead.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::mem;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use bloomfilter::Bloom;
use tracing::{debug, warn};

use crate::encoding::{self, Encode};
use crate::key::{InternalKey, SequenceNumber};

use super::{
    BLOCK_CHECKSUM_SIZE, BLOCK_LEN_SIZE, BLOOM_FALSE_POSITIVE_RATE, BlockHandle, FOOTER_SIZE,
    IndexEntry, META_BLOOM, META_PROPERTIES, MetaIndexEntry, SSTableError, TABLE_MAGIC,
    TABLE_VERSION, TableFooter, TableHeader, TableProperties, checksum,
};

/// Default target size of one data block.
pub const DEFAULT_BLOCK_SIZE: usize = 4096;

// ------------------------------------------------------------------------------------------------
// BuildStats
// ------------------------------------------------------------------------------------------------

/// Statistics gathered while entries are added; becomes [`TableProperties`].
#[derive(Default)]
struct BuildStats {
    entry_count: u64,
    deletion_count: u64,
    min_sequence: SequenceNumber,
    max_sequence: SequenceNumber,
    smallest: Option<InternalKey>,
}

impl BuildStats {
    fn track(&mut self, key: &InternalKey) {
        if self.entry_count == 0 {
            self.min_sequence = key.sequence();
            self.smallest = Some(key.clone());
        }
        self.entry_count += 1;
        if key.is_deletion() {
            self.deletion_count += 1;
        }
        self.min_sequence = self.min_sequence.min(key.sequence());
        self.max_sequence = self.max_sequence.max(key.sequence());
    }
}

// ------------------------------------------------------------------------------------------------
// TableBuilder
// ------------------------------------------------------------------------------------------------

/// Incremental table writer.
///
/// ```rust,ignore
/// let mut builder = TableBuilder::create(&path, 4096)?;
/// for (key, value) in entries {
///     builder.add(&key, &value)?;
/// }
/// let file_size = builder.finish()?;
/// ```
pub struct TableBuilder {
    writer: BufWriter<File>,
    tmp_path: PathBuf,
    final_path: PathBuf,
    block_size: usize,

    /// Bytes handed to `writer` so far.
    offset: u64,
    block: Vec<u8>,
    index: Vec<IndexEntry>,
    last_key: Option<InternalKey>,

    /// Distinct user keys, in order; hashed into the bloom filter at finish.
    bloom_keys: Vec<Vec<u8>>,
    stats: BuildStats,
}

impl TableBuilder {
    /// Start a table that will be renamed to `path` by [`finish`](Self::finish).
    pub fn create(path: impl AsRef<Path>, block_size: usize) -> Result<Self, SSTableError> {
        let final_path = path.as_ref().to_path_buf();
        let tmp_path = final_path.with_extension("dbtmp");
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;

        let mut builder = Self {
            writer: BufWriter::new(file),
            tmp_path,
            final_path,
            block_size: block_size.max(1),
            offset: 0,
            block: Vec::new(),
            index: Vec::new(),
            last_key: None,
            bloom_keys: Vec::new(),
            stats: BuildStats::default(),
        };
        builder.write_header()?;
        Ok(builder)
    }

    /// Append one entry. Keys must arrive in strictly increasing order.
    pub fn add(&mut self, key: &InternalKey, value: &[u8]) -> Result<(), SSTableError> {
        if let Some(last) = &self.last_key {
            if key <= last {
                return Err(SSTableError::Corruption(format!(
                    "table keys out of order: {key} after {last}"
                )));
            }
            if last.user_key() != key.user_key() {
                self.bloom_keys.push(key.user_key().to_vec());
            }
        } else {
            self.bloom_keys.push(key.user_key().to_vec());
        }

        self.stats.track(key);
        key.encode_to(&mut self.block)?;
        value.encode_to(&mut self.block)?;
        self.last_key = Some(key.clone());

        if self.block.len() >= self.block_size {
            self.flush_block()?;
        }
        Ok(())
    }

    /// Number of entries added so far.
    pub fn num_entries(&self) -> u64 {
        self.stats.entry_count
    }

    /// Size the file would have if finished now, excluding the trailing
    /// metadata blocks.
    pub fn file_size(&self) -> u64 {
        self.offset + self.block.len() as u64
    }

    /// Write the trailing blocks, sync, and rename into place.
    ///
    /// Returns the final file size.
    pub fn finish(mut self) -> Result<u64, SSTableError> {
        if !self.block.is_empty() {
            self.flush_block()?;
        }

        let mut bloom: Bloom<[u8]> =
            Bloom::new_for_fp_rate(self.bloom_keys.len().max(1), BLOOM_FALSE_POSITIVE_RATE)
                .map_err(|e| SSTableError::Corruption(e.to_string()))?;
        for key in &self.bloom_keys {
            bloom.set(key.as_slice());
        }
        let bloom_handle = self.write_block(bloom.as_slice())?;

        let stats = mem::take(&mut self.stats);
        let properties = TableProperties {
            creation_timestamp: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_nanos() as u64)
                .unwrap_or_default(),
            entry_count: stats.entry_count,
            deletion_count: stats.deletion_count,
            min_sequence: stats.min_sequence,
            max_sequence: stats.max_sequence,
            smallest: stats
                .smallest
                .unwrap_or_else(|| InternalKey::for_lookup(b"", 0)),
            largest: self
                .last_key
                .clone()
                .unwrap_or_else(|| InternalKey::for_lookup(b"", 0)),
        };
        let props_handle = self.write_block(&encoding::encode_to_vec(&properties)?)?;

        let meta_entries = vec![
            MetaIndexEntry {
                name: META_BLOOM.to_string(),
                handle: bloom_handle,
            },
            MetaIndexEntry {
                name: META_PROPERTIES.to_string(),
                handle: props_handle,
            },
        ];
        let mut meta_bytes = Vec::new();
        encoding::encode_vec(&meta_entries, &mut meta_bytes)?;
        let metaindex = self.write_block(&meta_bytes)?;

        let mut index_bytes = Vec::new();
        encoding::encode_vec(&self.index, &mut index_bytes)?;
        let index = self.write_block(&index_bytes)?;

        let mut footer = TableFooter {
            metaindex,
            index,
            total_file_size: self.offset + FOOTER_SIZE as u64,
            footer_crc32: 0,
        };
        let bytes = encoding::encode_to_vec(&footer)?;
        footer.footer_crc32 = checksum(&bytes[..FOOTER_SIZE - BLOCK_CHECKSUM_SIZE]);
        let bytes = encoding::encode_to_vec(&footer)?;
        self.write_raw(&bytes)?;

        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        fs::rename(&self.tmp_path, &self.final_path)?;

        debug!(
            path = %self.final_path.display(),
            entries = properties.entry_count,
            bytes = self.offset,
            "table finished"
        );
        Ok(self.offset)
    }

    /// Drop the partially-written file.
    pub fn abandon(self) {
        if let Err(e) = fs::remove_file(&self.tmp_path) {
            warn!(path = %self.tmp_path.display(), error = %e, "failed to remove abandoned table");
        }
    }

    fn write_header(&mut self) -> Result<(), SSTableError> {
        let header = TableHeader {
            magic: TABLE_MAGIC,
            version: TABLE_VERSION,
        };
        let mut bytes = encoding::encode_to_vec(&header)?;
        let crc = checksum(&bytes);
        bytes.extend_from_slice(&crc.to_le_bytes());
        self.write_raw(&bytes)
    }

    fn flush_block(&mut self) -> Result<(), SSTableError> {
        let Some(last_key) = self.last_key.clone() else {
            return Ok(());
        };
        let block = mem::take(&mut self.block);
        let handle = self.write_block(&block)?;
        self.index.push(IndexEntry { last_key, handle });
        Ok(())
    }

    /// Writes `[len_le][data][crc32_le]` and returns its handle.
    fn write_block(&mut self, data: &[u8]) -> Result<BlockHandle, SSTableError> {
        let offset = self.offset;
        let len = u32::try_from(data.len())
            .map_err(|_| SSTableError::Corruption(format!("block of {} bytes", data.len())))?;
        self.write_raw(&len.to_le_bytes())?;
        self.write_raw(data)?;
        self.write_raw(&checksum(data).to_le_bytes())?;
        Ok(BlockHandle {
            offset,
            size: (BLOCK_LEN_SIZE + data.len() + BLOCK_CHECKSUM_SIZE) as u64,
        })
    }

    fn write_raw(&mut self, bytes: &[u8]) -> Result<(), SSTableError> {
        self.writer.write_all(bytes)?;
        self.offset += bytes.len() as u64;
        Ok(())
    }
}
