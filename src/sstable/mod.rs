//! Sorted String Table (SSTable) Module
//!
//! Immutable, disk-backed sorted runs of internal-key entries. Minor
//! compaction writes one table per flushed memtable; major compaction
//! merges tables from adjacent levels into new ones.
//!
//! # On-disk layout
//!
//! ```text
//! [HEADER_BYTES][HEADER_CRC32_LE]
//! [DATA_BLOCK_LEN_LE][DATA_BLOCK_BYTES][DATA_BLOCK_CRC32_LE]
//! [DATA_BLOCK_LEN_LE][DATA_BLOCK_BYTES][DATA_BLOCK_CRC32_LE]
//! ...
//! [BLOOM_FILTER_LEN_LE][BLOOM_FILTER_BYTES][BLOOM_FILTER_CRC32_LE]
//! [PROPERTIES_LEN_LE][PROPERTIES_BYTES][PROPERTIES_CRC32_LE]
//! [METAINDEX_LEN_LE][METAINDEX_BYTES][METAINDEX_CRC32_LE]
//! [INDEX_LEN_LE][INDEX_BYTES][INDEX_CRC32_LE]
//! [FOOTER_BYTES]
//! ```
//!
//! - **Header**: magic and format version, followed by a CRC32.
//! - **Data blocks**: concatenated `[InternalKey][value]` cells in
//!   internal-key order.
//! - **Bloom filter block**: built over *user* keys, so a point lookup at
//!   any snapshot can skip the table.
//! - **Properties block**: smallest/largest internal key, sequence bounds and
//!   entry counts.
//! - **Metaindex block**: named handles to the bloom and properties blocks.
//! - **Index block**: the last internal key of every data block with its
//!   handle; a binary search finds the only block that can hold a key.
//! - **Footer**: metaindex handle, index handle, total file size, CRC32.
//!
//! # Sub-modules
//!
//! - [`builder`]: [`TableBuilder`] writes a table one entry at a time.
//! - [`iterator`]: [`BlockIterator`] and [`TableIterator`] for reading.
//! - [`cache`]: [`TableCache`] keeps opened tables keyed by file number.
//!
//! # Concurrency model
//!
//! Tables are never modified after the builder renames them into place, so
//! an opened [`Table`] is shared freely behind an `Arc` and read without
//! locks.

pub mod builder;
pub mod cache;
pub mod iterator;

#[cfg(test)]
mod tests;

pub use builder::TableBuilder;
pub use cache::TableCache;
pub use iterator::{BlockIterator, TableIterator};

use std::fs::File;
use std::io;
use std::path::Path;
use std::sync::Arc;

use bloomfilter::Bloom;
use crc32fast::Hasher as Crc32;
use memmap2::Mmap;
use thiserror::Error;
use tracing::{debug, trace};

use crate::encoding::{self, Decode, Encode, EncodingError, Reader};
use crate::key::{HexKey, InternalKey, SequenceNumber, ValueType};
use crate::memtable::LookupResult;

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

const TABLE_MAGIC: [u8; 4] = *b"SST1";
const TABLE_VERSION: u32 = 1;
const BLOOM_FALSE_POSITIVE_RATE: f64 = 0.01;
const HEADER_SIZE: usize = 8;
const FOOTER_SIZE: usize = 44;
const BLOCK_LEN_SIZE: usize = 4;
const BLOCK_CHECKSUM_SIZE: usize = 4;

const META_BLOOM: &str = "filter.bloom";
const META_PROPERTIES: &str = "meta.properties";

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by table operations (open, read, build).
#[derive(Debug, Error)]
pub enum SSTableError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Encoding / decoding error.
    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// A block, header or footer checksum did not match.
    #[error("Checksum mismatch")]
    ChecksumMismatch,

    /// Structurally invalid table contents.
    #[error("Corruption: {0}")]
    Corruption(String),
}

// ------------------------------------------------------------------------------------------------
// On-disk format structures
// ------------------------------------------------------------------------------------------------

/// Table file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TableHeader {
    magic: [u8; 4],
    version: u32,
}

/// Location of a checksummed block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BlockHandle {
    /// Offset of the block's length prefix.
    pub(crate) offset: u64,

    /// Size of the block in bytes, including length prefix and checksum.
    pub(crate) size: u64,
}

/// Table-level metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableProperties {
    /// Creation timestamp (UNIX epoch nanos).
    pub creation_timestamp: u64,

    /// Total number of entries.
    pub entry_count: u64,

    /// Number of deletion markers.
    pub deletion_count: u64,

    pub min_sequence: SequenceNumber,
    pub max_sequence: SequenceNumber,

    /// First internal key in the table.
    pub smallest: InternalKey,

    /// Last internal key in the table.
    pub largest: InternalKey,
}

/// Index entry pointing to one data block.
#[derive(Debug, Clone)]
pub(crate) struct IndexEntry {
    /// Largest internal key stored in the block.
    pub(crate) last_key: InternalKey,
    pub(crate) handle: BlockHandle,
}

#[derive(Debug)]
pub(crate) struct MetaIndexEntry {
    pub(crate) name: String,
    pub(crate) handle: BlockHandle,
}

/// Table footer, stored in the last [`FOOTER_SIZE`] bytes.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TableFooter {
    pub(crate) metaindex: BlockHandle,
    pub(crate) index: BlockHandle,

    /// Total size of the file, footer included.
    pub(crate) total_file_size: u64,

    /// CRC32 of the footer fields before this one.
    pub(crate) footer_crc32: u32,
}

// ------------------------------------------------------------------------------------------------
// Encoding implementations
// ------------------------------------------------------------------------------------------------

impl Encode for TableHeader {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.magic.encode_to(buf)?;
        self.version.encode_to(buf)
    }
}

impl Decode for TableHeader {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut r = Reader::new(buf);
        let header = Self {
            magic: r.read()?,
            version: r.read()?,
        };
        Ok((header, r.consumed()))
    }
}

impl Encode for BlockHandle {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.offset.encode_to(buf)?;
        self.size.encode_to(buf)
    }
}

impl Decode for BlockHandle {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut r = Reader::new(buf);
        let handle = Self {
            offset: r.read()?,
            size: r.read()?,
        };
        Ok((handle, r.consumed()))
    }
}

impl Encode for TableProperties {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.creation_timestamp.encode_to(buf)?;
        self.entry_count.encode_to(buf)?;
        self.deletion_count.encode_to(buf)?;
        self.min_sequence.encode_to(buf)?;
        self.max_sequence.encode_to(buf)?;
        self.smallest.encode_to(buf)?;
        self.largest.encode_to(buf)
    }
}

impl Decode for TableProperties {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut r = Reader::new(buf);
        let props = Self {
            creation_timestamp: r.read()?,
            entry_count: r.read()?,
            deletion_count: r.read()?,
            min_sequence: r.read()?,
            max_sequence: r.read()?,
            smallest: r.read()?,
            largest: r.read()?,
        };
        Ok((props, r.consumed()))
    }
}

impl Encode for IndexEntry {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.last_key.encode_to(buf)?;
        self.handle.encode_to(buf)
    }
}

impl Decode for IndexEntry {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut r = Reader::new(buf);
        let entry = Self {
            last_key: r.read()?,
            handle: r.read()?,
        };
        Ok((entry, r.consumed()))
    }
}

impl Encode for MetaIndexEntry {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.name.encode_to(buf)?;
        self.handle.encode_to(buf)
    }
}

impl Decode for MetaIndexEntry {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut r = Reader::new(buf);
        let entry = Self {
            name: r.read()?,
            handle: r.read()?,
        };
        Ok((entry, r.consumed()))
    }
}

impl Encode for TableFooter {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.metaindex.encode_to(buf)?;
        self.index.encode_to(buf)?;
        self.total_file_size.encode_to(buf)?;
        self.footer_crc32.encode_to(buf)
    }
}

impl Decode for TableFooter {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut r = Reader::new(buf);
        let footer = Self {
            metaindex: r.read()?,
            index: r.read()?,
            total_file_size: r.read()?,
            footer_crc32: r.read()?,
        };
        Ok((footer, r.consumed()))
    }
}

pub(crate) fn checksum(data: &[u8]) -> u32 {
    let mut hasher = Crc32::new();
    hasher.update(data);
    hasher.finalize()
}

// ------------------------------------------------------------------------------------------------
// Table (immutable reader)
// ------------------------------------------------------------------------------------------------

/// A memory-mapped, immutable table.
pub struct Table {
    mmap: Mmap,
    bloom: Vec<u8>,
    properties: TableProperties,
    pub(crate) index: Vec<IndexEntry>,
    footer: TableFooter,
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Table")
            .field("file_size", &self.file_size())
            .field("blocks", &self.index.len())
            .field("properties", &self.properties)
            .finish()
    }
}

impl Table {
    /// Open and verify the table at `path`.
    ///
    /// Header, footer, metaindex, properties and index are verified and
    /// decoded eagerly; data blocks are verified when first read.
    ///
    /// # Errors
    ///
    /// - [`SSTableError::ChecksumMismatch`] if any checksum fails.
    /// - [`SSTableError::Corruption`] for bad magic/version, out-of-range
    ///   handles, a missing properties block or an unknown metaindex entry.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SSTableError> {
        let path = path.as_ref();
        let file = File::open(path)?;

        // SAFETY: table files are immutable once renamed into place and the
        // mapping is read-only. Every slice below is bounds-checked first.
        let mmap = unsafe { Mmap::map(&file)? };

        let file_len = mmap.len();
        if file_len < HEADER_SIZE + BLOCK_CHECKSUM_SIZE + FOOTER_SIZE {
            return Err(SSTableError::Corruption("file too small".into()));
        }

        let header_bytes = &mmap[..HEADER_SIZE];
        let stored = read_u32(&mmap[HEADER_SIZE..HEADER_SIZE + BLOCK_CHECKSUM_SIZE]);
        if stored != checksum(header_bytes) {
            return Err(SSTableError::ChecksumMismatch);
        }
        let (header, _) = encoding::decode_from_slice::<TableHeader>(header_bytes)?;
        if header.magic != TABLE_MAGIC {
            return Err(SSTableError::Corruption("table header magic mismatch".into()));
        }
        if header.version != TABLE_VERSION {
            return Err(SSTableError::Corruption(format!(
                "unsupported table version {}",
                header.version
            )));
        }

        let footer_start = file_len - FOOTER_SIZE;
        let (footer, _) = encoding::decode_from_slice::<TableFooter>(&mmap[footer_start..])?;
        if footer.footer_crc32 != checksum(&mmap[footer_start..file_len - BLOCK_CHECKSUM_SIZE]) {
            return Err(SSTableError::ChecksumMismatch);
        }
        if footer.total_file_size != file_len as u64 {
            return Err(SSTableError::Corruption(format!(
                "footer records {} bytes, file has {file_len}",
                footer.total_file_size
            )));
        }

        let metaindex_bytes = read_block(&mmap, &footer.metaindex)?;
        let (meta_entries, _) = encoding::decode_vec::<MetaIndexEntry>(metaindex_bytes)?;

        let mut bloom = Vec::new();
        let mut properties = None;
        for entry in meta_entries {
            match entry.name.as_str() {
                META_BLOOM => bloom = read_block(&mmap, &entry.handle)?.to_vec(),
                META_PROPERTIES => {
                    let bytes = read_block(&mmap, &entry.handle)?;
                    properties = Some(encoding::decode_from_slice::<TableProperties>(bytes)?.0);
                }
                other => {
                    return Err(SSTableError::Corruption(format!(
                        "unknown metaindex entry {other:?}"
                    )));
                }
            }
        }
        let properties =
            properties.ok_or_else(|| SSTableError::Corruption("table missing properties".into()))?;

        let index_bytes = read_block(&mmap, &footer.index)?;
        let (index, _) = encoding::decode_vec::<IndexEntry>(index_bytes)?;

        debug!(
            path = %path.display(),
            entries = properties.entry_count,
            blocks = index.len(),
            "opened table"
        );

        Ok(Self {
            mmap,
            bloom,
            properties,
            index,
            footer,
        })
    }

    /// On-disk size in bytes.
    pub fn file_size(&self) -> u64 {
        self.footer.total_file_size
    }

    pub fn properties(&self) -> &TableProperties {
        &self.properties
    }

    /// `false` only when the bloom filter rules `user_key` out.
    pub fn may_contain(&self, user_key: &[u8]) -> bool {
        if self.bloom.is_empty() {
            return true;
        }
        match Bloom::<[u8]>::from_slice(&self.bloom) {
            Ok(bloom) => bloom.check(user_key),
            Err(_) => true,
        }
    }

    /// Newest entry for `user_key` visible at `sequence`.
    pub fn get(
        &self,
        user_key: &[u8],
        sequence: SequenceNumber,
    ) -> Result<LookupResult, SSTableError> {
        if !self.may_contain(user_key) {
            trace!(key = %HexKey(user_key), "bloom filter excluded key");
            return Ok(LookupResult::NotFound);
        }

        let lookup = InternalKey::for_lookup(user_key, sequence);
        let Some(block_idx) = self.find_block(&lookup) else {
            return Ok(LookupResult::NotFound);
        };

        let mut iter = BlockIterator::new(self.block_bytes(block_idx)?.to_vec());
        iter.seek(&lookup)?;
        match iter.next().transpose()? {
            Some((key, value)) if key.user_key() == user_key => Ok(match key.value_type() {
                ValueType::Value => LookupResult::Found(value),
                ValueType::Deletion => LookupResult::Deleted,
            }),
            _ => Ok(LookupResult::NotFound),
        }
    }

    /// Iterator over every entry, positioned at the first one.
    pub fn iter(self: &Arc<Self>) -> TableIterator {
        TableIterator::new(Arc::clone(self))
    }

    /// Iterator positioned at the first entry `>= target`.
    pub fn iter_from(self: &Arc<Self>, target: &InternalKey) -> Result<TableIterator, SSTableError> {
        let mut iter = TableIterator::new(Arc::clone(self));
        iter.seek(target)?;
        Ok(iter)
    }

    /// Index of the first block whose last key is `>= key`.
    pub(crate) fn find_block(&self, key: &InternalKey) -> Option<usize> {
        let idx = self.index.partition_point(|entry| entry.last_key < *key);
        (idx < self.index.len()).then_some(idx)
    }

    /// Verified bytes of data block `idx`.
    pub(crate) fn block_bytes(&self, idx: usize) -> Result<&[u8], SSTableError> {
        let entry = self
            .index
            .get(idx)
            .ok_or_else(|| SSTableError::Corruption(format!("block {idx} out of range")))?;
        read_block(&self.mmap, &entry.handle)
    }
}

fn read_u32(bytes: &[u8]) -> u32 {
    let mut arr = [0u8; 4];
    arr.copy_from_slice(&bytes[..4]);
    u32::from_le_bytes(arr)
}

/// Reads the block at `handle` and verifies its checksum.
pub(crate) fn read_block<'a>(mmap: &'a Mmap, handle: &BlockHandle) -> Result<&'a [u8], SSTableError> {
    let start = usize::try_from(handle.offset)
        .map_err(|_| SSTableError::Corruption("block offset exceeds addressable range".into()))?;
    let size = usize::try_from(handle.size)
        .map_err(|_| SSTableError::Corruption("block size exceeds addressable range".into()))?;

    if size < BLOCK_LEN_SIZE + BLOCK_CHECKSUM_SIZE
        || start.checked_add(size).is_none_or(|end| end > mmap.len())
    {
        return Err(SSTableError::Corruption("block out of range".into()));
    }

    let content_len = read_u32(&mmap[start..]) as usize;
    if BLOCK_LEN_SIZE + content_len + BLOCK_CHECKSUM_SIZE != size {
        return Err(SSTableError::Corruption("block length mismatch".into()));
    }

    let content_start = start + BLOCK_LEN_SIZE;
    let content = &mmap[content_start..content_start + content_len];
    let stored = read_u32(&mmap[content_start + content_len..]);
    if stored != checksum(content) {
        return Err(SSTableError::ChecksumMismatch);
    }
    Ok(content)
}
