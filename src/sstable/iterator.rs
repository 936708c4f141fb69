//! Table iterators: block-level and whole-table.
//!
//! - [`BlockIterator`] decodes a single data block and yields entries.
//! - [`TableIterator`] walks the data blocks of one table in order, loading
//!   each block lazily.
//!
//! # Block layout
//!
//! ```text
//! [KEY_LEN][USER_KEY][TAG][VALUE_LEN][VALUE]
//! [KEY_LEN][USER_KEY][TAG][VALUE_LEN][VALUE]
//! ...
//! ```
//!
//! Seeking is linear within a block. Blocks are small (4 KiB by default),
//! so a linear search is cheap. Undecodable bytes are reported as an error
//! and end the iteration.

use std::sync::Arc;

use tracing::warn;

use crate::encoding::Reader;
use crate::key::{Entry, InternalKey};

use super::{SSTableError, Table};

// ------------------------------------------------------------------------------------------------
// Block Iterator
// ------------------------------------------------------------------------------------------------

/// Iterator over the entries of a single data block.
pub struct BlockIterator {
    /// Verified block payload.
    data: Vec<u8>,

    /// Offset of the next cell to decode.
    cursor: usize,

    failed: bool,
}

impl BlockIterator {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            cursor: 0,
            failed: false,
        }
    }

    pub fn seek_to_first(&mut self) {
        self.cursor = 0;
        self.failed = false;
    }

    /// Position at the first entry whose key is `>= target`.
    pub fn seek(&mut self, target: &InternalKey) -> Result<(), SSTableError> {
        self.seek_to_first();
        while self.cursor < self.data.len() {
            let (key, _, len) = self.decode_at(self.cursor)?;
            if key >= *target {
                return Ok(());
            }
            self.cursor += len;
        }
        Ok(())
    }

    /// `true` once every entry has been returned or decoding failed.
    pub fn is_end(&self) -> bool {
        self.failed || self.cursor >= self.data.len()
    }

    fn decode_at(&self, at: usize) -> Result<(InternalKey, Vec<u8>, usize), SSTableError> {
        let mut r = Reader::new(&self.data[at..]);
        let key: InternalKey = r.read()?;
        let value: Vec<u8> = r.read()?;
        Ok((key, value, r.consumed()))
    }
}

impl Iterator for BlockIterator {
    type Item = Result<Entry, SSTableError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.is_end() {
            return None;
        }
        match self.decode_at(self.cursor) {
            Ok((key, value, len)) => {
                self.cursor += len;
                Some(Ok((key, value)))
            }
            Err(e) => {
                warn!(cursor = self.cursor, error = %e, "undecodable cell in data block");
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Table Iterator
// ------------------------------------------------------------------------------------------------

/// Forward iterator over every entry of one table.
///
/// Owns an `Arc` on the table, so it can outlive the cache entry it came
/// from and be boxed into merge iterators.
pub struct TableIterator {
    table: Arc<Table>,

    /// Index of the block `block` was loaded from.
    block_index: usize,
    block: Option<BlockIterator>,
    failed: bool,
}

impl TableIterator {
    pub(crate) fn new(table: Arc<Table>) -> Self {
        Self {
            table,
            block_index: 0,
            block: None,
            failed: false,
        }
    }

    /// Reposition at the first entry `>= target`.
    pub fn seek(&mut self, target: &InternalKey) -> Result<(), SSTableError> {
        self.failed = false;
        match self.table.find_block(target) {
            Some(idx) => {
                let mut block = self.load(idx)?;
                block.seek(target)?;
                self.block_index = idx;
                self.block = Some(block);
            }
            None => {
                self.block_index = self.table.index.len();
                self.block = None;
            }
        }
        Ok(())
    }

    fn load(&self, idx: usize) -> Result<BlockIterator, SSTableError> {
        Ok(BlockIterator::new(self.table.block_bytes(idx)?.to_vec()))
    }

    fn advance_block(&mut self) -> Result<bool, SSTableError> {
        let next = if self.block.is_some() {
            self.block_index + 1
        } else {
            self.block_index
        };
        if next >= self.table.index.len() {
            self.block_index = self.table.index.len();
            self.block = None;
            return Ok(false);
        }
        self.block = Some(self.load(next)?);
        self.block_index = next;
        Ok(true)
    }
}

impl Iterator for TableIterator {
    type Item = Result<Entry, SSTableError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        loop {
            if let Some(item) = self.block.as_mut().and_then(Iterator::next) {
                if item.is_err() {
                    self.failed = true;
                }
                return Some(item);
            }
            match self.advance_block() {
                Ok(true) => {}
                Ok(false) => return None,
                Err(e) => {
                    self.failed = true;
                    return Some(Err(e));
                }
            }
        }
    }
}
