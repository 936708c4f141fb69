//! Write batches: the unit of atomicity for a write.
//!
//! A [`WriteBatch`] is an ordered list of [`BatchOp`]s that commit together.
//! When the writer queue admits a batch it stamps the batch with a
//! sequence base; record `i` of the batch then carries sequence
//! `base + i`, so one batch always occupies a contiguous sequence range.
//!
//! # Wire format
//!
//! ```text
//! [sequence base: u64][count: u32]
//! [tag: u8 = 1][key][value]   -- Put
//! [tag: u8 = 0][key]          -- Delete
//! ...
//! ```
//!
//! Keys and values are `[u32 len][bytes]`. The same bytes are appended to
//! the write-ahead log and replayed on recovery.


use crate::encoding::{Decode, Encode, EncodingError, Reader};
use crate::key::{SequenceNumber, ValueType};
use crate::memtable::MemTable;

/// Size of the `[sequence][count]` header.
pub const BATCH_HEADER_SIZE: usize = 12;

/// One operation inside a [`WriteBatch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

impl BatchOp {
    pub fn key(&self) -> &[u8] {
        match self {
            BatchOp::Put { key, .. } | BatchOp::Delete { key } => key,
        }
    }

    pub fn value_type(&self) -> ValueType {
        match self {
            BatchOp::Put { .. } => ValueType::Value,
            BatchOp::Delete { .. } => ValueType::Deletion,
        }
    }

    fn encoded_len(&self) -> usize {
        match self {
            BatchOp::Put { key, value } => 1 + 4 + key.len() + 4 + value.len(),
            BatchOp::Delete { key } => 1 + 4 + key.len(),
        }
    }
}

impl Encode for BatchOp {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        (self.value_type() as u8).encode_to(buf)?;
        match self {
            BatchOp::Put { key, value } => {
                key.encode_to(buf)?;
                value.encode_to(buf)
            }
            BatchOp::Delete { key } => key.encode_to(buf),
        }
    }
}

impl Decode for BatchOp {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut r = Reader::new(buf);
        let tag: u8 = r.read()?;
        let op = match ValueType::try_from(tag)? {
            ValueType::Value => BatchOp::Put {
                key: r.read()?,
                value: r.read()?,
            },
            ValueType::Deletion => BatchOp::Delete { key: r.read()? },
        };
        Ok((op, r.consumed()))
    }
}

/// An ordered, atomically-applied group of puts and deletes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteBatch {
    sequence: SequenceNumber,
    ops: Vec<BatchOp>,
    size: usize,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self {
            sequence: 0,
            ops: Vec::new(),
            size: BATCH_HEADER_SIZE,
        }
    }

    /// Queue a put of `key` → `value`.
    pub fn put(&mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> &mut Self {
        self.push(BatchOp::Put {
            key: key.into(),
            value: value.into(),
        })
    }

    /// Queue a deletion of `key`.
    pub fn delete(&mut self, key: impl Into<Vec<u8>>) -> &mut Self {
        self.push(BatchOp::Delete { key: key.into() })
    }

    fn push(&mut self, op: BatchOp) -> &mut Self {
        self.size += op.encoded_len();
        self.ops.push(op);
        self
    }

    pub fn clear(&mut self) {
        self.ops.clear();
        self.sequence = 0;
        self.size = BATCH_HEADER_SIZE;
    }

    /// Number of records in the batch.
    pub fn count(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn ops(&self) -> &[BatchOp] {
        &self.ops
    }

    /// Sequence number assigned to the first record.
    pub fn sequence(&self) -> SequenceNumber {
        self.sequence
    }

    pub(crate) fn set_sequence(&mut self, sequence: SequenceNumber) {
        self.sequence = sequence;
    }

    /// Encoded size in bytes; used to cap group commits.
    pub fn approximate_size(&self) -> usize {
        self.size
    }

    /// Append every record of `other` after the records of `self`.
    pub(crate) fn append(&mut self, other: &WriteBatch) {
        self.ops.extend(other.ops.iter().cloned());
        self.size += other.size - BATCH_HEADER_SIZE;
    }

    /// Serialize header and records.
    pub fn encode(&self) -> Result<Vec<u8>, EncodingError> {
        let mut buf = Vec::with_capacity(self.size);
        self.encode_to(&mut buf)?;
        Ok(buf)
    }

    /// Parse a batch previously produced by [`WriteBatch::encode`].
    ///
    /// The whole buffer must be consumed and the record count must match
    /// the header.
    pub fn decode(buf: &[u8]) -> Result<Self, EncodingError> {
        let (batch, consumed) = Self::decode_from(buf)?;
        if consumed != buf.len() {
            return Err(EncodingError::Custom(format!(
                "write batch has {} trailing bytes",
                buf.len() - consumed
            )));
        }
        Ok(batch)
    }

    /// Insert every record into `mem`, numbering them from the batch sequence.
    pub(crate) fn insert_into(&self, mem: &MemTable) {
        mem.insert_batch(self.sequence, &self.ops);
    }

    /// Sequence number of the last record.
    pub fn last_sequence(&self) -> SequenceNumber {
        (self.sequence + self.ops.len() as u64).saturating_sub(1)
    }
}

impl Encode for WriteBatch {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.sequence.encode_to(buf)?;
        let count = u32::try_from(self.ops.len()).map_err(|_| {
            EncodingError::LengthOverflow(format!("batch of {} records", self.ops.len()))
        })?;
        count.encode_to(buf)?;
        for op in &self.ops {
            op.encode_to(buf)?;
        }
        Ok(())
    }
}

impl Decode for WriteBatch {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut r = Reader::new(buf);
        let sequence: u64 = r.read()?;
        let count: u32 = r.read()?;
        let mut batch = WriteBatch::new();
        batch.sequence = sequence;
        for _ in 0..count {
            if r.is_empty() {
                return Err(EncodingError::Custom(format!(
                    "write batch header claims {count} records, found {}",
                    batch.count()
                )));
            }
            batch.push(r.read()?);
        }
        Ok((batch, r.consumed()))
    }
}
