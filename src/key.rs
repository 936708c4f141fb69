//! Internal keys: the unit every sorted structure in the engine is ordered by.
//!
//! An [`InternalKey`] couples a user key with the sequence number of the
//! write that produced it and the kind of that write. Internal keys sort by
//! user key ascending, then sequence number **descending**, then value type
//! descending, so that for a given user key the newest write comes first.
//!
//! On disk an internal key is `[u32 len][user key][u64 tag]` where
//! `tag = (sequence << 8) | value_type`.

use std::cmp::Ordering;
use std::fmt;

use crate::encoding::{Decode, Encode, EncodingError, Reader};

/// Monotonic counter assigned to every committed write operation.
pub type SequenceNumber = u64;

/// Sequence numbers occupy the upper 56 bits of the packed tag.
pub const MAX_SEQUENCE_NUMBER: SequenceNumber = (1 << 56) - 1;

/// An internal key with its value; the item type of every sorted stream.
pub type Entry = (InternalKey, Vec<u8>);

/// Kind of write recorded under an internal key.
///
/// The discriminants are persisted; `Value` sorts ahead of `Deletion` for
/// equal user key and sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum ValueType {
    Deletion = 0,
    Value = 1,
}

impl TryFrom<u8> for ValueType {
    type Error = EncodingError;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        match tag {
            0 => Ok(ValueType::Deletion),
            1 => Ok(ValueType::Value),
            other => Err(EncodingError::InvalidTag {
                tag: u32::from(other),
                type_name: "ValueType",
            }),
        }
    }
}

/// User key + sequence number + value type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InternalKey {
    user_key: Vec<u8>,
    sequence: SequenceNumber,
    value_type: ValueType,
}

impl InternalKey {
    pub fn new(user_key: impl Into<Vec<u8>>, sequence: SequenceNumber, value_type: ValueType) -> Self {
        Self {
            user_key: user_key.into(),
            sequence,
            value_type,
        }
    }

    /// The smallest internal key for `user_key` that is visible at `sequence`.
    ///
    /// Every entry for the same user key with a sequence number at or below
    /// `sequence` sorts at or after the returned key.
    pub fn for_lookup(user_key: &[u8], sequence: SequenceNumber) -> Self {
        Self::new(user_key.to_vec(), sequence, ValueType::Value)
    }

    pub fn user_key(&self) -> &[u8] {
        &self.user_key
    }

    pub fn sequence(&self) -> SequenceNumber {
        self.sequence
    }

    pub fn value_type(&self) -> ValueType {
        self.value_type
    }

    pub fn is_deletion(&self) -> bool {
        self.value_type == ValueType::Deletion
    }

    pub fn into_user_key(self) -> Vec<u8> {
        self.user_key
    }

    /// `(sequence << 8) | value_type`, the persisted trailer.
    pub fn tag(&self) -> u64 {
        (self.sequence << 8) | self.value_type as u64
    }
}

impl Ord for InternalKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.user_key
            .cmp(&other.user_key)
            .then_with(|| other.sequence.cmp(&self.sequence))
            .then_with(|| other.value_type.cmp(&self.value_type))
    }
}

impl PartialOrd for InternalKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Encode for InternalKey {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.user_key.as_slice().encode_to(buf)?;
        self.tag().encode_to(buf)
    }
}

impl Decode for InternalKey {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut r = Reader::new(buf);
        let user_key: Vec<u8> = r.read()?;
        let tag: u64 = r.read()?;
        let value_type = ValueType::try_from((tag & 0xff) as u8)?;
        Ok((
            Self {
                user_key,
                sequence: tag >> 8,
                value_type,
            },
            r.consumed(),
        ))
    }
}

impl fmt::Display for InternalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.value_type {
            ValueType::Value => "put",
            ValueType::Deletion => "del",
        };
        write!(f, "{}@{}:{}", HexKey(&self.user_key), self.sequence, kind)
    }
}

// ------------------------------------------------------------------------------------------------
// Tracing helper
// ------------------------------------------------------------------------------------------------

/// Compact hex rendering of a key for log fields.
pub struct HexKey<'a>(pub &'a [u8]);

impl fmt::Display for HexKey<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shown = if self.0.len() <= 32 { self.0 } else { &self.0[..16] };
        for byte in shown {
            write!(f, "{byte:02x}")?;
        }
        if shown.len() < self.0.len() {
            write!(f, "...[{} bytes]", self.0.len())?;
        }
        Ok(())
    }
}
