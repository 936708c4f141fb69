//! Version edits: the deltas recorded in the manifest.
//!
//! # Wire format
//!
//! ```text
//! [field count: u32]
//! [tag: u8][payload]
//! ...
//! ```
//!
//! | Tag | Field               | Payload                                        |
//! |-----|---------------------|------------------------------------------------|
//! | 1   | log number          | `u64`                                          |
//! | 2   | prev log number     | `u64`                                          |
//! | 3   | next file number    | `u64`                                          |
//! | 4   | last sequence       | `u64`                                          |
//! | 5   | compaction pointer  | `[level u32][InternalKey]`                     |
//! | 6   | deleted file        | `[level u32][number u64]`                      |
//! | 7   | new file            | `[level u32][number u64][size u64][smallest][largest]` |

use std::collections::BTreeSet;

use crate::encoding::{Decode, Encode, EncodingError, Reader};
use crate::key::{InternalKey, SequenceNumber};

const TAG_LOG_NUMBER: u8 = 1;
const TAG_PREV_LOG_NUMBER: u8 = 2;
const TAG_NEXT_FILE_NUMBER: u8 = 3;
const TAG_LAST_SEQUENCE: u8 = 4;
const TAG_COMPACTION_POINTER: u8 = 5;
const TAG_DELETED_FILE: u8 = 6;
const TAG_NEW_FILE: u8 = 7;

/// A file added by an edit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewFile {
    pub number: u64,
    pub file_size: u64,
    pub smallest: InternalKey,
    pub largest: InternalKey,
}

/// Delta between two consecutive versions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VersionEdit {
    pub log_number: Option<u64>,
    pub prev_log_number: Option<u64>,
    pub next_file_number: Option<u64>,
    pub last_sequence: Option<SequenceNumber>,

    /// Where the next size-triggered compaction of each level resumes.
    pub compaction_pointers: Vec<(usize, InternalKey)>,

    /// `(level, file number)` pairs removed.
    pub deleted_files: BTreeSet<(usize, u64)>,

    /// Files added, with their level.
    pub new_files: Vec<(usize, NewFile)>,
}

impl VersionEdit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_log_number(&mut self, number: u64) {
        self.log_number = Some(number);
    }

    pub fn set_prev_log_number(&mut self, number: u64) {
        self.prev_log_number = Some(number);
    }

    pub fn set_next_file_number(&mut self, number: u64) {
        self.next_file_number = Some(number);
    }

    pub fn set_last_sequence(&mut self, sequence: SequenceNumber) {
        self.last_sequence = Some(sequence);
    }

    pub fn set_compaction_pointer(&mut self, level: usize, key: InternalKey) {
        self.compaction_pointers.push((level, key));
    }

    pub fn add_file(
        &mut self,
        level: usize,
        number: u64,
        file_size: u64,
        smallest: InternalKey,
        largest: InternalKey,
    ) {
        self.new_files.push((
            level,
            NewFile {
                number,
                file_size,
                smallest,
                largest,
            },
        ));
    }

    pub fn delete_file(&mut self, level: usize, number: u64) {
        self.deleted_files.insert((level, number));
    }

    /// `true` when the edit changes no file.
    #[cfg(test)]
    pub fn has_no_file_changes(&self) -> bool {
        self.new_files.is_empty() && self.deleted_files.is_empty()
    }

    fn field_count(&self) -> usize {
        [
            self.log_number.is_some(),
            self.prev_log_number.is_some(),
            self.next_file_number.is_some(),
            self.last_sequence.is_some(),
        ]
        .into_iter()
        .filter(|set| *set)
        .count()
            + self.compaction_pointers.len()
            + self.deleted_files.len()
            + self.new_files.len()
    }
}

fn encode_level(level: usize, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
    u32::try_from(level)
        .map_err(|_| EncodingError::LengthOverflow(format!("level {level}")))?
        .encode_to(buf)
}

fn encode_u64_field(tag: u8, value: Option<u64>, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
    if let Some(value) = value {
        tag.encode_to(buf)?;
        value.encode_to(buf)?;
    }
    Ok(())
}

impl Encode for VersionEdit {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        let count = u32::try_from(self.field_count())
            .map_err(|_| EncodingError::LengthOverflow("version edit field count".into()))?;
        count.encode_to(buf)?;

        encode_u64_field(TAG_LOG_NUMBER, self.log_number, buf)?;
        encode_u64_field(TAG_PREV_LOG_NUMBER, self.prev_log_number, buf)?;
        encode_u64_field(TAG_NEXT_FILE_NUMBER, self.next_file_number, buf)?;
        encode_u64_field(TAG_LAST_SEQUENCE, self.last_sequence, buf)?;

        for (level, key) in &self.compaction_pointers {
            TAG_COMPACTION_POINTER.encode_to(buf)?;
            encode_level(*level, buf)?;
            key.encode_to(buf)?;
        }
        for (level, number) in &self.deleted_files {
            TAG_DELETED_FILE.encode_to(buf)?;
            encode_level(*level, buf)?;
            number.encode_to(buf)?;
        }
        for (level, file) in &self.new_files {
            TAG_NEW_FILE.encode_to(buf)?;
            encode_level(*level, buf)?;
            file.number.encode_to(buf)?;
            file.file_size.encode_to(buf)?;
            file.smallest.encode_to(buf)?;
            file.largest.encode_to(buf)?;
        }
        Ok(())
    }
}

impl Decode for VersionEdit {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut r = Reader::new(buf);
        let count: u32 = r.read()?;
        let mut edit = VersionEdit::new();

        for _ in 0..count {
            let tag: u8 = r.read()?;
            match tag {
                TAG_LOG_NUMBER => edit.log_number = Some(r.read()?),
                TAG_PREV_LOG_NUMBER => edit.prev_log_number = Some(r.read()?),
                TAG_NEXT_FILE_NUMBER => edit.next_file_number = Some(r.read()?),
                TAG_LAST_SEQUENCE => edit.last_sequence = Some(r.read()?),
                TAG_COMPACTION_POINTER => {
                    let level = r.read::<u32>()? as usize;
                    edit.compaction_pointers.push((level, r.read()?));
                }
                TAG_DELETED_FILE => {
                    let level = r.read::<u32>()? as usize;
                    edit.deleted_files.insert((level, r.read()?));
                }
                TAG_NEW_FILE => {
                    let level = r.read::<u32>()? as usize;
                    let file = NewFile {
                        number: r.read()?,
                        file_size: r.read()?,
                        smallest: r.read()?,
                        largest: r.read()?,
                    };
                    edit.new_files.push((level, file));
                }
                other => {
                    return Err(EncodingError::InvalidTag {
                        tag: u32::from(other),
                        type_name: "VersionEdit field",
                    });
                }
            }
        }
        Ok((edit, r.consumed()))
    }
}
