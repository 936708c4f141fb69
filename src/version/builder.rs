//! Accumulates version edits on top of a base version.

use std::collections::HashSet;
use std::sync::Arc;

use super::{FileMetaData, Version, VersionEdit, VersionError};

#[derive(Debug, Default)]
struct LevelState {
    deleted: HashSet<u64>,
    added: Vec<Arc<FileMetaData>>,
}

/// Applies a sequence of [`VersionEdit`]s to a base [`Version`] without
/// materializing the intermediate versions.
///
/// Recovery feeds every manifest record through one builder; a regular
/// `log_and_apply` feeds exactly one edit.
pub struct VersionBuilder {
    base: Arc<Version>,
    levels: Vec<LevelState>,
}

impl VersionBuilder {
    pub fn new(base: Arc<Version>) -> Self {
        let levels = (0..base.num_levels()).map(|_| LevelState::default()).collect();
        Self { base, levels }
    }

    /// Record the file changes of `edit`. Deletions apply before additions,
    /// so an edit that moves a file lists it in both.
    pub fn apply(&mut self, edit: &VersionEdit) -> Result<(), VersionError> {
        let num_levels = self.levels.len();
        let check = |level: usize| {
            if level < num_levels {
                Ok(())
            } else {
                Err(VersionError::Corruption(format!(
                    "edit references level {level}, tree has {num_levels}"
                )))
            }
        };

        for &(level, number) in &edit.deleted_files {
            check(level)?;
            self.levels[level].deleted.insert(number);
        }
        for (level, file) in &edit.new_files {
            check(*level)?;
            let state = &mut self.levels[*level];
            state.deleted.remove(&file.number);
            state.added.push(Arc::new(FileMetaData::from_new_file(file)));
        }
        Ok(())
    }

    /// Produce the resulting file lists.
    ///
    /// Files are sorted by smallest key (ties by file number). Every level
    /// above 0 must come out disjoint; anything else is a bug in whoever
    /// produced the edit.
    pub fn build(self) -> Result<Version, VersionError> {
        let mut files = Vec::with_capacity(self.levels.len());

        for (level, state) in self.levels.into_iter().enumerate() {
            let mut merged: Vec<Arc<FileMetaData>> = self
                .base
                .files(level)
                .iter()
                .chain(state.added.iter())
                .filter(|f| !state.deleted.contains(&f.number))
                .cloned()
                .collect();
            merged.sort_by(|a, b| {
                a.smallest
                    .cmp(&b.smallest)
                    .then_with(|| a.number.cmp(&b.number))
            });
            merged.dedup_by_key(|f| f.number);

            if level > 0 {
                for pair in merged.windows(2) {
                    if pair[0].largest >= pair[1].smallest {
                        return Err(VersionError::InvariantViolation(format!(
                            "overlapping files {} [{} .. {}] and {} [{} .. {}] at level {level}",
                            pair[0].number,
                            pair[0].smallest,
                            pair[0].largest,
                            pair[1].number,
                            pair[1].smallest,
                            pair[1].largest,
                        )));
                    }
                }
            }
            files.push(merged);
        }

        Ok(Version::from_levels(files))
    }
}
