//! Choosing the next compaction.

use std::sync::Arc;

use tracing::debug;

use super::Compaction;
use crate::key::InternalKey;
use crate::version::{FileMetaData, VersionSet, key_range, total_file_size};

impl VersionSet {
    /// `true` if the current version has a level over capacity or a file
    /// whose seek allowance ran out.
    pub fn needs_compaction(&self) -> bool {
        let current = self.current();
        current.compaction_score() >= 1.0 || current.file_to_compact().is_some()
    }

    /// Pick the next automatic compaction, if any is due.
    ///
    /// A level over capacity wins over a seek-exhausted file. Within a
    /// level, compactions rotate through the key space: the first file
    /// past the level's compaction pointer is picked, wrapping to the
    /// start of the level.
    pub fn pick_compaction(&mut self) -> Option<Compaction> {
        let current = self.current();
        let mut c = if current.compaction_score() >= 1.0 {
            let level = current.compaction_level();
            let files = current.files(level);
            let pointer = self.compaction_pointers[level].as_ref();
            let first = files
                .iter()
                .find(|f| pointer.is_none_or(|p| f.largest > *p))
                .or_else(|| files.first())?;

            debug!(level, file = first.number, score = current.compaction_score(), "size compaction picked");
            let mut c = Compaction::new(&self.config, level, Arc::clone(&current), false);
            c.inputs[0].push(Arc::clone(first));
            c
        } else if let Some((level, file)) = current.file_to_compact() {
            debug!(level, file = file.number, "seek compaction picked");
            let mut c = Compaction::new(&self.config, level, Arc::clone(&current), false);
            c.inputs[0].push(file);
            c
        } else {
            return None;
        };

        // Level-0 files overlap one another: pull in every file that
        // shares keys with the picked one.
        if c.level() == 0
            && let Some((smallest, largest)) = key_range(&c.inputs[0])
        {
            c.inputs[0] = current.overlapping_inputs(0, Some(smallest.user_key()), Some(largest.user_key()));
        }

        self.setup_other_inputs(&mut c);
        Some(c)
    }

    /// Compaction of the files at `level` overlapping `[begin, end]`, or
    /// `None` if there are none. `None` bounds are open.
    ///
    /// Above level 0 the inputs are capped at about one output file's
    /// worth of bytes; the caller repeats until the range is done.
    pub fn compact_range(
        &mut self,
        level: usize,
        begin: Option<&InternalKey>,
        end: Option<&InternalKey>,
    ) -> Option<Compaction> {
        let current = self.current();
        let mut inputs = current.overlapping_inputs(
            level,
            begin.map(InternalKey::user_key),
            end.map(InternalKey::user_key),
        );
        if inputs.is_empty() {
            return None;
        }

        if level > 0 {
            let limit = self.config.max_file_size;
            let mut total = 0;
            if let Some(cut) = inputs.iter().position(|f| {
                total += f.file_size;
                total >= limit
            }) {
                inputs.truncate(cut + 1);
            }
        }

        let mut c = Compaction::new(&self.config, level, current, true);
        c.inputs[0] = inputs;
        self.setup_other_inputs(&mut c);
        Some(c)
    }

    /// Fill in the `level + 1` inputs and grandparents, and try to grow
    /// the `level` inputs without growing the `level + 1` set.
    pub(crate) fn setup_other_inputs(&mut self, c: &mut Compaction) {
        let level = c.level();
        let current = Arc::clone(c.input_version());

        add_boundary_inputs(current.files(level), &mut c.inputs[0]);
        let Some((smallest, mut largest)) = key_range(&c.inputs[0]) else {
            return;
        };

        c.inputs[1] = current.overlapping_inputs(level + 1, Some(smallest.user_key()), Some(largest.user_key()));
        add_boundary_inputs(current.files(level + 1), &mut c.inputs[1]);

        let Some((mut all_start, mut all_limit)) = key_range(c.inputs[0].iter().chain(&c.inputs[1])) else {
            return;
        };

        if !c.inputs[1].is_empty() {
            let mut expanded0 =
                current.overlapping_inputs(level, Some(all_start.user_key()), Some(all_limit.user_key()));
            add_boundary_inputs(current.files(level), &mut expanded0);

            let inputs1_size = total_file_size(&c.inputs[1]);
            let expanded0_size = total_file_size(&expanded0);
            if expanded0.len() > c.inputs[0].len()
                && inputs1_size + expanded0_size < self.config.expanded_compaction_byte_limit
                && let Some((new_start, new_limit)) = key_range(&expanded0)
            {
                let mut expanded1 =
                    current.overlapping_inputs(level + 1, Some(new_start.user_key()), Some(new_limit.user_key()));
                add_boundary_inputs(current.files(level + 1), &mut expanded1);

                if expanded1.len() == c.inputs[1].len() {
                    debug!(
                        level,
                        from = c.inputs[0].len(),
                        to = expanded0.len(),
                        next_level_files = c.inputs[1].len(),
                        "expanding compaction inputs"
                    );
                    largest = new_limit;
                    c.inputs[0] = expanded0;
                    c.inputs[1] = expanded1;
                    if let Some((s, l)) = key_range(c.inputs[0].iter().chain(&c.inputs[1])) {
                        all_start = s;
                        all_limit = l;
                    }
                }
            }
        }

        if level + 2 < current.num_levels() {
            c.grandparents =
                current.overlapping_inputs(level + 2, Some(all_start.user_key()), Some(all_limit.user_key()));
        }

        // The next size compaction of this level resumes after this range,
        // even if this one fails.
        self.compaction_pointers[level] = Some(largest.clone());
        c.edit_mut().set_compaction_pointer(level, largest);
    }
}

/// Pull in files of the same level whose first entry continues the user
/// key that ends the current input set.
///
/// When one user key straddles two files, compacting only the first would
/// move its newer entries down while older ones stay above, and reads
/// would then find the older entries first.
pub(crate) fn add_boundary_inputs(level_files: &[Arc<FileMetaData>], inputs: &mut Vec<Arc<FileMetaData>>) {
    let Some(mut largest) = inputs.iter().map(|f| f.largest.clone()).max() else {
        return;
    };

    loop {
        let boundary = level_files
            .iter()
            .filter(|f| f.smallest > largest && f.smallest.user_key() == largest.user_key())
            .min_by(|a, b| a.smallest.cmp(&b.smallest));
        match boundary {
            Some(f) => {
                largest = f.largest.clone();
                inputs.push(Arc::clone(f));
            }
            None => break,
        }
    }
}
