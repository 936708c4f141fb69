//! Reclaiming files no version references any more.

use std::fs;
use std::path::PathBuf;

use parking_lot::MutexGuard;
use tracing::{debug, warn};

use super::{EngineInner, StateGuard};
use crate::filename::{FileType, parse_file_name};

impl EngineInner {
    /// Delete every engine file in the directory that is neither live nor
    /// protected. Returns how many were removed.
    ///
    /// Live tables are those of every version still held plus the outputs
    /// of work in progress. Logs at or above the current log number, the
    /// previous log, the current manifest and `CURRENT` are protected.
    /// Nothing is deleted while a background error is set, because the
    /// on-disk state may then be ahead of what is installed in memory.
    pub(crate) fn remove_obsolete_files(&self, state: &mut StateGuard<'_>) -> usize {
        if state.bg_error.is_some() {
            return 0;
        }

        let mut live = state.pending_outputs.clone();
        live.extend(state.versions.live_files());
        let log_number = state.versions.log_number();
        let prev_log_number = state.versions.prev_log_number();
        let manifest_number = state.versions.manifest_file_number();

        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(dir = %self.dir.display(), error = %e, "cannot list database directory");
                return 0;
            }
        };

        let mut doomed: Vec<(FileType, u64, PathBuf)> = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some((kind, number)) = name.to_str().and_then(parse_file_name) else {
                continue;
            };
            let keep = match kind {
                FileType::Log => number >= log_number || number == prev_log_number,
                FileType::Manifest => number >= manifest_number,
                FileType::Table => live.contains(&number),
                // The CURRENT rewrite stages its temp file under the manifest number.
                FileType::Temp => live.contains(&number) || number == manifest_number,
                FileType::Current => true,
            };
            if !keep {
                if kind == FileType::Table {
                    self.table_cache.evict(number);
                }
                doomed.push((kind, number, entry.path()));
            }
        }

        if doomed.is_empty() {
            return 0;
        }

        let removed = MutexGuard::unlocked(state, || {
            doomed
                .iter()
                .filter(|(kind, number, path)| match fs::remove_file(path) {
                    Ok(()) => {
                        debug!(?kind, number, "deleted obsolete file");
                        true
                    }
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "failed to delete obsolete file");
                        false
                    }
                })
                .count()
        });
        state.stats.files_deleted += removed as u64;
        removed
    }
}
