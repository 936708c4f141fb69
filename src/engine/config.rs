//! Engine tuning knobs.

/// Configuration for an [`Engine`](super::Engine) instance.
///
/// Controls memtable sizing, level-0 backpressure, level capacities and
/// compaction output sizing. Validated by [`DbConfig`](crate::DbConfig)
/// before it reaches the engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Max memtable size (bytes) before it is frozen and flushed.
    pub write_buffer_size: usize,

    /// Level-0 file count that makes level 0 a compaction candidate.
    pub l0_compaction_trigger: usize,

    /// Level-0 file count at which each write is delayed once by 1 ms.
    pub l0_slowdown_writes_trigger: usize,

    /// Level-0 file count at which writes block until compaction catches up.
    pub l0_stop_writes_trigger: usize,

    /// Number of levels in the tree.
    pub num_levels: usize,

    /// Capacity of level 1 in bytes.
    pub max_bytes_for_level_base: u64,

    /// Capacity growth factor between adjacent levels.
    pub level_size_multiplier: u64,

    /// Compaction output files are cut at this size.
    pub max_file_size: u64,

    /// Overlap with level+2 above which a compaction output file is cut early
    /// and a trivial move or deep memtable placement is refused.
    pub max_grandparent_overlap_bytes: u64,

    /// Upper bound on the bytes of one compaction after input expansion.
    pub expanded_compaction_byte_limit: u64,

    /// Deepest level a flushed memtable may be placed at directly.
    pub max_mem_compact_level: usize,

    /// Target size of one table data block.
    pub block_size: usize,

    /// Upper bound on the bytes merged into one group commit.
    pub max_group_commit_bytes: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let max_file_size = 2 * 1024 * 1024;
        Self {
            write_buffer_size: 4 * 1024 * 1024,
            l0_compaction_trigger: 4,
            l0_slowdown_writes_trigger: 8,
            l0_stop_writes_trigger: 12,
            num_levels: 7,
            max_bytes_for_level_base: 10 * 1024 * 1024,
            level_size_multiplier: 10,
            max_file_size,
            max_grandparent_overlap_bytes: 10 * max_file_size,
            expanded_compaction_byte_limit: 25 * max_file_size,
            max_mem_compact_level: 2,
            block_size: crate::sstable::builder::DEFAULT_BLOCK_SIZE,
            max_group_commit_bytes: 1024 * 1024,
        }
    }
}

impl EngineConfig {
    /// Byte capacity of `level` (level 0 is governed by file count instead).
    pub fn max_bytes_for_level(&self, level: usize) -> f64 {
        let mut result = self.max_bytes_for_level_base as f64;
        for _ in 1..level {
            result *= self.level_size_multiplier as f64;
        }
        result
    }
}
