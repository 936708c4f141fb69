//! Queries against a single version.

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use crate::memtable::LookupResult;
    use crate::sstable::TableCache;
    use crate::version::tests::helpers::{config, init_tracing, meta, numbers, version_with, write_table};
    use crate::version::SeekCharge;

    // ----------------------------------------------------------------
    // Overlap detection
    // ----------------------------------------------------------------

    /// # Scenario
    /// Two level-0 files cover `[01, 10]` and `[05, 15]`.
    ///
    /// # Actions
    /// Ask for the inputs overlapping the single key `08`.
    ///
    /// # Expected behavior
    /// Both files are returned.
    #[test]
    fn level_zero_point_range_hits_both_overlapping_files() {
        init_tracing();
        let v = version_with(&[(0, 1, "01", "10", 100), (0, 2, "05", "15", 100)]);
        let inputs = v.overlapping_inputs(0, Some(b"08"), Some(b"08"));
        assert_eq!(numbers(&inputs), vec![1, 2]);
    }

    /// # Scenario
    /// Level-0 files chain together: `[01, 04]`, `[03, 08]`, `[07, 12]`,
    /// plus an unrelated `[20, 30]`.
    ///
    /// # Actions
    /// Ask for the inputs overlapping `01` only.
    ///
    /// # Expected behavior
    /// The range widens through each picked file until the whole chain is
    /// included; the unrelated file is not.
    #[test]
    fn level_zero_overlap_is_transitive() {
        let v = version_with(&[
            (0, 1, "01", "04", 100),
            (0, 2, "03", "08", 100),
            (0, 3, "07", "12", 100),
            (0, 4, "20", "30", 100),
        ]);
        let inputs = v.overlapping_inputs(0, Some(b"01"), Some(b"01"));
        assert_eq!(numbers(&inputs), vec![1, 2, 3]);
    }

    #[test]
    fn deeper_levels_do_not_widen_the_range() {
        let v = version_with(&[
            (1, 1, "01", "04", 100),
            (1, 2, "05", "08", 100),
            (1, 3, "09", "12", 100),
        ]);
        let inputs = v.overlapping_inputs(1, Some(b"04"), Some(b"05"));
        assert_eq!(numbers(&inputs), vec![1, 2]);

        let all = v.overlapping_inputs(1, None, None);
        assert_eq!(numbers(&all), vec![1, 2, 3]);

        let tail = v.overlapping_inputs(1, Some(b"10"), None);
        assert_eq!(numbers(&tail), vec![3]);
    }

    #[test]
    fn overlap_in_level_uses_user_keys() {
        let v = version_with(&[(2, 1, "c", "f", 100), (2, 2, "m", "p", 100)]);
        assert!(v.overlap_in_level(2, Some(b"a"), Some(b"c")));
        assert!(v.overlap_in_level(2, Some(b"p"), Some(b"z")));
        assert!(!v.overlap_in_level(2, Some(b"g"), Some(b"l")));
        assert!(!v.overlap_in_level(2, Some(b"q"), None));
        assert!(!v.overlap_in_level(2, None, Some(b"a0")));
        assert!(!v.overlap_in_level(3, None, None));
    }

    // ----------------------------------------------------------------
    // Memtable placement
    // ----------------------------------------------------------------

    #[test]
    fn memtable_output_sinks_into_empty_tree() {
        let v = version_with(&[]);
        assert_eq!(v.pick_level_for_memtable_output(b"a", b"b", &config()), 2);
    }

    #[test]
    fn memtable_output_stays_at_level_zero_on_overlap() {
        let v = version_with(&[(0, 1, "a", "c", 100)]);
        assert_eq!(v.pick_level_for_memtable_output(b"b", b"d", &config()), 0);

        let v = version_with(&[(1, 1, "a", "c", 100)]);
        assert_eq!(v.pick_level_for_memtable_output(b"b", b"d", &config()), 0);
    }

    #[test]
    fn memtable_output_stops_above_overlapping_level() {
        let v = version_with(&[(2, 1, "a", "c", 100)]);
        assert_eq!(v.pick_level_for_memtable_output(b"b", b"d", &config()), 1);
    }

    #[test]
    fn memtable_output_stops_on_heavy_grandparent_overlap() {
        let heavy = 30 * 1024 * 1024;
        let v = version_with(&[(3, 1, "a", "z", heavy)]);
        assert_eq!(v.pick_level_for_memtable_output(b"b", b"d", &config()), 1);
    }

    #[test]
    fn memtable_output_respects_configured_cap() {
        let mut cfg = config();
        cfg.max_mem_compact_level = 0;
        let v = version_with(&[]);
        assert_eq!(v.pick_level_for_memtable_output(b"a", b"b", &cfg), 0);
    }

    // ----------------------------------------------------------------
    // Scoring
    // ----------------------------------------------------------------

    #[test]
    fn level_zero_scores_by_file_count() {
        let v = version_with(&[(0, 1, "a", "b", 10), (0, 2, "c", "d", 10)]);
        assert_eq!(v.compaction_level(), 0);
        assert!((v.compaction_score() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn deeper_levels_score_by_bytes() {
        let mib = 1024 * 1024;
        let v = version_with(&[
            (0, 1, "a", "b", 10),
            (1, 2, "c", "d", 20 * mib),
            (2, 3, "e", "f", 50 * mib),
        ]);
        assert_eq!(v.compaction_level(), 1);
        assert!((v.compaction_score() - 2.0).abs() < 1e-9);
    }

    #[test]
    fn level_summary_lists_counts() {
        let v = version_with(&[(0, 1, "a", "b", 10), (0, 2, "c", "d", 10), (1, 3, "e", "f", 10)]);
        assert_eq!(v.level_summary(), "files[ 2 1 0 0 0 0 0 ]");
    }

    // ----------------------------------------------------------------
    // Seek accounting
    // ----------------------------------------------------------------

    #[test]
    fn small_files_get_the_minimum_seek_allowance() {
        assert_eq!(meta(1, "a", "b", 10).allowed_seeks(), 100);
        assert_eq!(meta(1, "a", "b", 32 * 1024 * 1024).allowed_seeks(), 2048);
    }

    /// # Scenario
    /// Reads keep missing in the same level-0 file before finding their
    /// key deeper down.
    ///
    /// # Expected behavior
    /// The charge that drains the allowance marks the file for compaction
    /// exactly once.
    #[test]
    fn exhausted_seek_allowance_marks_file() {
        let v = version_with(&[(0, 1, "a", "z", 10), (1, 2, "a", "z", 10)]);
        let file = v.files(0)[0].clone();

        for _ in 0..99 {
            assert!(!v.update_stats(SeekCharge { level: 0, file: file.clone() }));
        }
        assert!(v.file_to_compact().is_none());
        assert!(v.update_stats(SeekCharge { level: 0, file: file.clone() }));
        let (level, marked) = v.file_to_compact().unwrap();
        assert_eq!((level, marked.number), (0, 1));
        assert!(!v.update_stats(SeekCharge { level: 0, file }));
    }

    // ----------------------------------------------------------------
    // Point reads
    // ----------------------------------------------------------------

    /// # Scenario
    /// Table 6 holds a newer `k` than table 5; both live in level 0. A
    /// level-1 table covers an unrelated range.
    ///
    /// # Actions
    /// 1. Read `k` at the latest sequence.
    /// 2. Read `k` at a sequence older than table 6's entry.
    ///
    /// # Expected behavior
    /// The first read is served by table 6 alone. The second falls
    /// through to table 5 and charges table 6 for the wasted seek.
    #[test]
    fn get_reads_newest_level_zero_file_first() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let s5 = write_table(tmp.path(), 5, &[("k", 5), ("m", 4)]);
        let s6 = write_table(tmp.path(), 6, &[("k", 8)]);
        let s7 = write_table(tmp.path(), 7, &[("q", 1), ("z", 2)]);
        let v = version_with(&[(0, 5, "k", "m", s5), (0, 6, "k", "k", s6), (1, 7, "q", "z", s7)]);
        let cache = TableCache::new(tmp.path());

        let (found, charge) = v.get(b"k", 100, &cache).unwrap();
        assert_eq!(found, LookupResult::Found(b"k@8".to_vec()));
        assert!(charge.is_none());

        let (found, charge) = v.get(b"k", 6, &cache).unwrap();
        assert_eq!(found, LookupResult::Found(b"k@5".to_vec()));
        let charge = charge.unwrap();
        assert_eq!((charge.level, charge.file.number), (0, 6));

        let (found, _) = v.get(b"r", 100, &cache).unwrap();
        assert_eq!(found, LookupResult::NotFound);
        let (found, _) = v.get(b"z", 100, &cache).unwrap();
        assert_eq!(found, LookupResult::Found(b"z@2".to_vec()));
    }
}
