//! Reopening: log replay, torn tails, corruption and missing files.

#[cfg(test)]
#[allow(non_snake_case)]
mod tests {
    use std::fs::{self, OpenOptions};
    use std::path::Path;

    use tempfile::TempDir;

    use crate::engine::tests::helpers::*;
    use crate::engine::{Engine, EngineError};
    use crate::filename::{FileType, log_file_name, table_file_name};
    use crate::wal::LogWriter;

    /// Path of the newest log, the one the last session appended to.
    fn newest_log(dir: &Path) -> std::path::PathBuf {
        let logs = files_of(dir, FileType::Log);
        log_file_name(dir, *logs.last().unwrap())
    }

    fn write_keys(dir: &Path, n: usize) {
        let engine = Engine::open(dir, memtable_only_config()).unwrap();
        for i in 0..n {
            put(&engine, key(i), value(i));
        }
        engine.close().unwrap();
    }

    // ----------------------------------------------------------------
    // Clean reopen
    // ----------------------------------------------------------------

    /// # Scenario
    /// Unflushed writes survive a reopen through log replay.
    ///
    /// # Starting environment
    /// Engine with 100 writes still in the memtable, then closed.
    ///
    /// # Actions
    /// 1. Reopen and read every key.
    ///
    /// # Expected behavior
    /// All keys are present and the sequence counter continues where it
    /// left off.
    #[test]
    fn reopen__replays_log() {
        let tmp = TempDir::new().unwrap();
        write_keys(tmp.path(), 100);

        let engine = Engine::open(tmp.path(), memtable_only_config()).unwrap();
        assert_eq!(engine.last_sequence(), 100);
        for i in 0..100 {
            assert_eq!(engine.get(&key(i)).unwrap(), Some(value(i)));
        }

        put(&engine, "next", "1");
        assert_eq!(engine.last_sequence(), 101);
    }

    #[test]
    fn reopen__keeps_single_log_and_manifest() {
        let tmp = TempDir::new().unwrap();
        write_keys(tmp.path(), 10);
        {
            let _engine = Engine::open(tmp.path(), memtable_only_config()).unwrap();
        }
        let _engine = Engine::open(tmp.path(), memtable_only_config()).unwrap();

        assert_eq!(files_of(tmp.path(), FileType::Log).len(), 1);
        assert_eq!(files_of(tmp.path(), FileType::Manifest).len(), 1);
        assert!(!files_of(tmp.path(), FileType::Table).is_empty());
    }

    /// # Scenario
    /// Deletes and flushed data both survive several reopen cycles.
    ///
    /// # Starting environment
    /// Mixed flushed and unflushed writes, including deletes.
    ///
    /// # Actions
    /// 1. Reopen three times, writing a little each time.
    ///
    /// # Expected behavior
    /// Each reopen sees exactly the state left by the previous session.
    #[test]
    fn reopen__multiple_cycles_with_deletes() {
        let tmp = TempDir::new().unwrap();
        for cycle in 0..3 {
            let engine = Engine::open(tmp.path(), memtable_only_config()).unwrap();
            if cycle > 0 {
                assert_eq!(engine.get(format!("cycle-{}", cycle - 1).as_bytes()).unwrap(), Some(b"x".to_vec()));
                assert_eq!(engine.get(b"doomed").unwrap(), None);
            }
            put(&engine, "doomed", "soon");
            engine.flush().unwrap();
            delete(&engine, "doomed");
            put(&engine, format!("cycle-{cycle}"), "x");
        }

        let engine = Engine::open(tmp.path(), memtable_only_config()).unwrap();
        for cycle in 0..3 {
            assert!(engine.get(format!("cycle-{cycle}").as_bytes()).unwrap().is_some());
        }
    }

    // ----------------------------------------------------------------
    // Damaged logs
    // ----------------------------------------------------------------

    /// # Scenario
    /// A half-written final record is dropped.
    ///
    /// # Starting environment
    /// Closed engine whose log holds ten single-put records.
    ///
    /// # Actions
    /// 1. Cut three bytes off the end of the log.
    /// 2. Reopen.
    ///
    /// # Expected behavior
    /// The open succeeds; the first nine writes are back and the tenth is
    /// gone.
    #[test]
    fn damaged_log__torn_tail_is_dropped() {
        let tmp = TempDir::new().unwrap();
        write_keys(tmp.path(), 10);

        let log = newest_log(tmp.path());
        let len = fs::metadata(&log).unwrap().len();
        OpenOptions::new().write(true).open(&log).unwrap().set_len(len - 3).unwrap();

        let engine = Engine::open(tmp.path(), memtable_only_config()).unwrap();
        for i in 0..9 {
            assert_eq!(engine.get(&key(i)).unwrap(), Some(value(i)));
        }
        assert_eq!(engine.get(&key(9)).unwrap(), None);
        assert_eq!(engine.last_sequence(), 9);
    }

    #[test]
    fn damaged_log__checksum_failure_in_final_record_is_dropped() {
        let tmp = TempDir::new().unwrap();
        write_keys(tmp.path(), 10);

        let log = newest_log(tmp.path());
        let mut bytes = fs::read(&log).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        fs::write(&log, &bytes).unwrap();

        let engine = Engine::open(tmp.path(), memtable_only_config()).unwrap();
        assert_eq!(engine.get(&key(8)).unwrap(), Some(value(8)));
        assert_eq!(engine.get(&key(9)).unwrap(), None);
    }

    /// # Scenario
    /// Damage before the final record is corruption, not a torn tail.
    ///
    /// # Starting environment
    /// Closed engine whose log holds ten records.
    ///
    /// # Actions
    /// 1. Flip a byte inside the first record's payload.
    /// 2. Reopen.
    ///
    /// # Expected behavior
    /// The open fails instead of silently dropping acknowledged writes.
    #[test]
    fn damaged_log__middle_record_fails_open() {
        let tmp = TempDir::new().unwrap();
        write_keys(tmp.path(), 10);

        let log = newest_log(tmp.path());
        let mut bytes = fs::read(&log).unwrap();
        // Log header (20) + header CRC (4) + record length (4) puts the
        // first payload byte at 28.
        bytes[30] ^= 0xFF;
        fs::write(&log, &bytes).unwrap();

        let result = Engine::open(tmp.path(), memtable_only_config());
        assert!(matches!(result, Err(EngineError::Wal(_))), "{result:?}");
    }

    #[test]
    fn damaged_log__empty_log_file_is_skipped() {
        let tmp = TempDir::new().unwrap();
        write_keys(tmp.path(), 3);

        let newest = *files_of(tmp.path(), FileType::Log).last().unwrap();
        fs::write(log_file_name(tmp.path(), newest + 100), b"").unwrap();

        let engine = Engine::open(tmp.path(), memtable_only_config()).unwrap();
        assert_eq!(engine.get(&key(2)).unwrap(), Some(value(2)));
        // The next file number moved past the stray log.
        let next = engine.inner().state.lock().versions.next_file_number();
        assert!(next > newest + 100);
    }

    /// # Scenario
    /// Logs that hold no records do not stop recovery: one with a header
    /// cut short by a crash, one that was created but never appended to.
    ///
    /// # Starting environment
    /// Closed engine with three keys; two extra logs placed after its log.
    ///
    /// # Actions
    /// 1. Reopen.
    ///
    /// # Expected behavior
    /// The open succeeds, data and sequence numbers are intact, and both
    /// extra logs are reclaimed.
    #[test]
    fn damaged_log__header_only_and_incomplete_header_are_skipped() {
        let tmp = TempDir::new().unwrap();
        write_keys(tmp.path(), 3);

        let newest = *files_of(tmp.path(), FileType::Log).last().unwrap();
        let partial = log_file_name(tmp.path(), newest + 10);
        fs::write(&partial, [0x53u8; 10]).unwrap();
        let header_only = log_file_name(tmp.path(), newest + 11);
        drop(LogWriter::create(&header_only, newest + 11).unwrap());

        let engine = Engine::open(tmp.path(), memtable_only_config()).unwrap();
        for i in 0..3 {
            assert_eq!(engine.get(&key(i)).unwrap(), Some(value(i)));
        }
        assert_eq!(engine.last_sequence(), 3);
        assert!(!partial.exists());
        assert!(!header_only.exists());
    }

    // ----------------------------------------------------------------
    // Missing tables
    // ----------------------------------------------------------------

    /// # Scenario
    /// A table the manifest references has vanished.
    ///
    /// # Starting environment
    /// Closed engine with one flushed table.
    ///
    /// # Actions
    /// 1. Delete the table file.
    /// 2. Reopen.
    ///
    /// # Expected behavior
    /// The open fails with a version-set corruption error.
    #[test]
    fn missing_table__fails_open() {
        let tmp = TempDir::new().unwrap();
        {
            let engine = Engine::open(tmp.path(), memtable_only_config()).unwrap();
            put(&engine, "a", "1");
            engine.flush().unwrap();
        }
        let tables = files_of(tmp.path(), FileType::Table);
        assert_eq!(tables.len(), 1);
        fs::remove_file(table_file_name(tmp.path(), tables[0])).unwrap();

        let result = Engine::open(tmp.path(), memtable_only_config());
        assert!(matches!(result, Err(EngineError::Version(_))), "{result:?}");
    }
}
