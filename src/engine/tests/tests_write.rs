//! Write path: batches, sequence numbering, group commit and the
//! memtable switch.
//!
//! ## See also
//! - [`tests_concurrency`]: many writers racing through the queue
//! - [`tests_flush`]: what happens to a full memtable

#[cfg(test)]
#[allow(non_snake_case)]
mod tests {
    use tempfile::TempDir;

    use crate::batch::WriteBatch;
    use crate::engine::tests::helpers::*;
    use crate::engine::{Engine, EngineError};
    use crate::wal::WalError;

    #[test]
    fn memtable__put_get_single_key() {
        let tmp = TempDir::new().unwrap();
        let engine = Engine::open(tmp.path(), memtable_only_config()).unwrap();

        put(&engine, "hello", "world");
        assert_eq!(engine.get(b"hello").unwrap(), Some(b"world".to_vec()));
        assert_eq!(engine.get(b"missing").unwrap(), None);
    }

    #[test]
    fn memtable__overwrite_returns_latest() {
        let tmp = TempDir::new().unwrap();
        let engine = Engine::open(tmp.path(), memtable_only_config()).unwrap();

        put(&engine, "k", "v1");
        put(&engine, "k", "v2");
        assert_eq!(engine.get(b"k").unwrap(), Some(b"v2".to_vec()));
    }

    #[test]
    fn memtable__delete_hides_key() {
        let tmp = TempDir::new().unwrap();
        let engine = Engine::open(tmp.path(), memtable_only_config()).unwrap();

        put(&engine, "k", "v");
        delete(&engine, "k");
        assert_eq!(engine.get(b"k").unwrap(), None);
    }

    /// # Scenario
    /// Every operation of a batch consumes one sequence number.
    ///
    /// # Starting environment
    /// Fresh engine.
    ///
    /// # Actions
    /// 1. Write a batch of three operations.
    /// 2. Write a single put.
    ///
    /// # Expected behavior
    /// The last sequence advances by three and then by one; the batch's
    /// entries carry sequences 1, 2 and 3.
    #[test]
    fn batch__consumes_contiguous_sequences() {
        let tmp = TempDir::new().unwrap();
        let engine = Engine::open(tmp.path(), memtable_only_config()).unwrap();
        assert_eq!(engine.last_sequence(), 0);

        let mut batch = WriteBatch::new();
        batch.put("a", "1").put("b", "2").delete("c");
        engine.write(batch, false).unwrap();
        assert_eq!(engine.last_sequence(), 3);

        put(&engine, "d", "4");
        assert_eq!(engine.last_sequence(), 4);

        let mem = std::sync::Arc::clone(&engine.inner().state.lock().mem);
        let mut sequences: Vec<u64> = mem.iter().map(|(k, _)| k.sequence()).collect();
        sequences.sort_unstable();
        assert_eq!(sequences, vec![1, 2, 3, 4]);
    }

    #[test]
    fn batch__later_operation_wins_within_batch() {
        let tmp = TempDir::new().unwrap();
        let engine = Engine::open(tmp.path(), memtable_only_config()).unwrap();

        let mut batch = WriteBatch::new();
        batch.put("k", "first").delete("k").put("k", "last");
        engine.write(batch, false).unwrap();

        assert_eq!(engine.get(b"k").unwrap(), Some(b"last".to_vec()));
    }

    #[test]
    fn batch__empty_batch_is_a_no_op() {
        let tmp = TempDir::new().unwrap();
        let engine = Engine::open(tmp.path(), memtable_only_config()).unwrap();

        engine.write(WriteBatch::new(), true).unwrap();
        assert_eq!(engine.last_sequence(), 0);
        assert_eq!(engine.stats().write_groups, 0);
    }

    #[test]
    fn sync_write_is_acknowledged() {
        let tmp = TempDir::new().unwrap();
        let engine = Engine::open(tmp.path(), memtable_only_config()).unwrap();

        let mut batch = WriteBatch::new();
        batch.put("durable", "yes");
        engine.write(batch, true).unwrap();

        assert_eq!(engine.get(b"durable").unwrap(), Some(b"yes".to_vec()));
        assert_eq!(engine.stats().batches_written, 1);
    }

    /// # Scenario
    /// A full memtable is switched for a fresh one backed by a new log.
    ///
    /// # Starting environment
    /// Engine with a 1 KiB write buffer.
    ///
    /// # Actions
    /// 1. Write 200 keys one at a time.
    /// 2. Read every key back.
    ///
    /// # Expected behavior
    /// At least one memtable switch happened and every key is readable
    /// from whichever layer now holds it.
    #[test]
    fn memtable_switch__keeps_every_key_readable() {
        let tmp = TempDir::new().unwrap();
        let engine = Engine::open(tmp.path(), small_buffer_config()).unwrap();

        for i in 0..200 {
            put(&engine, key(i), value(i));
        }
        assert!(engine.stats().memtable_switches >= 1);

        for i in 0..200 {
            assert_eq!(engine.get(&key(i)).unwrap(), Some(value(i)), "key {i}");
        }
    }

    /// # Scenario
    /// Writes after `close` are refused.
    ///
    /// # Starting environment
    /// Open engine that has been closed explicitly.
    ///
    /// # Actions
    /// 1. Attempt a write.
    ///
    /// # Expected behavior
    /// The write fails with `ShuttingDown`; closing again is harmless.
    #[test]
    fn write_after_close_is_refused() {
        let tmp = TempDir::new().unwrap();
        let engine = Engine::open(tmp.path(), memtable_only_config()).unwrap();
        engine.close().unwrap();

        let mut batch = WriteBatch::new();
        batch.put("k", "v");
        assert!(matches!(
            engine.write(batch, false),
            Err(crate::engine::EngineError::ShuttingDown)
        ));
        engine.close().unwrap();
    }

    /// # Scenario
    /// A batch too large for one log record is refused on its own.
    ///
    /// # Starting environment
    /// Fresh engine with the default 64 MiB log record limit.
    ///
    /// # Actions
    /// 1. Write a batch holding a 65 MiB value.
    /// 2. Write a small batch, then reopen.
    ///
    /// # Expected behavior
    /// The oversized write fails with `RecordTooLarge` and consumes no
    /// sequence number. No background error is recorded, the next write
    /// succeeds, and after reopening only the small write exists.
    #[test]
    fn oversized_batch__rejected_without_stopping_writes() {
        let tmp = TempDir::new().unwrap();
        let engine = Engine::open(tmp.path(), memtable_only_config()).unwrap();

        let mut batch = WriteBatch::new();
        batch.put("big", vec![0u8; 65 * 1024 * 1024]);
        let err = engine.write(batch, false).unwrap_err();
        match &err {
            EngineError::GroupCommit(inner) => {
                assert!(matches!(**inner, EngineError::Wal(WalError::RecordTooLarge(_))), "{err}");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(engine.inner().state.lock().bg_error.is_none());
        assert_eq!(engine.last_sequence(), 0);

        put(&engine, "small", "1");
        assert_eq!(engine.last_sequence(), 1);
        assert_eq!(engine.get(b"small").unwrap(), Some(b"1".to_vec()));
        assert_eq!(engine.get(b"big").unwrap(), None);
        engine.flush().unwrap();
        drop(engine);

        let engine = Engine::open(tmp.path(), memtable_only_config()).unwrap();
        assert_eq!(engine.get(b"small").unwrap(), Some(b"1".to_vec()));
        assert_eq!(engine.get(b"big").unwrap(), None);
        assert_eq!(engine.last_sequence(), 1);
    }
}
