//! Many writers and readers sharing one engine.

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::thread;

    use tempfile::TempDir;

    use crate::batch::WriteBatch;
    use crate::engine::Engine;
    use crate::engine::tests::helpers::*;

    const THREADS: usize = 8;
    const BATCHES: usize = 50;
    const OPS: usize = 10;

    /// # Scenario
    /// Batches from concurrent writers are applied atomically.
    ///
    /// # Starting environment
    /// Memtable-only engine shared by eight threads.
    ///
    /// # Actions
    /// 1. Each thread writes 50 batches of 10 puts with distinct keys.
    /// 2. Inspect the sequence numbers in the memtable.
    ///
    /// # Expected behavior
    /// Every batch occupies a contiguous run of ten sequence numbers, no
    /// two operations share a number, and all 400 batches were counted,
    /// whether they were committed alone or merged into a group.
    #[test]
    fn concurrent_batches_get_contiguous_sequences() {
        let tmp = TempDir::new().unwrap();
        let engine = Arc::new(Engine::open(tmp.path(), memtable_only_config()).unwrap());

        let handles: Vec<_> = (0..THREADS)
            .map(|t| {
                let engine = Arc::clone(&engine);
                thread::spawn(move || {
                    for b in 0..BATCHES {
                        let mut batch = WriteBatch::new();
                        for k in 0..OPS {
                            batch.put(format!("t{t}-b{b:03}-k{k}"), "v");
                        }
                        engine.write(batch, b % 7 == 0).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let total = (THREADS * BATCHES * OPS) as u64;
        assert_eq!(engine.last_sequence(), total);

        let stats = engine.stats();
        assert_eq!(stats.batches_written, (THREADS * BATCHES) as u64);
        assert!(stats.write_groups <= stats.batches_written);

        let mem = Arc::clone(&engine.inner().state.lock().mem);
        let mut by_batch: HashMap<String, Vec<u64>> = HashMap::new();
        let mut all = Vec::new();
        for (key, _) in mem.iter() {
            let name = String::from_utf8(key.user_key().to_vec()).unwrap();
            let (batch, _) = name.rsplit_once('-').unwrap();
            by_batch.entry(batch.to_string()).or_default().push(key.sequence());
            all.push(key.sequence());
        }

        assert_eq!(by_batch.len(), THREADS * BATCHES);
        for (batch, mut seqs) in by_batch {
            seqs.sort_unstable();
            assert_eq!(seqs.len(), OPS, "{batch}");
            assert_eq!(seqs[OPS - 1] - seqs[0], (OPS - 1) as u64, "{batch}: {seqs:?}");
        }

        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len() as u64, total);
    }

    /// # Scenario
    /// Readers never observe a torn batch.
    ///
    /// # Starting environment
    /// Small-buffer engine; a writer thread repeatedly writes the same
    /// value to keys `a` and `b` in one batch.
    ///
    /// # Actions
    /// 1. While the writer runs, readers take snapshots and read both keys.
    ///
    /// # Expected behavior
    /// Within one snapshot `a` and `b` always hold the same value.
    #[test]
    fn snapshot_reads_see_whole_batches() {
        let tmp = TempDir::new().unwrap();
        let engine = Arc::new(Engine::open(tmp.path(), small_buffer_config()).unwrap());

        let writer = {
            let engine = Arc::clone(&engine);
            thread::spawn(move || {
                for i in 0..500 {
                    let mut batch = WriteBatch::new();
                    batch.put("a", format!("{i}")).put("b", format!("{i}"));
                    engine.write(batch, false).unwrap();
                }
            })
        };

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let engine = Arc::clone(&engine);
                thread::spawn(move || {
                    for _ in 0..200 {
                        let snapshot = engine.snapshot();
                        let a = engine.get_at(b"a", &snapshot).unwrap();
                        let b = engine.get_at(b"b", &snapshot).unwrap();
                        assert_eq!(a, b);
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }
        assert_eq!(engine.get(b"a").unwrap(), Some(b"499".to_vec()));
    }

    #[test]
    fn concurrent_writers_with_memtable_switches() {
        let tmp = TempDir::new().unwrap();
        let engine = Arc::new(Engine::open(tmp.path(), small_buffer_config()).unwrap());

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let engine = Arc::clone(&engine);
                thread::spawn(move || {
                    for i in 0..250 {
                        put(&engine, format!("t{t}-{i:04}"), value(i));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert!(engine.stats().memtable_switches > 0);
        for t in 0..4 {
            for i in 0..250 {
                assert_eq!(engine.get(format!("t{t}-{i:04}").as_bytes()).unwrap(), Some(value(i)));
            }
        }
    }
}
