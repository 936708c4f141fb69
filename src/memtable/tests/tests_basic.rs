//! Point lookups, snapshot visibility, iteration order and sizing.

#[cfg(test)]
mod tests {
    use crate::key::ValueType;
    use crate::memtable::{ENTRY_OVERHEAD, LookupResult, MemTable};

    #[test]
    fn get_returns_newest_visible_value() {
        let mem = MemTable::new();
        mem.insert(1, ValueType::Value, b"k", b"v1");
        mem.insert(5, ValueType::Value, b"k", b"v5");

        assert_eq!(mem.get(b"k", 10), LookupResult::Found(b"v5".to_vec()));
        assert_eq!(mem.get(b"k", 4), LookupResult::Found(b"v1".to_vec()));
        assert_eq!(mem.get(b"k", 0), LookupResult::NotFound);
    }

    /// # Scenario
    /// A tombstone hides older values for reads at or after its sequence.
    ///
    /// # Actions
    /// 1. Put `k` at seq 1, delete `k` at seq 2.
    ///
    /// # Expected behavior
    /// Reads at seq ≥ 2 report `Deleted` (not `NotFound`), reads at seq 1
    /// still see the value.
    #[test]
    fn deletion_reports_deleted_not_not_found() {
        let mem = MemTable::new();
        mem.insert(1, ValueType::Value, b"k", b"v");
        mem.insert(2, ValueType::Deletion, b"k", b"");

        assert_eq!(mem.get(b"k", 2), LookupResult::Deleted);
        assert!(mem.get(b"k", 2).is_resolved());
        assert_eq!(mem.get(b"k", 1), LookupResult::Found(b"v".to_vec()));
    }

    #[test]
    fn lookup_does_not_leak_into_neighbouring_keys() {
        let mem = MemTable::new();
        mem.insert(1, ValueType::Value, b"ka", b"x");
        assert_eq!(mem.get(b"k", 9), LookupResult::NotFound);
        assert_eq!(mem.get(b"kb", 9), LookupResult::NotFound);
    }

    #[test]
    fn iter_is_in_internal_key_order_and_restartable() {
        let mem = MemTable::new();
        mem.insert(3, ValueType::Value, b"b", b"3");
        mem.insert(1, ValueType::Value, b"a", b"1");
        mem.insert(4, ValueType::Deletion, b"a", b"");

        let keys: Vec<(Vec<u8>, u64)> = mem
            .iter()
            .map(|(k, _)| (k.user_key().to_vec(), k.sequence()))
            .collect();
        assert_eq!(
            keys,
            vec![(b"a".to_vec(), 4), (b"a".to_vec(), 1), (b"b".to_vec(), 3)]
        );
        assert_eq!(mem.iter().count(), 3);
    }

    #[test]
    fn range_is_half_open_over_user_keys() {
        let mem = MemTable::new();
        for (seq, key) in [b"a", b"b", b"c", b"d"].iter().enumerate() {
            mem.insert(seq as u64 + 1, ValueType::Value, *key, b"v");
        }
        mem.insert(9, ValueType::Value, b"b", b"newer");

        let got: Vec<Vec<u8>> = mem
            .range(b"b", b"d")
            .into_iter()
            .map(|(k, _)| k.user_key().to_vec())
            .collect();
        assert_eq!(got, vec![b"b".to_vec(), b"b".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn usage_counts_keys_values_and_overhead() {
        let mem = MemTable::new();
        assert!(mem.is_empty());
        mem.insert(1, ValueType::Value, b"abc", b"12345");
        mem.insert(2, ValueType::Deletion, b"abc", b"");
        assert_eq!(
            mem.approximate_memory_usage(),
            (3 + 5 + ENTRY_OVERHEAD) + (3 + ENTRY_OVERHEAD)
        );
        assert_eq!(mem.len(), 2);
    }
}
