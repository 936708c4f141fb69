//! Append / replay behaviour of the record log.

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use crate::wal::{LOG_HEADER_SIZE, LogHeader, LogReader, LogWriter, WalError};

    // ------------------------------------------------------------------------------------------------
    // Round trips
    // ------------------------------------------------------------------------------------------------

    /// # Scenario
    /// Records come back in append order with their exact bytes.
    ///
    /// # Starting environment
    /// Fresh log in a temporary directory.
    ///
    /// # Actions
    /// 1. Append three records of different lengths, one of them empty.
    /// 2. Sync and reopen with a reader.
    ///
    /// # Expected behavior
    /// The reader yields the same three payloads, then `None`.
    #[test]
    fn records_replay_in_append_order() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("000001.log");

        let mut writer = LogWriter::create(&path, 1).unwrap();
        writer.append(b"first").unwrap();
        writer.append(b"").unwrap();
        writer.append(&[7u8; 1000]).unwrap();
        writer.sync().unwrap();
        assert_eq!(writer.number(), 1);
        assert_eq!(writer.path(), path.as_path());

        let records: Vec<Vec<u8>> = LogReader::open(&path)
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(records, vec![b"first".to_vec(), Vec::new(), vec![7u8; 1000]]);
    }

    #[test]
    fn empty_log_yields_no_records() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("000002.log");
        let writer = LogWriter::create(&path, 2).unwrap();
        assert!(writer.is_empty());

        let mut reader = LogReader::open(&path).unwrap();
        assert_eq!(reader.header(), &LogHeader::new(2, LogHeader::DEFAULT_MAX_RECORD_SIZE));
        assert!(reader.next().is_none());
    }

    #[test]
    fn writer_tracks_bytes_written() {
        let tmp = TempDir::new().unwrap();
        let mut writer = LogWriter::create(tmp.path().join("l.log"), 3).unwrap();
        let base = writer.len();
        assert_eq!(base, (LOG_HEADER_SIZE + 4) as u64);

        writer.append(b"abcd").unwrap();
        assert_eq!(writer.len(), base + 4 + 4 + 4);
        assert!(!writer.is_empty());
    }

    #[test]
    fn oversized_record_is_rejected_before_writing() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("small.log");
        let mut writer = LogWriter::create_with_limit(&path, 4, 8).unwrap();

        let err = writer.append(&[0u8; 9]).unwrap_err();
        assert!(matches!(err, WalError::RecordTooLarge(9)));

        writer.append(b"12345678").unwrap();
        let records: Vec<_> = LogReader::open(&path).unwrap().collect();
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn create_truncates_existing_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("reuse.log");
        {
            let mut writer = LogWriter::create(&path, 5).unwrap();
            writer.append(b"stale").unwrap();
        }
        LogWriter::create(&path, 6).unwrap();

        let mut reader = LogReader::open(&path).unwrap();
        assert_eq!(reader.header().number, 6);
        assert!(reader.next().is_none());
    }
}
