//! Open-table cache keyed by file number.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use crate::filename::table_file_name;
use crate::key::SequenceNumber;
use crate::memtable::LookupResult;

use super::{SSTableError, Table, TableIterator};

/// Keeps every table the engine has opened, so each file is mapped once.
///
/// Entries are evicted when the file is deleted as obsolete. Iterators and
/// readers hold their own `Arc<Table>`, so eviction never invalidates them.
#[derive(Debug)]
pub struct TableCache {
    dir: PathBuf,
    tables: Mutex<HashMap<u64, Arc<Table>>>,
}

impl TableCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            tables: Mutex::new(HashMap::new()),
        }
    }

    /// The table with file number `number`, opening it on first use.
    pub fn get(&self, number: u64) -> Result<Arc<Table>, SSTableError> {
        if let Some(table) = self.tables.lock().get(&number) {
            return Ok(Arc::clone(table));
        }

        // Opened without the lock; a racing open of the same file is harmless.
        let table = Arc::new(Table::open(table_file_name(&self.dir, number))?);
        trace!(number, "table cache miss");
        Ok(Arc::clone(
            self.tables.lock().entry(number).or_insert(table),
        ))
    }

    /// Point lookup in table `number`.
    pub fn lookup(
        &self,
        number: u64,
        user_key: &[u8],
        sequence: SequenceNumber,
    ) -> Result<LookupResult, SSTableError> {
        self.get(number)?.get(user_key, sequence)
    }

    pub fn iter(&self, number: u64) -> Result<TableIterator, SSTableError> {
        Ok(self.get(number)?.iter())
    }

    pub fn evict(&self, number: u64) {
        self.tables.lock().remove(&number);
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.tables.lock().len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.tables.lock().is_empty()
    }
}
