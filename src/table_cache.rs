//! Cache of open table handles.
//!
//! Tables are opened on demand and held in an LRU bounded by the
//! `max_open_files` budget (minus a reserve for the log, manifest, and
//! info-log descriptors). Obsolete-file deletion evicts entries so
//! file descriptors are released promptly.

use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;

use crate::cache::LruCache;
use crate::error::Result;
use crate::filter::FilterPolicy;
use crate::filename::table_file_name;
use crate::memtable::InternalKeyComparator;
use crate::sstable::reader::BlockCache;
use crate::sstable::Table;

/// Descriptors reserved for non-table files.
const NON_TABLE_FILES: usize = 10;

/// Opens and caches [`Table`] handles by file number.
pub struct TableCache {
    dbname: PathBuf,
    comparator: InternalKeyComparator,
    filter_policy: Option<Arc<dyn FilterPolicy>>,
    block_cache: Option<Arc<BlockCache>>,
    cache: LruCache<u64, Arc<Table>>,
}

impl TableCache {
    /// Creates a cache for tables in `dbname`, holding at most
    /// `max_open_files - 10` handles.
    pub fn new(
        dbname: PathBuf,
        comparator: InternalKeyComparator,
        filter_policy: Option<Arc<dyn FilterPolicy>>,
        block_cache: Option<Arc<BlockCache>>,
        max_open_files: usize,
    ) -> Self {
        let capacity = max_open_files.saturating_sub(NON_TABLE_FILES).max(1);
        Self { dbname, comparator, filter_policy, block_cache, cache: LruCache::new(capacity) }
    }

    /// Returns the table for `file_number`, opening it if needed.
    pub fn get_table(&self, file_number: u64, file_size: u64) -> Result<Arc<Table>> {
        if let Some(table) = self.cache.get(&file_number) {
            return Ok(table);
        }
        let path = table_file_name(&self.dbname, file_number);
        let file = File::open(&path)?;
        let table = Arc::new(Table::open(
            file,
            file_number,
            file_size,
            self.comparator.clone(),
            self.filter_policy.clone(),
            self.block_cache.clone(),
        )?);
        self.cache.insert(file_number, Arc::clone(&table), 1);
        Ok(table)
    }

    /// Finds the first entry with internal key >= `target` in the table.
    pub fn get(
        &self,
        file_number: u64,
        file_size: u64,
        target: &[u8],
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        self.get_table(file_number, file_size)?.internal_get(target)
    }

    /// Drops the cached handle for a deleted table file.
    pub fn evict(&self, file_number: u64) {
        self.cache.erase(&file_number);
    }
}
