//! Configuration options for the SiltDB storage engine.

use std::sync::Arc;

use crate::comparator::{BytewiseComparator, Comparator};
use crate::snapshot::Snapshot;

/// Number of levels in the tree.
pub const NUM_LEVELS: usize = 7;

/// Level-0 file count that schedules a compaction.
pub const L0_COMPACTION_TRIGGER: usize = 4;

/// Level-0 file count at which writes are slowed by 1ms each.
pub const L0_SLOWDOWN_WRITES_TRIGGER: usize = 8;

/// Level-0 file count at which writes stall until compaction catches up.
pub const L0_STOP_WRITES_TRIGGER: usize = 12;

/// Maximum level to which a new memtable flush may be pushed when its
/// range does not overlap deeper data.
pub const MAX_MEM_COMPACT_LEVEL: usize = 2;

/// Configuration options for opening a database.
#[derive(Clone)]
pub struct Options {
    /// Create the database if it doesn't exist.
    /// Default: false
    pub create_if_missing: bool,

    /// Error if the database already exists.
    /// Default: false
    pub error_if_exists: bool,

    /// Treat recoverable corruption (e.g. a damaged log tail) as fatal.
    /// Default: false
    pub paranoid_checks: bool,

    /// Size threshold for freezing the active memtable (in bytes).
    /// Default: 4MB
    pub write_buffer_size: usize,

    /// Budget of open table files held by the table cache.
    /// Default: 1000
    pub max_open_files: usize,

    /// Target size for compaction output files (in bytes).
    /// Default: 2MB
    pub max_file_size: usize,

    /// Block size for SSTables (in bytes).
    /// Default: 4KB
    pub block_size: usize,

    /// Block cache capacity (in bytes). 0 disables caching.
    /// Default: 8MB
    pub block_cache_size: usize,

    /// Bits per key for the bloom filter; 0 disables filters.
    /// Default: 10
    pub bloom_bits_per_key: usize,

    /// On open, continue appending to the existing log and manifest when
    /// they are small enough instead of rotating to fresh files.
    /// Default: false
    pub reuse_logs: bool,

    /// Total order over user keys.
    /// Default: bytewise
    pub comparator: Arc<dyn Comparator>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            create_if_missing: false,
            error_if_exists: false,
            paranoid_checks: false,
            write_buffer_size: 4 * 1024 * 1024,
            max_open_files: 1000,
            max_file_size: 2 * 1024 * 1024,
            block_size: 4 * 1024,
            block_cache_size: 8 * 1024 * 1024,
            bloom_bits_per_key: 10,
            reuse_logs: false,
            comparator: Arc::new(BytewiseComparator),
        }
    }
}

impl Options {
    /// Creates a new Options with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether to create the database if it doesn't exist.
    pub fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    /// Sets whether opening an existing database is an error.
    pub fn error_if_exists(mut self, value: bool) -> Self {
        self.error_if_exists = value;
        self
    }

    /// Sets whether recoverable corruption is treated as fatal.
    pub fn paranoid_checks(mut self, value: bool) -> Self {
        self.paranoid_checks = value;
        self
    }

    /// Sets the memtable freeze threshold.
    pub fn write_buffer_size(mut self, size: usize) -> Self {
        self.write_buffer_size = size;
        self
    }

    /// Sets the target compaction output file size.
    pub fn max_file_size(mut self, size: usize) -> Self {
        self.max_file_size = size;
        self
    }

    /// Sets the SSTable block size.
    pub fn block_size(mut self, size: usize) -> Self {
        self.block_size = size;
        self
    }

    /// Sets log/manifest reuse on open.
    pub fn reuse_logs(mut self, value: bool) -> Self {
        self.reuse_logs = value;
        self
    }

    /// Validates the options and returns an error if any are invalid.
    pub fn validate(&self) -> crate::Result<()> {
        if self.write_buffer_size == 0 {
            return Err(crate::Error::invalid_argument("write_buffer_size must be > 0"));
        }
        if self.block_size == 0 {
            return Err(crate::Error::invalid_argument("block_size must be > 0"));
        }
        if self.max_file_size == 0 {
            return Err(crate::Error::invalid_argument("max_file_size must be > 0"));
        }
        if self.max_open_files < 16 {
            return Err(crate::Error::invalid_argument("max_open_files must be >= 16"));
        }
        Ok(())
    }
}

/// Options that control a single write.
#[derive(Debug, Clone, Default)]
pub struct WriteOptions {
    /// Fsync the log before acknowledging the write.
    ///
    /// With `sync = false` a machine crash may lose the most recent
    /// writes; a process crash loses nothing.
    pub sync: bool,
}

impl WriteOptions {
    /// WriteOptions with `sync` enabled.
    pub fn sync() -> Self {
        Self { sync: true }
    }
}

/// Options that control a single read.
#[derive(Clone, Default)]
pub struct ReadOptions {
    /// Read as of this snapshot instead of the latest state.
    pub snapshot: Option<Arc<Snapshot>>,
}

impl ReadOptions {
    /// Read options against the latest state.
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let opts = Options::default();
        assert!(!opts.create_if_missing);
        assert!(!opts.error_if_exists);
        assert_eq!(opts.write_buffer_size, 4 * 1024 * 1024);
        assert_eq!(opts.max_file_size, 2 * 1024 * 1024);
        assert_eq!(opts.max_open_files, 1000);
    }

    #[test]
    fn test_options_builder() {
        let opts = Options::new()
            .create_if_missing(true)
            .write_buffer_size(8 * 1024 * 1024)
            .block_size(8 * 1024)
            .reuse_logs(true);

        assert!(opts.create_if_missing);
        assert_eq!(opts.write_buffer_size, 8 * 1024 * 1024);
        assert_eq!(opts.block_size, 8 * 1024);
        assert!(opts.reuse_logs);
    }

    #[test]
    fn test_options_validation() {
        let mut opts = Options::default();
        assert!(opts.validate().is_ok());

        opts.write_buffer_size = 0;
        assert!(opts.validate().is_err());

        opts.write_buffer_size = 1024;
        opts.max_open_files = 2;
        assert!(opts.validate().is_err());
    }
}
