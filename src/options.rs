//! Configuration for the storage engine core.

use std::sync::Arc;

use crate::cache::ShardedLruCache;
use crate::env::{Env, StdEnv};
use crate::sstable::block::Block;
use crate::sstable::filter::FilterPolicy;
use crate::sstable::CompressionType;
use crate::util::comparator::{BytewiseComparator, Comparator};

/// Cache of uncompressed data blocks, shared across tables.
pub type BlockCache = ShardedLruCache<Block>;

/// Default write buffer size before a memtable is frozen (4 MiB).
pub const DEFAULT_WRITE_BUFFER_SIZE: usize = 4 * 1024 * 1024;

/// Default cap on open files; the table cache reserves all but a few.
pub const DEFAULT_MAX_OPEN_FILES: usize = 1000;

/// Default target size for uncompressed data blocks (4 KiB).
pub const DEFAULT_BLOCK_SIZE: usize = 4 * 1024;

/// Default number of entries between restart points in a data block.
pub const DEFAULT_BLOCK_RESTART_INTERVAL: usize = 16;

/// File handles kept out of the table cache for other uses.
pub const NUM_NON_TABLE_CACHE_FILES: usize = 10;

/// Options controlling the engine's behavior.
#[derive(Clone)]
pub struct Options {
    /// Comparator defining the key order. Must not change between opens of
    /// the same database.
    pub comparator: Arc<dyn Comparator>,

    /// Create the database directory if it is missing.
    pub create_if_missing: bool,

    /// Fail opening if the database already exists.
    pub error_if_exists: bool,

    /// Aggressively verify checksums on internal reads.
    pub paranoid_checks: bool,

    /// Platform services.
    pub env: Arc<dyn Env>,

    /// Bytes buffered in a memtable before it is frozen for flushing.
    pub write_buffer_size: usize,

    /// Maximum number of files held open at once.
    pub max_open_files: usize,

    /// Cache of uncompressed data blocks, or `None` to read through.
    pub block_cache: Option<Arc<BlockCache>>,

    /// Approximate uncompressed size of a data block.
    pub block_size: usize,

    /// Entries between restart points inside a data block.
    pub block_restart_interval: usize,

    /// Compression applied to data blocks.
    pub compression: CompressionType,

    /// Filter policy for pruning point reads, or `None` for no filters.
    pub filter_policy: Option<Arc<dyn FilterPolicy>>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            comparator: Arc::new(BytewiseComparator),
            create_if_missing: false,
            error_if_exists: false,
            paranoid_checks: false,
            env: Arc::new(StdEnv),
            write_buffer_size: DEFAULT_WRITE_BUFFER_SIZE,
            max_open_files: DEFAULT_MAX_OPEN_FILES,
            block_cache: None,
            block_size: DEFAULT_BLOCK_SIZE,
            block_restart_interval: DEFAULT_BLOCK_RESTART_INTERVAL,
            compression: CompressionType::Snappy,
            filter_policy: None,
        }
    }
}

impl Options {
    /// Options with every knob at its default.
    pub fn new() -> Self {
        Self::default()
    }

    /// Table-cache capacity implied by `max_open_files`.
    pub fn table_cache_size(&self) -> usize {
        self.max_open_files.saturating_sub(NUM_NON_TABLE_CACHE_FILES)
    }
}

/// Options for read operations.
#[derive(Clone)]
pub struct ReadOptions {
    /// Verify checksums of all data read for this operation.
    pub verify_checksums: bool,

    /// Whether blocks read for this operation should populate the block
    /// cache. Bulk scans usually disable this.
    pub fill_cache: bool,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            verify_checksums: false,
            fill_cache: true,
        }
    }
}

impl ReadOptions {
    /// Read options with the defaults.
    pub fn new() -> Self {
        Self::default()
    }
}

/// Options for write operations.
#[derive(Debug, Clone, Copy, Default)]
pub struct WriteOptions {
    /// Sync the WAL before the write is considered complete.
    pub sync: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = Options::default();
        assert_eq!(options.block_size, 4096);
        assert_eq!(options.block_restart_interval, 16);
        assert_eq!(options.compression, CompressionType::Snappy);
        assert!(options.block_cache.is_none());
        assert!(options.filter_policy.is_none());
        assert_eq!(options.table_cache_size(), 990);
    }

    #[test]
    fn test_read_options_default_fill_cache() {
        let read_options = ReadOptions::default();
        assert!(read_options.fill_cache);
        assert!(!read_options.verify_checksums);
    }
}
