//! # stratadb
//!
//! Core of an embedded, ordered key-value storage engine organized as a
//! log-structured merge tree.
//!
//! This crate provides the pieces that give such an engine its shape:
//!
//! - **Sorted tables**: the immutable on-disk file format with
//!   prefix-compressed blocks, Bloom filter blocks, and a block index
//! - **Write-ahead log**: durable record framing over 32 KiB blocks with
//!   checksummed, fragmentable records
//! - **MemTable**: an arena-backed skip list keyed by internal keys,
//!   lock-free for readers
//! - **Caches**: a sharded, reference-counted LRU for data blocks and a
//!   table cache for open file handles
//! - **Iterators**: block, table, two-level, and k-way merging iterators
//!   sharing one trait
//!
//! The database façade that ties these together (recovery, compaction
//! scheduling, manifests, snapshots) lives a layer above; this crate
//! exposes the interfaces it consumes: [`env::Env`],
//! [`util::comparator::Comparator`], [`sstable::FilterPolicy`], and the
//! iterator stack.
//!
//! ## Writing and reading a table
//!
//! ```rust,ignore
//! use stratadb::{Options, ReadOptions, SSTableReader, SSTableWriter};
//!
//! let options = Options::default();
//! let file = options.env.new_writable_file(path)?;
//! let mut writer = SSTableWriter::new(options.clone(), file);
//! writer.add(b"key", b"value")?;
//! writer.finish()?;
//!
//! let file = options.env.new_random_access_file(path)?;
//! let size = options.env.file_size(path)?;
//! let table = SSTableReader::open(options, file, size)?;
//! let entry = table.internal_get(&ReadOptions::default(), b"key")?;
//! ```

pub mod cache;
pub mod env;
pub mod error;
pub mod iterator;
pub mod memtable;
pub mod options;
pub mod sstable;
pub mod types;
pub mod util;
pub mod wal;

pub use error::{Error, Result};
pub use options::{BlockCache, Options, ReadOptions, WriteOptions};
pub use types::{
    InternalKey, LookupKey, LookupResult, SequenceNumber, ValueType, WriteBatch,
    MAX_SEQUENCE_NUMBER,
};

pub use cache::{LruCache, ShardedLruCache, TableCache};
pub use env::{Env, StdEnv};
pub use iterator::{ChildIter, EmptyIter, Iter, MergingIterator, TwoLevelIterator};
pub use memtable::MemTable;
pub use sstable::{
    BloomFilterPolicy, CompressionType, FilterPolicy, SSTableReader, SSTableWriter,
};
pub use util::comparator::{BytewiseComparator, Comparator, InternalKeyComparator};
pub use wal::{WalReader, WalWriter};
