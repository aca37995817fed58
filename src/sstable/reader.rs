//! Sorted-table reader.

use std::sync::Arc;

use bytes::Bytes;

use crate::env::RandomAccessFile;
use crate::iterator::{Iter, TwoLevelIterator};
use crate::options::{Options, ReadOptions};
use crate::sstable::block::{Block, BlockIter};
use crate::sstable::filter_block::FilterBlockReader;
use crate::sstable::{read_block_contents, BlockHandle, Footer, FOOTER_SIZE};
use crate::util::comparator::BytewiseComparator;
use crate::{Error, Result};

/// Iterator over a whole table: the index block drives lazily loaded data
/// block iterators.
pub type SSTableIterator = TwoLevelIterator;

struct TableInner {
    options: Options,
    file: Box<dyn RandomAccessFile>,
    metaindex_handle: BlockHandle,
    index_block: Block,
    filter: Option<FilterBlockReader>,
    /// Distinguishes this table's blocks in the shared block cache.
    cache_id: u64,
}

/// An open, immutable sorted table.
///
/// Cloning is cheap; clones share the underlying file, the resident index
/// block, and the filter.
#[derive(Clone)]
pub struct SSTableReader {
    inner: Arc<TableInner>,
}

impl std::fmt::Debug for SSTableReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SSTableReader").finish_non_exhaustive()
    }
}

impl SSTableReader {
    /// Open a table of `size` bytes stored in `file`.
    ///
    /// Reads and retains the index block (and filter block, when a policy
    /// is configured) for the life of the reader.
    pub fn open(
        options: Options,
        file: Box<dyn RandomAccessFile>,
        size: u64,
    ) -> Result<SSTableReader> {
        if size < FOOTER_SIZE as u64 {
            return Err(Error::corruption("file is too short to be an sstable"));
        }

        let mut footer_buf = vec![0u8; FOOTER_SIZE];
        let read = file.read_at(size - FOOTER_SIZE as u64, &mut footer_buf)?;
        if read < FOOTER_SIZE {
            return Err(Error::corruption("truncated footer read"));
        }
        let footer = Footer::decode_from(&footer_buf)?;

        // The index block is verified eagerly when paranoid.
        let meta_read_options = ReadOptions {
            verify_checksums: options.paranoid_checks,
            fill_cache: false,
        };
        let index_contents = read_block_contents(&*file, &meta_read_options, &footer.index_handle)?;
        let index_block = Block::new(index_contents)?;

        let cache_id = match &options.block_cache {
            Some(cache) => cache.new_id(),
            None => 0,
        };

        let filter = Self::read_filter(&options, &*file, &footer, &meta_read_options);

        Ok(SSTableReader {
            inner: Arc::new(TableInner {
                options,
                file,
                metaindex_handle: footer.metaindex_handle,
                index_block,
                filter,
                cache_id,
            }),
        })
    }

    /// Load the filter named in the metaindex, if any.
    ///
    /// A missing or unreadable filter only costs performance, so any
    /// problem here degrades to `None` rather than failing the open.
    fn read_filter(
        options: &Options,
        file: &dyn RandomAccessFile,
        footer: &Footer,
        read_options: &ReadOptions,
    ) -> Option<FilterBlockReader> {
        let policy = options.filter_policy.as_ref()?;

        let meta_contents =
            read_block_contents(file, read_options, &footer.metaindex_handle).ok()?;
        let meta = Block::new(meta_contents).ok()?;

        let name = format!("filter.{}", policy.name());
        let mut iter = meta.iter(Arc::new(BytewiseComparator));
        iter.seek(name.as_bytes());
        if !iter.valid() || iter.key() != name.as_bytes() {
            return None;
        }

        let mut handle_bytes = iter.value();
        let handle = BlockHandle::decode_from(&mut handle_bytes).ok()?;
        let filter_contents = read_block_contents(file, read_options, &handle).ok()?;
        Some(FilterBlockReader::new(Arc::clone(policy), filter_contents))
    }

    /// Iterate over the table's entries.
    pub fn iter(&self, read_options: &ReadOptions) -> SSTableIterator {
        let inner = Arc::clone(&self.inner);
        let read_options = read_options.clone();
        let index_iter = self
            .inner
            .index_block
            .iter(self.inner.options.comparator.clone());

        TwoLevelIterator::new(
            index_iter,
            Box::new(move |handle_bytes| block_reader(&inner, &read_options, handle_bytes)),
        )
    }

    /// Point lookup: the first entry with key >= `key`, if the block that
    /// could hold it contains one.
    ///
    /// The filter is consulted first, so most lookups for absent keys
    /// finish without touching a data block.
    pub fn internal_get(
        &self,
        read_options: &ReadOptions,
        key: &[u8],
    ) -> Result<Option<(Bytes, Bytes)>> {
        let inner = &self.inner;

        let mut index_iter = inner.index_block.iter(inner.options.comparator.clone());
        index_iter.seek(key);
        if !index_iter.valid() {
            index_iter.status()?;
            return Ok(None);
        }

        let handle_bytes = index_iter.value();
        if let Some(filter) = &inner.filter {
            let mut cursor = handle_bytes;
            if let Ok(handle) = BlockHandle::decode_from(&mut cursor) {
                let user_key = if key.len() > 8 { &key[..key.len() - 8] } else { key };
                if !filter.key_may_match(handle.offset(), user_key) {
                    return Ok(None);
                }
            }
        }

        let mut block_iter = block_reader(inner, read_options, handle_bytes)?;
        block_iter.seek(key);
        if block_iter.valid() {
            Ok(Some((
                Bytes::copy_from_slice(block_iter.key()),
                Bytes::copy_from_slice(block_iter.value()),
            )))
        } else {
            block_iter.status()?;
            Ok(None)
        }
    }

    /// Approximate file offset where `key`'s data begins.
    ///
    /// Keys past the last entry map to the start of the metaindex block,
    /// which is close to the file size.
    pub fn approximate_offset_of(&self, key: &[u8]) -> u64 {
        let inner = &self.inner;
        let mut index_iter = inner.index_block.iter(inner.options.comparator.clone());
        index_iter.seek(key);
        if index_iter.valid() {
            let mut handle_bytes = index_iter.value();
            if let Ok(handle) = BlockHandle::decode_from(&mut handle_bytes) {
                return handle.offset();
            }
        }
        inner.metaindex_handle.offset()
    }
}

/// Open an iterator over the data block named by `handle_bytes`, going
/// through the block cache when one is configured.
fn block_reader(
    inner: &TableInner,
    read_options: &ReadOptions,
    handle_bytes: &[u8],
) -> Result<BlockIter> {
    let mut cursor = handle_bytes;
    let handle = BlockHandle::decode_from(&mut cursor)?;

    let block = match &inner.options.block_cache {
        Some(cache) => {
            // Cache key: table cache id || block offset, both fixed64.
            let mut cache_key = [0u8; 16];
            cache_key[..8].copy_from_slice(&inner.cache_id.to_le_bytes());
            cache_key[8..].copy_from_slice(&handle.offset().to_le_bytes());

            match cache.lookup(&cache_key) {
                Some(cache_handle) => {
                    // Block data is refcounted; the clone outlives the
                    // released handle.
                    cache_handle.value().clone()
                }
                None => {
                    let contents = read_block_contents(&*inner.file, read_options, &handle)?;
                    let block = Block::new(contents)?;
                    if read_options.fill_cache {
                        cache.release(cache.insert(
                            &cache_key,
                            block.clone(),
                            block.size(),
                            None,
                        ));
                    }
                    block
                }
            }
        }
        None => {
            let contents = read_block_contents(&*inner.file, read_options, &handle)?;
            Block::new(contents)?
        }
    };

    Ok(block.iter(inner.options.comparator.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::{Env, StdEnv};
    use crate::options::BlockCache;
    use crate::sstable::filter::BloomFilterPolicy;
    use crate::sstable::writer::SSTableWriter;
    use crate::sstable::CompressionType;
    use std::path::Path;
    use tempfile::tempdir;

    fn build_table(
        options: &Options,
        path: &Path,
        entries: &[(Vec<u8>, Vec<u8>)],
    ) -> SSTableReader {
        let env = StdEnv;
        let file = env.new_writable_file(path).unwrap();
        let mut writer = SSTableWriter::new(options.clone(), file);
        for (k, v) in entries {
            writer.add(k, v).unwrap();
        }
        writer.finish().unwrap();
        writer.sync().unwrap();

        let file = env.new_random_access_file(path).unwrap();
        let size = env.file_size(path).unwrap();
        SSTableReader::open(options.clone(), file, size).unwrap()
    }

    fn sample_entries(n: u32) -> Vec<(Vec<u8>, Vec<u8>)> {
        (0..n)
            .map(|i| {
                (
                    format!("key{:06}", i).into_bytes(),
                    format!("value{:06}", i).into_bytes(),
                )
            })
            .collect()
    }

    fn small_block_options() -> Options {
        let mut options = Options::default();
        options.block_size = 256;
        options.compression = CompressionType::None;
        options
    }

    #[test]
    fn test_get_every_key_and_misses() {
        let dir = tempdir().unwrap();
        let entries = sample_entries(300);

        for restart_interval in [1, 16, 1024] {
            let mut options = small_block_options();
            options.block_restart_interval = restart_interval;
            let path = dir.path().join(format!("{:06}.ldb", restart_interval));
            let table = build_table(&options, &path, &entries);

            let read_options = ReadOptions::default();
            for (k, v) in &entries {
                let found = table.internal_get(&read_options, k).unwrap().unwrap();
                assert_eq!(&found.0, k);
                assert_eq!(&found.1, v);
            }

            // A key between two stored keys surfaces the successor; the
            // caller compares keys itself.
            let found = table
                .internal_get(&read_options, b"key000100x")
                .unwrap()
                .unwrap();
            assert_eq!(found.0, &b"key000101"[..]);

            // Past the end: nothing.
            assert!(table
                .internal_get(&read_options, b"zzz")
                .unwrap()
                .is_none());
        }
    }

    #[test]
    fn test_iterate_forward_and_backward() {
        let dir = tempdir().unwrap();
        let entries = sample_entries(300);
        let table = build_table(
            &small_block_options(),
            &dir.path().join("000001.ldb"),
            &entries,
        );

        let mut iter = table.iter(&ReadOptions::default());

        iter.seek_to_first();
        let mut forward = Vec::new();
        while iter.valid() {
            forward.push((iter.key().to_vec(), iter.value().to_vec()));
            iter.next();
        }
        assert_eq!(forward, entries);
        assert!(iter.status().is_ok());

        iter.seek_to_last();
        let mut backward = Vec::new();
        while iter.valid() {
            backward.push((iter.key().to_vec(), iter.value().to_vec()));
            iter.prev();
        }
        backward.reverse();
        assert_eq!(backward, entries);
    }

    #[test]
    fn test_iterator_seek_lands_on_lower_bound() {
        let dir = tempdir().unwrap();
        let entries = sample_entries(100);
        let table = build_table(
            &small_block_options(),
            &dir.path().join("000001.ldb"),
            &entries,
        );

        let mut iter = table.iter(&ReadOptions::default());

        iter.seek(b"key000050");
        assert!(iter.valid());
        assert_eq!(iter.key(), b"key000050");

        iter.seek(b"key000050x");
        assert!(iter.valid());
        assert_eq!(iter.key(), b"key000051");

        iter.seek(b"zzz");
        assert!(!iter.valid());

        // Seek then walk backwards across block boundaries.
        iter.seek(b"key000050");
        iter.prev();
        assert!(iter.valid());
        assert_eq!(iter.key(), b"key000049");
    }

    #[test]
    fn test_snappy_roundtrip() {
        let dir = tempdir().unwrap();
        let mut options = Options::default();
        options.block_size = 1024;
        options.compression = CompressionType::Snappy;

        // Highly compressible values.
        let entries: Vec<(Vec<u8>, Vec<u8>)> = (0..200u32)
            .map(|i| (format!("key{:06}", i).into_bytes(), vec![b'x'; 120]))
            .collect();
        let path = dir.path().join("000001.ldb");
        let table = build_table(&options, &path, &entries);

        // Compression visibly shrank the file.
        let raw_payload: usize = entries.iter().map(|(k, v)| k.len() + v.len()).sum();
        assert!((std::fs::metadata(&path).unwrap().len() as usize) < raw_payload);

        let read_options = ReadOptions::default();
        for (k, v) in &entries {
            let found = table.internal_get(&read_options, k).unwrap().unwrap();
            assert_eq!(&found.1, v);
        }
    }

    #[test]
    fn test_block_cache_serves_repeat_reads() {
        let dir = tempdir().unwrap();
        let cache = Arc::new(BlockCache::new(64 * 1024));
        let mut options = small_block_options();
        options.block_cache = Some(Arc::clone(&cache));

        let entries = sample_entries(200);
        let table = build_table(&options, &dir.path().join("000001.ldb"), &entries);

        assert_eq!(cache.total_charge(), 0);
        let read_options = ReadOptions::default();
        table.internal_get(&read_options, b"key000000").unwrap();
        let after_first = cache.total_charge();
        assert!(after_first > 0, "block cached on first read");

        table.internal_get(&read_options, b"key000000").unwrap();
        assert_eq!(cache.total_charge(), after_first, "repeat read hit cache");

        // fill_cache = false leaves the cache untouched.
        let no_fill = ReadOptions {
            verify_checksums: false,
            fill_cache: false,
        };
        table.internal_get(&no_fill, b"key000199").unwrap();
        assert_eq!(cache.total_charge(), after_first);
    }

    #[test]
    fn test_bloom_filter_blocks_absent_keys() {
        let dir = tempdir().unwrap();
        let mut options = small_block_options();
        options.filter_policy = Some(Arc::new(BloomFilterPolicy::new(10)));

        let entries = sample_entries(500);
        let table = build_table(&options, &dir.path().join("000001.ldb"), &entries);

        let read_options = ReadOptions::default();
        for (k, v) in entries.iter().step_by(17) {
            let found = table.internal_get(&read_options, k).unwrap().unwrap();
            assert_eq!(&found.1, v);
        }

        // Absent keys inside the key range come back empty (the filter or
        // the block seek rejects them).
        for i in 0..500u32 {
            let probe = format!("key{:06}absent", i);
            let result = table.internal_get(&read_options, probe.as_bytes()).unwrap();
            if let Some((found_key, _)) = result {
                assert_ne!(found_key, probe.as_bytes());
            }
        }
    }

    #[test]
    fn test_corrupt_footer_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("000001.ldb");
        let entries = sample_entries(10);
        build_table(&small_block_options(), &path, &entries);

        let mut data = std::fs::read(&path).unwrap();
        let n = data.len();
        data[n - 1] ^= 0xFF; // stomp the magic
        std::fs::write(&path, &data).unwrap();

        let env = StdEnv;
        let file = env.new_random_access_file(&path).unwrap();
        let err =
            SSTableReader::open(small_block_options(), file, data.len() as u64).unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn test_corrupt_block_detected_with_verify_checksums() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("000001.ldb");
        let entries = sample_entries(50);
        build_table(&small_block_options(), &path, &entries);

        // Flip a byte in the first data block.
        let mut data = std::fs::read(&path).unwrap();
        data[3] ^= 0xFF;
        std::fs::write(&path, &data).unwrap();

        let env = StdEnv;
        let file = env.new_random_access_file(&path).unwrap();
        let table =
            SSTableReader::open(small_block_options(), file, data.len() as u64).unwrap();

        let strict = ReadOptions {
            verify_checksums: true,
            fill_cache: false,
        };
        let err = table.internal_get(&strict, b"key000000").unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn test_too_small_file_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("000001.ldb");
        std::fs::write(&path, b"tiny").unwrap();

        let env = StdEnv;
        let file = env.new_random_access_file(&path).unwrap();
        let err = SSTableReader::open(Options::default(), file, 4).unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn test_approximate_offset_is_monotonic() {
        let dir = tempdir().unwrap();
        let entries = sample_entries(300);
        let path = dir.path().join("000001.ldb");
        let table = build_table(&small_block_options(), &path, &entries);

        let first = table.approximate_offset_of(b"key000000");
        let middle = table.approximate_offset_of(b"key000150");
        let last = table.approximate_offset_of(b"zzz");

        assert!(first <= middle);
        assert!(middle < last);
        assert!(last <= std::fs::metadata(&path).unwrap().len());
    }
}
