//! Cache of open sorted-table readers, keyed by file number.

use std::path::{Path, PathBuf};

use bytes::Bytes;

use crate::iterator::{ChildIter, EmptyIter, Iter};
use crate::options::{Options, ReadOptions};
use crate::sstable::reader::SSTableReader;
use crate::util::filename::{sst_table_file_name, table_file_name};
use crate::Result;

use super::lru::{CacheHandle, ShardedLruCache};

/// Keeps recently used tables open so reads skip the open-and-parse cost.
///
/// An entry owns the open file and the parsed table; evicting it closes
/// both once no iterator pins the handle anymore.
pub struct TableCache {
    dbname: PathBuf,
    options: Options,
    cache: ShardedLruCache<SSTableReader>,
}

impl TableCache {
    /// Create a cache for tables under `dbname` holding at most `entries`
    /// open tables.
    pub fn new(dbname: impl AsRef<Path>, options: Options, entries: usize) -> Self {
        Self {
            dbname: dbname.as_ref().to_path_buf(),
            options,
            cache: ShardedLruCache::new(entries),
        }
    }

    fn find_table(
        &self,
        file_number: u64,
        file_size: u64,
    ) -> Result<CacheHandle<SSTableReader>> {
        let key = file_number.to_le_bytes();
        if let Some(handle) = self.cache.lookup(&key) {
            return Ok(handle);
        }

        // Tables are written with the .ldb suffix; fall back to the legacy
        // .sst name on the read path.
        let env = &self.options.env;
        let path = table_file_name(&self.dbname, file_number);
        let file = match env.new_random_access_file(&path) {
            Ok(file) => file,
            Err(err) => {
                let old_path = sst_table_file_name(&self.dbname, file_number);
                match env.new_random_access_file(&old_path) {
                    Ok(file) => file,
                    Err(_) => return Err(err),
                }
            }
        };

        let table = SSTableReader::open(self.options.clone(), file, file_size)?;
        Ok(self.cache.insert(&key, table, 1, None))
    }

    /// Iterate over table `file_number`.
    ///
    /// Never fails loudly: if the table cannot be opened the returned
    /// iterator is invalid and carries the error in its status. The cache
    /// entry stays pinned until the iterator is dropped.
    pub fn new_iterator(
        &self,
        read_options: &ReadOptions,
        file_number: u64,
        file_size: u64,
    ) -> ChildIter {
        match self.find_table(file_number, file_size) {
            Ok(handle) => {
                let table = handle.value().clone();
                let mut iter = table.iter(read_options);
                iter.register_cleanup(Box::new(move || drop(handle)));
                ChildIter::Table(iter)
            }
            Err(err) => ChildIter::Empty(EmptyIter::with_error(err)),
        }
    }

    /// Point lookup in table `file_number` without materializing an
    /// iterator.
    pub fn get(
        &self,
        read_options: &ReadOptions,
        file_number: u64,
        file_size: u64,
        internal_key: &[u8],
    ) -> Result<Option<(Bytes, Bytes)>> {
        let handle = self.find_table(file_number, file_size)?;
        handle.value().internal_get(read_options, internal_key)
    }

    /// Drop the cached entry for a table, releasing its descriptor as soon
    /// as outstanding iterators finish. Called when the file is deleted.
    pub fn evict(&self, file_number: u64) {
        self.cache.erase(&file_number.to_le_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::{Env, StdEnv};
    use crate::sstable::writer::SSTableWriter;
    use crate::sstable::CompressionType;
    use tempfile::tempdir;

    fn options() -> Options {
        let mut options = Options::default();
        options.block_size = 256;
        options.compression = CompressionType::None;
        options
    }

    fn write_table(dbname: &Path, file_number: u64, count: u32) -> u64 {
        let env = StdEnv;
        let path = table_file_name(dbname, file_number);
        let file = env.new_writable_file(&path).unwrap();
        let mut writer = SSTableWriter::new(options(), file);
        for i in 0..count {
            let key = format!("f{}key{:06}", file_number, i);
            let value = format!("value{:06}", i);
            writer.add(key.as_bytes(), value.as_bytes()).unwrap();
        }
        writer.finish().unwrap();
        writer.sync().unwrap();
        writer.file_size()
    }

    #[test]
    fn test_get_through_cache() {
        let dir = tempdir().unwrap();
        let size = write_table(dir.path(), 1, 100);
        let cache = TableCache::new(dir.path(), options(), 16);

        let read_options = ReadOptions::default();
        let found = cache
            .get(&read_options, 1, size, b"f1key000042")
            .unwrap()
            .unwrap();
        assert_eq!(found.1, &b"value000042"[..]);

        // Second read is served by the cached table.
        let found = cache
            .get(&read_options, 1, size, b"f1key000007")
            .unwrap()
            .unwrap();
        assert_eq!(found.1, &b"value000007"[..]);
    }

    #[test]
    fn test_iterator_pins_table_across_evict() {
        let dir = tempdir().unwrap();
        let size = write_table(dir.path(), 1, 50);
        let cache = TableCache::new(dir.path(), options(), 16);

        let mut iter = cache.new_iterator(&ReadOptions::default(), 1, size);
        iter.seek_to_first();
        assert!(iter.valid());

        // Evicting while the iterator is open must not break it.
        cache.evict(1);
        let mut count = 0;
        while iter.valid() {
            count += 1;
            iter.next();
        }
        assert_eq!(count, 50);
        drop(iter);
    }

    #[test]
    fn test_missing_table_yields_error_iterator() {
        let dir = tempdir().unwrap();
        let cache = TableCache::new(dir.path(), options(), 16);

        let mut iter = cache.new_iterator(&ReadOptions::default(), 404, 1000);
        iter.seek_to_first();
        assert!(!iter.valid());
        assert!(iter.status().is_err());

        assert!(cache
            .get(&ReadOptions::default(), 404, 1000, b"k")
            .is_err());
    }

    #[test]
    fn test_sst_suffix_fallback() {
        let dir = tempdir().unwrap();
        // Write under .ldb, rename to the legacy suffix.
        let size = write_table(dir.path(), 7, 10);
        std::fs::rename(
            table_file_name(dir.path(), 7),
            sst_table_file_name(dir.path(), 7),
        )
        .unwrap();

        let cache = TableCache::new(dir.path(), options(), 16);
        let found = cache
            .get(&ReadOptions::default(), 7, size, b"f7key000003")
            .unwrap()
            .unwrap();
        assert_eq!(found.1, &b"value000003"[..]);
    }

    #[test]
    fn test_evict_reopens_on_next_access() {
        let dir = tempdir().unwrap();
        let size = write_table(dir.path(), 1, 10);
        let cache = TableCache::new(dir.path(), options(), 16);

        let read_options = ReadOptions::default();
        assert!(cache
            .get(&read_options, 1, size, b"f1key000001")
            .unwrap()
            .is_some());

        cache.evict(1);

        // Still readable: the file is reopened on demand.
        assert!(cache
            .get(&read_options, 1, size, b"f1key000001")
            .unwrap()
            .is_some());
    }
}
