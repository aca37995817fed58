//! Sorted-table writer.

use crate::env::WritableFile;
use crate::options::Options;
use crate::sstable::block_builder::BlockBuilder;
use crate::sstable::filter_block::FilterBlockBuilder;
use crate::sstable::{BlockHandle, CompressionType, Footer, BLOCK_TRAILER_SIZE};
use crate::util::crc::{crc32c_multi, mask};
use crate::Result;

/// Builds a sorted table file from keys added in ascending order.
///
/// The index entry for a data block is not written until the first key of
/// the *next* block is known, so the index key can be shortened to a
/// separator that sorts between the two blocks. Errors are sticky: after
/// the first failure every operation returns the same error.
pub struct SSTableWriter {
    options: Options,
    file: Box<dyn WritableFile>,
    offset: u64,
    status: Result<()>,
    data_block: BlockBuilder,
    index_block: BlockBuilder,
    last_key: Vec<u8>,
    num_entries: u64,
    closed: bool,
    filter_block: Option<FilterBlockBuilder>,
    /// An index entry for the last finished data block is owed.
    pending_index_entry: bool,
    pending_handle: BlockHandle,
}

/// Filters operate on user keys; strip the internal-key tail when present.
fn filter_key(key: &[u8]) -> &[u8] {
    if key.len() > 8 {
        &key[..key.len() - 8]
    } else {
        key
    }
}

impl SSTableWriter {
    /// Create a writer that appends the table to `file`.
    pub fn new(options: Options, file: Box<dyn WritableFile>) -> Self {
        let mut filter_block = options
            .filter_policy
            .clone()
            .map(FilterBlockBuilder::new);
        if let Some(fb) = &mut filter_block {
            fb.start_block(0);
        }

        Self {
            data_block: BlockBuilder::new(options.block_restart_interval),
            // Index entries are never prefix-compressed; every one is a
            // restart point so lookups can binary-search all of them.
            index_block: BlockBuilder::new(1),
            options,
            file,
            offset: 0,
            status: Ok(()),
            last_key: Vec::new(),
            num_entries: 0,
            closed: false,
            filter_block,
            pending_index_entry: false,
            pending_handle: BlockHandle::default(),
        }
    }

    /// Number of entries added so far.
    pub fn num_entries(&self) -> u64 {
        self.num_entries
    }

    /// Size of the file generated so far. Accurate after `finish`.
    pub fn file_size(&self) -> u64 {
        self.offset
    }

    /// First error encountered, if any.
    pub fn status(&self) -> Result<()> {
        self.status.clone()
    }

    fn sticky<R>(&mut self, result: Result<R>) -> Result<R> {
        if let Err(e) = &result {
            if self.status.is_ok() {
                self.status = Err(e.clone());
            }
        }
        result
    }

    /// Add an entry. Keys must arrive in strictly increasing order under
    /// the configured comparator.
    pub fn add(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        assert!(!self.closed);
        self.status()?;

        debug_assert!(
            self.num_entries == 0
                || self.options.comparator.compare(key, &self.last_key)
                    == std::cmp::Ordering::Greater,
            "keys must be added in strictly increasing order"
        );

        if self.pending_index_entry {
            debug_assert!(self.data_block.is_empty());
            self.options
                .comparator
                .find_shortest_separator(&mut self.last_key, key);
            let handle_encoding = self.pending_handle.encode();
            let last_key = std::mem::take(&mut self.last_key);
            self.index_block.add(&last_key, &handle_encoding);
            self.last_key = last_key;
            self.pending_index_entry = false;
        }

        if let Some(fb) = &mut self.filter_block {
            fb.add_key(filter_key(key));
        }

        self.last_key.clear();
        self.last_key.extend_from_slice(key);
        self.num_entries += 1;
        self.data_block.add(key, value);

        if self.data_block.current_size_estimate() >= self.options.block_size {
            self.flush()?;
        }
        Ok(())
    }

    /// Flush the buffered data block to the file.
    pub fn flush(&mut self) -> Result<()> {
        assert!(!self.closed);
        self.status()?;
        if self.data_block.is_empty() {
            return Ok(());
        }
        debug_assert!(!self.pending_index_entry);

        let contents = self.data_block.finish().to_vec();
        self.data_block.reset();
        let handle = self.write_block(&contents)?;
        self.pending_handle = handle;
        self.pending_index_entry = true;

        let flushed = self.file.flush();
        self.sticky(flushed)?;

        if let Some(fb) = &mut self.filter_block {
            fb.start_block(self.offset);
        }
        Ok(())
    }

    /// Write the filter, metaindex, index, and footer. No further entries
    /// may be added afterwards.
    pub fn finish(&mut self) -> Result<()> {
        self.flush()?;
        assert!(!self.closed);
        self.closed = true;

        // Filter block (stored raw).
        let filter_handle = match self.filter_block.take() {
            Some(fb) => {
                let contents = fb.finish();
                Some(self.write_raw_block(&contents, CompressionType::None)?)
            }
            None => None,
        };

        // Metaindex block maps "filter.<policy>" to the filter handle.
        let mut metaindex_block = BlockBuilder::new(self.options.block_restart_interval);
        if let Some(handle) = filter_handle {
            let key = format!(
                "filter.{}",
                self.options
                    .filter_policy
                    .as_ref()
                    .expect("filter block implies a policy")
                    .name()
            );
            metaindex_block.add(key.as_bytes(), &handle.encode());
        }
        let metaindex_contents = metaindex_block.finish().to_vec();
        let metaindex_handle = self.write_block(&metaindex_contents)?;

        // Index block, with the final entry keyed past the last key.
        if self.pending_index_entry {
            let mut last_key = std::mem::take(&mut self.last_key);
            self.options.comparator.find_short_successor(&mut last_key);
            self.index_block.add(&last_key, &self.pending_handle.encode());
            self.last_key = last_key;
            self.pending_index_entry = false;
        }
        let index_contents = self.index_block.finish().to_vec();
        let index_handle = self.write_block(&index_contents)?;

        // Footer.
        let footer = Footer {
            metaindex_handle,
            index_handle,
        };
        let encoded = footer.encode();
        let appended = self.file.append(&encoded);
        self.sticky(appended)?;
        self.offset += encoded.len() as u64;

        let flushed = self.file.flush();
        self.sticky(flushed)
    }

    /// Force the written table to stable storage.
    pub fn sync(&mut self) -> Result<()> {
        let synced = self.file.sync();
        self.sticky(synced)
    }

    /// Compress (if profitable) and write one block.
    fn write_block(&mut self, raw: &[u8]) -> Result<BlockHandle> {
        match self.options.compression {
            CompressionType::None => self.write_raw_block(raw, CompressionType::None),
            CompressionType::Snappy => {
                match snap::raw::Encoder::new().compress_vec(raw) {
                    Ok(compressed) if compressed.len() < raw.len() => {
                        self.write_raw_block(&compressed, CompressionType::Snappy)
                    }
                    // Incompressible; store raw.
                    _ => self.write_raw_block(raw, CompressionType::None),
                }
            }
        }
    }

    fn write_raw_block(
        &mut self,
        contents: &[u8],
        compression: CompressionType,
    ) -> Result<BlockHandle> {
        let handle = BlockHandle::new(self.offset, contents.len() as u64);

        let result = (|| -> Result<()> {
            self.file.append(contents)?;

            let mut trailer = [0u8; BLOCK_TRAILER_SIZE];
            trailer[0] = compression.to_byte();
            let crc = mask(crc32c_multi(&[contents, &[compression.to_byte()]]));
            trailer[1..5].copy_from_slice(&crc.to_le_bytes());
            self.file.append(&trailer)?;
            Ok(())
        })();
        self.sticky(result)?;

        self.offset += contents.len() as u64 + BLOCK_TRAILER_SIZE as u64;
        Ok(handle)
    }
}
