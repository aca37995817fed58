//! Builder for prefix-compressed blocks.
//!
//! Keys between restart points store only the bytes that differ from the
//! previous key:
//!
//! ```text
//! varint32(shared) || varint32(non_shared) || varint32(value_len)
//!     || key_delta || value
//! ```
//!
//! Every `restart_interval` entries the full key is written and the entry
//! offset is recorded in the restart array appended at `finish`, enabling
//! binary search within the block.

use crate::util::coding::{put_fixed32, put_varint32};

/// Accumulates sorted entries into a single block image.
pub struct BlockBuilder {
    restart_interval: usize,
    buffer: Vec<u8>,
    /// Offsets of restart points.
    restarts: Vec<u32>,
    /// Entries emitted since the last restart point.
    counter: usize,
    finished: bool,
    last_key: Vec<u8>,
}

impl BlockBuilder {
    /// Create a builder that restarts prefix compression every
    /// `restart_interval` entries.
    pub fn new(restart_interval: usize) -> Self {
        assert!(restart_interval >= 1);
        Self {
            restart_interval,
            buffer: Vec::new(),
            restarts: vec![0], // first restart point is at offset 0
            counter: 0,
            finished: false,
            last_key: Vec::new(),
        }
    }

    /// Reset to the empty state for building another block.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.restarts.clear();
        self.restarts.push(0);
        self.counter = 0;
        self.finished = false;
        self.last_key.clear();
    }

    /// True when no entries have been added since creation or `reset`.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Append an entry. Keys must arrive in ascending comparator order;
    /// the table builder enforces this.
    pub fn add(&mut self, key: &[u8], value: &[u8]) {
        debug_assert!(!self.finished);
        debug_assert!(self.counter <= self.restart_interval);

        let shared = if self.counter < self.restart_interval {
            // Shared prefix with the previous key.
            let min_len = std::cmp::min(self.last_key.len(), key.len());
            let mut shared = 0;
            while shared < min_len && self.last_key[shared] == key[shared] {
                shared += 1;
            }
            shared
        } else {
            // Restart point: store the full key.
            self.restarts.push(self.buffer.len() as u32);
            self.counter = 0;
            0
        };

        let non_shared = key.len() - shared;

        put_varint32(&mut self.buffer, shared as u32);
        put_varint32(&mut self.buffer, non_shared as u32);
        put_varint32(&mut self.buffer, value.len() as u32);
        self.buffer.extend_from_slice(&key[shared..]);
        self.buffer.extend_from_slice(value);

        self.last_key.truncate(shared);
        self.last_key.extend_from_slice(&key[shared..]);
        debug_assert_eq!(self.last_key, key);
        self.counter += 1;
    }

    /// Size of the block that `finish` would currently produce.
    pub fn current_size_estimate(&self) -> usize {
        self.buffer.len() + self.restarts.len() * 4 + 4
    }

    /// Append the restart array and return the finished block contents.
    pub fn finish(&mut self) -> &[u8] {
        debug_assert!(!self.finished);
        for &restart in &self.restarts {
            put_fixed32(&mut self.buffer, restart);
        }
        put_fixed32(&mut self.buffer, self.restarts.len() as u32);
        self.finished = true;
        &self.buffer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iterator::Iter;
    use crate::sstable::block::Block;
    use crate::util::comparator::BytewiseComparator;
    use bytes::Bytes;
    use std::sync::Arc;

    fn build_block(builder: &mut BlockBuilder) -> Block {
        let contents = Bytes::copy_from_slice(builder.finish());
        Block::new(contents).unwrap()
    }

    fn collect(block: &Block) -> Vec<(Vec<u8>, Vec<u8>)> {
        let mut iter = block.iter(Arc::new(BytewiseComparator));
        let mut out = Vec::new();
        iter.seek_to_first();
        while iter.valid() {
            out.push((iter.key().to_vec(), iter.value().to_vec()));
            iter.next();
        }
        out
    }

    #[test]
    fn test_empty_block() {
        let mut builder = BlockBuilder::new(16);
        assert!(builder.is_empty());
        assert_eq!(builder.current_size_estimate(), 8); // one restart + count

        let block = build_block(&mut builder);
        assert!(collect(&block).is_empty());
    }

    #[test]
    fn test_single_entry() {
        let mut builder = BlockBuilder::new(16);
        builder.add(b"key", b"value");
        let block = build_block(&mut builder);
        assert_eq!(block.num_restarts(), 1);
        assert_eq!(collect(&block), vec![(b"key".to_vec(), b"value".to_vec())]);
    }

    #[test]
    fn test_entries_roundtrip_with_shared_prefixes() {
        let entries: Vec<(Vec<u8>, Vec<u8>)> = vec![
            (b"aaa".to_vec(), b"v1".to_vec()),
            (b"aab".to_vec(), b"v2".to_vec()),
            (b"aac".to_vec(), b"".to_vec()),
            (b"abc".to_vec(), b"v4".to_vec()),
            (b"bcd".to_vec(), b"v5".to_vec()),
        ];

        for interval in [1, 2, 16, 1024] {
            let mut builder = BlockBuilder::new(interval);
            for (k, v) in &entries {
                builder.add(k, v);
            }
            let block = build_block(&mut builder);
            assert_eq!(collect(&block), entries, "interval {}", interval);
        }
    }

    #[test]
    fn test_restart_points() {
        let mut builder = BlockBuilder::new(2);
        for i in 0..6 {
            let key = format!("key{:02}", i);
            builder.add(key.as_bytes(), b"v");
        }
        let block = build_block(&mut builder);
        // Entries 0-1, 2-3, 4-5.
        assert_eq!(block.num_restarts(), 3);
    }

    #[test]
    fn test_prefix_compression_shrinks_buffer() {
        let mut compressed = BlockBuilder::new(16);
        let mut uncompressed = BlockBuilder::new(1);
        for i in 0..64 {
            let key = format!("a_long_common_prefix_{:04}", i);
            compressed.add(key.as_bytes(), b"v");
            uncompressed.add(key.as_bytes(), b"v");
        }
        assert!(compressed.current_size_estimate() < uncompressed.current_size_estimate());
    }

    #[test]
    fn test_size_estimate_matches_finish() {
        let mut builder = BlockBuilder::new(4);
        for i in 0..20 {
            let key = format!("key{:03}", i);
            builder.add(key.as_bytes(), b"some value");
        }
        let estimate = builder.current_size_estimate();
        assert_eq!(builder.finish().len(), estimate);
    }

    #[test]
    fn test_reset_builds_fresh_block() {
        let mut builder = BlockBuilder::new(16);
        builder.add(b"old", b"x");
        builder.finish();

        builder.reset();
        assert!(builder.is_empty());
        builder.add(b"new", b"y");
        let block = build_block(&mut builder);
        assert_eq!(collect(&block), vec![(b"new".to_vec(), b"y".to_vec())]);
    }
}
