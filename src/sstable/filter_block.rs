//! Filter blocks: one filter per 2 KiB region of data-block offsets.
//!
//! Layout:
//!
//! ```text
//! [filter 0][filter 1]...[filter N-1]
//! [offset of filter 0 (u32 LE)]...[offset of filter N-1]
//! [offset of the offset array (u32 LE)]
//! [base_lg (u8)]
//! ```
//!
//! A data block starting at file offset `o` is covered by filter
//! `o >> base_lg`. Regions containing no data-block starts get empty
//! filters so the index stays dense.

use std::sync::Arc;

use bytes::Bytes;

use crate::util::coding::{put_fixed32, read_fixed32};

use super::filter::FilterPolicy;

/// Filters cover 2 KiB of offset space each.
pub const FILTER_BASE_LG: u8 = 11;
const FILTER_BASE: u64 = 1 << FILTER_BASE_LG;

/// Accumulates per-region filters while a table is written.
pub struct FilterBlockBuilder {
    policy: Arc<dyn FilterPolicy>,
    /// Flattened key bytes for the region being accumulated.
    keys: Vec<u8>,
    /// Start offset of each key in `keys`.
    start: Vec<usize>,
    /// Filter data computed so far.
    result: Vec<u8>,
    /// Offset of each finished filter within `result`.
    filter_offsets: Vec<u32>,
}

impl FilterBlockBuilder {
    /// Create a builder using `policy`.
    pub fn new(policy: Arc<dyn FilterPolicy>) -> Self {
        Self {
            policy,
            keys: Vec::new(),
            start: Vec::new(),
            result: Vec::new(),
            filter_offsets: Vec::new(),
        }
    }

    /// Note that a data block begins at `block_offset`. Catches the filter
    /// index up to that offset's region, flushing accumulated keys.
    pub fn start_block(&mut self, block_offset: u64) {
        let filter_index = block_offset / FILTER_BASE;
        debug_assert!(filter_index >= self.filter_offsets.len() as u64);
        while filter_index > self.filter_offsets.len() as u64 {
            self.generate_filter();
        }
    }

    /// Add a key belonging to the current data block.
    pub fn add_key(&mut self, key: &[u8]) {
        self.start.push(self.keys.len());
        self.keys.extend_from_slice(key);
    }

    /// Finish the block and return its contents.
    pub fn finish(mut self) -> Vec<u8> {
        if !self.start.is_empty() {
            self.generate_filter();
        }

        let array_offset = self.result.len() as u32;
        for &offset in &self.filter_offsets {
            put_fixed32(&mut self.result, offset);
        }
        put_fixed32(&mut self.result, array_offset);
        self.result.push(FILTER_BASE_LG);
        self.result
    }

    fn generate_filter(&mut self) {
        let num_keys = self.start.len();
        self.filter_offsets.push(self.result.len() as u32);
        if num_keys == 0 {
            // Empty region: the offset repeats, producing an empty filter.
            return;
        }

        self.start.push(self.keys.len()); // simplify length computation
        let tmp_keys: Vec<&[u8]> = (0..num_keys)
            .map(|i| &self.keys[self.start[i]..self.start[i + 1]])
            .collect();

        self.policy.create_filter(&tmp_keys, &mut self.result);

        self.keys.clear();
        self.start.clear();
    }
}

/// Probes the filters of an open table.
pub struct FilterBlockReader {
    policy: Arc<dyn FilterPolicy>,
    data: Bytes,
    /// Start of the offset array within `data`.
    offset_array: usize,
    /// Number of filters.
    num: usize,
    base_lg: u8,
}

impl FilterBlockReader {
    /// Wrap filter block `contents`. Malformed contents yield a reader
    /// that matches everything (filters only ever suppress reads).
    pub fn new(policy: Arc<dyn FilterPolicy>, contents: Bytes) -> Self {
        let mut reader = Self {
            policy,
            data: Bytes::new(),
            offset_array: 0,
            num: 0,
            base_lg: 0,
        };

        let n = contents.len();
        if n < 5 {
            // 1 byte base_lg + 4 bytes array offset at minimum.
            return reader;
        }
        reader.base_lg = contents[n - 1];
        let Some(last_word) = read_fixed32(&contents[n - 5..]) else {
            return reader;
        };
        if last_word as usize > n - 5 {
            return reader;
        }
        reader.offset_array = last_word as usize;
        reader.num = (n - 5 - last_word as usize) / 4;
        reader.data = contents;
        reader
    }

    /// True if `key` may have been stored in the data block starting at
    /// `block_offset`. Decoding problems count as matches.
    pub fn key_may_match(&self, block_offset: u64, key: &[u8]) -> bool {
        let index = (block_offset >> self.base_lg) as usize;
        if index < self.num {
            let slot = self.offset_array + index * 4;
            let start = read_fixed32(&self.data[slot..]).unwrap() as usize;
            let limit = read_fixed32(&self.data[slot + 4..]).unwrap() as usize;
            if start <= limit && limit <= self.offset_array {
                let filter = &self.data[start..limit];
                return self.policy.key_may_match(key, filter);
            } else if start == limit {
                // Empty filters match nothing.
                return false;
            }
        }
        true
    }
}
