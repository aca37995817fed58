//! Block parsing and iteration.

use std::cmp::Ordering;
use std::sync::Arc;

use bytes::Bytes;

use crate::iterator::{Cleanup, CleanupList, Iter};
use crate::util::coding::decode_varint32;
use crate::util::comparator::Comparator;
use crate::{Error, Result};

/// An immutable, parsed block: prefix-compressed entries followed by the
/// restart array and its length.
///
/// The contents are refcounted, so clones are cheap and iterators own the
/// block they walk.
#[derive(Debug, Clone)]
pub struct Block {
    data: Bytes,
    /// Offset where entries end and the restart array begins.
    restart_offset: usize,
    num_restarts: u32,
}

impl Block {
    /// Parse block contents (without trailer).
    pub fn new(data: Bytes) -> Result<Self> {
        if data.len() < 4 {
            return Err(Error::corruption("bad block contents"));
        }

        let num_restarts =
            u32::from_le_bytes(data[data.len() - 4..].try_into().unwrap());
        let max_restarts_allowed = (data.len() - 4) / 4;
        if num_restarts as usize > max_restarts_allowed {
            return Err(Error::corruption("bad block contents"));
        }

        let restart_offset = data.len() - 4 - num_restarts as usize * 4;
        Ok(Self {
            data,
            restart_offset,
            num_restarts,
        })
    }

    /// Stored size of the block contents in bytes.
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Number of restart points.
    pub fn num_restarts(&self) -> u32 {
        self.num_restarts
    }

    fn restart_point(&self, index: u32) -> u32 {
        debug_assert!(index < self.num_restarts);
        let offset = self.restart_offset + index as usize * 4;
        u32::from_le_bytes(self.data[offset..offset + 4].try_into().unwrap())
    }

    /// Iterate the block under `comparator`. Starts out invalid.
    pub fn iter(&self, comparator: Arc<dyn Comparator>) -> BlockIter {
        BlockIter {
            block: self.clone(),
            comparator,
            current: self.restart_offset,
            restart_index: self.num_restarts,
            key: Vec::new(),
            value_start: self.restart_offset,
            value_len: 0,
            status: Ok(()),
            cleanup: CleanupList::new(),
        }
    }
}

/// Decoded entry header: shared, non-shared, value length, header length.
fn decode_entry(data: &[u8]) -> Option<(usize, usize, usize, usize)> {
    let mut cursor = data;
    let shared = decode_varint32(&mut cursor)? as usize;
    let non_shared = decode_varint32(&mut cursor)? as usize;
    let value_len = decode_varint32(&mut cursor)? as usize;
    let header_len = data.len() - cursor.len();
    if cursor.len() < non_shared + value_len {
        return None;
    }
    Some((shared, non_shared, value_len, header_len))
}

/// Iterator over a single block.
pub struct BlockIter {
    block: Block,
    comparator: Arc<dyn Comparator>,
    /// Offset of the current entry; `restart_offset` means invalid.
    current: usize,
    /// Restart block the current entry falls in.
    restart_index: u32,
    /// Current key, reassembled from shared prefixes.
    key: Vec<u8>,
    value_start: usize,
    value_len: usize,
    status: Result<()>,
    cleanup: CleanupList,
}

impl BlockIter {
    fn next_entry_offset(&self) -> usize {
        self.value_start + self.value_len
    }

    fn seek_to_restart_point(&mut self, index: u32) {
        self.key.clear();
        self.restart_index = index;
        // parse_next_key starts at next_entry_offset; point it at the
        // restart position by pretending an empty value ends there.
        self.value_start = self.block.restart_point(index) as usize;
        self.value_len = 0;
    }

    fn mark_invalid(&mut self) {
        self.current = self.block.restart_offset;
        self.restart_index = self.block.num_restarts;
        self.key.clear();
        self.value_start = self.block.restart_offset;
        self.value_len = 0;
    }

    fn corruption_error(&mut self) {
        if self.status.is_ok() {
            self.status = Err(Error::corruption("bad entry in block"));
        }
        self.mark_invalid();
    }

    fn parse_next_key(&mut self) -> bool {
        self.current = self.next_entry_offset();
        if self.current >= self.block.restart_offset {
            // No more entries.
            self.mark_invalid();
            return false;
        }

        let entry = &self.block.data[self.current..self.block.restart_offset];
        let Some((shared, non_shared, value_len, header_len)) = decode_entry(entry) else {
            self.corruption_error();
            return false;
        };
        if shared > self.key.len() {
            self.corruption_error();
            return false;
        }

        let delta_start = self.current + header_len;
        self.key.truncate(shared);
        self.key
            .extend_from_slice(&self.block.data[delta_start..delta_start + non_shared]);
        self.value_start = delta_start + non_shared;
        self.value_len = value_len;

        while self.restart_index + 1 < self.block.num_restarts
            && (self.block.restart_point(self.restart_index + 1) as usize) < self.current
        {
            self.restart_index += 1;
        }
        true
    }
}

impl Iter for BlockIter {
    fn valid(&self) -> bool {
        self.current < self.block.restart_offset
    }

    fn seek_to_first(&mut self) {
        if self.block.num_restarts == 0 {
            self.mark_invalid();
            return;
        }
        self.seek_to_restart_point(0);
        self.parse_next_key();
    }

    fn seek_to_last(&mut self) {
        if self.block.num_restarts == 0 {
            self.mark_invalid();
            return;
        }
        self.seek_to_restart_point(self.block.num_restarts - 1);
        while self.parse_next_key() && self.next_entry_offset() < self.block.restart_offset {
            // Keep skipping until we hit the tail of the block.
        }
    }

    fn seek(&mut self, target: &[u8]) {
        if self.block.num_restarts == 0 {
            self.mark_invalid();
            return;
        }

        // Binary search over restart points for the last one whose key is
        // strictly less than target.
        let mut left = 0u32;
        let mut right = self.block.num_restarts - 1;
        while left < right {
            let mid = (left + right + 1) / 2;
            let region_offset = self.block.restart_point(mid) as usize;
            let entry = &self.block.data[region_offset..self.block.restart_offset];
            let decoded = decode_entry(entry);
            let Some((shared, non_shared, _, header_len)) = decoded else {
                self.corruption_error();
                return;
            };
            if shared != 0 {
                // Keys at restart points are stored whole.
                self.corruption_error();
                return;
            }
            let key_start = region_offset + header_len;
            let mid_key = &self.block.data[key_start..key_start + non_shared];
            if self.comparator.compare(mid_key, target) == Ordering::Less {
                left = mid;
            } else {
                right = mid - 1;
            }
        }

        // Linear scan from the restart point to the first key >= target.
        self.seek_to_restart_point(left);
        loop {
            if !self.parse_next_key() {
                return;
            }
            if self.comparator.compare(&self.key, target) != Ordering::Less {
                return;
            }
        }
    }

    fn next(&mut self) {
        assert!(self.valid());
        self.parse_next_key();
    }

    fn prev(&mut self) {
        assert!(self.valid());
        let original = self.current;

        // Back up to a restart point before the current entry.
        while self.block.restart_point(self.restart_index) as usize >= original {
            if self.restart_index == 0 {
                // No entries before the current one.
                self.mark_invalid();
                return;
            }
            self.restart_index -= 1;
        }

        // Scan forward until the entry just before the original position.
        self.seek_to_restart_point(self.restart_index);
        while self.parse_next_key() && self.next_entry_offset() < original {}
    }

    fn key(&self) -> &[u8] {
        assert!(self.valid());
        &self.key
    }

    fn value(&self) -> &[u8] {
        assert!(self.valid());
        &self.block.data[self.value_start..self.value_start + self.value_len]
    }

    fn status(&self) -> Result<()> {
        self.status.clone()
    }

    fn register_cleanup(&mut self, cleanup: Cleanup) {
        self.cleanup.push(cleanup);
    }
}
