//! MemTable: in-memory sorted buffer for recent writes.
//!
//! Entries live in an arena-backed skip list keyed by the full encoded
//! memtable entry:
//!
//! ```text
//! varint32(internal_key.len) || internal_key || varint32(value.len) || value
//! ```
//!
//! The skip-list comparator extracts the internal key from the varint
//! prefix and orders by the internal-key comparator, so versions of one
//! user key sit together, newest first.
//!
//! Thread safety matches the skip list: one writer at a time (serialized by
//! the enclosing database), any number of concurrent readers.

pub mod arena;
pub mod skiplist;

use std::cmp::Ordering;
use std::sync::Arc;

use bytes::Bytes;

use crate::iterator::{Cleanup, CleanupList, Iter};
use crate::types::{
    pack_sequence_and_type, LookupKey, LookupResult, SequenceNumber, ValueType,
};
use crate::util::coding::{decode_varint32, put_varint32, varint_length};
use crate::util::comparator::{Comparator, InternalKeyComparator};
use crate::Result;

use skiplist::{KeyComparator, SkipList, SkipListIter};

/// Orders encoded memtable entries by their internal-key portion.
#[derive(Clone)]
pub struct EntryComparator {
    comparator: InternalKeyComparator,
}

fn entry_internal_key(entry: &[u8]) -> &[u8] {
    let mut cursor = entry;
    let len = decode_varint32(&mut cursor).expect("malformed memtable entry") as usize;
    &cursor[..len]
}

impl KeyComparator for EntryComparator {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        self.comparator
            .compare(entry_internal_key(a), entry_internal_key(b))
    }
}

/// In-memory sorted table of recent writes.
pub struct MemTable {
    comparator: InternalKeyComparator,
    table: SkipList<EntryComparator>,
}

impl MemTable {
    /// Create an empty memtable ordered by `comparator`.
    pub fn new(comparator: InternalKeyComparator) -> Self {
        let entry_cmp = EntryComparator {
            comparator: comparator.clone(),
        };
        Self {
            comparator,
            table: SkipList::new(entry_cmp),
        }
    }

    /// Approximate bytes in use by this memtable. Advisory.
    pub fn approximate_memory_usage(&self) -> usize {
        self.table.arena().memory_usage()
    }

    /// Insert an entry tagged with `sequence` and `value_type`.
    ///
    /// Deletions store an empty value. Requires external write
    /// synchronization, like [`SkipList::insert`].
    pub fn add(
        &self,
        sequence: SequenceNumber,
        value_type: ValueType,
        user_key: &[u8],
        value: &[u8],
    ) {
        let internal_key_len = user_key.len() + 8;
        let encoded_len = varint_length(internal_key_len as u64)
            + internal_key_len
            + varint_length(value.len() as u64)
            + value.len();

        let mut buf = Vec::with_capacity(encoded_len);
        put_varint32(&mut buf, internal_key_len as u32);
        buf.extend_from_slice(user_key);
        buf.extend_from_slice(&pack_sequence_and_type(sequence, value_type).to_le_bytes());
        put_varint32(&mut buf, value.len() as u32);
        buf.extend_from_slice(value);
        debug_assert_eq!(buf.len(), encoded_len);

        self.table.insert(&buf);
    }

    /// Point lookup at the snapshot encoded in `key`.
    ///
    /// Positions at the first entry at or after the lookup key and inspects
    /// it: a matching user key yields `Found` or `Deleted` depending on the
    /// stored type; anything else is `NotFound`.
    pub fn get(&self, key: &LookupKey) -> LookupResult {
        let mut iter = self.table.iter();
        iter.seek(key.memtable_key());

        if iter.valid() {
            let entry = iter.key();
            let mut cursor = entry;
            let ikey_len = decode_varint32(&mut cursor).expect("malformed memtable entry") as usize;
            let (internal_key, rest) = cursor.split_at(ikey_len);

            let user_key = &internal_key[..ikey_len - 8];
            if self
                .comparator
                .user_comparator()
                .compare(user_key, key.user_key())
                == Ordering::Equal
            {
                let tag = u64::from_le_bytes(internal_key[ikey_len - 8..].try_into().unwrap());
                match ValueType::from_byte((tag & 0xff) as u8) {
                    Some(ValueType::Value) => {
                        let mut cursor = rest;
                        let vlen =
                            decode_varint32(&mut cursor).expect("malformed memtable entry") as usize;
                        return LookupResult::Found(Bytes::copy_from_slice(&cursor[..vlen]));
                    }
                    Some(ValueType::Deletion) => return LookupResult::Deleted,
                    None => {}
                }
            }
        }
        LookupResult::NotFound
    }

    /// Iterate over `mem`. Keys yielded are internal keys.
    pub fn iter(mem: &Arc<MemTable>) -> MemTableIterator {
        let iter = mem.table.iter();
        // Safety: the Arc held inside MemTableIterator keeps the skip list
        // (and its arena) alive for the iterator's whole life.
        let iter = unsafe {
            std::mem::transmute::<SkipListIter<'_, EntryComparator>, SkipListIter<'static, EntryComparator>>(
                iter,
            )
        };
        MemTableIterator {
            cleanup: CleanupList::new(),
            iter,
            tmp: Vec::new(),
            _mem: Arc::clone(mem),
        }
    }
}

/// Iterator over a memtable, yielding internal keys and raw values.
///
/// Fields drop in order: cleanups first, then the cursor, and the memtable
/// reference last, so callbacks and the cursor never outlive the arena.
pub struct MemTableIterator {
    cleanup: CleanupList,
    iter: SkipListIter<'static, EntryComparator>,
    /// Scratch for encoding seek targets as memtable keys.
    tmp: Vec<u8>,
    _mem: Arc<MemTable>,
}

impl MemTableIterator {
    fn entry(&self) -> &[u8] {
        self.iter.key()
    }
}

impl Iter for MemTableIterator {
    fn valid(&self) -> bool {
        self.iter.valid()
    }

    fn seek_to_first(&mut self) {
        self.iter.seek_to_first();
    }

    fn seek_to_last(&mut self) {
        self.iter.seek_to_last();
    }

    fn seek(&mut self, target: &[u8]) {
        // The skip list holds length-prefixed entries; wrap the internal
        // key the same way to seek.
        self.tmp.clear();
        put_varint32(&mut self.tmp, target.len() as u32);
        self.tmp.extend_from_slice(target);
        self.iter.seek(&self.tmp);
    }

    fn next(&mut self) {
        self.iter.next();
    }

    fn prev(&mut self) {
        self.iter.prev();
    }

    fn key(&self) -> &[u8] {
        entry_internal_key(self.entry())
    }

    fn value(&self) -> &[u8] {
        let entry = self.entry();
        let mut cursor = entry;
        let ikey_len = decode_varint32(&mut cursor).expect("malformed memtable entry") as usize;
        cursor = &cursor[ikey_len..];
        let vlen = decode_varint32(&mut cursor).expect("malformed memtable entry") as usize;
        &cursor[..vlen]
    }

    fn status(&self) -> Result<()> {
        Ok(())
    }

    fn register_cleanup(&mut self, cleanup: Cleanup) {
        self.cleanup.push(cleanup);
    }
}
