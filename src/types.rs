//! Core key formats: internal keys, lookup keys, and write batches.
//!
//! Every key stored in the memtable or a sorted table is an *internal key*:
//! the user key followed by an 8-byte tail packing a 56-bit sequence number
//! with an 8-bit value type. For equal user keys, larger sequence numbers
//! sort first, so iterators always surface the newest version of a key.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::cmp::Ordering;

use crate::memtable::MemTable;
use crate::util::coding::{get_length_prefixed, put_length_prefixed, put_varint32, varint_length};
use crate::{Error, Result};

/// Sequence number assigned to every write. Only the low 56 bits are used.
pub type SequenceNumber = u64;

/// Maximum representable sequence number (56 bits).
pub const MAX_SEQUENCE_NUMBER: SequenceNumber = (1 << 56) - 1;

/// Value type indicator in internal keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ValueType {
    /// Deletion marker (tombstone).
    Deletion = 0,
    /// Normal value.
    Value = 1,
}

/// Value type used when positioning a seek.
///
/// This is the highest-numbered tag, so for a given user key and sequence
/// the seek key sorts before (at or before) all entries with that sequence.
pub const VALUE_TYPE_FOR_SEEK: ValueType = ValueType::Value;

impl ValueType {
    /// Create from byte.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(ValueType::Deletion),
            1 => Some(ValueType::Value),
            _ => None,
        }
    }

    /// Convert to byte.
    pub fn to_byte(self) -> u8 {
        self as u8
    }

    /// Check if this is a deletion marker.
    pub fn is_deletion(&self) -> bool {
        matches!(self, ValueType::Deletion)
    }
}

/// Pack a sequence number and value type into the 8-byte internal key tail.
pub fn pack_sequence_and_type(sequence: SequenceNumber, value_type: ValueType) -> u64 {
    debug_assert!(sequence <= MAX_SEQUENCE_NUMBER);
    (sequence << 8) | value_type.to_byte() as u64
}

/// Append an internal key (`user_key || packed tail`) to `dst`.
pub fn append_internal_key(
    dst: &mut Vec<u8>,
    user_key: &[u8],
    sequence: SequenceNumber,
    value_type: ValueType,
) {
    dst.extend_from_slice(user_key);
    dst.extend_from_slice(&pack_sequence_and_type(sequence, value_type).to_le_bytes());
}

/// Extract the user key portion of an encoded internal key.
pub fn extract_user_key(internal_key: &[u8]) -> &[u8] {
    debug_assert!(internal_key.len() >= 8);
    &internal_key[..internal_key.len() - 8]
}

/// Extract the packed `(sequence << 8) | type` tail of an internal key.
pub fn extract_tag(internal_key: &[u8]) -> u64 {
    debug_assert!(internal_key.len() >= 8);
    let tail = &internal_key[internal_key.len() - 8..];
    u64::from_le_bytes(tail.try_into().unwrap())
}

/// An owned, parsed internal key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InternalKey {
    user_key: Bytes,
    sequence: SequenceNumber,
    value_type: ValueType,
}

impl InternalKey {
    /// Create a new internal key.
    pub fn new(
        user_key: impl Into<Bytes>,
        sequence: SequenceNumber,
        value_type: ValueType,
    ) -> Self {
        debug_assert!(sequence <= MAX_SEQUENCE_NUMBER);
        Self {
            user_key: user_key.into(),
            sequence,
            value_type,
        }
    }

    /// Create an internal key for a put operation.
    pub fn for_value(user_key: impl Into<Bytes>, sequence: SequenceNumber) -> Self {
        Self::new(user_key, sequence, ValueType::Value)
    }

    /// Create an internal key for a delete operation.
    pub fn for_deletion(user_key: impl Into<Bytes>, sequence: SequenceNumber) -> Self {
        Self::new(user_key, sequence, ValueType::Deletion)
    }

    /// Get the user key.
    pub fn user_key(&self) -> &[u8] {
        &self.user_key
    }

    /// Get the sequence number.
    pub fn sequence(&self) -> SequenceNumber {
        self.sequence
    }

    /// Get the value type.
    pub fn value_type(&self) -> ValueType {
        self.value_type
    }

    /// Check if this is a deletion marker.
    pub fn is_deletion(&self) -> bool {
        self.value_type.is_deletion()
    }

    /// Encode to `user_key || fixed64_le((sequence << 8) | type)`.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.user_key.len() + 8);
        buf.put_slice(&self.user_key);
        buf.put_u64_le(pack_sequence_and_type(self.sequence, self.value_type));
        buf.freeze()
    }

    /// Decode an internal key from bytes.
    pub fn decode(data: &[u8]) -> Option<Self> {
        if data.len() < 8 {
            return None;
        }

        let user_key_len = data.len() - 8;
        let user_key = Bytes::copy_from_slice(&data[..user_key_len]);

        let mut tail = &data[user_key_len..];
        let packed = tail.get_u64_le();

        let value_type = ValueType::from_byte((packed & 0xFF) as u8)?;
        let sequence = packed >> 8;

        Some(Self {
            user_key,
            sequence,
            value_type,
        })
    }
}

impl Ord for InternalKey {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.user_key.cmp(&other.user_key) {
            Ordering::Equal => {
                // Same user key: larger packed tail (newer sequence) first.
                let a = pack_sequence_and_type(self.sequence, self.value_type);
                let b = pack_sequence_and_type(other.sequence, other.value_type);
                b.cmp(&a)
            }
            ord => ord,
        }
    }
}

impl PartialOrd for InternalKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Result of a point lookup in the memtable or a table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupResult {
    /// Value found.
    Found(Bytes),
    /// Key was deleted (tombstone found).
    Deleted,
    /// Key not found.
    NotFound,
}

impl LookupResult {
    /// Check if a value was found.
    pub fn is_found(&self) -> bool {
        matches!(self, LookupResult::Found(_))
    }

    /// Get the value if found.
    pub fn value(&self) -> Option<&Bytes> {
        match self {
            LookupResult::Found(v) => Some(v),
            _ => None,
        }
    }

    /// Convert to `Option<Bytes>`.
    pub fn into_option(self) -> Option<Bytes> {
        match self {
            LookupResult::Found(v) => Some(v),
            _ => None,
        }
    }
}

/// Key layout built once per point query.
///
/// ```text
/// varint32(user_key.len + 8) || user_key || fixed64_le((seq << 8) | seek_type)
/// ```
///
/// Exposes three views over one buffer: the memtable key (everything), the
/// internal key (skip the varint), and the user key (also drop the tail).
pub struct LookupKey {
    data: Vec<u8>,
    kstart: usize,
}

impl LookupKey {
    /// Build a lookup key for `user_key` at snapshot `sequence`.
    pub fn new(user_key: &[u8], sequence: SequenceNumber) -> Self {
        let internal_len = user_key.len() + 8;
        let kstart = varint_length(internal_len as u64);

        let mut data = Vec::with_capacity(kstart + internal_len);
        put_varint32(&mut data, internal_len as u32);
        data.extend_from_slice(user_key);
        data.extend_from_slice(&pack_sequence_and_type(sequence, VALUE_TYPE_FOR_SEEK).to_le_bytes());

        Self { data, kstart }
    }

    /// Key for seeking the memtable (length-prefixed internal key).
    pub fn memtable_key(&self) -> &[u8] {
        &self.data
    }

    /// The internal key.
    pub fn internal_key(&self) -> &[u8] {
        &self.data[self.kstart..]
    }

    /// The user key.
    pub fn user_key(&self) -> &[u8] {
        &self.data[self.kstart..self.data.len() - 8]
    }
}

// WriteBatch header: 8-byte sequence followed by 4-byte count.
const BATCH_HEADER_SIZE: usize = 12;

/// A batch of updates applied atomically.
///
/// The representation is the WAL payload format:
///
/// ```text
/// sequence fixed64_le || count fixed32_le ||
///   [tag(1 = value, 0 = deletion) || key_lp || value_lp?]*
/// ```
#[derive(Debug, Clone)]
pub struct WriteBatch {
    rep: Vec<u8>,
}

impl Default for WriteBatch {
    fn default() -> Self {
        Self::new()
    }
}

impl WriteBatch {
    /// Create a new empty write batch.
    pub fn new() -> Self {
        Self {
            rep: vec![0; BATCH_HEADER_SIZE],
        }
    }

    /// Clear all updates, keeping the buffer.
    pub fn clear(&mut self) {
        self.rep.clear();
        self.rep.resize(BATCH_HEADER_SIZE, 0);
    }

    /// Store a key/value mapping.
    pub fn put(&mut self, key: &[u8], value: &[u8]) {
        self.set_count(self.count() + 1);
        self.rep.push(ValueType::Value.to_byte());
        put_length_prefixed(&mut self.rep, key);
        put_length_prefixed(&mut self.rep, value);
    }

    /// Record a deletion of a key.
    pub fn delete(&mut self, key: &[u8]) {
        self.set_count(self.count() + 1);
        self.rep.push(ValueType::Deletion.to_byte());
        put_length_prefixed(&mut self.rep, key);
    }

    /// Number of entries in the batch.
    pub fn count(&self) -> u32 {
        u32::from_le_bytes(self.rep[8..12].try_into().unwrap())
    }

    fn set_count(&mut self, n: u32) {
        self.rep[8..12].copy_from_slice(&n.to_le_bytes());
    }

    /// Check if the batch has no entries.
    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Sequence number assigned to the first entry.
    pub fn sequence(&self) -> SequenceNumber {
        u64::from_le_bytes(self.rep[0..8].try_into().unwrap())
    }

    /// Assign the sequence number for the first entry.
    pub fn set_sequence(&mut self, seq: SequenceNumber) {
        self.rep[0..8].copy_from_slice(&seq.to_le_bytes());
    }

    /// Size of the serialized batch in bytes.
    pub fn approximate_size(&self) -> usize {
        self.rep.len()
    }

    /// The serialized batch, suitable as a single WAL record payload.
    pub fn contents(&self) -> &[u8] {
        &self.rep
    }

    /// Rebuild a batch from a WAL record payload.
    pub fn from_contents(data: &[u8]) -> Result<Self> {
        if data.len() < BATCH_HEADER_SIZE {
            return Err(Error::corruption("malformed WriteBatch (too small)"));
        }
        Ok(Self { rep: data.to_vec() })
    }

    /// Visit every entry in order.
    pub fn iterate<H: BatchHandler>(&self, handler: &mut H) -> Result<()> {
        let mut input = &self.rep[BATCH_HEADER_SIZE..];
        let mut found = 0u32;

        while !input.is_empty() {
            found += 1;
            let tag = input[0];
            input = &input[1..];

            match ValueType::from_byte(tag) {
                Some(ValueType::Value) => {
                    let key = get_length_prefixed(&mut input)
                        .ok_or_else(|| Error::corruption("bad WriteBatch Put"))?;
                    let value = get_length_prefixed(&mut input)
                        .ok_or_else(|| Error::corruption("bad WriteBatch Put"))?;
                    handler.put(key, value);
                }
                Some(ValueType::Deletion) => {
                    let key = get_length_prefixed(&mut input)
                        .ok_or_else(|| Error::corruption("bad WriteBatch Delete"))?;
                    handler.delete(key);
                }
                None => return Err(Error::corruption("unknown WriteBatch tag")),
            }
        }

        if found != self.count() {
            return Err(Error::corruption("WriteBatch has wrong count"));
        }
        Ok(())
    }

    /// Replay the batch into a memtable with sequence numbers
    /// `sequence(), sequence() + 1, ...`.
    pub fn insert_into(&self, mem: &MemTable) -> Result<()> {
        let mut inserter = MemTableInserter {
            sequence: self.sequence(),
            mem,
        };
        self.iterate(&mut inserter)
    }
}

/// Visitor for [`WriteBatch::iterate`].
pub trait BatchHandler {
    /// Called for each stored key/value pair.
    fn put(&mut self, key: &[u8], value: &[u8]);
    /// Called for each deletion.
    fn delete(&mut self, key: &[u8]);
}

struct MemTableInserter<'a> {
    sequence: SequenceNumber,
    mem: &'a MemTable,
}

impl BatchHandler for MemTableInserter<'_> {
    fn put(&mut self, key: &[u8], value: &[u8]) {
        self.mem.add(self.sequence, ValueType::Value, key, value);
        self.sequence += 1;
    }

    fn delete(&mut self, key: &[u8]) {
        self.mem.add(self.sequence, ValueType::Deletion, key, &[]);
        self.sequence += 1;
    }
}
