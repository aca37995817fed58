//! Sorted tables: immutable on-disk files of key-sorted blocks.
//!
//! # File format
//!
//! ```text
//! +--------------------+
//! | data block 1       |
//! +--------------------+
//! | ...                |
//! +--------------------+
//! | data block N       |
//! +--------------------+
//! | filter block       |   (optional)
//! +--------------------+
//! | metaindex block    |   ("filter.<policy>" -> filter handle)
//! +--------------------+
//! | index block        |   (separator key -> data block handle)
//! +--------------------+
//! | footer             |   (fixed 48 bytes, ends in magic)
//! +--------------------+
//! ```
//!
//! Every block is followed by a 5-byte trailer: a compression type byte and
//! a masked CRC32C over the stored block contents plus that byte.

pub mod block;
pub mod block_builder;
pub mod filter;
pub mod filter_block;
pub mod reader;
pub mod writer;

pub use block::{Block, BlockIter};
pub use block_builder::BlockBuilder;
pub use filter::{BloomFilterPolicy, FilterPolicy};
pub use filter_block::{FilterBlockBuilder, FilterBlockReader};
pub use reader::{SSTableIterator, SSTableReader};
pub use writer::SSTableWriter;

use bytes::Bytes;

use crate::env::RandomAccessFile;
use crate::options::ReadOptions;
use crate::util::coding::{decode_varint64, put_fixed64, put_varint64, read_fixed64};
use crate::util::crc::{crc32c_multi, unmask};
use crate::{Error, Result};

/// Magic number in the last 8 bytes of every sorted table.
pub const TABLE_MAGIC_NUMBER: u64 = 0xdb4775248b80fb57;

/// Encoded footer length: two maximum-length handles plus the magic.
pub const FOOTER_SIZE: usize = 2 * BlockHandle::MAX_ENCODED_LENGTH + 8;

/// Block trailer: compression type byte plus masked CRC32C.
pub const BLOCK_TRAILER_SIZE: usize = 5;

/// Compression applied to a stored block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum CompressionType {
    /// Stored raw.
    #[default]
    None = 0,
    /// Snappy-compressed.
    Snappy = 1,
}

impl CompressionType {
    /// Create from byte.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(CompressionType::None),
            1 => Some(CompressionType::Snappy),
            _ => None,
        }
    }

    /// Convert to byte.
    pub fn to_byte(self) -> u8 {
        self as u8
    }
}

/// A `(offset, size)` pair locating a block inside a file.
///
/// The size excludes the block trailer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockHandle {
    offset: u64,
    size: u64,
}

impl BlockHandle {
    /// Maximum encoded length of a handle: two varint64 values.
    pub const MAX_ENCODED_LENGTH: usize = 10 + 10;

    /// Create a new block handle.
    pub fn new(offset: u64, size: u64) -> Self {
        Self { offset, size }
    }

    /// File offset of the block.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Stored size of the block, excluding trailer.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Append the varint encoding to `dst`.
    pub fn encode_to(&self, dst: &mut Vec<u8>) {
        put_varint64(dst, self.offset);
        put_varint64(dst, self.size);
    }

    /// Encode into a fresh buffer.
    pub fn encode(&self) -> Vec<u8> {
        let mut dst = Vec::with_capacity(Self::MAX_ENCODED_LENGTH);
        self.encode_to(&mut dst);
        dst
    }

    /// Decode from the front of `input`, consuming the handle's bytes.
    pub fn decode_from(input: &mut &[u8]) -> Result<Self> {
        let offset = decode_varint64(input).ok_or_else(|| Error::corruption("bad block handle"))?;
        let size = decode_varint64(input).ok_or_else(|| Error::corruption("bad block handle"))?;
        Ok(Self { offset, size })
    }
}

/// Fixed-size footer at the tail of every table file.
#[derive(Debug, Clone)]
pub struct Footer {
    /// Handle of the metaindex block.
    pub metaindex_handle: BlockHandle,
    /// Handle of the index block.
    pub index_handle: BlockHandle,
}

impl Footer {
    /// Encode to exactly [`FOOTER_SIZE`] bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut dst = Vec::with_capacity(FOOTER_SIZE);
        self.metaindex_handle.encode_to(&mut dst);
        self.index_handle.encode_to(&mut dst);
        dst.resize(2 * BlockHandle::MAX_ENCODED_LENGTH, 0); // zero padding
        put_fixed64(&mut dst, TABLE_MAGIC_NUMBER);
        debug_assert_eq!(dst.len(), FOOTER_SIZE);
        dst
    }

    /// Decode from a buffer holding at least the 48 footer bytes.
    pub fn decode_from(input: &[u8]) -> Result<Self> {
        if input.len() < FOOTER_SIZE {
            return Err(Error::corruption("footer too short"));
        }

        let magic = read_fixed64(&input[FOOTER_SIZE - 8..]).unwrap();
        if magic != TABLE_MAGIC_NUMBER {
            return Err(Error::corruption("not an sstable (bad magic number)"));
        }

        let mut cursor = input;
        let metaindex_handle = BlockHandle::decode_from(&mut cursor)?;
        let index_handle = BlockHandle::decode_from(&mut cursor)?;
        Ok(Self {
            metaindex_handle,
            index_handle,
        })
    }
}

/// Read a block from `file`, verify its trailer, and decompress it.
///
/// Returns the uncompressed block contents, without the trailer.
pub fn read_block_contents(
    file: &dyn RandomAccessFile,
    options: &ReadOptions,
    handle: &BlockHandle,
) -> Result<Bytes> {
    let n = handle.size() as usize;
    let mut buf = vec![0u8; n + BLOCK_TRAILER_SIZE];
    let read = file.read_at(handle.offset(), &mut buf)?;
    if read < buf.len() {
        return Err(Error::corruption("truncated block read"));
    }

    let compression = buf[n];
    if options.verify_checksums {
        let stored = u32::from_le_bytes(buf[n + 1..n + 5].try_into().unwrap());
        let actual = crc32c_multi(&[&buf[..n], &[compression]]);
        if actual != unmask(stored) {
            return Err(Error::corruption("block checksum mismatch"));
        }
    }

    match CompressionType::from_byte(compression) {
        Some(CompressionType::None) => {
            buf.truncate(n);
            Ok(Bytes::from(buf))
        }
        Some(CompressionType::Snappy) => {
            let decompressed = snap::raw::Decoder::new()
                .decompress_vec(&buf[..n])
                .map_err(|e| Error::corruption(format!("corrupted compressed block: {}", e)))?;
            Ok(Bytes::from(decompressed))
        }
        None => Err(Error::corruption("unknown block compression type")),
    }
}
