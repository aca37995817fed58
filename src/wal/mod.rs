//! Write-ahead log framing.
//!
//! The log is a sequence of 32 KiB blocks. Each block holds physical
//! records with a 7-byte header:
//!
//! ```text
//! masked crc32c(4, LE) || length(2, LE) || type(1) || payload
//! ```
//!
//! A logical record that fits in the remainder of a block is written as a
//! single `Full` record; otherwise it is fragmented into `First`, zero or
//! more `Middle`, and `Last` records, never interleaving with fragments of
//! other logical records. A block tail shorter than a header is zero
//! padded. The checksum covers the type byte and the payload and is stored
//! masked.

mod reader;
mod writer;

pub use reader::{Reporter, WalReader};
pub use writer::WalWriter;

/// Log block size (32 KiB).
pub const BLOCK_SIZE: usize = 32 * 1024;

/// Record header size: checksum (4) + length (2) + type (1).
pub const HEADER_SIZE: usize = 7;

/// Record types for WAL entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordType {
    /// Reserved for preallocated files; skipped on read.
    Zero = 0,
    /// Complete logical record in one fragment.
    Full = 1,
    /// First fragment of a logical record.
    First = 2,
    /// Interior fragment.
    Middle = 3,
    /// Final fragment.
    Last = 4,
}

/// Largest assigned record type value.
pub const MAX_RECORD_TYPE: u8 = RecordType::Last as u8;

impl RecordType {
    /// Create from byte value.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(RecordType::Zero),
            1 => Some(RecordType::Full),
            2 => Some(RecordType::First),
            3 => Some(RecordType::Middle),
            4 => Some(RecordType::Last),
            _ => None,
        }
    }

    /// Convert to byte.
    pub fn to_byte(self) -> u8 {
        self as u8
    }
}
