//! WAL writer.

use crate::env::WritableFile;
use crate::util::crc::{crc32c_multi, mask};
use crate::Result;

use super::{RecordType, BLOCK_SIZE, HEADER_SIZE};

const ZEROES: [u8; HEADER_SIZE - 1] = [0; HEADER_SIZE - 1];

/// Appends logical records to a log file, fragmenting across 32 KiB blocks.
///
/// Durability is the caller's responsibility: `add_record` only appends;
/// call [`WalWriter::sync`] to force the data down.
pub struct WalWriter {
    dest: Box<dyn WritableFile>,
    /// Current offset within the current block.
    block_offset: usize,
}

impl WalWriter {
    /// Create a writer that appends to an empty `dest`.
    pub fn new(dest: Box<dyn WritableFile>) -> Self {
        Self {
            dest,
            block_offset: 0,
        }
    }

    /// Create a writer that resumes appending to a `dest` that already has
    /// `dest_length` bytes in it.
    pub fn with_dest_length(dest: Box<dyn WritableFile>, dest_length: u64) -> Self {
        Self {
            dest,
            block_offset: (dest_length % BLOCK_SIZE as u64) as usize,
        }
    }

    /// Append one logical record.
    pub fn add_record(&mut self, payload: &[u8]) -> Result<()> {
        let mut left = payload.len();
        let mut offset = 0;
        let mut begin = true;

        // Emit at least one fragment, so empty payloads produce an empty
        // Full record.
        loop {
            let leftover = BLOCK_SIZE - self.block_offset;
            if leftover < HEADER_SIZE {
                // No room for a header; pad the block tail with zeros.
                if leftover > 0 {
                    self.dest.append(&ZEROES[..leftover])?;
                }
                self.block_offset = 0;
            }

            let avail = BLOCK_SIZE - self.block_offset - HEADER_SIZE;
            let fragment_length = std::cmp::min(left, avail);
            let end = left == fragment_length;

            let record_type = match (begin, end) {
                (true, true) => RecordType::Full,
                (true, false) => RecordType::First,
                (false, true) => RecordType::Last,
                (false, false) => RecordType::Middle,
            };

            self.emit_physical_record(record_type, &payload[offset..offset + fragment_length])?;

            offset += fragment_length;
            left -= fragment_length;
            begin = false;

            if left == 0 {
                break;
            }
        }
        Ok(())
    }

    /// Push buffered bytes to the OS without forcing them to disk.
    pub fn flush(&mut self) -> Result<()> {
        self.dest.flush()
    }

    /// Force everything written so far to stable storage.
    pub fn sync(&mut self) -> Result<()> {
        self.dest.sync()
    }

    fn emit_physical_record(&mut self, record_type: RecordType, data: &[u8]) -> Result<()> {
        debug_assert!(data.len() <= 0xFFFF);
        debug_assert!(self.block_offset + HEADER_SIZE + data.len() <= BLOCK_SIZE);

        let type_byte = record_type.to_byte();
        let crc = mask(crc32c_multi(&[&[type_byte], data]));

        let mut header = [0u8; HEADER_SIZE];
        header[0..4].copy_from_slice(&crc.to_le_bytes());
        header[4..6].copy_from_slice(&(data.len() as u16).to_le_bytes());
        header[6] = type_byte;

        self.dest.append(&header)?;
        self.dest.append(data)?;
        self.block_offset += HEADER_SIZE + data.len();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::{Env, StdEnv};
    use tempfile::tempdir;

    #[test]
    fn test_single_record_layout() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("000001.log");
        let env = StdEnv;

        let mut writer = WalWriter::new(env.new_writable_file(&path).unwrap());
        writer.add_record(b"hello world").unwrap();
        writer.sync().unwrap();

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(bytes.len(), HEADER_SIZE + 11);
        // length
        assert_eq!(u16::from_le_bytes([bytes[4], bytes[5]]), 11);
        // type
        assert_eq!(bytes[6], RecordType::Full.to_byte());
        // payload
        assert_eq!(&bytes[7..], b"hello world");
        // masked checksum over type || payload
        let crc = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
        assert_eq!(
            crc,
            mask(crc32c_multi(&[&[RecordType::Full.to_byte()], b"hello world"]))
        );
    }

    #[test]
    fn test_block_tail_is_zero_padded() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("000001.log");
        let env = StdEnv;

        let mut writer = WalWriter::new(env.new_writable_file(&path).unwrap());
        // Leave exactly 3 bytes in the first block, too small for a header.
        let first = vec![b'a'; BLOCK_SIZE - HEADER_SIZE - 3];
        writer.add_record(&first).unwrap();
        writer.add_record(b"next").unwrap();
        writer.sync().unwrap();

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(bytes.len(), BLOCK_SIZE + HEADER_SIZE + 4);
        // The three bytes before the block boundary are padding zeros.
        assert_eq!(&bytes[BLOCK_SIZE - 3..BLOCK_SIZE], &[0, 0, 0]);
        // The second record starts on the block boundary.
        assert_eq!(bytes[BLOCK_SIZE + 6], RecordType::Full.to_byte());
        assert_eq!(&bytes[BLOCK_SIZE + HEADER_SIZE..], b"next");
    }

    #[test]
    fn test_empty_record_is_full_type() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("000001.log");
        let env = StdEnv;

        let mut writer = WalWriter::new(env.new_writable_file(&path).unwrap());
        writer.add_record(b"").unwrap();
        writer.sync().unwrap();

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(bytes.len(), HEADER_SIZE);
        assert_eq!(bytes[6], RecordType::Full.to_byte());
    }
}
