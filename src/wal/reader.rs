//! WAL reader.

use bytes::Bytes;

use crate::env::SequentialFile;
use crate::util::crc::{crc32c, unmask};
use crate::Error;

use super::{RecordType, BLOCK_SIZE, HEADER_SIZE};

/// Receives reports of data dropped during log scanning.
///
/// Corruption never aborts the scan; the damaged region is skipped and
/// reported here with the approximate number of bytes lost.
pub trait Reporter {
    /// Some bytes were dropped; `reason` describes why.
    fn corruption(&mut self, bytes: usize, reason: &Error);
}

enum Physical {
    /// A physical record at `start..start + len` inside the block buffer.
    Record {
        record_type: u8,
        start: usize,
        len: usize,
    },
    /// End of file (including torn tail writes).
    Eof,
    /// A damaged or skipped region; keep scanning.
    Bad,
}

/// Reads logical records back out of a log file.
pub struct WalReader {
    file: Box<dyn SequentialFile>,
    reporter: Option<Box<dyn Reporter>>,
    checksum: bool,
    backing: Vec<u8>,
    /// Unconsumed region of `backing`.
    buffer_start: usize,
    buffer_end: usize,
    eof: bool,
    /// Offset of the last logical record returned.
    last_record_offset: u64,
    /// File offset just past the end of the buffered block.
    end_of_buffer_offset: u64,
    /// Smallest file offset the caller cares about.
    initial_offset: u64,
    /// Dropping fragments of a record that began before `initial_offset`.
    resyncing: bool,
}

impl WalReader {
    /// Create a reader over `file`.
    ///
    /// With `checksum` set, record checksums are verified. Reading starts
    /// at the first logical record at or past `initial_offset`.
    pub fn new(
        file: Box<dyn SequentialFile>,
        reporter: Option<Box<dyn Reporter>>,
        checksum: bool,
        initial_offset: u64,
    ) -> Self {
        Self {
            file,
            reporter,
            checksum,
            backing: vec![0; BLOCK_SIZE],
            buffer_start: 0,
            buffer_end: 0,
            eof: false,
            last_record_offset: 0,
            end_of_buffer_offset: 0,
            initial_offset,
            resyncing: initial_offset > 0,
        }
    }

    /// File offset of the start of the last record returned.
    pub fn last_record_offset(&self) -> u64 {
        self.last_record_offset
    }

    /// Read the next logical record, assembling fragments through `scratch`.
    ///
    /// Returns `None` at end of file. Corruption is routed to the reporter
    /// and scanning continues at the next intact boundary.
    pub fn read_record(&mut self, scratch: &mut Vec<u8>) -> Option<Bytes> {
        if self.last_record_offset < self.initial_offset && !self.skip_to_initial_block() {
            return None;
        }

        scratch.clear();
        let mut in_fragmented_record = false;
        // Offset of the logical record being assembled.
        let mut prospective_record_offset = 0u64;

        loop {
            match self.read_physical_record() {
                Physical::Record {
                    record_type,
                    start,
                    len,
                } => {
                    let buffered = (self.buffer_end - self.buffer_start) as u64;
                    let physical_record_offset = self.end_of_buffer_offset
                        - buffered
                        - HEADER_SIZE as u64
                        - len as u64;

                    if self.resyncing {
                        // Drop trailing fragments of a record that started
                        // before the initial offset. A Full or First record
                        // ends resynchronization (and a Full is delivered).
                        if record_type == RecordType::Middle.to_byte() {
                            continue;
                        } else if record_type == RecordType::Last.to_byte() {
                            self.resyncing = false;
                            continue;
                        } else {
                            self.resyncing = false;
                        }
                    }

                    match RecordType::from_byte(record_type) {
                        Some(RecordType::Full) => {
                            if in_fragmented_record && !scratch.is_empty() {
                                self.report_corruption(
                                    scratch.len() as u64,
                                    "partial record without end(1)",
                                );
                            }
                            scratch.clear();
                            self.last_record_offset = physical_record_offset;
                            return Some(Bytes::copy_from_slice(
                                &self.backing[start..start + len],
                            ));
                        }
                        Some(RecordType::First) => {
                            if in_fragmented_record && !scratch.is_empty() {
                                self.report_corruption(
                                    scratch.len() as u64,
                                    "partial record without end(2)",
                                );
                            }
                            prospective_record_offset = physical_record_offset;
                            scratch.clear();
                            scratch.extend_from_slice(&self.backing[start..start + len]);
                            in_fragmented_record = true;
                        }
                        Some(RecordType::Middle) => {
                            if !in_fragmented_record {
                                self.report_corruption(
                                    len as u64,
                                    "missing start of fragmented record(1)",
                                );
                            } else {
                                scratch.extend_from_slice(&self.backing[start..start + len]);
                            }
                        }
                        Some(RecordType::Last) => {
                            if !in_fragmented_record {
                                self.report_corruption(
                                    len as u64,
                                    "missing start of fragmented record(2)",
                                );
                            } else {
                                scratch.extend_from_slice(&self.backing[start..start + len]);
                                self.last_record_offset = prospective_record_offset;
                                return Some(Bytes::copy_from_slice(scratch));
                            }
                        }
                        Some(RecordType::Zero) | None => {
                            let dropped =
                                len + if in_fragmented_record { scratch.len() } else { 0 };
                            self.report_corruption(
                                dropped as u64,
                                &format!("unknown record type {}", record_type),
                            );
                            in_fragmented_record = false;
                            scratch.clear();
                        }
                    }
                }
                Physical::Eof => {
                    if in_fragmented_record {
                        // The writer died after a fragment without completing
                        // the record; drop it silently rather than reporting
                        // corruption.
                        scratch.clear();
                    }
                    return None;
                }
                Physical::Bad => {
                    if in_fragmented_record {
                        self.report_corruption(scratch.len() as u64, "error in middle of record");
                        in_fragmented_record = false;
                        scratch.clear();
                    }
                }
            }
        }
    }

    /// Position the underlying file at the block containing `initial_offset`.
    fn skip_to_initial_block(&mut self) -> bool {
        let offset_in_block = (self.initial_offset % BLOCK_SIZE as u64) as usize;
        let mut block_start_location = self.initial_offset - offset_in_block as u64;

        // An offset inside a block trailer belongs to the next block.
        if offset_in_block > BLOCK_SIZE - 6 {
            block_start_location += BLOCK_SIZE as u64;
        }

        self.end_of_buffer_offset = block_start_location;

        if block_start_location > 0 {
            if let Err(e) = self.file.skip(block_start_location) {
                self.report_drop(block_start_location, &e);
                return false;
            }
        }
        true
    }

    fn read_physical_record(&mut self) -> Physical {
        loop {
            if self.buffer_end - self.buffer_start < HEADER_SIZE {
                if !self.eof {
                    // The last read returned a full block, so whatever is
                    // left here is trailer padding; refill.
                    self.buffer_start = 0;
                    self.buffer_end = 0;
                    match self.file.read(&mut self.backing) {
                        Ok(n) => {
                            self.end_of_buffer_offset += n as u64;
                            self.buffer_end = n;
                            if n < BLOCK_SIZE {
                                self.eof = true;
                            }
                        }
                        Err(e) => {
                            self.report_drop(BLOCK_SIZE as u64, &e);
                            self.eof = true;
                            return Physical::Eof;
                        }
                    }
                    continue;
                } else {
                    // A leftover partial header at EOF is a torn write, not
                    // corruption.
                    self.buffer_start = 0;
                    self.buffer_end = 0;
                    return Physical::Eof;
                }
            }

            let header_start = self.buffer_start;
            let stored_crc = u32::from_le_bytes(
                self.backing[header_start..header_start + 4].try_into().unwrap(),
            );
            let length = u16::from_le_bytes([
                self.backing[header_start + 4],
                self.backing[header_start + 5],
            ]) as usize;
            let record_type = self.backing[header_start + 6];

            if HEADER_SIZE + length > self.buffer_end - self.buffer_start {
                let drop_size = (self.buffer_end - self.buffer_start) as u64;
                self.buffer_start = self.buffer_end;
                if !self.eof {
                    self.report_corruption(drop_size, "bad record length");
                    return Physical::Bad;
                }
                // The file ended before the payload did; assume the writer
                // died mid-record.
                return Physical::Eof;
            }

            if record_type == RecordType::Zero.to_byte() && length == 0 {
                // Zero-filled region from preallocation; skip quietly.
                self.buffer_start = self.buffer_end;
                return Physical::Bad;
            }

            if self.checksum {
                let expected = unmask(stored_crc);
                let actual = crc32c(
                    &self.backing[header_start + 6..header_start + HEADER_SIZE + length],
                );
                if actual != expected {
                    // The length field itself may be corrupt; trusting it
                    // could resynchronize onto garbage that happens to look
                    // like a record, so drop the whole buffered region.
                    let drop_size = (self.buffer_end - self.buffer_start) as u64;
                    self.buffer_start = self.buffer_end;
                    self.report_corruption(drop_size, "checksum mismatch");
                    return Physical::Bad;
                }
            }

            self.buffer_start += HEADER_SIZE + length;

            // Skip physical records that started before initial_offset.
            let record_offset = self.end_of_buffer_offset as i64
                - (self.buffer_end - self.buffer_start) as i64
                - HEADER_SIZE as i64
                - length as i64;
            if record_offset < self.initial_offset as i64 {
                return Physical::Bad;
            }

            return Physical::Record {
                record_type,
                start: header_start + HEADER_SIZE,
                len: length,
            };
        }
    }

    fn report_corruption(&mut self, bytes: u64, reason: &str) {
        self.report_drop(bytes, &Error::corruption(reason));
    }

    fn report_drop(&mut self, bytes: u64, reason: &Error) {
        if let Some(reporter) = &mut self.reporter {
            let dropped_end = self.end_of_buffer_offset as i64
                - (self.buffer_end - self.buffer_start) as i64
                - bytes as i64;
            if dropped_end >= self.initial_offset as i64 {
                reporter.corruption(bytes as usize, reason);
            }
        }
    }
}
