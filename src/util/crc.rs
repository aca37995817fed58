//! CRC32C (Castagnoli) checksum utilities.
//!
//! Stored checksums are masked so that data containing embedded CRCs (for
//! example a write batch inside a log record) does not defeat the check.

use crc::{Crc, CRC_32_ISCSI};

const CASTAGNOLI: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

const MASK_DELTA: u32 = 0xa282ead8;

/// Compute the CRC32C of the given data.
pub fn crc32c(data: &[u8]) -> u32 {
    let mut digest = CASTAGNOLI.digest();
    digest.update(data);
    digest.finalize()
}

/// Compute the CRC32C of multiple concatenated slices.
pub fn crc32c_multi(slices: &[&[u8]]) -> u32 {
    let mut digest = CASTAGNOLI.digest();
    for slice in slices {
        digest.update(slice);
    }
    digest.finalize()
}

/// Mask a CRC value for storage.
///
/// Rotate right by 15 bits and add a constant, modulo 2^32.
pub fn mask(crc: u32) -> u32 {
    ((crc >> 15) | (crc << 17)).wrapping_add(MASK_DELTA)
}

/// Unmask a masked CRC value. Exact inverse of [`mask`].
pub fn unmask(masked: u32) -> u32 {
    let rot = masked.wrapping_sub(MASK_DELTA);
    (rot >> 17) | (rot << 15)
}

/// Verify that data matches an expected masked CRC.
pub fn verify_masked(data: &[u8], masked: u32) -> bool {
    crc32c(data) == unmask(masked)
}
