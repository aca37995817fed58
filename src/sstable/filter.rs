//! Filter policies for pruning point lookups.
//!
//! A filter policy summarizes a set of keys into a compact filter that can
//! prove a key absent. The default is a Bloom filter with double hashing.

use crate::util::hash::hash;

/// Builds and probes per-block filters.
pub trait FilterPolicy: Send + Sync {
    /// Name persisted in the table metaindex. Readers ignore filters built
    /// by a policy with a different name.
    fn name(&self) -> &str;

    /// Append a filter summarizing `keys` to `dst`.
    fn create_filter(&self, keys: &[&[u8]], dst: &mut Vec<u8>);

    /// True if `key` may be in the set summarized by `filter`. False
    /// positives are allowed; false negatives are not.
    fn key_may_match(&self, key: &[u8], filter: &[u8]) -> bool;
}

fn bloom_hash(key: &[u8]) -> u32 {
    hash(key, 0xbc9f1d34)
}

/// Bloom filter policy with a configurable bits-per-key budget.
#[derive(Debug, Clone)]
pub struct BloomFilterPolicy {
    bits_per_key: usize,
    /// Number of probes per key.
    k: usize,
}

impl BloomFilterPolicy {
    /// Create a policy spending roughly `bits_per_key` filter bits per key.
    ///
    /// Ten bits per key gives a false-positive rate near 1%.
    pub fn new(bits_per_key: usize) -> Self {
        // k = bits_per_key * ln(2), rounded down to cut probing cost.
        let k = (bits_per_key as f64 * 0.69) as usize;
        Self {
            bits_per_key,
            k: k.clamp(1, 30),
        }
    }
}

impl FilterPolicy for BloomFilterPolicy {
    fn name(&self) -> &str {
        "stratadb.BuiltinBloomFilter"
    }

    fn create_filter(&self, keys: &[&[u8]], dst: &mut Vec<u8>) {
        // Small key sets see very high false-positive rates; enforce a
        // minimum filter length.
        let mut bits = keys.len() * self.bits_per_key;
        if bits < 64 {
            bits = 64;
        }
        let bytes = (bits + 7) / 8;
        let bits = bytes * 8;

        let init_size = dst.len();
        dst.resize(init_size + bytes, 0);
        // Remember the probe count so readers can decode filters built
        // with different parameters.
        dst.push(self.k as u8);

        for key in keys {
            // Double hashing: h, h + delta, h + 2*delta, ...
            let mut h = bloom_hash(key);
            let delta = h.rotate_right(17);
            for _ in 0..self.k {
                let bit_pos = (h as usize) % bits;
                dst[init_size + bit_pos / 8] |= 1 << (bit_pos % 8);
                h = h.wrapping_add(delta);
            }
        }
    }

    fn key_may_match(&self, key: &[u8], filter: &[u8]) -> bool {
        let len = filter.len();
        if len < 2 {
            return false;
        }

        let bits = (len - 1) * 8;
        let k = filter[len - 1] as usize;
        if k > 30 {
            // Reserved for future encodings; treat as a match.
            return true;
        }

        let mut h = bloom_hash(key);
        let delta = h.rotate_right(17);
        for _ in 0..k {
            let bit_pos = (h as usize) % bits;
            if filter[bit_pos / 8] & (1 << (bit_pos % 8)) == 0 {
                return false;
            }
            h = h.wrapping_add(delta);
        }
        true
    }
}
