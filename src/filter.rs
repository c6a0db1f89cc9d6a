//! Bloom filter blocks.
//!
//! One filter is built per table during compaction, sized up front from
//! the expected entry count. The encoded image is the bit array followed
//! by a single byte recording the probe count, so readers can match
//! against filters built with different parameters.

use crate::block::{BLOCK_TRAILER_SIZE, CRC32};
use crate::encoding::mask_crc;

/// A fixed-size bloom filter under construction.
pub struct BloomBlock {
    space: Vec<u8>,
    bits: usize,
    k: usize,
    finished: bool,
}

impl BloomBlock {
    pub fn new(bits_per_key: usize, bytes: usize) -> Self {
        let mut space = Vec::with_capacity(bytes + 1 + BLOCK_TRAILER_SIZE);
        space.resize(bytes, 0);
        // Round down to reduce probing cost a little bit
        let k = ((bits_per_key as f64) * 0.69) as usize; // 0.69 =~ ln 2
        let k = k.clamp(1, 30);
        Self {
            space,
            bits: bytes * 8,
            k,
            finished: false,
        }
    }

    pub fn add_key(&mut self, key: &[u8]) {
        debug_assert!(!self.finished);
        // Double hashing generates the probe sequence from one hash.
        let mut h = bloom_hash(key);
        let delta = h.rotate_right(17);
        for _ in 0..self.k {
            let bitpos = (h as usize) % self.bits;
            self.space[bitpos / 8] |= 1 << (bitpos % 8);
            h = h.wrapping_add(delta);
        }
    }

    /// Seals the filter and returns the encoded image.
    pub fn finish(&mut self) -> &[u8] {
        debug_assert!(!self.finished);
        self.finished = true;
        self.space.push(self.k as u8);
        &self.space
    }

    /// Appends the block trailer so the image can go straight into the
    /// index log. Requires `finish` to have been called.
    pub fn finalize(&mut self) -> &[u8] {
        debug_assert!(self.finished);
        self.space.push(crate::block::NO_COMPRESSION);
        let crc = CRC32.checksum(&self.space);
        let masked = mask_crc(crc);
        self.space.extend_from_slice(&masked.to_le_bytes());
        &self.space
    }
}

/// True when `key` may be in the set the filter image was built over.
/// Images too short to be a filter, or recording an unknown probe count,
/// are treated as a match so newer encodings stay readable.
pub fn bloom_key_may_match(key: &[u8], filter: &[u8]) -> bool {
    let len = filter.len();
    if len < 2 {
        return true;
    }

    let bits = (len - 1) * 8;
    let k = filter[len - 1] as usize;
    if k > 30 {
        // Reserved for potentially new encodings of short filters.
        return true;
    }

    let mut h = bloom_hash(key);
    let delta = h.rotate_right(17);
    for _ in 0..k {
        let bitpos = (h as usize) % bits;
        if filter[bitpos / 8] & (1 << (bitpos % 8)) == 0 {
            return false;
        }
        h = h.wrapping_add(delta);
    }
    true
}

const BLOOM_HASH_SEED: u32 = 0xbc9f_1d34;

fn bloom_hash(key: &[u8]) -> u32 {
    hash(key, BLOOM_HASH_SEED)
}

/// Seeded 32-bit multiplicative hash over a byte string.
fn hash(data: &[u8], seed: u32) -> u32 {
    const M: u32 = 0xc6a4_a793;
    const R: u32 = 24;

    let mut h = seed ^ (data.len() as u32).wrapping_mul(M);
    let mut chunks = data.chunks_exact(4);
    for word in &mut chunks {
        let w = u32::from_le_bytes(word.try_into().unwrap());
        h = h.wrapping_add(w).wrapping_mul(M);
        h ^= h >> 16;
    }

    let rest = chunks.remainder();
    if !rest.is_empty() {
        if rest.len() >= 3 {
            h = h.wrapping_add((rest[2] as u32) << 16);
        }
        if rest.len() >= 2 {
            h = h.wrapping_add((rest[1] as u32) << 8);
        }
        h = h.wrapping_add(rest[0] as u32).wrapping_mul(M);
        h ^= h >> R;
    }
    h
}
