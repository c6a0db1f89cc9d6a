//! Restart-array block builder and reader.
//!
//! ## Block layout
//!
//! ```text
//! +--------------------------------------+
//! | entry 0: shared_len (varint32)       |
//! |          unshared_len (varint32)     |
//! |          value_len (varint32)        |
//! |          key delta bytes             |
//! |          value bytes                 |
//! +--------------------------------------+
//! | ...                                  |
//! +--------------------------------------+
//! | restart offsets (u32 LE each)        |
//! +--------------------------------------+
//! | restart count (u32 LE)               |
//! +--------------------------------------+
//! | compression type (u8)                |
//! +--------------------------------------+
//! | masked crc32c (u32 LE)               |
//! +--------------------------------------+
//! | zero padding to pad_to               |  (data blocks only)
//! +--------------------------------------+
//! ```
//!
//! Keys are prefix-compressed against the previous key; every
//! `restart_interval` entries a full key is stored and its offset recorded
//! in the restart array so readers can binary-search. The checksum covers
//! the payload plus the compression type byte and is stored masked.
//!
//! The builder appends into a backing buffer it retains across blocks, so
//! a sequence of finalized blocks accumulates into one contiguous write.

use byteorder::{ByteOrder, LittleEndian};
use crc::{Crc, CRC_32_ISCSI};

use crate::config::DirOptions;
use crate::encoding::{get_varint32, mask_crc, put_varint32, unmask_crc};
use crate::error::{Error, Result};
use crate::format::BlockHandle;
use crate::log::LogSource;

pub const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Compression type byte plus the masked checksum.
pub const BLOCK_TRAILER_SIZE: usize = 5;

/// The only compression type the format supports.
pub const NO_COMPRESSION: u8 = 0;

pub struct BlockBuilder {
    restart_interval: usize,
    buffer: Vec<u8>,
    /// Offset in `buffer` where the current block begins. Finalized blocks
    /// accumulate in front of it.
    block_start: usize,
    restarts: Vec<u32>,
    counter: usize,
    last_key: Vec<u8>,
    finished: bool,
}

impl BlockBuilder {
    pub fn new(restart_interval: usize) -> Self {
        debug_assert!(restart_interval >= 1);
        Self {
            restart_interval,
            buffer: Vec::new(),
            block_start: 0,
            restarts: vec![0],
            counter: 0,
            last_key: Vec::new(),
            finished: false,
        }
    }

    pub fn reserve(&mut self, bytes: usize) {
        self.buffer.reserve(bytes);
    }

    /// Appends an entry. Keys must arrive in non-decreasing order.
    pub fn add(&mut self, key: &[u8], value: &[u8]) {
        debug_assert!(!self.finished);
        debug_assert!(self.last_key.is_empty() || key >= self.last_key.as_slice());

        let shared = if self.counter < self.restart_interval {
            shared_prefix_length(&self.last_key, key)
        } else {
            self.restarts.push((self.buffer.len() - self.block_start) as u32);
            self.counter = 0;
            0
        };

        put_varint32(&mut self.buffer, shared as u32);
        put_varint32(&mut self.buffer, (key.len() - shared) as u32);
        put_varint32(&mut self.buffer, value.len() as u32);
        self.buffer.extend_from_slice(&key[shared..]);
        self.buffer.extend_from_slice(value);

        self.last_key.clear();
        self.last_key.extend_from_slice(key);
        self.counter += 1;
    }

    /// True when no entry has been added since the last reset.
    pub fn is_empty(&self) -> bool {
        self.buffer.len() == self.block_start
    }

    pub fn current_size_estimate(&self) -> usize {
        (self.buffer.len() - self.block_start) + self.restarts.len() * 4 + 4
    }

    /// Appends the restart array and seals the block. Returns the payload
    /// size, which is what a block handle records.
    pub fn finish(&mut self) -> usize {
        debug_assert!(!self.finished);
        let mut fixed = [0u8; 4];
        for i in 0..self.restarts.len() {
            LittleEndian::write_u32(&mut fixed, self.restarts[i]);
            self.buffer.extend_from_slice(&fixed);
        }
        LittleEndian::write_u32(&mut fixed, self.restarts.len() as u32);
        self.buffer.extend_from_slice(&fixed);
        self.finished = true;
        self.buffer.len() - self.block_start
    }

    /// Appends the trailer and, when `pad_to` is given, zero padding so
    /// the block image occupies a whole multiple of `pad_to` bytes.
    /// Returns the final image size.
    pub fn finalize(&mut self, pad_to: Option<usize>) -> usize {
        debug_assert!(self.finished);
        self.buffer.push(NO_COMPRESSION);
        let crc = CRC32.checksum(&self.buffer[self.block_start..]);
        let mut fixed = [0u8; 4];
        LittleEndian::write_u32(&mut fixed, mask_crc(crc));
        self.buffer.extend_from_slice(&fixed);

        if let Some(pad_to) = pad_to {
            debug_assert!(pad_to > 0);
            let image = self.buffer.len() - self.block_start;
            let padded = image.div_ceil(pad_to) * pad_to;
            self.buffer.resize(self.block_start + padded, 0);
        }
        self.buffer.len() - self.block_start
    }

    /// Begins a new block at the current end of the backing buffer.
    pub fn reset(&mut self) {
        self.block_start = self.buffer.len();
        self.restarts.clear();
        self.restarts.push(0);
        self.counter = 0;
        self.last_key.clear();
        self.finished = false;
    }

    /// Drops all accumulated block images and begins fresh.
    pub fn reset_buffer(&mut self) {
        self.buffer.clear();
        self.reset();
    }

    /// The finalized block images accumulated so far, excluding the
    /// in-progress block.
    pub fn committed_images(&self) -> &[u8] {
        &self.buffer[..self.block_start]
    }

    /// Forgets the finalized images, relocating any in-progress block to
    /// the front of the backing buffer. Restart offsets are relative to
    /// the block start, so the in-progress block survives the move.
    pub fn drop_committed(&mut self) {
        self.buffer.copy_within(self.block_start.., 0);
        self.buffer.truncate(self.buffer.len() - self.block_start);
        self.block_start = 0;
    }

    /// The backing buffer: every finalized block image so far plus the
    /// in-progress block.
    pub fn buffer_store(&self) -> &[u8] {
        &self.buffer
    }
}

fn shared_prefix_length(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b.iter()).take_while(|&(a, b)| a == b).count()
}

/// An immutable, parsed block payload.
pub struct Block {
    data: Vec<u8>,
    restart_offset: usize,
    num_restarts: u32,
}

impl Block {
    pub fn new(data: Vec<u8>) -> Result<Self> {
        if data.len() < 4 {
            return Err(Error::Corruption("block too short".to_string()));
        }
        let num_restarts = LittleEndian::read_u32(&data[data.len() - 4..]);
        let max_restarts = (data.len() - 4) / 4;
        if num_restarts as usize > max_restarts {
            return Err(Error::Corruption("bad restart count".to_string()));
        }
        let restart_offset = data.len() - 4 - num_restarts as usize * 4;
        Ok(Self {
            data,
            restart_offset,
            num_restarts,
        })
    }

    pub fn iter(&self) -> BlockIter<'_> {
        BlockIter {
            block: self,
            current: self.restart_offset,
            key: Vec::new(),
            value: 0..0,
            err: None,
        }
    }

    fn restart_point(&self, index: u32) -> usize {
        debug_assert!(index < self.num_restarts);
        let at = self.restart_offset + index as usize * 4;
        LittleEndian::read_u32(&self.data[at..at + 4]) as usize
    }
}

/// Cursor over one block. Invalid until positioned with `seek` or
/// `seek_to_first`; parse failures invalidate it and latch into `status`.
pub struct BlockIter<'a> {
    block: &'a Block,
    /// Offset of the next entry to decode; `restart_offset` means
    /// exhausted.
    current: usize,
    key: Vec<u8>,
    value: std::ops::Range<usize>,
    err: Option<Error>,
}

impl<'a> BlockIter<'a> {
    pub fn valid(&self) -> bool {
        self.err.is_none() && !self.key.is_empty()
    }

    pub fn status(&self) -> Result<()> {
        match &self.err {
            None => Ok(()),
            Some(err) => Err(err.clone()),
        }
    }

    pub fn key(&self) -> &[u8] {
        debug_assert!(self.valid());
        &self.key
    }

    pub fn value(&self) -> &'a [u8] {
        debug_assert!(self.valid());
        &self.block.data[self.value.clone()]
    }

    pub fn seek_to_first(&mut self) {
        if self.block.num_restarts == 0 {
            self.corrupt();
            return;
        }
        self.current = self.block.restart_point(0);
        self.key.clear();
        self.parse_next();
    }

    /// Positions the cursor at the first entry with key >= `target`.
    pub fn seek(&mut self, target: &[u8]) {
        // Binary search restarts for the last full key < target.
        let mut left = 0u32;
        let mut right = self.block.num_restarts.saturating_sub(1);
        while left < right {
            let mid = (left + right + 1) / 2;
            match self.full_key_at(self.block.restart_point(mid)) {
                Some(key) if key < target => left = mid,
                Some(_) => right = mid - 1,
                None => {
                    self.corrupt();
                    return;
                }
            }
        }

        if self.block.num_restarts == 0 {
            self.corrupt();
            return;
        }
        self.current = self.block.restart_point(left);
        self.key.clear();
        loop {
            if !self.parse_next() {
                return; // Exhausted or corrupt
            }
            if self.key.as_slice() >= target {
                return;
            }
        }
    }

    pub fn next(&mut self) {
        debug_assert!(self.valid());
        self.parse_next();
    }

    /// Decodes the entry at `current`, advancing past it. Returns false
    /// when the cursor is exhausted or the block is corrupt.
    fn parse_next(&mut self) -> bool {
        if self.current >= self.block.restart_offset {
            self.key.clear();
            self.value = 0..0;
            return false;
        }

        let data = &self.block.data[..self.block.restart_offset];
        let mut input = &data[self.current..];
        let header = (
            get_varint32(&mut input),
            get_varint32(&mut input),
            get_varint32(&mut input),
        );
        let (shared, unshared, value_len) = match header {
            (Some(s), Some(u), Some(v)) => (s as usize, u as usize, v as usize),
            _ => return self.corrupt(),
        };

        let delta_start = data.len() - input.len();
        if shared > self.key.len() || delta_start + unshared + value_len > data.len() {
            return self.corrupt();
        }

        self.key.truncate(shared);
        self.key.extend_from_slice(&data[delta_start..delta_start + unshared]);
        self.value = delta_start + unshared..delta_start + unshared + value_len;
        self.current = self.value.end;
        true
    }

    /// Reads the full key stored at a restart point without disturbing
    /// the cursor.
    fn full_key_at(&self, offset: usize) -> Option<&'a [u8]> {
        let data = &self.block.data[..self.block.restart_offset];
        let mut input = data.get(offset..)?;
        let shared = get_varint32(&mut input)?;
        let unshared = get_varint32(&mut input)? as usize;
        let _value_len = get_varint32(&mut input)?;
        if shared != 0 {
            return None; // Restart entries store the whole key
        }
        let start = data.len() - input.len();
        data.get(start..start + unshared)
    }

    fn corrupt(&mut self) -> bool {
        self.err = Some(Error::Corruption("bad block entry".to_string()));
        self.key.clear();
        self.value = 0..0;
        false
    }
}

/// Reads a block image located by `handle`, verifies its trailer when the
/// options ask for it, and returns the owned payload.
pub fn read_block(
    src: &dyn LogSource,
    options: &DirOptions,
    handle: &BlockHandle,
) -> Result<Vec<u8>> {
    let n = handle.size as usize;
    let mut buf = vec![0u8; n + BLOCK_TRAILER_SIZE];
    let read = src.read_at(&mut buf, handle.offset)?;
    if read != buf.len() {
        return Err(Error::Corruption("truncated block read".to_string()));
    }

    if options.verify_checksums {
        let stored = unmask_crc(LittleEndian::read_u32(&buf[n + 1..]));
        let actual = CRC32.checksum(&buf[..n + 1]);
        if stored != actual {
            return Err(Error::Corruption("block checksum mismatch".to_string()));
        }
    }
    if buf[n] != NO_COMPRESSION {
        return Err(crate::errcorrupt!(
            "unknown block compression type {}",
            buf[n]
        ));
    }

    buf.truncate(n);
    Ok(buf)
}
