//! On-disk layout records for the index log.
//!
//! ## Index log layout
//!
//! ```text
//! +----------------------+
//! | table 0 index block  |
//! +----------------------+
//! | table 0 filter       |  (absent when filters are disabled)
//! +----------------------+
//! | ...                  |
//! +----------------------+
//! | epoch index block    |  one (epoch, table) -> TableHandle per table
//! +----------------------+
//! | zero padding         |  (only with tail_padding)
//! +----------------------+
//! | footer (32 bytes)    |
//! +----------------------+
//! ```
//!
//! Handles locate byte ranges in one of the two logs; the epoch key orders
//! the epoch index block by (epoch, table).

use byteorder::{BigEndian, ByteOrder, LittleEndian};

use crate::encoding::{
    get_length_prefixed_slice, get_varint64, put_length_prefixed_slice, put_varint64,
};
use crate::error::{Error, Result};

/// Largest number of epochs a single directory may hold.
pub const MAX_EPOCHS: u32 = 1 << 24;

/// Largest number of tables a single epoch may hold.
pub const MAX_TABLES_PER_EPOCH: u32 = 1 << 24;

/// Maximum encoded length of a [`BlockHandle`]: two 10-byte varints.
pub const BLOCK_HANDLE_MAX_ENCODED_LENGTH: usize = 20;

/// Fixed footer length: a padded epoch-index handle, the epoch count,
/// and the magic.
pub const FOOTER_ENCODED_LENGTH: usize = BLOCK_HANDLE_MAX_ENCODED_LENGTH + 4 + 8;

const MAGIC: &[u8; 8] = b"EPOCHDIR";

/// Identifies a byte range in the data or index log.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BlockHandle {
    pub offset: u64,
    pub size: u64,
}

impl BlockHandle {
    pub fn new(offset: u64, size: u64) -> Self {
        Self { offset, size }
    }

    pub fn encode_to(&self, dst: &mut Vec<u8>) {
        put_varint64(dst, self.offset);
        put_varint64(dst, self.size);
    }

    pub fn decode_from(input: &mut &[u8]) -> Result<Self> {
        let offset = get_varint64(input)
            .ok_or_else(|| Error::Corruption("bad block handle".to_string()))?;
        let size = get_varint64(input)
            .ok_or_else(|| Error::Corruption("bad block handle".to_string()))?;
        Ok(Self { offset, size })
    }
}

/// Locates one table: its index block, its optional filter, and the key
/// range it covers.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TableHandle {
    /// Index block location in the index log.
    pub index: BlockHandle,
    pub filter_offset: u64,
    /// Zero when the table carries no filter.
    pub filter_size: u64,
    pub smallest_key: Vec<u8>,
    pub largest_key: Vec<u8>,
}

impl TableHandle {
    pub fn encode_to(&self, dst: &mut Vec<u8>) {
        self.index.encode_to(dst);
        put_varint64(dst, self.filter_offset);
        put_varint64(dst, self.filter_size);
        put_length_prefixed_slice(dst, &self.smallest_key);
        put_length_prefixed_slice(dst, &self.largest_key);
    }

    pub fn decode_from(input: &mut &[u8]) -> Result<Self> {
        let corrupt = || Error::Corruption("bad table handle".to_string());
        let index = BlockHandle::decode_from(input)?;
        let filter_offset = get_varint64(input).ok_or_else(corrupt)?;
        let filter_size = get_varint64(input).ok_or_else(corrupt)?;
        let smallest_key = get_length_prefixed_slice(input).ok_or_else(corrupt)?.to_vec();
        let largest_key = get_length_prefixed_slice(input).ok_or_else(corrupt)?.to_vec();
        Ok(Self {
            index,
            filter_offset,
            filter_size,
            smallest_key,
            largest_key,
        })
    }
}

/// Fixed-size tail record of the index log.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Footer {
    pub epoch_index_handle: BlockHandle,
    pub num_epochs: u32,
}

impl Footer {
    pub fn encode(&self) -> Vec<u8> {
        let mut dst = Vec::with_capacity(FOOTER_ENCODED_LENGTH);
        self.epoch_index_handle.encode_to(&mut dst);
        dst.resize(BLOCK_HANDLE_MAX_ENCODED_LENGTH, 0);

        let mut fixed = [0u8; 4];
        LittleEndian::write_u32(&mut fixed, self.num_epochs);
        dst.extend_from_slice(&fixed);
        dst.extend_from_slice(MAGIC);
        debug_assert_eq!(dst.len(), FOOTER_ENCODED_LENGTH);
        dst
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < FOOTER_ENCODED_LENGTH {
            return Err(Error::Corruption("footer too short".to_string()));
        }
        let buf = &buf[buf.len() - FOOTER_ENCODED_LENGTH..];
        if &buf[24..32] != MAGIC {
            return Err(Error::Corruption("bad footer magic".to_string()));
        }

        let mut input = &buf[..BLOCK_HANDLE_MAX_ENCODED_LENGTH];
        let epoch_index_handle = BlockHandle::decode_from(&mut input)?;
        let num_epochs = LittleEndian::read_u32(&buf[20..24]);
        Ok(Self {
            epoch_index_handle,
            num_epochs,
        })
    }
}

/// Composite key ordering the epoch index block: epochs in creation
/// order, tables within an epoch in emission order.
pub fn epoch_key(epoch: u32, table: u32) -> [u8; 8] {
    let mut key = [0u8; 8];
    BigEndian::write_u32(&mut key[..4], epoch);
    BigEndian::write_u32(&mut key[4..], table);
    key
}
