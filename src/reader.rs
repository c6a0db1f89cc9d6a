//! The read path: point lookups against a finished directory.
//!
//! Opening a directory reads and validates the footer at the tail of the
//! index log and keeps the epoch index block resident. A lookup then
//! descends per epoch: epoch index entry -> table handle -> key range
//! check -> bloom filter probe -> table index block -> data block, and
//! hands each matching value to a saver callback.

use std::sync::Arc;

use crate::block::{read_block, Block};
use crate::config::DirOptions;
use crate::error::{Error, Result};
use crate::filter::bloom_key_may_match;
use crate::format::{epoch_key, BlockHandle, Footer, TableHandle, FOOTER_ENCODED_LENGTH};
use crate::log::LogSource;

/// Caller-supplied sink invoked with `(key, value)` on each match.
pub type Saver<'a> = &'a mut dyn FnMut(&[u8], &[u8]);

/// The read half of a directory.
pub struct DirReader {
    options: DirOptions,
    num_epochs: u32,
    epoch_index: Block,
    data_src: Arc<dyn LogSource>,
    index_src: Arc<dyn LogSource>,
}

impl DirReader {
    /// Opens a directory from its data and index logs.
    pub fn open(
        options: DirOptions,
        data_src: Arc<dyn LogSource>,
        index_src: Arc<dyn LogSource>,
    ) -> Result<Self> {
        let size = index_src.size();
        if size < FOOTER_ENCODED_LENGTH as u64 {
            return Err(Error::Corruption(
                "index too short to be valid".to_string(),
            ));
        }

        let mut tail = [0u8; FOOTER_ENCODED_LENGTH];
        let read = index_src.read_at(&mut tail, size - FOOTER_ENCODED_LENGTH as u64)?;
        if read != FOOTER_ENCODED_LENGTH {
            return Err(Error::Corruption("truncated footer read".to_string()));
        }
        let footer = Footer::decode(&tail)?;

        let contents = read_block(&*index_src, &options, &footer.epoch_index_handle)?;
        let epoch_index = Block::new(contents)?;

        tracing::debug!(num_epochs = footer.num_epochs, "opened directory index");
        Ok(Self {
            options,
            num_epochs: footer.num_epochs,
            epoch_index,
            data_src,
            index_src,
        })
    }

    pub fn num_epochs(&self) -> u32 {
        self.num_epochs
    }

    /// Looks `key` up in one epoch, invoking `saver` on each match.
    /// Returns whether anything matched.
    pub fn get_with(&self, key: &[u8], epoch: u32, saver: Saver) -> Result<bool> {
        let mut iter = self.epoch_index.iter();
        let mut table = 0u32;
        let mut found = false;
        loop {
            let target = epoch_key(epoch, table);
            if !iter.valid() || iter.key() != target.as_slice() {
                iter.seek(&target);
                if !iter.valid() || iter.key() != target.as_slice() {
                    break; // Table range exhausted for this epoch
                }
            }

            let mut input = iter.value();
            let handle = TableHandle::decode_from(&mut input)?;
            if self.get_from_table(key, &handle, saver)? {
                found = true;
                if self.options.unique_keys {
                    return Ok(true); // First hit wins
                }
            }

            iter.next();
            table += 1;
        }
        iter.status()?;
        Ok(found)
    }

    /// Looks `key` up in one epoch, appending matched values to `dst`.
    pub fn get(&self, key: &[u8], epoch: u32, dst: &mut Vec<u8>) -> Result<bool> {
        self.get_with(key, epoch, &mut |_key, value| dst.extend_from_slice(value))
    }

    /// Looks `key` up across all epochs in creation order, appending
    /// matched values to `dst`. With unique keys the first hit wins;
    /// otherwise every epoch contributes its matches.
    pub fn gets(&self, key: &[u8], dst: &mut Vec<u8>) -> Result<bool> {
        let mut found = false;
        for epoch in 0..self.num_epochs {
            if self.get(key, epoch, dst)? {
                found = true;
                if self.options.unique_keys {
                    break;
                }
            }
        }
        Ok(found)
    }

    /// Walks one table: range check, filter probe, then the index and
    /// data blocks.
    fn get_from_table(&self, key: &[u8], handle: &TableHandle, saver: Saver) -> Result<bool> {
        if key < handle.smallest_key.as_slice() || key > handle.largest_key.as_slice() {
            return Ok(false);
        }
        if handle.filter_size != 0 {
            let filter = BlockHandle::new(handle.filter_offset, handle.filter_size);
            if !self.key_may_match(key, &filter) {
                return Ok(false);
            }
        }

        let contents = read_block(&*self.index_src, &self.options, &handle.index)?;
        let index = Block::new(contents)?;
        let mut iter = index.iter();
        if self.options.unique_keys {
            iter.seek(key);
        } else {
            // Duplicates may straddle separators; walk from the front.
            iter.seek_to_first();
            while iter.valid() && key > iter.key() {
                iter.next();
            }
        }

        let mut found = false;
        let mut end_of_key = false;
        while !end_of_key && iter.valid() {
            let mut input = iter.value();
            let block = BlockHandle::decode_from(&mut input)?;
            found |= self.get_from_block(key, &block, saver, &mut end_of_key)?;
            iter.next();
        }
        iter.status()?;
        Ok(found)
    }

    /// Scans one data block for `key`. Sets `end_of_key` once a strictly
    /// greater key proves no later block can match.
    fn get_from_block(
        &self,
        key: &[u8],
        handle: &BlockHandle,
        saver: Saver,
        end_of_key: &mut bool,
    ) -> Result<bool> {
        let contents = read_block(&*self.data_src, &self.options, handle)?;
        let block = Block::new(contents)?;
        let mut iter = block.iter();
        if self.options.unique_keys {
            iter.seek(key);
        } else {
            iter.seek_to_first();
            while iter.valid() && key > iter.key() {
                iter.next();
            }
        }

        let mut found = false;
        while !*end_of_key && iter.valid() {
            if iter.key() == key {
                saver(key, iter.value());
                found = true;
                if self.options.unique_keys {
                    *end_of_key = true;
                }
            } else {
                *end_of_key = true;
            }
            iter.next();
        }
        iter.status()?;
        Ok(found)
    }

    /// Filter probe; read problems count as a match so lookups stay
    /// correct when a filter is unreadable.
    fn key_may_match(&self, key: &[u8], handle: &BlockHandle) -> bool {
        match read_block(&*self.index_src, &self.options, handle) {
            Ok(contents) => bloom_key_may_match(key, &contents),
            Err(_) => true,
        }
    }
}
