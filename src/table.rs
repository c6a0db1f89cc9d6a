//! The table encoder: turns sorted record streams into the on-disk data
//! and index logs.
//!
//! One table is the output of one compaction; `end_table` seals it.
//! Tables group into epochs sealed by `end_epoch`, and `finish` writes
//! the epoch index and footer. Data blocks accumulate in memory and go
//! to the data sink in large appends: `flush` cuts a block, `commit`
//! writes every cut block in one I/O and rewrites the buffered index
//! entries from buffer-local offsets to absolute log offsets.
//!
//! The first failure is latched; every later entry point returns it
//! without doing work.

use std::sync::Arc;

use crate::block::{BlockBuilder, BLOCK_TRAILER_SIZE};
use crate::config::DirOptions;
use crate::encoding::{
    find_short_successor, find_shortest_separator, get_length_prefixed_slice,
    put_length_prefixed_slice,
};
use crate::error::{Error, Result};
use crate::filter::BloomBlock;
use crate::format::{
    epoch_key, BlockHandle, Footer, TableHandle, MAX_EPOCHS, MAX_TABLES_PER_EPOCH,
};
use crate::log::LogSink;

pub struct TableEncoder {
    options: DirOptions,
    data_sink: Arc<dyn LogSink>,
    index_sink: Arc<dyn LogSink>,

    data_block: BlockBuilder,
    index_block: BlockBuilder,
    meta_block: BlockBuilder,

    /// Index entries cut since the last commit, buffered as
    /// length-prefixed key then handle with a buffer-local offset.
    uncommitted_indexes: Vec<u8>,
    num_uncommitted_indexes: usize,
    num_uncommitted_data: usize,

    pending_index_entry: bool,
    pending_index_handle: BlockHandle,

    smallest_key: Vec<u8>,
    largest_key: Vec<u8>,
    last_key: Vec<u8>,

    num_tables: u32,
    num_epochs: u32,
    finished: bool,
    status: Result<()>,
}

impl TableEncoder {
    pub fn new(
        options: DirOptions,
        data_sink: Arc<dyn LogSink>,
        index_sink: Arc<dyn LogSink>,
    ) -> Self {
        let mut data_block = BlockBuilder::new(16);
        let mut index_block = BlockBuilder::new(1);
        let mut meta_block = BlockBuilder::new(1);
        data_block.reserve(options.block_buffer);
        index_block.reserve(4 << 10);
        meta_block.reserve(16 << 10);

        Self {
            options,
            data_sink,
            index_sink,
            data_block,
            index_block,
            meta_block,
            uncommitted_indexes: Vec::with_capacity(1 << 10),
            num_uncommitted_indexes: 0,
            num_uncommitted_data: 0,
            pending_index_entry: false,
            pending_index_handle: BlockHandle::default(),
            smallest_key: Vec::new(),
            largest_key: Vec::new(),
            last_key: Vec::new(),
            num_tables: 0,
            num_epochs: 0,
            finished: false,
            status: Ok(()),
        }
    }

    pub fn ok(&self) -> bool {
        self.status.is_ok()
    }

    pub fn status(&self) -> Result<()> {
        self.status.clone()
    }

    pub fn num_epochs(&self) -> u32 {
        self.num_epochs
    }

    fn latch(&mut self, err: Error) -> Error {
        self.status = Err(err.clone());
        err
    }

    /// Appends a record to the current table. Keys must arrive in sorted
    /// order within the table.
    pub fn add(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        debug_assert!(!self.finished);
        debug_assert!(!key.is_empty());
        self.status.clone()?;

        if !self.last_key.is_empty() {
            debug_assert!(key >= self.last_key.as_slice());
            if self.options.unique_keys {
                // Duplicates are the caller's bug; the last writer wins
                // on lookup.
                debug_assert!(key != self.last_key.as_slice());
            }
        }
        if self.smallest_key.is_empty() {
            self.smallest_key = key.to_vec();
        }
        self.largest_key.clear();
        self.largest_key.extend_from_slice(key);

        // A just-flushed block still needs its index entry; the separator
        // only exists once the next key is known.
        if self.pending_index_entry {
            let mut separator = std::mem::take(&mut self.last_key);
            find_shortest_separator(&mut separator, key);
            put_length_prefixed_slice(&mut self.uncommitted_indexes, &separator);
            self.pending_index_handle
                .encode_to(&mut self.uncommitted_indexes);
            self.pending_index_entry = false;
            self.num_uncommitted_indexes += 1;
        }

        if self.data_block.buffer_store().len() >= self.options.block_buffer {
            self.commit()?;
        }

        self.last_key.clear();
        self.last_key.extend_from_slice(key);
        self.data_block.add(key, value);

        let threshold = (self.options.block_size as f64 * self.options.block_util) as usize;
        if self.data_block.current_size_estimate() + BLOCK_TRAILER_SIZE >= threshold {
            self.flush()?;
        }
        Ok(())
    }

    /// Seals the current data block in the in-memory buffer and records
    /// its buffer-local handle.
    fn flush(&mut self) -> Result<()> {
        debug_assert!(!self.finished);
        if self.data_block.is_empty() {
            return Ok(());
        }
        self.status.clone()?;

        let payload = self.data_block.finish();
        let pad_to = self.options.block_padding.then_some(self.options.block_size);
        let image = self.data_block.finalize(pad_to);
        let offset = self.data_block.buffer_store().len() - image;

        debug_assert!(!self.pending_index_entry);
        self.pending_index_handle = BlockHandle::new(offset as u64, payload as u64);
        self.pending_index_entry = true;
        self.num_uncommitted_data += 1;
        self.data_block.reset();
        Ok(())
    }

    /// Writes every sealed block image to the data sink in one append and
    /// rewrites the buffered index entries to absolute offsets.
    fn commit(&mut self) -> Result<()> {
        debug_assert!(!self.finished);
        if self.data_block.committed_images().is_empty() {
            return Ok(()); // Empty commit
        }
        self.status.clone()?;
        debug_assert_eq!(self.num_uncommitted_data, self.num_uncommitted_indexes);

        let base = self.data_sink.tell();
        if let Err(err) = self.data_sink.write(self.data_block.committed_images()) {
            return Err(self.latch(err));
        }

        let mut uncommitted = std::mem::take(&mut self.uncommitted_indexes);
        let mut input = uncommitted.as_slice();
        let mut committed = 0;
        let mut encoding = Vec::new();
        while !input.is_empty() {
            let key = match get_length_prefixed_slice(&mut input) {
                Some(key) => key,
                None => break,
            };
            let mut handle = BlockHandle::decode_from(&mut input)?;
            handle.offset += base;
            encoding.clear();
            handle.encode_to(&mut encoding);
            self.index_block.add(key, &encoding);
            committed += 1;
        }

        debug_assert_eq!(committed, self.num_uncommitted_indexes);
        self.num_uncommitted_data = 0;
        self.num_uncommitted_indexes = 0;
        uncommitted.clear();
        self.uncommitted_indexes = uncommitted;
        self.data_block.drop_committed();
        Ok(())
    }

    /// Seals the current table: commits its data, writes its index block
    /// and filter to the index sink, and records a meta entry under the
    /// epoch key. A table with no records vanishes without a trace.
    pub fn end_table(&mut self, filter: Option<&mut BloomBlock>) -> Result<()> {
        debug_assert!(!self.finished);

        self.flush()?;
        self.status.clone()?;
        if self.pending_index_entry {
            // Last block of the table: a successor of the final key
            // serves as its index key.
            let mut successor = std::mem::take(&mut self.last_key);
            find_short_successor(&mut successor);
            put_length_prefixed_slice(&mut self.uncommitted_indexes, &successor);
            self.pending_index_handle
                .encode_to(&mut self.uncommitted_indexes);
            self.pending_index_entry = false;
            self.num_uncommitted_indexes += 1;
        }

        self.commit()?;
        self.status.clone()?;
        if self.index_block.is_empty() {
            return Ok(()); // Empty table
        }

        let payload = self.index_block.finish();
        self.index_block.finalize(None);
        let index_offset = self.index_sink.tell();
        if let Err(err) = self.index_sink.write(self.index_block.buffer_store()) {
            return Err(self.latch(err));
        }

        let filter_offset = self.index_sink.tell();
        let mut filter_size = 0u64;
        if let Some(filter) = filter {
            filter_size = filter.finish().len() as u64;
            if let Err(err) = self.index_sink.write(filter.finalize()) {
                return Err(self.latch(err));
            }
        }

        // Not reset until both writes land; a non-empty index block is
        // how later calls can tell this table never finished.
        self.index_block.reset_buffer();

        if self.num_tables >= MAX_TABLES_PER_EPOCH {
            return Err(self.latch(Error::TooManyTables));
        }

        let mut largest_key = std::mem::take(&mut self.largest_key);
        find_short_successor(&mut largest_key);
        let handle = TableHandle {
            index: BlockHandle::new(index_offset, payload as u64),
            filter_offset,
            filter_size,
            smallest_key: std::mem::take(&mut self.smallest_key),
            largest_key,
        };
        let mut encoding = Vec::new();
        handle.encode_to(&mut encoding);
        self.meta_block
            .add(&epoch_key(self.num_epochs, self.num_tables), &encoding);

        self.last_key.clear();
        self.num_tables += 1;
        Ok(())
    }

    /// Seals the current epoch. An epoch that produced no tables does not
    /// advance the epoch counter.
    pub fn end_epoch(&mut self) -> Result<()> {
        debug_assert!(!self.finished);
        self.end_table(None)?;
        if self.num_tables == 0 {
            return Ok(()); // Empty epoch
        }
        if self.num_epochs >= MAX_EPOCHS {
            return Err(self.latch(Error::TooManyEpochs));
        }
        self.num_tables = 0;
        self.num_epochs += 1;
        Ok(())
    }

    /// Seals the directory: final epoch, the epoch index block, optional
    /// tail padding, and the footer. No operation is accepted afterwards.
    pub fn finish(&mut self) -> Result<()> {
        debug_assert!(!self.finished);
        let sealed = self.end_epoch();
        self.finished = true;
        sealed?;

        let payload = self.meta_block.finish();
        self.meta_block.finalize(None);
        let offset = self.index_sink.tell();
        if let Err(err) = self.index_sink.write(self.meta_block.buffer_store()) {
            return Err(self.latch(err));
        }

        let footer = Footer {
            epoch_index_handle: BlockHandle::new(offset, payload as u64),
            num_epochs: self.num_epochs,
        };
        let tail = footer.encode();

        if self.options.tail_padding {
            // Align the final size of the index log to the physical
            // write size.
            let total = self.index_sink.tell() + tail.len() as u64;
            let overflow = (total % self.options.index_buffer as u64) as usize;
            if overflow != 0 {
                let padding = vec![0u8; self.options.index_buffer - overflow];
                if let Err(err) = self.index_sink.write(&padding) {
                    return Err(self.latch(err));
                }
            }
        }

        if let Err(err) = self.index_sink.write(&tail) {
            return Err(self.latch(err));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{read_block, Block};
    use crate::format::FOOTER_ENCODED_LENGTH;
    use crate::log::MemSink;

    fn test_options() -> DirOptions {
        DirOptions::default()
            .block_size(256)
            .block_padding(false)
            .block_buffer(1 << 10)
    }

    struct EncodedDir {
        data: MemSink,
        index: MemSink,
        encoder: TableEncoder,
    }

    fn new_encoder(options: DirOptions) -> EncodedDir {
        let data = MemSink::new();
        let index = MemSink::new();
        let encoder = TableEncoder::new(
            options,
            Arc::new(data.clone()),
            Arc::new(index.clone()),
        );
        EncodedDir {
            data,
            index,
            encoder,
        }
    }

    fn footer_of(index: &MemSink) -> Footer {
        let contents = index.contents();
        Footer::decode(&contents).expect("Failed to decode footer")
    }

    #[test]
    fn test_single_table_roundtrip() {
        let mut dir = new_encoder(test_options());
        dir.encoder.add(b"a", b"1").unwrap();
        dir.encoder.add(b"b", b"2").unwrap();
        dir.encoder.add(b"c", b"3").unwrap();
        dir.encoder.end_table(None).unwrap();
        dir.encoder.end_epoch().unwrap();
        dir.encoder.finish().unwrap();

        let footer = footer_of(&dir.index);
        assert_eq!(footer.num_epochs, 1);

        // Walk footer -> epoch index -> table index -> data block by hand.
        let options = test_options().verify_checksums(true);
        let index_src = dir.index.source();
        let contents = read_block(&index_src, &options, &footer.epoch_index_handle).unwrap();
        let epoch_index = Block::new(contents).unwrap();

        let mut iter = epoch_index.iter();
        iter.seek(&epoch_key(0, 0));
        assert!(iter.valid());
        assert_eq!(iter.key(), epoch_key(0, 0).as_slice());

        let mut input = iter.value();
        let table = TableHandle::decode_from(&mut input).unwrap();
        assert_eq!(table.smallest_key, b"a");
        assert!(table.largest_key.as_slice() >= &b"c"[..]);
        assert_eq!(table.filter_size, 0);

        let contents = read_block(&index_src, &options, &table.index).unwrap();
        let table_index = Block::new(contents).unwrap();
        let mut iter = table_index.iter();
        iter.seek(b"b");
        assert!(iter.valid());

        let mut input = iter.value();
        let block_handle = BlockHandle::decode_from(&mut input).unwrap();
        let data_src = dir.data.source();
        let contents = read_block(&data_src, &options, &block_handle).unwrap();
        let data = Block::new(contents).unwrap();
        let mut iter = data.iter();
        iter.seek(b"b");
        assert!(iter.valid());
        assert_eq!(iter.key(), b"b");
        assert_eq!(iter.value(), b"2");
    }

    #[test]
    fn test_offsets_rewritten_across_blocks() {
        // Tiny blocks force several flushes per table; every resulting
        // handle must resolve against the data log.
        let mut dir = new_encoder(test_options().block_size(64));
        let mut pairs = Vec::new();
        for i in 0..100 {
            let key = format!("key_{:03}", i).into_bytes();
            let value = format!("value_{:03}", i).into_bytes();
            dir.encoder.add(&key, &value).unwrap();
            pairs.push((key, value));
        }
        dir.encoder.end_table(None).unwrap();
        dir.encoder.finish().unwrap();

        let options = test_options().verify_checksums(true);
        let footer = footer_of(&dir.index);
        let index_src = dir.index.source();
        let contents = read_block(&index_src, &options, &footer.epoch_index_handle).unwrap();
        let epoch_index = Block::new(contents).unwrap();
        let mut iter = epoch_index.iter();
        iter.seek_to_first();
        let mut input = iter.value();
        let table = TableHandle::decode_from(&mut input).unwrap();

        let contents = read_block(&index_src, &options, &table.index).unwrap();
        let table_index = Block::new(contents).unwrap();

        // Count data blocks and verify each one parses.
        let data_src = dir.data.source();
        let mut blocks = 0;
        let mut seen = Vec::new();
        let mut iter = table_index.iter();
        iter.seek_to_first();
        while iter.valid() {
            let mut input = iter.value();
            let handle = BlockHandle::decode_from(&mut input).unwrap();
            let contents = read_block(&data_src, &options, &handle).unwrap();
            let block = Block::new(contents).unwrap();
            let mut entries = block.iter();
            entries.seek_to_first();
            while entries.valid() {
                seen.push((entries.key().to_vec(), entries.value().to_vec()));
                entries.next();
            }
            blocks += 1;
            iter.next();
        }

        assert!(blocks > 1, "Expected several data blocks, got {}", blocks);
        assert_eq!(seen, pairs);
    }

    #[test]
    fn test_filter_recorded_in_table_handle() {
        let mut dir = new_encoder(test_options());
        let mut filter = BloomBlock::new(10, 32);
        for key in [&b"alpha"[..], b"beta", b"gamma"] {
            filter.add_key(key);
            dir.encoder.add(key, b"v").unwrap();
        }
        dir.encoder.end_table(Some(&mut filter)).unwrap();
        dir.encoder.finish().unwrap();

        let footer = footer_of(&dir.index);
        let options = test_options();
        let index_src = dir.index.source();
        let contents = read_block(&index_src, &options, &footer.epoch_index_handle).unwrap();
        let epoch_index = Block::new(contents).unwrap();
        let mut iter = epoch_index.iter();
        iter.seek_to_first();
        let mut input = iter.value();
        let table = TableHandle::decode_from(&mut input).unwrap();
        assert!(table.filter_size > 0);

        let filter_handle = BlockHandle::new(table.filter_offset, table.filter_size);
        let image = read_block(&index_src, &options, &filter_handle).unwrap();
        assert!(crate::filter::bloom_key_may_match(b"alpha", &image));
        assert!(!crate::filter::bloom_key_may_match(b"delta", &image));
    }

    #[test]
    fn test_empty_table_and_epoch_elision() {
        let mut dir = new_encoder(test_options());
        dir.encoder.end_table(None).unwrap();
        dir.encoder.end_epoch().unwrap();
        assert_eq!(dir.encoder.num_epochs(), 0);

        dir.encoder.add(b"k", b"v").unwrap();
        dir.encoder.end_epoch().unwrap();
        assert_eq!(dir.encoder.num_epochs(), 1);

        // Nothing added since the boundary: finish seals no extra epoch.
        dir.encoder.finish().unwrap();
        assert_eq!(footer_of(&dir.index).num_epochs, 1);
    }

    #[test]
    fn test_multiple_epochs_in_meta_block() {
        let mut dir = new_encoder(test_options());
        dir.encoder.add(b"e0", b"v0").unwrap();
        dir.encoder.end_epoch().unwrap();
        dir.encoder.add(b"e1", b"v1").unwrap();
        dir.encoder.end_epoch().unwrap();
        dir.encoder.finish().unwrap();

        let footer = footer_of(&dir.index);
        assert_eq!(footer.num_epochs, 2);

        let options = test_options();
        let index_src = dir.index.source();
        let contents = read_block(&index_src, &options, &footer.epoch_index_handle).unwrap();
        let epoch_index = Block::new(contents).unwrap();
        for epoch in 0..2 {
            let mut iter = epoch_index.iter();
            iter.seek(&epoch_key(epoch, 0));
            assert!(iter.valid(), "Missing meta entry for epoch {}", epoch);
            assert_eq!(iter.key(), epoch_key(epoch, 0).as_slice());
        }
    }

    #[test]
    fn test_latched_error_stops_everything() {
        let mut dir = new_encoder(test_options());
        dir.encoder.add(b"a", b"1").unwrap();
        // Closing the sink under the encoder makes the next table write
        // fail and latch.
        dir.index.close(false).unwrap();
        assert!(dir.encoder.end_table(None).is_err());
        assert!(!dir.encoder.ok());
        assert!(dir.encoder.add(b"b", b"2").is_err());
        assert!(dir.encoder.end_epoch().is_err());
    }

    #[test]
    fn test_filter_write_failure_stays_latched() {
        use std::sync::Mutex;

        // Allows a fixed number of writes, then fails every one after.
        struct QuotaSink {
            inner: MemSink,
            remaining: Mutex<usize>,
        }
        impl crate::log::LogSink for QuotaSink {
            fn write(&self, data: &[u8]) -> crate::error::Result<()> {
                let mut remaining = self.remaining.lock().unwrap();
                if *remaining == 0 {
                    return Err(Error::Io("injected write failure".to_string()));
                }
                *remaining -= 1;
                self.inner.write(data)
            }
            fn tell(&self) -> u64 {
                self.inner.tell()
            }
            fn sync(&self) -> crate::error::Result<()> {
                self.inner.sync()
            }
            fn close(&self, sync: bool) -> crate::error::Result<()> {
                self.inner.close(sync)
            }
        }

        // One allowed index-sink write: the index block lands, the
        // filter write right after it fails.
        let data = MemSink::new();
        let index = QuotaSink {
            inner: MemSink::new(),
            remaining: Mutex::new(1),
        };
        let mut encoder = TableEncoder::new(
            test_options(),
            Arc::new(data.clone()),
            Arc::new(index),
        );

        let mut filter = BloomBlock::new(10, 32);
        filter.add_key(b"alpha");
        encoder.add(b"alpha", b"v").unwrap();
        assert!(encoder.end_table(Some(&mut filter)).is_err());
        assert!(!encoder.ok());

        // Later barriers must keep surfacing the latched failure even
        // though every buffer region is now empty or committed.
        assert!(encoder.end_epoch().is_err());
        assert!(encoder.finish().is_err());
    }

    #[test]
    fn test_tail_padding_alignment() {
        let mut dir = new_encoder(test_options().tail_padding(true).index_buffer(512));
        dir.encoder.add(b"key", b"value").unwrap();
        dir.encoder.finish().unwrap();

        let contents = dir.index.contents();
        assert_eq!(contents.len() % 512, 0);

        // The footer still sits at the exact tail.
        let footer = Footer::decode(&contents).expect("Failed to decode footer");
        assert_eq!(footer.num_epochs, 1);
        assert!(contents.len() >= FOOTER_ENCODED_LENGTH);
    }

    #[test]
    fn test_block_padding_aligns_data_log() {
        let mut dir = new_encoder(
            DirOptions::default()
                .block_size(512)
                .block_padding(true)
                .block_buffer(1 << 10),
        );
        for i in 0..200 {
            let key = format!("key_{:04}", i).into_bytes();
            dir.encoder.add(&key, b"some value bytes").unwrap();
        }
        dir.encoder.end_table(None).unwrap();
        dir.encoder.finish().unwrap();

        assert!(!dir.data.contents().is_empty());
        assert_eq!(dir.data.contents().len() % 512, 0);
    }
}
