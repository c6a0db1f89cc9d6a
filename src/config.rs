use std::sync::Arc;

use crate::executor::Executor;

/// Configuration for a directory writer or reader.
#[derive(Clone)]
pub struct DirOptions {
    /// Total write buffering in bytes across both buffers and all
    /// partitions (default: 32MB)
    pub memtable_buffer: usize,

    /// Estimated key size in bytes, used for buffer sizing (default: 8)
    pub key_size: usize,

    /// Estimated value size in bytes, used for buffer sizing (default: 32)
    pub value_size: usize,

    /// Bloom filter bits per key; 0 disables filters (default: 8)
    pub bf_bits_per_key: usize,

    /// Data block size in bytes (default: 32KB)
    pub block_size: usize,

    /// Fraction of a data block filled before it is cut (default: 0.996)
    pub block_util: f64,

    /// Zero-pad data blocks to block_size (default: true)
    pub block_padding: bool,

    /// In-memory data accumulation before a commit to the data sink
    /// (default: 2MB)
    pub block_buffer: usize,

    /// Index log write alignment, also the tail padding modulus
    /// (default: 2MB)
    pub index_buffer: usize,

    /// Pad the index log so the footer lands on an index_buffer
    /// boundary (default: false)
    pub tail_padding: bool,

    /// Log2 of the partition count; divides the per-buffer capacity
    /// (default: 0)
    pub lg_parts: u32,

    /// Keys are unique within the directory; duplicate inserts are the
    /// caller's bug and lookups stop at the first hit (default: true)
    pub unique_keys: bool,

    /// Verify block checksums on read (default: false)
    pub verify_checksums: bool,

    /// Return BufferFull instead of waiting when both write buffers are
    /// in use (default: false)
    pub non_blocking: bool,

    /// Executor for background compactions; None selects the
    /// process-global pool (default: None)
    pub compaction_pool: Option<Arc<dyn Executor>>,
}

impl Default for DirOptions {
    fn default() -> Self {
        Self {
            memtable_buffer: 32 << 20,
            key_size: 8,
            value_size: 32,
            bf_bits_per_key: 8,
            block_size: 32 << 10,
            block_util: 0.996,
            block_padding: true,
            block_buffer: 2 << 20,
            index_buffer: 2 << 20,
            tail_padding: false,
            lg_parts: 0,
            unique_keys: true,
            verify_checksums: false,
            non_blocking: false,
            compaction_pool: None,
        }
    }
}

impl std::fmt::Debug for DirOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirOptions")
            .field("memtable_buffer", &self.memtable_buffer)
            .field("key_size", &self.key_size)
            .field("value_size", &self.value_size)
            .field("bf_bits_per_key", &self.bf_bits_per_key)
            .field("block_size", &self.block_size)
            .field("block_util", &self.block_util)
            .field("block_padding", &self.block_padding)
            .field("block_buffer", &self.block_buffer)
            .field("index_buffer", &self.index_buffer)
            .field("tail_padding", &self.tail_padding)
            .field("lg_parts", &self.lg_parts)
            .field("unique_keys", &self.unique_keys)
            .field("verify_checksums", &self.verify_checksums)
            .field("non_blocking", &self.non_blocking)
            .field("compaction_pool", &self.compaction_pool.is_some())
            .finish()
    }
}

impl DirOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set total write buffering in bytes
    pub fn memtable_buffer(mut self, bytes: usize) -> Self {
        self.memtable_buffer = bytes;
        self
    }

    /// Set estimated key size
    pub fn key_size(mut self, bytes: usize) -> Self {
        self.key_size = bytes;
        self
    }

    /// Set estimated value size
    pub fn value_size(mut self, bytes: usize) -> Self {
        self.value_size = bytes;
        self
    }

    /// Set bloom filter density; 0 disables filters
    pub fn bf_bits_per_key(mut self, bits: usize) -> Self {
        self.bf_bits_per_key = bits;
        self
    }

    /// Set data block size
    pub fn block_size(mut self, bytes: usize) -> Self {
        self.block_size = bytes;
        self
    }

    /// Set data block fill fraction
    pub fn block_util(mut self, util: f64) -> Self {
        self.block_util = util;
        self
    }

    /// Enable or disable data block padding
    pub fn block_padding(mut self, enabled: bool) -> Self {
        self.block_padding = enabled;
        self
    }

    /// Set the in-memory commit threshold for the data log
    pub fn block_buffer(mut self, bytes: usize) -> Self {
        self.block_buffer = bytes;
        self
    }

    /// Set the index log alignment
    pub fn index_buffer(mut self, bytes: usize) -> Self {
        self.index_buffer = bytes;
        self
    }

    /// Enable or disable index tail padding
    pub fn tail_padding(mut self, enabled: bool) -> Self {
        self.tail_padding = enabled;
        self
    }

    /// Set the log2 partition count
    pub fn lg_parts(mut self, lg: u32) -> Self {
        self.lg_parts = lg;
        self
    }

    /// Declare whether keys are unique
    pub fn unique_keys(mut self, unique: bool) -> Self {
        self.unique_keys = unique;
        self
    }

    /// Enable checksum verification on reads
    pub fn verify_checksums(mut self, enabled: bool) -> Self {
        self.verify_checksums = enabled;
        self
    }

    /// Fail fast on buffer pressure instead of waiting
    pub fn non_blocking(mut self, enabled: bool) -> Self {
        self.non_blocking = enabled;
        self
    }

    /// Run compactions on the given executor
    pub fn compaction_pool(mut self, pool: Arc<dyn Executor>) -> Self {
        self.compaction_pool = Some(pool);
        self
    }
}
