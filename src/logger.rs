//! Write-path orchestration: double-buffered ingestion with a background
//! compaction worker.
//!
//! Records land in the active write buffer; when it fills, or an epoch
//! or finish barrier arrives, the buffer moves to the immutable slot and
//! a compaction job is posted to the executor. The worker sorts the
//! buffer, feeds the table encoder, and hands the buffer back for reuse.
//! At most one buffer awaits compaction at a time; a second switch waits
//! on the condition variable (or reports `BufferFull` in non-blocking
//! mode).
//!
//! All state transitions happen under one mutex. The worker drops the
//! lock for the sort-and-encode phase, during which it exclusively owns
//! the immutable buffer and the encoder.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Instant;

use crate::buffer::WriteBuffer;
use crate::config::DirOptions;
use crate::encoding::varint_length;
use crate::error::{Error, Result};
use crate::executor::{default_executor, Executor};
use crate::filter::BloomBlock;
use crate::log::LogSink;
use crate::table::TableEncoder;

/// Running totals for one logger instance.
#[derive(Clone, Copy, Debug, Default)]
pub struct CompactionStats {
    /// Bytes appended to the data log.
    pub data_bytes: u64,
    /// Bytes appended to the index log.
    pub index_bytes: u64,
    /// Time spent in the sort-and-encode phase.
    pub write_micros: u64,
}

struct LoggerCore {
    /// Active buffer, accepting writes.
    mem: WriteBuffer,
    /// The other buffer while it is idle.
    spare: Option<WriteBuffer>,
    /// Sealed buffer awaiting compaction.
    imm: Option<WriteBuffer>,
    imm_is_epoch_flush: bool,
    imm_is_finish: bool,
    pending_epoch_flush: bool,
    pending_finish: bool,
    has_bg_compaction: bool,
    /// Owned by the compaction worker while its I/O phase runs.
    encoder: Option<TableEncoder>,
    /// Mirror of the encoder's latched status, readable while the
    /// encoder is checked out.
    latched: Result<()>,
    stats: CompactionStats,
}

struct LoggerInner {
    options: DirOptions,
    data_sink: Arc<dyn LogSink>,
    index_sink: Arc<dyn LogSink>,
    pool: Arc<dyn Executor>,
    /// Per-table byte budget; filling the active buffer past it triggers
    /// a buffer switch.
    tb_bytes: usize,
    bf_bytes: usize,
    core: Mutex<LoggerCore>,
    bg_cv: Condvar,
}

/// The write half of a directory.
pub struct DirLogger {
    inner: Arc<LoggerInner>,
}

impl DirLogger {
    pub fn new(
        options: DirOptions,
        data_sink: Arc<dyn LogSink>,
        index_sink: Arc<dyn LogSink>,
    ) -> Self {
        // Sizing works best when key and value sizes are fixed: larger
        // real entries under-allocate the filter and raise its false
        // positive rate; smaller ones waste filter memory.
        let overhead_per_entry = 4
            + varint_length(options.key_size as u64)
            + varint_length(options.value_size as u64);
        let bytes_per_entry = options.key_size + options.value_size + overhead_per_entry;
        let total_bits_per_entry = 8 * bytes_per_entry + options.bf_bits_per_key;

        let mut entries_per_tb =
            (8.0 * options.memtable_buffer as f64 / total_bits_per_entry as f64).ceil() as usize;
        entries_per_tb >>= options.lg_parts; // Data partitioning
        entries_per_tb /= 2; // Double buffering

        let tb_bytes = entries_per_tb * bytes_per_entry;
        let mut bf_bits = entries_per_tb * options.bf_bits_per_key;
        // Small tables would get filters too short to be selective.
        if bf_bits > 0 && bf_bits < 64 {
            bf_bits = 64;
        }
        let bf_bytes = (bf_bits + 7) / 8;

        tracing::debug!(
            entries_per_tb,
            tb_bytes,
            bf_bytes,
            "sized directory write buffers"
        );

        let mut mem = WriteBuffer::new();
        let mut spare = WriteBuffer::new();
        mem.reserve(entries_per_tb, tb_bytes);
        spare.reserve(entries_per_tb, tb_bytes);

        let encoder = TableEncoder::new(options.clone(), data_sink.clone(), index_sink.clone());
        let pool = options
            .compaction_pool
            .clone()
            .unwrap_or_else(default_executor);

        Self {
            inner: Arc::new(LoggerInner {
                options,
                data_sink,
                index_sink,
                pool,
                tb_bytes,
                bf_bytes,
                core: Mutex::new(LoggerCore {
                    mem,
                    spare: Some(spare),
                    imm: None,
                    imm_is_epoch_flush: false,
                    imm_is_finish: false,
                    pending_epoch_flush: false,
                    pending_finish: false,
                    has_bg_compaction: false,
                    encoder: Some(encoder),
                    latched: Ok(()),
                    stats: CompactionStats::default(),
                }),
                bg_cv: Condvar::new(),
            }),
        }
    }

    /// Appends a record to the directory.
    pub fn add(&self, key: &[u8], value: &[u8]) -> Result<()> {
        if key.is_empty() {
            return Err(Error::InvalidArgument("empty key".to_string()));
        }
        let core = self.inner.core.lock().unwrap();
        let (mut core, status) = self.inner.prepare(core, false, false);
        status?;
        core.mem.add(key, value);
        Ok(())
    }

    /// Seals the current epoch. Every record added before this call
    /// belongs to an epoch no later than the one being sealed. With
    /// `dry_run` only the status and space checks run; nothing is
    /// scheduled.
    pub fn make_epoch(&self, dry_run: bool) -> Result<()> {
        let mut core = self.inner.core.lock().unwrap();
        while core.pending_epoch_flush || core.imm.is_some() || core.has_bg_compaction {
            if dry_run || self.inner.options.non_blocking {
                return Err(Error::BufferFull);
            }
            core = self.inner.bg_cv.wait(core).unwrap();
        }

        if dry_run {
            return core.latched.clone();
        }

        core.pending_epoch_flush = true;
        let (mut core, status) = self.inner.prepare(core, true, false);
        if status.is_err() {
            core.pending_epoch_flush = false; // Avoid blocking future attempts
            return status;
        }
        if !self.inner.options.non_blocking {
            while core.pending_epoch_flush {
                core = self.inner.bg_cv.wait(core).unwrap();
            }
        }
        Ok(())
    }

    /// Seals the final epoch and writes the epoch index and footer.
    pub fn finish(&self, dry_run: bool) -> Result<()> {
        let mut core = self.inner.core.lock().unwrap();
        while core.pending_finish
            || core.pending_epoch_flush
            || core.imm.is_some()
            || core.has_bg_compaction
        {
            if dry_run || self.inner.options.non_blocking {
                return Err(Error::BufferFull);
            }
            core = self.inner.bg_cv.wait(core).unwrap();
        }

        if dry_run {
            return core.latched.clone();
        }

        core.pending_epoch_flush = true;
        core.pending_finish = true;
        let (mut core, status) = self.inner.prepare(core, true, true);
        if status.is_err() {
            core.pending_epoch_flush = false; // Avoid blocking future attempts
            core.pending_finish = false;
            return status;
        }
        if !self.inner.options.non_blocking {
            while core.pending_epoch_flush || core.pending_finish {
                core = self.inner.bg_cv.wait(core).unwrap();
            }
        }
        Ok(())
    }

    /// Blocks until no compaction is in flight.
    pub fn wait(&self) -> Result<()> {
        let mut core = self.inner.core.lock().unwrap();
        while core.has_bg_compaction {
            core = self.inner.bg_cv.wait(core).unwrap();
        }
        Ok(())
    }

    /// Closes the data and index logs. Callers drain in-flight
    /// compactions through [`DirLogger::wait`] first.
    pub fn close(&self, sync: bool) -> Result<()> {
        self.inner.data_sink.close(sync)?;
        self.inner.index_sink.close(sync)
    }

    pub fn stats(&self) -> CompactionStats {
        self.inner.core.lock().unwrap().stats
    }
}

impl Drop for DirLogger {
    fn drop(&mut self) {
        // The worker borrows nothing from us, but an in-flight
        // compaction still owns a buffer; let it finish.
        let mut core = self.inner.core.lock().unwrap();
        while core.has_bg_compaction {
            core = self.inner.bg_cv.wait(core).unwrap();
        }
    }
}

impl LoggerInner {
    /// Makes room in the active buffer, switching buffers and scheduling
    /// compactions as needed. With `flush` set, the active buffer is
    /// handed off even when it has room; `finish` propagates onto the
    /// handed-off buffer. Returns the guard so callers can keep waiting
    /// under the same lock.
    fn prepare<'a>(
        self: &Arc<Self>,
        mut core: MutexGuard<'a, LoggerCore>,
        mut flush: bool,
        mut finish: bool,
    ) -> (MutexGuard<'a, LoggerCore>, Result<()>) {
        loop {
            if core.latched.is_err() {
                let status = core.latched.clone();
                return (core, status);
            }
            if !flush && core.mem.current_buffer_size() < self.tb_bytes {
                // There is room in the current write buffer
                return (core, Ok(()));
            }
            if core.imm.is_some() || core.has_bg_compaction {
                if self.options.non_blocking {
                    return (core, Err(Error::BufferFull));
                }
                core = self.bg_cv.wait(core).unwrap();
                continue;
            }

            // Switch to the other write buffer
            let spare = core.spare.take().expect("spare write buffer missing");
            let imm = std::mem::replace(&mut core.mem, spare);
            core.imm = Some(imm);
            if flush {
                core.imm_is_epoch_flush = true;
                flush = false;
            }
            if finish {
                core.imm_is_finish = true;
                finish = false;
            }
            self.maybe_schedule_compaction(&mut core);
        }
    }

    fn maybe_schedule_compaction(self: &Arc<Self>, core: &mut LoggerCore) {
        if core.has_bg_compaction {
            return; // One is already scheduled
        }
        if core.imm.is_none() {
            return; // Nothing to be scheduled
        }
        core.has_bg_compaction = true;
        let inner = self.clone();
        self.pool.submit(Box::new(move || inner.bg_work()));
    }

    fn bg_work(self: Arc<Self>) {
        let mut core = self.core.lock().unwrap();
        debug_assert!(core.has_bg_compaction);
        let is_epoch_flush = core.imm_is_epoch_flush;
        let is_finish = core.imm_is_finish;
        let mut buffer = core.imm.take().expect("no immutable buffer to compact");
        let mut encoder = core.encoder.take().expect("encoder already checked out");
        drop(core);

        // I/O phase, lock released. The sinks serialize internally.
        let data_offset = self.data_sink.tell();
        let index_offset = self.index_sink.tell();
        let start = Instant::now();

        let mut filter = if self.options.bf_bits_per_key > 0 && self.bf_bytes > 0 {
            Some(BloomBlock::new(self.options.bf_bits_per_key, self.bf_bytes))
        } else {
            None
        };

        buffer.finish();
        let num_entries = buffer.num_entries();
        for (key, value) in buffer.iter() {
            if let Some(filter) = filter.as_mut() {
                filter.add_key(key);
            }
            if encoder.add(key, value).is_err() {
                break;
            }
        }

        if encoder.ok() {
            let _ = encoder.end_table(filter.as_mut());
        }
        if is_epoch_flush {
            let _ = encoder.end_epoch();
        }
        if is_finish {
            let _ = encoder.finish();
        }

        let micros = start.elapsed().as_micros() as u64;
        tracing::debug!(
            entries = num_entries,
            micros,
            epoch_flush = is_epoch_flush,
            finish = is_finish,
            "compacted write buffer"
        );

        let mut core = self.core.lock().unwrap();
        core.stats.data_bytes += self.data_sink.tell() - data_offset;
        core.stats.index_bytes += self.index_sink.tell() - index_offset;
        core.stats.write_micros += micros;
        core.latched = encoder.status();
        core.encoder = Some(encoder);
        buffer.reset();
        core.spare = Some(buffer);
        if is_epoch_flush && core.pending_epoch_flush {
            core.pending_epoch_flush = false;
        }
        if is_finish && core.pending_finish {
            core.pending_finish = false;
        }
        core.imm_is_epoch_flush = false;
        core.imm_is_finish = false;
        core.has_bg_compaction = false;
        // A waiter may already have posted the next buffer.
        self.maybe_schedule_compaction(&mut core);
        self.bg_cv.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::MemSink;

    fn small_options() -> DirOptions {
        // Two-entry tables so buffer switches are easy to provoke.
        DirOptions::default()
            .memtable_buffer(4 * 44 * 2)
            .key_size(8)
            .value_size(32)
            .bf_bits_per_key(0)
            .block_size(256)
            .block_padding(false)
            .block_buffer(1 << 10)
    }

    fn new_logger(options: DirOptions) -> (DirLogger, MemSink, MemSink) {
        let data = MemSink::new();
        let index = MemSink::new();
        let logger = DirLogger::new(options, Arc::new(data.clone()), Arc::new(index.clone()));
        (logger, data, index)
    }

    #[test]
    fn test_empty_key_rejected() {
        let (logger, _data, _index) = new_logger(small_options());
        assert!(matches!(
            logger.add(b"", b"value"),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_finish_writes_footer() {
        let (logger, _data, index) = new_logger(small_options());
        logger.add(b"a", b"1").unwrap();
        logger.finish(false).unwrap();
        logger.wait().unwrap();

        let contents = index.contents();
        let footer = crate::format::Footer::decode(&contents).expect("Failed to decode footer");
        assert_eq!(footer.num_epochs, 1);
        logger.close(false).unwrap();
    }

    #[test]
    fn test_empty_epoch_is_a_no_op() {
        let (logger, _data, index) = new_logger(small_options());
        logger.add(b"a", b"1").unwrap();
        logger.make_epoch(false).unwrap();
        // No records since the barrier: these must not mint epochs.
        logger.make_epoch(false).unwrap();
        logger.make_epoch(false).unwrap();
        logger.finish(false).unwrap();

        let contents = index.contents();
        let footer = crate::format::Footer::decode(&contents).expect("Failed to decode footer");
        assert_eq!(footer.num_epochs, 1);
    }

    #[test]
    fn test_mid_epoch_buffer_switches_make_tables() {
        let (logger, _data, index) = new_logger(small_options());
        // Far more data than one table's budget, all in one epoch.
        for i in 0..64 {
            let key = format!("key_{:04}", i).into_bytes();
            let value = format!("value_{:028}", i).into_bytes();
            logger.add(&key, &value).unwrap();
        }
        logger.finish(false).unwrap();

        let contents = index.contents();
        let footer = crate::format::Footer::decode(&contents).expect("Failed to decode footer");
        assert_eq!(footer.num_epochs, 1);

        let stats = logger.stats();
        assert!(stats.data_bytes > 0);
        assert!(stats.index_bytes > 0);
    }

    #[test]
    fn test_non_blocking_backpressure() {
        use std::sync::mpsc;

        // An executor that holds jobs until released, so both buffers
        // can be made busy deterministically.
        struct GatedExecutor {
            jobs: Mutex<mpsc::Sender<Box<dyn FnOnce() + Send>>>,
        }
        impl Executor for GatedExecutor {
            fn submit(&self, job: Box<dyn FnOnce() + Send>) {
                self.jobs.lock().unwrap().send(job).unwrap();
            }
        }

        let (tx, rx) = mpsc::channel();
        let gate = Arc::new(GatedExecutor {
            jobs: Mutex::new(tx),
        });
        let options = small_options().non_blocking(true).compaction_pool(gate);
        let (logger, _data, _index) = new_logger(options);

        // Fill until the switch happens and the job is parked, then fill
        // the second buffer; the next add must fail fast.
        let mut status = Ok(());
        for i in 0..1000 {
            let key = format!("key_{:04}", i).into_bytes();
            let value = format!("value_{:028}", i).into_bytes();
            status = logger.add(&key, &value);
            if status.is_err() {
                break;
            }
        }
        assert_eq!(status, Err(Error::BufferFull));

        // Drain the parked compaction; writes flow again.
        for job in rx.try_iter() {
            job();
        }
        logger.wait().unwrap();
        logger.add(b"post", b"drain").unwrap();

        // That add handed the still-full second buffer to the gate;
        // release it so drop can drain.
        for job in rx.try_iter() {
            job();
        }
        logger.wait().unwrap();
    }

    #[test]
    fn test_dry_run_reports_status_only() {
        let (logger, _data, index) = new_logger(small_options());
        logger.add(b"a", b"1").unwrap();
        logger.make_epoch(true).unwrap();
        logger.finish(true).unwrap();

        // Dry runs must not have sealed anything.
        assert!(index.contents().is_empty());
        logger.finish(false).unwrap();
        assert!(!index.contents().is_empty());
    }
}
