//! Background task execution.
//!
//! Compactions run off the user thread on whatever [`Executor`] the
//! directory options name; by default they share one process-global
//! worker pool, created on first use.

use std::sync::mpsc;
use std::sync::{Arc, Mutex, OnceLock};
use std::thread;

type Job = Box<dyn FnOnce() + Send>;

/// Target for background work.
pub trait Executor: Send + Sync {
    /// Runs `job` on some worker thread, after previously submitted jobs.
    fn submit(&self, job: Job);
}

/// A fixed-size pool of worker threads draining a shared queue.
pub struct ThreadPool {
    sender: Mutex<mpsc::Sender<Job>>,
}

impl ThreadPool {
    pub fn new(threads: usize) -> Self {
        debug_assert!(threads >= 1);
        let (sender, receiver) = mpsc::channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));
        for i in 0..threads {
            let receiver = receiver.clone();
            thread::Builder::new()
                .name(format!("epochdir-bg-{i}"))
                .spawn(move || loop {
                    let job = receiver.lock().unwrap().recv();
                    match job {
                        Ok(job) => job(),
                        Err(_) => break, // Pool dropped
                    }
                })
                .expect("failed to spawn background worker");
        }
        Self {
            sender: Mutex::new(sender),
        }
    }
}

impl Executor for ThreadPool {
    fn submit(&self, job: Job) {
        // Workers outlive the sender; a send only fails once the pool is
        // being torn down, at which point the job is dropped.
        let _ = self.sender.lock().unwrap().send(job);
    }
}

/// The process-global compaction pool.
pub fn default_executor() -> Arc<dyn Executor> {
    static POOL: OnceLock<Arc<ThreadPool>> = OnceLock::new();
    POOL.get_or_init(|| Arc::new(ThreadPool::new(1))).clone()
}
