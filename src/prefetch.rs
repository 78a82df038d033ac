use crate::error::KvHandleError;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{self as std_mpsc, Receiver, Sender};
use std::thread::{self, JoinHandle};
use tracing::{debug, warn};

/// A unit of background work. Jobs with the same shard key run in
/// submission order on one worker.
pub trait Job: Send + 'static {
    fn shard_key(&self) -> u64;
    fn run(self: Box<Self>);
}

#[derive(Debug, Default)]
struct PoolCounters {
    queued: AtomicUsize,
    completed: AtomicU64,
    panicked: AtomicU64,
}

/// Fixed set of named worker threads, one queue each.
pub struct PrefetchPool {
    workers: Vec<Sender<Box<dyn Job>>>,
    threads: Vec<JoinHandle<()>>,
    counters: Arc<PoolCounters>,
}

impl PrefetchPool {
    pub fn new(worker_threads: usize) -> Result<Self, KvHandleError> {
        let worker_count = worker_threads.max(1);
        let counters = Arc::new(PoolCounters::default());
        let mut workers = Vec::with_capacity(worker_count);
        let mut threads = Vec::with_capacity(worker_count);
        for index in 0..worker_count {
            let (tx, rx) = std_mpsc::channel::<Box<dyn Job>>();
            let c = Arc::clone(&counters);
            let handle = thread::Builder::new()
                .name(format!("kvhandle-prefetch-{index}"))
                .spawn(move || run_worker(rx, c))?;
            workers.push(tx);
            threads.push(handle);
        }
        debug!(workers = worker_count, "prefetch pool started");
        Ok(Self {
            workers,
            threads,
            counters,
        })
    }

    /// Queues `job`. Hands it back if the pool no longer accepts work, so
    /// the caller can run it inline.
    pub fn submit(&self, job: Box<dyn Job>) -> Result<(), Box<dyn Job>> {
        if self.workers.is_empty() {
            return Err(job);
        }
        let shard = (job.shard_key() % self.workers.len() as u64) as usize;
        self.counters.queued.fetch_add(1, Ordering::Relaxed);
        if let Err(rejected) = self.workers[shard].send(job) {
            self.counters.queued.fetch_sub(1, Ordering::Relaxed);
            return Err(rejected.0);
        }
        Ok(())
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn queued_jobs(&self) -> usize {
        self.counters.queued.load(Ordering::Relaxed)
    }

    pub fn completed_jobs(&self) -> u64 {
        self.counters.completed.load(Ordering::Relaxed)
    }

    pub fn panicked_jobs(&self) -> u64 {
        self.counters.panicked.load(Ordering::Relaxed)
    }

    /// Stops accepting jobs, lets workers drain their queues, and joins them.
    pub fn shutdown(&mut self) {
        self.workers.clear();
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                warn!("prefetch worker exited by panic");
            }
        }
    }
}

impl Drop for PrefetchPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_worker(rx: Receiver<Box<dyn Job>>, counters: Arc<PoolCounters>) {
    while let Ok(job) = rx.recv() {
        counters.queued.fetch_sub(1, Ordering::Relaxed);
        let shard_key = job.shard_key();
        if catch_unwind(AssertUnwindSafe(|| job.run())).is_err() {
            counters.panicked.fetch_add(1, Ordering::Relaxed);
            warn!(shard_key, "prefetch job panicked");
        } else {
            counters.completed.fetch_add(1, Ordering::Relaxed);
        }
    }
}
