//! Worker Pool
//!
//! Fixed-size pool executing step bodies and resumed continuations.
//!
//! - One global injector for jobs submitted from any thread (callers,
//!   event loop, other workers)
//! - Per-worker FIFO deque filled by batch steals from the injector;
//!   idle workers steal from their siblings
//! - Idle workers park with a timeout and are woken round-robin on submit
//!
//! Shutdown closes the pool to new jobs and lets workers drain everything
//! already queued before they exit.

use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_deque::{Injector, Steal, Stealer, Worker};
use crossbeam_utils::sync::{Parker, Unparker};
use log::{debug, error};

/// A unit of work for the pool.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

struct PoolShared {
    injector: Injector<Job>,
    stealers: Vec<Stealer<Job>>,
    unparkers: Vec<Unparker>,
    next_unpark: AtomicUsize,
    accepting: AtomicBool,
    executed: AtomicU64,
    panicked: AtomicU64,
    park_timeout: Duration,
}

impl PoolShared {
    fn unpark_one(&self) {
        let n = self.unparkers.len();
        if n == 0 {
            return;
        }
        let idx = self.next_unpark.fetch_add(1, Ordering::Relaxed) % n;
        self.unparkers[idx].unpark();
    }

    fn unpark_all(&self) {
        for u in &self.unparkers {
            u.unpark();
        }
    }
}

/// Fixed-size pool of worker threads.
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Starts `workers` threads named `{name}-worker-{index}`.
    ///
    /// If a thread cannot be spawned, the threads already running are
    /// stopped and the error is returned.
    pub fn start(workers: usize, name: &str, park_timeout: Duration) -> io::Result<Self> {
        if workers == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "worker pool needs at least one thread",
            ));
        }

        let mut locals = Vec::with_capacity(workers);
        let mut stealers = Vec::with_capacity(workers);
        let mut parkers = Vec::with_capacity(workers);
        let mut unparkers = Vec::with_capacity(workers);

        for _ in 0..workers {
            let local = Worker::new_fifo();
            stealers.push(local.stealer());
            locals.push(local);

            let parker = Parker::new();
            unparkers.push(parker.unparker().clone());
            parkers.push(parker);
        }

        let shared = Arc::new(PoolShared {
            injector: Injector::new(),
            stealers,
            unparkers,
            next_unpark: AtomicUsize::new(0),
            accepting: AtomicBool::new(true),
            executed: AtomicU64::new(0),
            panicked: AtomicU64::new(0),
            park_timeout,
        });

        let pool = Self {
            shared: Arc::clone(&shared),
            threads: Mutex::new(Vec::with_capacity(workers)),
        };

        for (index, (local, parker)) in locals.into_iter().zip(parkers).enumerate() {
            let shared = Arc::clone(&shared);
            let spawned = thread::Builder::new()
                .name(format!("{}-worker-{}", name, index))
                .spawn(move || worker_loop(index, &shared, &local, &parker));

            match spawned {
                Ok(handle) => pool.lock_threads().push(handle),
                Err(e) => {
                    error!("Failed to spawn worker thread {}: {}", index, e);
                    pool.shutdown();
                    return Err(e);
                }
            }
        }

        debug!("Worker pool '{}' started with {} threads", name, workers);
        Ok(pool)
    }

    fn lock_threads(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.threads.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queues a job.
    ///
    /// # Errors
    ///
    /// Returns `Err(job)` once the pool has been shut down, so the caller
    /// can decide what to do with it.
    pub fn submit(&self, job: Job) -> Result<(), Job> {
        if !self.shared.accepting.load(Ordering::Acquire) {
            return Err(job);
        }
        self.shared.injector.push(job);
        self.shared.unpark_one();
        Ok(())
    }

    /// Number of worker threads.
    pub fn size(&self) -> usize {
        self.shared.stealers.len()
    }

    /// Jobs run to completion so far.
    pub fn executed(&self) -> u64 {
        self.shared.executed.load(Ordering::Relaxed)
    }

    /// Jobs that panicked so far.
    pub fn panicked(&self) -> u64 {
        self.shared.panicked.load(Ordering::Relaxed)
    }

    /// Stops accepting jobs, drains the queues and joins every worker.
    ///
    /// Idempotent. Must not be called from a worker thread.
    pub fn shutdown(&self) {
        self.shared.accepting.store(false, Ordering::Release);
        self.shared.unpark_all();

        let threads: Vec<_> = self.lock_threads().drain(..).collect();
        let count = threads.len();
        let current = thread::current().id();
        for handle in threads {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                error!("Worker thread terminated abnormally");
            }
        }

        if count > 0 {
            debug!(
                "Worker pool stopped ({} threads, {} jobs, {} panicked)",
                count,
                self.executed(),
                self.panicked()
            );
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(index: usize, shared: &PoolShared, local: &Worker<Job>, parker: &Parker) {
    loop {
        match find_job(index, shared, local) {
            Some(job) => run_job(shared, job),
            None => {
                if !shared.accepting.load(Ordering::Acquire) && shared.injector.is_empty() {
                    break;
                }
                parker.park_timeout(shared.park_timeout);
            }
        }
    }
}

fn find_job(index: usize, shared: &PoolShared, local: &Worker<Job>) -> Option<Job> {
    if let Some(job) = local.pop() {
        return Some(job);
    }

    loop {
        match shared.injector.steal_batch_and_pop(local) {
            Steal::Success(job) => return Some(job),
            Steal::Retry => continue,
            Steal::Empty => break,
        }
    }

    let n = shared.stealers.len();
    for offset in 1..n {
        let victim = &shared.stealers[(index + offset) % n];
        loop {
            match victim.steal() {
                Steal::Success(job) => return Some(job),
                Steal::Retry => continue,
                Steal::Empty => break,
            }
        }
    }

    None
}

fn run_job(shared: &PoolShared, job: Job) {
    if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
        shared.panicked.fetch_add(1, Ordering::Relaxed);
        error!("Job panicked on worker thread");
    }
    shared.executed.fetch_add(1, Ordering::Relaxed);
}
