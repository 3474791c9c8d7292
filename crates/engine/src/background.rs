//! Notifier worker pool.
//!
//! Runs change-set computations for a scheduling pass on a fixed set of
//! worker threads. The coordinator submits one job per notifier and then
//! drains the pool, so a pass returns only once every notifier has finished.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::error;

use strata_core::{StrataError, StrataResult};

/// Error returned when submitting to a pool that has shut down.
#[derive(Debug, thiserror::Error)]
#[error("notifier pool has been shut down")]
pub struct PoolShutdown;

/// Pool metrics snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Number of jobs waiting in the queue.
    pub queue_depth: usize,
    /// Number of jobs currently being executed by workers.
    pub active_jobs: usize,
    /// Total number of jobs completed since the pool was created.
    pub jobs_completed: u64,
    /// Number of worker threads.
    pub worker_count: usize,
}

type Job = Box<dyn FnOnce() + Send>;

struct PoolInner {
    queue: Mutex<VecDeque<Job>>,
    work_ready: Condvar,
    drain_cond: Condvar,
    shutdown: AtomicBool,
    queue_depth: AtomicUsize,
    active_jobs: AtomicUsize,
    jobs_completed: AtomicU64,
}

/// Fixed pool of threads computing notifier results.
///
/// With zero threads, jobs run inline on the submitting thread.
pub struct NotifierPool {
    inner: Arc<PoolInner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    num_threads: usize,
}

impl NotifierPool {
    /// Create a pool with the given number of worker threads.
    ///
    /// Workers are named `strata-notify-0`, `strata-notify-1`, etc.
    pub fn new(num_threads: usize) -> StrataResult<Self> {
        let inner = Arc::new(PoolInner {
            queue: Mutex::new(VecDeque::new()),
            work_ready: Condvar::new(),
            drain_cond: Condvar::new(),
            shutdown: AtomicBool::new(false),
            queue_depth: AtomicUsize::new(0),
            active_jobs: AtomicUsize::new(0),
            jobs_completed: AtomicU64::new(0),
        });

        let pool = Self {
            inner,
            workers: Mutex::new(Vec::with_capacity(num_threads)),
            num_threads,
        };
        for i in 0..num_threads {
            let inner = Arc::clone(&pool.inner);
            let handle = std::thread::Builder::new()
                .name(format!("strata-notify-{}", i))
                .spawn(move || worker_loop(&inner))
                .map_err(|e| {
                    StrataError::internal(format!("failed to spawn notifier worker: {}", e))
                });
            match handle {
                Ok(handle) => pool.workers.lock().push(handle),
                Err(e) => {
                    pool.shutdown();
                    return Err(e);
                }
            }
        }
        Ok(pool)
    }

    /// Submit a job.
    ///
    /// Returns `Err(PoolShutdown)` once the pool has been shut down.
    pub fn submit(&self, job: impl FnOnce() + Send + 'static) -> Result<(), PoolShutdown> {
        if self.inner.shutdown.load(Ordering::Acquire) {
            return Err(PoolShutdown);
        }
        if self.num_threads == 0 {
            self.inner.active_jobs.fetch_add(1, Ordering::Release);
            let _guard = ActiveJobGuard { inner: &self.inner };
            run_isolated(Box::new(job));
            return Ok(());
        }

        {
            let mut queue = self.inner.queue.lock();
            queue.push_back(Box::new(job));
            self.inner.queue_depth.fetch_add(1, Ordering::Release);
        }
        self.inner.work_ready.notify_one();
        Ok(())
    }

    /// Submit every job and block until all of them have completed.
    pub fn run_batch<I>(&self, jobs: I) -> Result<(), PoolShutdown>
    where
        I: IntoIterator,
        I::Item: FnOnce() + Send + 'static,
    {
        for job in jobs {
            self.submit(job)?;
        }
        self.drain();
        Ok(())
    }

    /// Block until all queued and in-flight jobs have completed.
    ///
    /// Workers keep running afterwards.
    pub fn drain(&self) {
        let mut queue = self.inner.queue.lock();
        while self.inner.queue_depth.load(Ordering::Acquire) > 0
            || self.inner.active_jobs.load(Ordering::Acquire) > 0
        {
            self.inner.drain_cond.wait(&mut queue);
        }
    }

    /// Signal workers to exit and join them.
    ///
    /// Workers finish the queued jobs first.
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::Release);

        // A worker between its shutdown check and wait() holds the queue lock,
        // so taking it here rules out a lost wakeup.
        {
            let _queue = self.inner.queue.lock();
            self.inner.work_ready.notify_all();
        }

        let mut workers = self.workers.lock();
        for handle in workers.drain(..) {
            let _ = handle.join();
        }
    }

    /// Return a snapshot of pool metrics.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            queue_depth: self.inner.queue_depth.load(Ordering::Relaxed),
            active_jobs: self.inner.active_jobs.load(Ordering::Relaxed),
            jobs_completed: self.inner.jobs_completed.load(Ordering::Relaxed),
            worker_count: self.num_threads,
        }
    }
}

impl Drop for NotifierPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Decrements `active_jobs` and wakes drain waiters, even when the job panics.
struct ActiveJobGuard<'a> {
    inner: &'a PoolInner,
}

impl Drop for ActiveJobGuard<'_> {
    fn drop(&mut self) {
        let prev_active = self.inner.active_jobs.fetch_sub(1, Ordering::Release);
        self.inner.jobs_completed.fetch_add(1, Ordering::Relaxed);

        // drain() checks its condition under the queue lock.
        if prev_active == 1 && self.inner.queue_depth.load(Ordering::Acquire) == 0 {
            let _queue = self.inner.queue.lock();
            self.inner.drain_cond.notify_all();
        }
    }
}

fn run_isolated(job: Job) {
    if let Err(e) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(job)) {
        error!(
            target: "strata::notify",
            "notifier job panicked: {:?}",
            e.downcast_ref::<&str>().copied().unwrap_or("(non-string panic)")
        );
    }
}

fn worker_loop(inner: &PoolInner) {
    loop {
        let job = {
            let mut queue = inner.queue.lock();
            loop {
                if let Some(job) = queue.pop_front() {
                    inner.queue_depth.fetch_sub(1, Ordering::Release);
                    inner.active_jobs.fetch_add(1, Ordering::Release);
                    break job;
                }
                if inner.shutdown.load(Ordering::Acquire) {
                    return;
                }
                inner.work_ready.wait(&mut queue);
            }
        };

        let _guard = ActiveJobGuard { inner };
        run_isolated(job);
    }
}
