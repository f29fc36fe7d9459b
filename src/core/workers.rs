//! Decode thread pool.
//!
//! Work-stealing deques fed by one global injector:
//! - every request goes through the injector, so new work is picked up first
//! - idle workers steal from each other
//! - epoch tagging drops requests that became stale while queued (a scrub
//!   jump bumps the epoch)
//!
//! A pool with zero threads runs jobs inline on the caller. Tests rely on this
//! to make decode completion deterministic.

use crossbeam::deque::{Injector, Steal, Stealer, Worker};
use log::{error, trace, warn};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

type Job = Box<dyn FnOnce() + Send + 'static>;

pub struct Workers {
    injector: Arc<Injector<Job>>,
    handles: Vec<thread::JoinHandle<()>>,
    /// Shared with CacheManager
    current_epoch: Arc<AtomicU64>,
    shutdown: Arc<AtomicBool>,
    /// Jobs queued or running
    in_flight: Arc<AtomicUsize>,
}

impl std::fmt::Debug for Workers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workers")
            .field("threads", &self.handles.len())
            .field("in_flight", &self.in_flight.load(Ordering::Relaxed))
            .finish()
    }
}

/// Run one job, keeping the worker alive if the decoder panics.
fn run_job(job: Job, in_flight: &AtomicUsize) {
    if catch_unwind(AssertUnwindSafe(job)).is_err() {
        error!("Decode job panicked");
    }
    in_flight.fetch_sub(1, Ordering::AcqRel);
}

fn find_job(local: &Worker<Job>, injector: &Injector<Job>, stealers: &[Stealer<Job>]) -> Option<Job> {
    if let Some(job) = local.pop() {
        return Some(job);
    }
    loop {
        match injector.steal_batch_and_pop(local) {
            Steal::Success(job) => return Some(job),
            Steal::Retry => continue,
            Steal::Empty => break,
        }
    }
    stealers.iter().find_map(|s| s.steal().success())
}

impl Workers {
    /// Spawn `num_threads` decode threads sharing `epoch` with the cache manager.
    pub fn new(num_threads: usize, epoch: Arc<AtomicU64>) -> Self {
        let injector: Arc<Injector<Job>> = Arc::new(Injector::new());
        let shutdown = Arc::new(AtomicBool::new(false));
        let in_flight = Arc::new(AtomicUsize::new(0));

        let locals: Vec<Worker<Job>> = (0..num_threads).map(|_| Worker::new_fifo()).collect();
        let stealers: Vec<Stealer<Job>> = locals.iter().map(|w| w.stealer()).collect();
        let mut handles = Vec::with_capacity(num_threads);

        for (worker_id, local) in locals.into_iter().enumerate() {
            let injector = Arc::clone(&injector);
            let shutdown = Arc::clone(&shutdown);
            let in_flight = Arc::clone(&in_flight);
            let stealers = stealers.clone();

            let spawned = thread::Builder::new()
                .name(format!("cutstrip-decode-{}", worker_id))
                .spawn(move || {
                    trace!("Worker {} started", worker_id);
                    loop {
                        if let Some(job) = find_job(&local, &injector, &stealers) {
                            run_job(job, &in_flight);
                            continue;
                        }
                        if shutdown.load(Ordering::Relaxed) {
                            break;
                        }
                        thread::sleep(Duration::from_millis(1));
                    }
                    trace!("Worker {} stopped", worker_id);
                });
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => warn!("Failed to spawn decode thread {}: {}", worker_id, e),
            }
        }

        if num_threads > 0 && handles.is_empty() {
            error!("No decode thread could be spawned, running jobs inline");
        }
        trace!("Workers initialized: {} threads", handles.len());

        Self {
            injector,
            handles,
            current_epoch: epoch,
            shutdown,
            in_flight,
        }
    }

    /// Pool that runs every job on the calling thread.
    pub fn inline(epoch: Arc<AtomicU64>) -> Self {
        Self::new(0, epoch)
    }

    pub fn is_inline(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn threads(&self) -> usize {
        self.handles.len()
    }

    pub fn execute<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        if self.is_inline() {
            run_job(Box::new(f), &self.in_flight);
        } else {
            self.injector.push(Box::new(f));
        }
    }

    pub fn current_epoch(&self) -> u64 {
        self.current_epoch.load(Ordering::Relaxed)
    }

    /// Run `f` only if the epoch still equals `epoch` when a worker picks it up.
    ///
    /// `on_cancel` runs instead when the request went stale, so callers can
    /// clear their loading flags.
    pub fn execute_with_epoch<F, C>(&self, epoch: u64, f: F, on_cancel: C)
    where
        F: FnOnce() + Send + 'static,
        C: FnOnce() + Send + 'static,
    {
        let current_epoch = Arc::clone(&self.current_epoch);
        self.execute(move || {
            if current_epoch.load(Ordering::Relaxed) == epoch {
                f();
            } else {
                trace!("Skipping stale job (epoch {})", epoch);
                on_cancel();
            }
        });
    }

    /// Jobs queued or running.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Block until the queue drains or `timeout` passes. Returns true when idle.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.in_flight() > 0 {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(1));
        }
        true
    }
}

impl Drop for Workers {
    fn drop(&mut self) {
        let num_threads = self.handles.len();
        trace!("Workers shutting down ({} threads)...", num_threads);
        self.shutdown.store(true, Ordering::SeqCst);

        // stale jobs are skipped by epoch, so threads finish quickly
        let deadline = Instant::now() + Duration::from_millis(500);
        for handle in std::mem::take(&mut self.handles) {
            while !handle.is_finished() {
                if Instant::now() >= deadline {
                    trace!("Shutdown timeout reached, exiting anyway");
                    return;
                }
                thread::sleep(Duration::from_millis(1));
            }
            let _ = handle.join();
        }
        trace!("All {} workers stopped", num_threads);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_jobs_run_on_threads() {
        let workers = Workers::new(2, Arc::new(AtomicU64::new(0)));
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..50 {
            let c = Arc::clone(&count);
            workers.execute(move || {
                c.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert!(workers.wait_idle(Duration::from_secs(5)));
        assert_eq!(count.load(Ordering::SeqCst), 50);
    }

    #[test]
    fn test_stale_epoch_is_cancelled() {
        let epoch = Arc::new(AtomicU64::new(3));
        let workers = Workers::inline(Arc::clone(&epoch));
        let ran = Arc::new(AtomicUsize::new(0));
        let cancelled = Arc::new(AtomicUsize::new(0));

        let (r, c) = (Arc::clone(&ran), Arc::clone(&cancelled));
        workers.execute_with_epoch(2, move || { r.fetch_add(1, Ordering::SeqCst); }, move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        let r = Arc::clone(&ran);
        workers.execute_with_epoch(3, move || { r.fetch_add(1, Ordering::SeqCst); }, || {});

        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(cancelled.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panicking_job_does_not_kill_pool() {
        let workers = Workers::new(1, Arc::new(AtomicU64::new(0)));
        workers.execute(|| panic!("decoder blew up"));
        let done = Arc::new(AtomicBool::new(false));
        let d = Arc::clone(&done);
        workers.execute(move || d.store(true, Ordering::SeqCst));
        assert!(workers.wait_idle(Duration::from_secs(5)));
        assert!(done.load(Ordering::SeqCst));
    }
}
