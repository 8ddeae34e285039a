//! Worker Pool
//!
//! Fixed set of OS threads draining a shared job queue. Everything that may
//! block on disk I/O runs here: eviction writes, async pops and clears.
//!
//! Jobs run to completion; there is no cancellation. The pool tracks how
//! many jobs are queued or running so callers can wait for it to drain
//! before tearing state down.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error};

use crate::error::{Error, Result};

type Job = Box<dyn FnOnce() + Send + 'static>;

enum Message {
    Run(Job),
    Shutdown,
}

/// Count of queued and running jobs
#[derive(Default)]
struct InFlight {
    count: Mutex<usize>,
    idle: Condvar,
}

impl InFlight {
    fn begin(&self) {
        *self.count.lock() += 1;
    }

    fn finish(&self) {
        let mut count = self.count.lock();
        *count -= 1;
        if *count == 0 {
            self.idle.notify_all();
        }
    }

    fn current(&self) -> usize {
        *self.count.lock()
    }

    fn wait_idle(&self) {
        let mut count = self.count.lock();
        while *count > 0 {
            self.idle.wait(&mut count);
        }
    }

    fn wait_idle_for(&self, timeout: Duration) -> bool {
        let mut count = self.count.lock();
        let deadline = std::time::Instant::now() + timeout;
        while *count > 0 {
            if self.idle.wait_until(&mut count, deadline).timed_out() {
                return *count == 0;
            }
        }
        true
    }
}

/// Decrements the in-flight count even if the job panics
struct FinishGuard<'a>(&'a InFlight);

impl Drop for FinishGuard<'_> {
    fn drop(&mut self) {
        self.0.finish();
    }
}

/// Cloneable handle for submitting jobs
#[derive(Clone)]
pub struct Spawner {
    tx: Sender<Message>,
    in_flight: Arc<InFlight>,
}

impl Spawner {
    /// Queue a job
    pub fn spawn<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.in_flight.begin();
        if self.tx.send(Message::Run(Box::new(job))).is_err() {
            self.in_flight.finish();
            error!("Worker pool is shut down, dropping job");
        }
    }
}

/// Bounded worker pool
pub struct WorkerPool {
    spawner: Spawner,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Start `width` worker threads
    pub fn new(width: usize) -> Result<Self> {
        if width == 0 {
            return Err(Error::Config("worker pool width must be > 0".to_string()));
        }

        let (tx, rx) = channel::unbounded::<Message>();
        let in_flight = Arc::new(InFlight::default());

        let workers = (0..width)
            .map(|i| {
                let rx = rx.clone();
                let in_flight = Arc::clone(&in_flight);
                std::thread::Builder::new()
                    .name(format!("ticket-worker-{}", i))
                    .spawn(move || worker_loop(rx, in_flight))
                    .map_err(|e| Error::Internal(format!("Failed to spawn worker: {}", e)))
            })
            .collect::<Result<Vec<_>>>()?;

        debug!(width, "Worker pool started");

        Ok(Self {
            spawner: Spawner { tx, in_flight },
            workers,
        })
    }

    /// Handle for submitting jobs
    pub fn spawner(&self) -> Spawner {
        self.spawner.clone()
    }

    /// Queue a job
    pub fn spawn<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.spawner.spawn(job);
    }

    /// Number of queued or running jobs
    pub fn in_flight(&self) -> usize {
        self.spawner.in_flight.current()
    }

    /// Block until no job is queued or running
    ///
    /// Must not be called from a worker thread.
    pub fn wait_idle(&self) {
        self.spawner.in_flight.wait_idle();
    }

    /// Like [`WorkerPool::wait_idle`] with a deadline; true if the pool drained
    pub fn wait_idle_for(&self, timeout: Duration) -> bool {
        self.spawner.in_flight.wait_idle_for(timeout)
    }

    /// Number of worker threads
    pub fn width(&self) -> usize {
        self.workers.len()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        for _ in 0..self.workers.len() {
            let _ = self.spawner.tx.send(Message::Shutdown);
        }
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                error!("Worker thread panicked");
            }
        }
    }
}

fn worker_loop(rx: Receiver<Message>, in_flight: Arc<InFlight>) {
    while let Ok(message) = rx.recv() {
        match message {
            Message::Run(job) => {
                let _guard = FinishGuard(&in_flight);
                if std::panic::catch_unwind(std::panic::AssertUnwindSafe(job)).is_err() {
                    error!("Worker job panicked");
                }
            }
            Message::Shutdown => break,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_zero_width_rejected() {
        assert!(matches!(WorkerPool::new(0), Err(Error::Config(_))));
    }

    #[test]
    fn test_runs_every_job() {
        let pool = WorkerPool::new(4).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..1000 {
            let counter = Arc::clone(&counter);
            pool.spawn(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }

        pool.wait_idle();
        assert_eq!(counter.load(Ordering::SeqCst), 1000);
        assert_eq!(pool.in_flight(), 0);
    }

    #[test]
    fn test_width_bounds_concurrency() {
        let pool = WorkerPool::new(3).unwrap();
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        for _ in 0..30 {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            pool.spawn(move || {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(2));
                running.fetch_sub(1, Ordering::SeqCst);
            });
        }

        pool.wait_idle();
        assert_eq!(pool.width(), 3);
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[test]
    fn test_panicking_job_does_not_stall_pool() {
        let pool = WorkerPool::new(1).unwrap();
        let done = Arc::new(AtomicUsize::new(0));

        pool.spawn(|| panic!("boom"));
        let flag = Arc::clone(&done);
        pool.spawn(move || {
            flag.store(1, Ordering::SeqCst);
        });

        assert!(pool.wait_idle_for(Duration::from_secs(5)));
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_spawn_after_shutdown_is_dropped() {
        let pool = WorkerPool::new(2).unwrap();
        let spawner = pool.spawner();
        drop(pool);

        spawner.spawn(|| {});
        assert_eq!(spawner.in_flight.current(), 0);
    }
}
