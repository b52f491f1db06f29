//! Worker-pool seam for batch execution.
//!
//! The coalescer only needs "accepts a closure to run; may execute
//! concurrently", so the seam is a one-method trait. [`FixedThreadPool`] is
//! the built-in default; [`InlinePool`] runs jobs on the submitting thread
//! for deterministic tests; with the `rayon` feature enabled, a
//! `rayon::ThreadPool` satisfies the trait as-is.

use std::sync::mpsc::{Receiver, Sender};
use std::sync::{Arc, Mutex, mpsc};
use std::thread::{self, JoinHandle};

use tracing::trace;

/// A unit of work handed to a pool.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Something that runs jobs, possibly concurrently.
///
/// Implementations must not drop a job without running it during normal
/// operation; a pool torn down with queued jobs should run them to
/// completion first. (Waiters are still protected if a pool misbehaves —
/// an unexecuted batch resolves its members to a disconnection error — but
/// results are lost.)
pub trait WorkerPool: Send + Sync {
    /// Enqueue a job for execution.
    fn submit(&self, job: Job);
}

// ---------------------------------------------------------------------------
// FixedThreadPool
// ---------------------------------------------------------------------------

/// A fixed-size pool of named worker threads over a shared job channel.
///
/// Dropping the pool closes the channel, lets workers finish every queued
/// job, and joins them.
pub struct FixedThreadPool {
    sender: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for FixedThreadPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FixedThreadPool")
            .field("workers", &self.workers.len())
            .finish_non_exhaustive()
    }
}

impl FixedThreadPool {
    /// Spawn a pool with `workers` threads (clamped to at least 1).
    ///
    /// # Panics
    ///
    /// Panics if the operating system refuses to spawn a thread.
    #[must_use]
    pub fn new(workers: usize) -> Self {
        let workers = workers.max(1);
        let (sender, receiver) = mpsc::channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));

        let workers = (0..workers)
            .map(|i| {
                let receiver = Arc::clone(&receiver);
                thread::Builder::new()
                    .name(format!("funnel-worker-{i}"))
                    .spawn(move || worker_loop(&receiver))
                    .expect("failed to spawn funnel worker thread")
            })
            .collect();

        Self {
            sender: Some(sender),
            workers,
        }
    }

    /// Number of worker threads.
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }
}

fn worker_loop(receiver: &Mutex<Receiver<Job>>) {
    loop {
        // Hold the receiver lock only while picking up the next job.
        let job = {
            let guard = receiver.lock().expect("worker channel lock poisoned");
            guard.recv()
        };
        match job {
            Ok(job) => {
                trace!(target: "funnel.pool", "running job");
                job();
            }
            // Channel closed: pool dropped and queue fully drained.
            Err(_) => break,
        }
    }
}

impl WorkerPool for FixedThreadPool {
    fn submit(&self, job: Job) {
        if let Some(sender) = &self.sender {
            // Send only fails when every worker has exited; the dropped job
            // resolves its batch members to a disconnection error.
            let _ = sender.send(job);
        }
    }
}

impl Drop for FixedThreadPool {
    fn drop(&mut self) {
        drop(self.sender.take());
        let current = thread::current().id();
        for worker in self.workers.drain(..) {
            // The final owner of a shared pool can be a job running on one
            // of its own workers; that thread cannot join itself and is
            // left to exit on the closed channel.
            if worker.thread().id() == current {
                continue;
            }
            let _ = worker.join();
        }
    }
}

// ---------------------------------------------------------------------------
// InlinePool
// ---------------------------------------------------------------------------

/// Runs every job synchronously on the submitting thread.
///
/// Serializes batch execution with batch formation, which makes tests
/// deterministic; not intended for production use.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlinePool;

impl WorkerPool for InlinePool {
    fn submit(&self, job: Job) {
        job();
    }
}

// ---------------------------------------------------------------------------
// rayon adapter
// ---------------------------------------------------------------------------

#[cfg(feature = "rayon")]
impl WorkerPool for rayon::ThreadPool {
    fn submit(&self, job: Job) {
        self.spawn(job);
    }
}
