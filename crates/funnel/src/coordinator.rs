//! The public coalescer façade.
//!
//! A [`Coalescer`] owns the submission ring, the live configuration
//! snapshot, and the batch driver thread. Callers pick a delivery modality
//! per request:
//!
//! - [`execute`](Coalescer::execute) — block until the batched result
//!   arrives;
//! - [`submit`](Coalescer::submit) — get a [`ResultHandle`] back once the
//!   submission is accepted (blocking `get`, bounded `get_timeout`,
//!   `cancel`, or `.await`);
//! - [`try_submit`](Coalescer::try_submit) — as `submit`, but fail fast with
//!   [`CoalesceError::BufferFull`] instead of blocking on backpressure;
//! - [`submit_lazy`](Coalescer::submit_lazy) — a cold [`LazyRequest`] future
//!   that submits on first poll, never before.
//!
//! Reconfiguration is live: [`update_config`](Coalescer::update_config)
//! atomically replaces the snapshot (config, pool, callback) and retunes the
//! ring capacity in place; batches already in flight keep the snapshot they
//! were formed under.

use std::hash::Hash;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::task::{Context, Poll};
use std::thread::JoinHandle;
use std::time::Duration;

use funnel_core::{
    BoxError, CoalesceError, CoalesceResult, CoalescerConfig, CoalescerMetrics,
    DEFAULT_WORKER_THREADS, MetricsSnapshot, ResultHandle,
};
use tracing::{debug, trace};

use crate::batcher::Batcher;
use crate::pool::{FixedThreadPool, WorkerPool};
use crate::ring::RingBuffer;
use crate::submission::Submission;

/// The batch callback: one output per unique input, in input order.
pub type BatchFn<A, R> = Arc<dyn Fn(Vec<A>) -> Result<Vec<R>, BoxError> + Send + Sync>;

/// Immutable configuration snapshot a batch runs under.
pub(crate) struct Snapshot<A, R> {
    pub(crate) config: CoalescerConfig,
    pub(crate) pool: Arc<dyn WorkerPool>,
    pub(crate) callback: BatchFn<A, R>,
}

/// State shared between the façade, the driver thread, and lazy requests.
pub(crate) struct CoalescerShared<A, R> {
    pub(crate) ring: RingBuffer<Submission<A, R>>,
    pub(crate) snapshot: RwLock<Arc<Snapshot<A, R>>>,
    pub(crate) metrics: Arc<CoalescerMetrics>,
    shutdown: AtomicBool,
}

impl<A, R> CoalescerShared<A, R> {
    /// The current configuration snapshot.
    pub(crate) fn snapshot(&self) -> Arc<Snapshot<A, R>> {
        Arc::clone(&self.snapshot.read().expect("snapshot lock poisoned"))
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Admit one submission, blocking on backpressure.
    fn submit_one(&self, args: A) -> CoalesceResult<ResultHandle<R>> {
        if self.is_shutdown() {
            return Err(CoalesceError::Shutdown);
        }
        let (submission, handle) = Submission::new(args);
        self.ring.put(submission)?;
        self.metrics.total_submitted.fetch_add(1, Ordering::Relaxed);
        trace!(target: "funnel.coordinator", pending = self.ring.len(), "submission accepted");
        Ok(handle)
    }

    /// Admit one submission without blocking.
    fn try_submit_one(&self, args: A) -> CoalesceResult<ResultHandle<R>> {
        if self.is_shutdown() {
            return Err(CoalesceError::Shutdown);
        }
        let (submission, handle) = Submission::new(args);
        match self.ring.try_put(submission) {
            Ok(()) => {
                self.metrics.total_submitted.fetch_add(1, Ordering::Relaxed);
                Ok(handle)
            }
            Err(err) => {
                if matches!(err, CoalesceError::BufferFull { .. }) {
                    self.metrics.rejected_full.fetch_add(1, Ordering::Relaxed);
                }
                Err(err)
            }
        }
    }
}

/// A coalescing coordinator for requests of argument type `A` and result
/// type `R`.
///
/// Multi-argument requests instantiate `A` as a tuple; structural
/// equality/hash over `A` is the dedup identity. `R` must be `Clone` so one
/// deduplicated result can fan out to several submitters; "not found" style
/// results instantiate `R` as an `Option`.
///
/// Each coalescer is independent: it owns one driver thread, one submission
/// ring, and a configuration snapshot. Dropping it shuts it down
/// gracefully, draining pending submissions into final batches first.
pub struct Coalescer<A, R> {
    shared: Arc<CoalescerShared<A, R>>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl<A, R> std::fmt::Debug for Coalescer<A, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coalescer")
            .field("config", &self.config())
            .field("pending", &self.pending_count())
            .finish_non_exhaustive()
    }
}

impl<A, R> Coalescer<A, R>
where
    A: Clone + Eq + Hash + Send + 'static,
    R: Clone + Send + 'static,
{
    /// Create a coalescer with the given window and batch bound, a built-in
    /// 4-worker pool, an 8192-slot buffer, and dedup enabled.
    ///
    /// # Errors
    ///
    /// Returns [`CoalesceError::InvalidConfig`] for out-of-range settings.
    pub fn new<F>(window: Duration, max_size: usize, callback: F) -> CoalesceResult<Self>
    where
        F: Fn(Vec<A>) -> Result<Vec<R>, BoxError> + Send + Sync + 'static,
    {
        Self::with_config(
            CoalescerConfig::new(window, max_size),
            Arc::new(FixedThreadPool::new(DEFAULT_WORKER_THREADS)),
            Arc::new(callback),
        )
    }

    /// Create a coalescer with explicit configuration, pool, and callback.
    ///
    /// # Errors
    ///
    /// Returns [`CoalesceError::InvalidConfig`] for out-of-range settings.
    ///
    /// # Panics
    ///
    /// Panics if the operating system refuses to spawn the driver thread.
    pub fn with_config(
        config: CoalescerConfig,
        pool: Arc<dyn WorkerPool>,
        callback: BatchFn<A, R>,
    ) -> CoalesceResult<Self> {
        config.validate()?;
        let shared = Arc::new(CoalescerShared {
            ring: RingBuffer::new(config.buffer_capacity),
            snapshot: RwLock::new(Arc::new(Snapshot {
                config,
                pool,
                callback,
            })),
            metrics: Arc::new(CoalescerMetrics::default()),
            shutdown: AtomicBool::new(false),
        });

        let driver = std::thread::Builder::new()
            .name("funnel-batcher".into())
            .spawn({
                let shared = Arc::clone(&shared);
                move || Batcher::new(shared).run()
            })
            .expect("failed to spawn batch driver thread");

        Ok(Self {
            shared,
            driver: Mutex::new(Some(driver)),
        })
    }

    // ── Submission ───────────────────────────────────────────────────

    /// Submit and block until the batched result (or failure) arrives.
    ///
    /// # Errors
    ///
    /// Re-raises the batch's failure ([`CoalesceError::CallbackFailed`],
    /// [`CoalesceError::ArityMismatch`]) or the admission error.
    pub fn execute(&self, args: A) -> CoalesceResult<R> {
        self.shared.submit_one(args)?.get()
    }

    /// Submit and return a deferred handle once the submission is accepted.
    /// Blocks only on backpressure.
    ///
    /// # Errors
    ///
    /// Returns [`CoalesceError::Shutdown`] after shutdown.
    pub fn submit(&self, args: A) -> CoalesceResult<ResultHandle<R>> {
        self.shared.submit_one(args)
    }

    /// As [`submit`](Self::submit), but never blocks.
    ///
    /// # Errors
    ///
    /// Returns [`CoalesceError::BufferFull`] when the buffer has no space.
    pub fn try_submit(&self, args: A) -> CoalesceResult<ResultHandle<R>> {
        self.shared.try_submit_one(args)
    }

    /// A cold request: nothing is submitted until the returned future is
    /// first polled. Each call yields one independent submission; dropping
    /// an un-polled request submits nothing, and dropping a polled one
    /// cancels it while it is still queued.
    #[must_use]
    pub fn submit_lazy(&self, args: A) -> LazyRequest<A, R> {
        LazyRequest {
            shared: Arc::clone(&self.shared),
            args: Some(args),
            handle: None,
        }
    }

    // ── Reconfiguration ──────────────────────────────────────────────

    /// Atomically replace the configuration snapshot. Batches already
    /// formed keep the snapshot they captured; the next window runs under
    /// the new one. A buffer-capacity change is applied in place without
    /// disturbing queued submissions. Thread-safe and idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`CoalesceError::InvalidConfig`] and leaves the previous
    /// snapshot untouched when the new config is out of range.
    pub fn update_config(
        &self,
        config: CoalescerConfig,
        pool: Arc<dyn WorkerPool>,
        callback: BatchFn<A, R>,
    ) -> CoalesceResult<()> {
        config.validate()?;
        let capacity = config.buffer_capacity;
        {
            let mut snapshot = self.shared.snapshot.write().expect("snapshot lock poisoned");
            let capacity_changed = snapshot.config.buffer_capacity != capacity;
            *snapshot = Arc::new(Snapshot {
                config,
                pool,
                callback,
            });
            if capacity_changed {
                self.shared.ring.set_capacity(capacity);
            }
        }
        self.shared
            .metrics
            .config_updates
            .fetch_add(1, Ordering::Relaxed);
        debug!(target: "funnel.coordinator", "configuration replaced");
        Ok(())
    }
}

impl<A, R> Coalescer<A, R> {
    // ── Lifecycle ────────────────────────────────────────────────────

    /// Graceful shutdown: reject further submissions, drain pending ones
    /// into final batches, dispatch them, and stop the driver. Idempotent;
    /// called automatically on drop.
    pub fn shutdown(&self) {
        let was_down = self.shared.shutdown.swap(true, Ordering::SeqCst);
        self.shared.ring.shutdown();
        if !was_down {
            debug!(target: "funnel.coordinator", "shutdown requested");
        }
        if let Some(driver) = self
            .driver
            .lock()
            .expect("driver handle lock poisoned")
            .take()
        {
            let _ = driver.join();
        }
    }

    // ── Accessors ────────────────────────────────────────────────────

    /// The current configuration (the serializable part of the snapshot).
    #[must_use]
    pub fn config(&self) -> CoalescerConfig {
        self.shared.snapshot().config.clone()
    }

    /// Live telemetry counters.
    #[must_use]
    pub fn metrics(&self) -> Arc<CoalescerMetrics> {
        Arc::clone(&self.shared.metrics)
    }

    /// Point-in-time copy of the telemetry counters.
    #[must_use]
    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot()
    }

    /// Submissions currently buffered (not yet drawn into a batch).
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.shared.ring.len()
    }
}

impl<A, R> Drop for Coalescer<A, R> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ---------------------------------------------------------------------------
// LazyRequest
// ---------------------------------------------------------------------------

/// A cold, single-value request future.
///
/// Nothing is submitted until the first poll; backpressure blocking (if the
/// buffer is full at that moment) lands on the polling thread. Dropping the
/// future after it has submitted cancels the request if it is still queued,
/// mirroring downstream cancellation; dropping it un-polled is free.
pub struct LazyRequest<A, R> {
    shared: Arc<CoalescerShared<A, R>>,
    args: Option<A>,
    handle: Option<ResultHandle<R>>,
}

// No field is ever pinned; `poll` moves `args` out by value.
impl<A, R> Unpin for LazyRequest<A, R> {}

impl<A, R> LazyRequest<A, R> {
    /// Whether the first poll has already submitted this request.
    #[must_use]
    pub fn is_submitted(&self) -> bool {
        self.handle.is_some()
    }
}

impl<A, R> std::fmt::Debug for LazyRequest<A, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LazyRequest")
            .field("submitted", &self.is_submitted())
            .finish_non_exhaustive()
    }
}

impl<A, R> std::future::Future for LazyRequest<A, R>
where
    A: Clone + Eq + Hash + Send + 'static,
    R: Clone + Send + 'static,
{
    type Output = CoalesceResult<R>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if this.handle.is_none() {
            let Some(args) = this.args.take() else {
                // Polled again after a pre-submission error was returned.
                return Poll::Ready(Err(CoalesceError::Disconnected));
            };
            match this.shared.submit_one(args) {
                Ok(handle) => this.handle = Some(handle),
                Err(err) => return Poll::Ready(Err(err)),
            }
            trace!(target: "funnel.coordinator", "lazy request submitted on first poll");
        }
        match this.handle.as_mut() {
            Some(handle) => Pin::new(handle).poll(cx),
            None => Poll::Ready(Err(CoalesceError::Disconnected)),
        }
    }
}

impl<A, R> Drop for LazyRequest<A, R> {
    fn drop(&mut self) {
        if let Some(handle) = &self.handle {
            // Downstream cancellation: discard a queued submission. Once
            // its batch has begun, delivery cannot be revoked; the result
            // simply goes unobserved here.
            handle.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::future::Future;
    use std::sync::Barrier;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::task::{Wake, Waker};
    use std::thread;
    use std::time::Instant;

    use super::*;
    use crate::pool::InlinePool;

    // ── Test plumbing ────────────────────────────────────────────────

    struct ThreadWaker(thread::Thread);

    impl Wake for ThreadWaker {
        fn wake(self: Arc<Self>) {
            self.0.unpark();
        }
    }

    fn block_on<F: Future>(fut: F) -> F::Output {
        let waker = Waker::from(Arc::new(ThreadWaker(thread::current())));
        let mut cx = Context::from_waker(&waker);
        let mut fut = std::pin::pin!(fut);
        loop {
            match fut.as_mut().poll(&mut cx) {
                Poll::Ready(value) => return value,
                Poll::Pending => thread::park(),
            }
        }
    }

    /// Callback that multiplies each argument by ten and records the length
    /// of every invocation's input.
    fn times_ten(lengths: &Arc<Mutex<Vec<usize>>>) -> BatchFn<u32, u32> {
        let lengths = Arc::clone(lengths);
        Arc::new(move |args: Vec<u32>| {
            lengths.lock().unwrap().push(args.len());
            Ok(args.into_iter().map(|a| a * 10).collect())
        })
    }

    fn config(window_ms: u64, max_size: usize) -> CoalescerConfig {
        CoalescerConfig {
            window_ms,
            max_size,
            ..CoalescerConfig::default()
        }
    }

    // ── Size close ───────────────────────────────────────────────────

    #[test]
    fn size_close_delivers_to_each_caller() {
        let lengths = Arc::new(Mutex::new(Vec::new()));
        let coalescer = Arc::new(
            Coalescer::with_config(
                config(5_000, 3),
                Arc::new(InlinePool),
                times_ten(&lengths),
            )
            .unwrap(),
        );

        let start = Instant::now();
        let workers: Vec<_> = [1u32, 2, 3]
            .into_iter()
            .map(|arg| {
                let coalescer = Arc::clone(&coalescer);
                thread::spawn(move || (arg, coalescer.execute(arg)))
            })
            .collect();
        for worker in workers {
            let (arg, result) = worker.join().unwrap();
            assert_eq!(result.unwrap(), arg * 10);
        }

        // Reaching max_size closed the batch long before the window.
        assert!(start.elapsed() < Duration::from_secs(5));
        assert_eq!(*lengths.lock().unwrap(), vec![3]);
        let snap = coalescer.metrics_snapshot();
        assert_eq!(snap.total_batches, 1);
        assert_eq!(snap.size_closes, 1);
        assert_eq!(snap.window_closes, 0);
    }

    // ── Window close ─────────────────────────────────────────────────

    #[test]
    fn window_close_dispatches_a_lone_submission() {
        let lengths = Arc::new(Mutex::new(Vec::new()));
        let coalescer = Coalescer::with_config(
            config(50, 3),
            Arc::new(InlinePool),
            times_ten(&lengths),
        )
        .unwrap();

        let start = Instant::now();
        assert_eq!(coalescer.execute(7).unwrap(), 70);
        let elapsed = start.elapsed();

        // The lone submission waited out the 50ms window.
        assert!(elapsed >= Duration::from_millis(40), "closed too early: {elapsed:?}");
        assert_eq!(*lengths.lock().unwrap(), vec![1]);
        let snap = coalescer.metrics_snapshot();
        assert_eq!(snap.window_closes, 1);
        assert_eq!(snap.size_closes, 0);
    }

    // ── Dedup ────────────────────────────────────────────────────────

    #[test]
    fn duplicate_args_collapse_to_one_invocation() {
        let lengths = Arc::new(Mutex::new(Vec::new()));
        let coalescer = Arc::new(
            Coalescer::with_config(
                config(300, 8),
                Arc::new(InlinePool),
                times_ten(&lengths),
            )
            .unwrap(),
        );

        let barrier = Arc::new(Barrier::new(3));
        let workers: Vec<_> = (0..3)
            .map(|_| {
                let coalescer = Arc::clone(&coalescer);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    coalescer.execute(5)
                })
            })
            .collect();
        for worker in workers {
            assert_eq!(worker.join().unwrap().unwrap(), 50);
        }

        assert_eq!(*lengths.lock().unwrap(), vec![1]);
        let snap = coalescer.metrics_snapshot();
        assert_eq!(snap.total_batches, 1);
        assert_eq!(snap.duplicates_collapsed, 2);
    }

    #[test]
    fn dedup_disabled_passes_duplicates_through() {
        let lengths = Arc::new(Mutex::new(Vec::new()));
        let coalescer = Arc::new(
            Coalescer::with_config(
                CoalescerConfig {
                    remove_duplicates: false,
                    ..config(300, 3)
                },
                Arc::new(InlinePool),
                times_ten(&lengths),
            )
            .unwrap(),
        );

        let workers: Vec<_> = (0..3)
            .map(|_| {
                let coalescer = Arc::clone(&coalescer);
                thread::spawn(move || coalescer.execute(5))
            })
            .collect();
        for worker in workers {
            assert_eq!(worker.join().unwrap().unwrap(), 50);
        }

        assert_eq!(*lengths.lock().unwrap(), vec![3]);
        assert_eq!(coalescer.metrics_snapshot().duplicates_collapsed, 0);
    }

    // ── Arity mismatch ───────────────────────────────────────────────

    #[test]
    fn wrong_result_count_fails_all_members() {
        let coalescer = Arc::new(
            Coalescer::with_config(
                config(2_000, 3),
                Arc::new(InlinePool),
                Arc::new(|_args: Vec<u32>| Ok(vec![1u32, 2])),
            )
            .unwrap(),
        );

        let workers: Vec<_> = [1u32, 2, 3]
            .into_iter()
            .map(|arg| {
                let coalescer = Arc::clone(&coalescer);
                thread::spawn(move || coalescer.execute(arg))
            })
            .collect();
        for worker in workers {
            assert!(matches!(
                worker.join().unwrap(),
                Err(CoalesceError::ArityMismatch {
                    expected: 3,
                    actual: 2
                })
            ));
        }
        assert_eq!(coalescer.metrics_snapshot().arity_mismatches, 1);
    }

    // ── Callback failure isolation ───────────────────────────────────

    #[test]
    fn failed_batch_does_not_poison_the_next() {
        let first_call = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&first_call);
        let coalescer = Coalescer::with_config(
            config(20, 1),
            Arc::new(InlinePool),
            Arc::new(move |args: Vec<u32>| {
                if flag.swap(false, Ordering::SeqCst) {
                    Err("backend down".into())
                } else {
                    Ok(args.into_iter().map(|a| a * 10).collect())
                }
            }),
        )
        .unwrap();

        match coalescer.execute(1) {
            Err(CoalesceError::CallbackFailed { source }) => {
                assert!(source.to_string().contains("backend down"));
            }
            other => panic!("expected CallbackFailed, got {other:?}"),
        }
        // The batcher kept going; a healthy callback serves the next batch.
        assert_eq!(coalescer.execute(2).unwrap(), 20);
        assert_eq!(coalescer.metrics_snapshot().callback_failures, 1);
    }

    // ── Backpressure ─────────────────────────────────────────────────

    #[test]
    fn slow_batches_lose_no_submissions() {
        let coalescer = Arc::new(
            Coalescer::with_config(
                CoalescerConfig {
                    window_ms: 5,
                    max_size: 1,
                    buffer_capacity: 2,
                    remove_duplicates: false,
                },
                Arc::new(FixedThreadPool::new(1)),
                Arc::new(|args: Vec<u32>| {
                    thread::sleep(Duration::from_millis(100));
                    Ok(args.into_iter().map(|a| a * 2).collect())
                }),
            )
            .unwrap(),
        );

        let workers: Vec<_> = [1u32, 2, 3]
            .into_iter()
            .map(|arg| {
                let coalescer = Arc::clone(&coalescer);
                thread::spawn(move || (arg, coalescer.execute(arg)))
            })
            .collect();
        for worker in workers {
            let (arg, result) = worker.join().unwrap();
            assert_eq!(result.unwrap(), arg * 2);
        }
        assert_eq!(coalescer.metrics_snapshot().total_batched, 3);
    }

    // ── Deferred handles ─────────────────────────────────────────────

    #[test]
    fn get_timeout_is_waiter_local() {
        let lengths = Arc::new(Mutex::new(Vec::new()));
        let coalescer = Coalescer::with_config(
            config(200, 8),
            Arc::new(InlinePool),
            times_ten(&lengths),
        )
        .unwrap();

        let handle = coalescer.submit(6).unwrap();
        assert!(matches!(
            handle.get_timeout(Duration::from_millis(30)),
            Err(CoalesceError::Timeout { .. })
        ));
        // The request is unaffected and completes on window close.
        assert_eq!(handle.get().unwrap(), 60);
    }

    #[test]
    fn deferred_handle_awaits_as_a_future() {
        let lengths = Arc::new(Mutex::new(Vec::new()));
        let coalescer = Coalescer::with_config(
            config(20, 8),
            Arc::new(InlinePool),
            times_ten(&lengths),
        )
        .unwrap();

        let handle = coalescer.submit(4).unwrap();
        assert_eq!(block_on(handle).unwrap(), 40);
    }

    #[test]
    fn cancel_while_queued_discards_the_submission() {
        // A slow inline dispatch keeps the driver busy, so the second
        // submission stays queued long enough to cancel deterministically.
        let coalescer = Coalescer::with_config(
            CoalescerConfig {
                window_ms: 10,
                max_size: 1,
                buffer_capacity: 8,
                remove_duplicates: false,
            },
            Arc::new(InlinePool),
            Arc::new(|args: Vec<u32>| {
                thread::sleep(Duration::from_millis(150));
                Ok(args.into_iter().map(|a| a * 10).collect())
            }),
        )
        .unwrap();

        let busy = coalescer.submit(1).unwrap();
        // Give the driver time to enter the slow callback.
        thread::sleep(Duration::from_millis(40));
        let queued = coalescer.submit(9).unwrap();

        assert!(queued.cancel());
        assert!(queued.is_cancelled());
        assert!(matches!(queued.get(), Err(CoalesceError::Cancelled)));
        assert_eq!(busy.get().unwrap(), 10);

        // The cancelled submission is dropped at drain time, never batched.
        let metrics = coalescer.metrics();
        for _ in 0..100 {
            if metrics.cancelled_discards.load(Ordering::Relaxed) == 1 {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(metrics.cancelled_discards.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.total_batched.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn cancel_after_dispatch_begins_cannot_revoke_the_result() {
        let coalescer = Coalescer::with_config(
            CoalescerConfig {
                window_ms: 10,
                max_size: 1,
                buffer_capacity: 8,
                remove_duplicates: false,
            },
            Arc::new(FixedThreadPool::new(1)),
            Arc::new(|args: Vec<u32>| {
                thread::sleep(Duration::from_millis(100));
                Ok(args.into_iter().map(|a| a * 10).collect())
            }),
        )
        .unwrap();

        let handle = coalescer.submit(7).unwrap();
        // The driver claims the submission as it drains it; by now the
        // batch is closed and the callback is mid-flight.
        thread::sleep(Duration::from_millis(40));
        assert!(!handle.cancel(), "delivery cannot be revoked once the batch runs");
        assert_eq!(handle.get().unwrap(), 70);
        assert!(!handle.is_cancelled());
    }

    // ── Lazy requests ────────────────────────────────────────────────

    #[test]
    fn lazy_request_submits_only_on_first_poll() {
        let lengths = Arc::new(Mutex::new(Vec::new()));
        let coalescer = Coalescer::with_config(
            config(30, 8),
            Arc::new(InlinePool),
            times_ten(&lengths),
        )
        .unwrap();

        let lazy = coalescer.submit_lazy(4);
        thread::sleep(Duration::from_millis(80));
        assert!(!lazy.is_submitted());
        assert_eq!(coalescer.metrics_snapshot().total_submitted, 0);

        assert_eq!(block_on(lazy).unwrap(), 40);
        assert_eq!(coalescer.metrics_snapshot().total_submitted, 1);
    }

    #[test]
    fn dropping_unpolled_lazy_request_submits_nothing() {
        let lengths = Arc::new(Mutex::new(Vec::new()));
        let coalescer = Coalescer::with_config(
            config(20, 8),
            Arc::new(InlinePool),
            times_ten(&lengths),
        )
        .unwrap();

        drop(coalescer.submit_lazy(4));
        thread::sleep(Duration::from_millis(60));
        assert_eq!(coalescer.metrics_snapshot().total_submitted, 0);
        assert!(lengths.lock().unwrap().is_empty());
    }

    #[test]
    fn each_lazy_request_is_an_independent_submission() {
        let lengths = Arc::new(Mutex::new(Vec::new()));
        let coalescer = Coalescer::with_config(
            CoalescerConfig {
                remove_duplicates: false,
                ..config(30, 8)
            },
            Arc::new(InlinePool),
            times_ten(&lengths),
        )
        .unwrap();

        let first = coalescer.submit_lazy(4);
        let second = coalescer.submit_lazy(4);
        assert_eq!(block_on(first).unwrap(), 40);
        assert_eq!(block_on(second).unwrap(), 40);
        assert_eq!(coalescer.metrics_snapshot().total_submitted, 2);
    }

    // ── Reconfiguration ──────────────────────────────────────────────

    #[test]
    fn update_config_swaps_callback_and_timing() {
        let lengths = Arc::new(Mutex::new(Vec::new()));
        let coalescer = Coalescer::with_config(
            config(400, 8),
            Arc::new(InlinePool),
            times_ten(&lengths),
        )
        .unwrap();

        coalescer
            .update_config(
                CoalescerConfig {
                    buffer_capacity: 4096,
                    ..config(20, 4)
                },
                Arc::new(InlinePool),
                Arc::new(|args: Vec<u32>| Ok(args.into_iter().map(|a| a * 100).collect())),
            )
            .unwrap();

        let updated = coalescer.config();
        assert_eq!(updated.window_ms, 20);
        assert_eq!(updated.max_size, 4);
        assert_eq!(updated.buffer_capacity, 4096);

        let start = Instant::now();
        assert_eq!(coalescer.execute(3).unwrap(), 300);
        // The new 20ms window applies, not the original 400ms one.
        assert!(start.elapsed() < Duration::from_millis(350));
        assert_eq!(coalescer.metrics_snapshot().config_updates, 1);
    }

    #[test]
    fn invalid_update_is_rejected_and_keeps_the_old_snapshot() {
        let lengths = Arc::new(Mutex::new(Vec::new()));
        let coalescer = Coalescer::with_config(
            config(20, 4),
            Arc::new(InlinePool),
            times_ten(&lengths),
        )
        .unwrap();

        let err = coalescer
            .update_config(
                config(20, 0),
                Arc::new(InlinePool),
                Arc::new(|_: Vec<u32>| Ok(Vec::new())),
            )
            .unwrap_err();
        assert!(matches!(err, CoalesceError::InvalidConfig { .. }));

        assert_eq!(coalescer.config().max_size, 4);
        assert_eq!(coalescer.execute(2).unwrap(), 20);
        assert_eq!(coalescer.metrics_snapshot().config_updates, 0);
    }

    // ── Shutdown ─────────────────────────────────────────────────────

    #[test]
    fn submissions_after_shutdown_are_rejected() {
        let lengths = Arc::new(Mutex::new(Vec::new()));
        let coalescer = Coalescer::with_config(
            config(20, 4),
            Arc::new(InlinePool),
            times_ten(&lengths),
        )
        .unwrap();

        coalescer.shutdown();
        assert!(matches!(coalescer.execute(1), Err(CoalesceError::Shutdown)));
        assert!(matches!(
            coalescer.try_submit(1),
            Err(CoalesceError::Shutdown)
        ));
        assert!(matches!(
            block_on(coalescer.submit_lazy(1)),
            Err(CoalesceError::Shutdown)
        ));
    }

    #[test]
    fn shutdown_drains_pending_submissions() {
        let lengths = Arc::new(Mutex::new(Vec::new()));
        let coalescer = Coalescer::with_config(
            CoalescerConfig {
                remove_duplicates: false,
                ..config(10_000, 8)
            },
            Arc::new(InlinePool),
            times_ten(&lengths),
        )
        .unwrap();

        let first = coalescer.submit(1).unwrap();
        let second = coalescer.submit(2).unwrap();

        // Without the drain these would wait out a 10s window.
        coalescer.shutdown();
        assert_eq!(first.get().unwrap(), 10);
        assert_eq!(second.get().unwrap(), 20);
        assert!(coalescer.metrics_snapshot().drain_closes >= 1);
    }

    #[test]
    fn shutdown_is_idempotent() {
        let lengths = Arc::new(Mutex::new(Vec::new()));
        let coalescer = Coalescer::with_config(
            config(20, 4),
            Arc::new(InlinePool),
            times_ten(&lengths),
        )
        .unwrap();
        coalescer.shutdown();
        coalescer.shutdown();
    }

    // ── Defaults & accessors ─────────────────────────────────────────

    #[test]
    fn new_uses_documented_defaults() {
        let coalescer: Coalescer<u32, u32> =
            Coalescer::new(Duration::from_millis(15), 8, |args: Vec<u32>| {
                Ok(args.into_iter().map(|a| a + 1).collect())
            })
            .unwrap();

        let config = coalescer.config();
        assert_eq!(config.window_ms, 15);
        assert_eq!(config.max_size, 8);
        assert_eq!(config.buffer_capacity, 8192);
        assert!(config.remove_duplicates);

        assert_eq!(coalescer.execute(1).unwrap(), 2);
    }

    #[test]
    fn rejects_invalid_construction() {
        let result: CoalesceResult<Coalescer<u32, u32>> =
            Coalescer::new(Duration::from_millis(10), 0, |_: Vec<u32>| Ok(Vec::new()));
        assert!(matches!(
            result,
            Err(CoalesceError::InvalidConfig { .. })
        ));
    }

    #[test]
    fn try_submit_accepts_while_space_remains() {
        let lengths = Arc::new(Mutex::new(Vec::new()));
        let coalescer = Coalescer::with_config(
            config(20, 4),
            Arc::new(InlinePool),
            times_ten(&lengths),
        )
        .unwrap();

        let handle = coalescer.try_submit(3).unwrap();
        assert_eq!(handle.get().unwrap(), 30);
    }

    #[test]
    fn debug_and_pending_count() {
        let lengths = Arc::new(Mutex::new(Vec::new()));
        let coalescer = Coalescer::with_config(
            config(20, 4),
            Arc::new(InlinePool),
            times_ten(&lengths),
        )
        .unwrap();

        assert_eq!(coalescer.pending_count(), 0);
        let text = format!("{coalescer:?}");
        assert!(text.contains("Coalescer"));
        assert!(text.contains("pending"));
    }

    // ── Tuple arguments ──────────────────────────────────────────────

    #[test]
    fn multi_argument_requests_use_tuples() {
        let coalescer: Coalescer<(String, u32), String> = Coalescer::with_config(
            config(200, 2),
            Arc::new(InlinePool),
            Arc::new(|args: Vec<(String, u32)>| {
                Ok(args
                    .into_iter()
                    .map(|(name, id)| format!("{name}#{id}"))
                    .collect())
            }),
        )
        .unwrap();

        let coalescer = Arc::new(coalescer);
        let left = {
            let coalescer = Arc::clone(&coalescer);
            thread::spawn(move || coalescer.execute(("user".into(), 1)))
        };
        let right = {
            let coalescer = Arc::clone(&coalescer);
            thread::spawn(move || coalescer.execute(("user".into(), 2)))
        };
        assert_eq!(left.join().unwrap().unwrap(), "user#1");
        assert_eq!(right.join().unwrap().unwrap(), "user#2");
    }

    // ── Counter sanity across a burst ────────────────────────────────

    #[test]
    fn metrics_account_for_a_burst() {
        let invocations = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&invocations);
        let coalescer = Arc::new(
            Coalescer::with_config(
                CoalescerConfig {
                    remove_duplicates: false,
                    ..config(30, 4)
                },
                Arc::new(InlinePool),
                Arc::new(move |args: Vec<u32>| {
                    seen.fetch_add(1, Ordering::SeqCst);
                    Ok(args.into_iter().map(|a| a * 10).collect())
                }),
            )
            .unwrap(),
        );

        let workers: Vec<_> = (0..12u32)
            .map(|arg| {
                let coalescer = Arc::clone(&coalescer);
                thread::spawn(move || coalescer.execute(arg).unwrap())
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        let snap = coalescer.metrics_snapshot();
        assert_eq!(snap.total_submitted, 12);
        assert_eq!(snap.total_batched, 12);
        assert!(snap.total_batches >= 3, "12 submissions, max_size 4");
        assert_eq!(
            snap.total_batches,
            invocations.load(Ordering::SeqCst) as u64
        );
    }
}
