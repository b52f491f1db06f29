//! The timing/sizing driver at the heart of the coalescer.
//!
//! One driver thread per coalescer owns the ring's consumer end. It parks
//! until the first submission arrives, opens a window measured from that
//! submission's admission, keeps draining until the batch is full or the
//! window elapses, then hands the closed batch to the worker pool and goes
//! back to idle — never waiting for a batch to finish executing. Shutdown
//! drains whatever remains into final batches before the driver exits.

use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Instant;

use funnel_core::CoalescerMetrics;
use tracing::{debug, trace};

use crate::coordinator::CoalescerShared;
use crate::dispatch;
use crate::pool::Job;
use crate::submission::{Batch, Submission};

/// Why a batch closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseReason {
    /// The batch reached `max_size`.
    Size,
    /// The window elapsed since the first member's admission.
    Window,
    /// Shutdown drained the remainder.
    Drain,
}

impl CloseReason {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Size => "size",
            Self::Window => "window",
            Self::Drain => "drain",
        }
    }
}

/// Claim drained submissions for delivery. A successful claim locks out
/// late cancellation; submissions cancelled while still queued fail the
/// claim, are discarded here, and never join a batch.
fn keep_live<A, R>(
    drained: Vec<Submission<A, R>>,
    metrics: &CoalescerMetrics,
) -> Vec<Submission<A, R>> {
    let mut live = Vec::with_capacity(drained.len());
    for submission in drained {
        if submission.claim() {
            live.push(submission);
        } else {
            metrics.cancelled_discards.fetch_add(1, Ordering::Relaxed);
            trace!(target: "funnel.batcher", "cancelled submission discarded at drain");
        }
    }
    live
}

/// The driver loop. Spawned on a dedicated thread by the coalescer.
pub(crate) struct Batcher<A, R> {
    shared: Arc<CoalescerShared<A, R>>,
}

impl<A, R> Batcher<A, R>
where
    A: Clone + Eq + Hash + Send + 'static,
    R: Clone + Send + 'static,
{
    pub(crate) const fn new(shared: Arc<CoalescerShared<A, R>>) -> Self {
        Self { shared }
    }

    pub(crate) fn run(&self) {
        debug!(target: "funnel.batcher", "batch driver started");
        loop {
            // Idle: park until the first submission (or shutdown).
            let first = self.shared.ring.poll_batch(1, None);
            if first.is_empty() {
                if self.shared.ring.is_shutdown() {
                    break;
                }
                continue;
            }
            let mut members = keep_live(first, &self.shared.metrics);
            if members.is_empty() {
                continue;
            }

            // The window opens at the first member's admission; the batch
            // runs under the snapshot captured here.
            let snapshot = self.shared.snapshot();
            let max_size = snapshot.config.max_size;
            let deadline = members[0].submitted_at + snapshot.config.window();

            let reason = loop {
                if members.len() >= max_size {
                    break CloseReason::Size;
                }
                if Instant::now() >= deadline {
                    break CloseReason::Window;
                }
                let budget = max_size - members.len();
                let more = self.shared.ring.poll_batch(budget, Some(deadline));
                if more.is_empty() {
                    if self.shared.ring.is_shutdown() {
                        break CloseReason::Drain;
                    }
                    break CloseReason::Window;
                }
                members.extend(keep_live(more, &self.shared.metrics));
            };

            let batch_size = members.len();
            let metrics = Arc::clone(&self.shared.metrics);
            metrics.total_batches.fetch_add(1, Ordering::Relaxed);
            metrics
                .total_batched
                .fetch_add(batch_size as u64, Ordering::Relaxed);
            match reason {
                CloseReason::Size => metrics.size_closes.fetch_add(1, Ordering::Relaxed),
                CloseReason::Window => metrics.window_closes.fetch_add(1, Ordering::Relaxed),
                CloseReason::Drain => metrics.drain_closes.fetch_add(1, Ordering::Relaxed),
            };
            debug!(
                target: "funnel.batcher",
                batch_size,
                reason = reason.as_str(),
                pending = self.shared.ring.len(),
                "batch closed"
            );

            let batch = Batch {
                members,
                snapshot: Arc::clone(&snapshot),
            };
            let job: Job = Box::new(move || dispatch::run_batch(batch, &metrics));
            snapshot.pool.submit(job);
        }
        debug!(target: "funnel.batcher", "batch driver stopped");
    }
}
