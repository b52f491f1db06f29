//! Per-caller submission records and closed batches.

use std::sync::Arc;
use std::time::Instant;

use funnel_core::{CoalesceError, CompletionSlot, ResultHandle};

use crate::coordinator::Snapshot;

/// One caller's pending request: the argument value, the completion slot the
/// result fans back through, and the admission instant the batch window is
/// measured from.
pub(crate) struct Submission<A, R> {
    pub(crate) args: A,
    pub(crate) slot: Arc<CompletionSlot<R>>,
    pub(crate) submitted_at: Instant,
}

impl<A, R> Submission<A, R> {
    /// Create a submission and the caller-side handle observing it.
    pub(crate) fn new(args: A) -> (Self, ResultHandle<R>) {
        let slot = Arc::new(CompletionSlot::new());
        let handle = ResultHandle::new(Arc::clone(&slot));
        (
            Self {
                args,
                slot,
                submitted_at: Instant::now(),
            },
            handle,
        )
    }

    /// Claim this submission for batch delivery. Fails when the caller
    /// cancelled it while it was still queued; once claimed it can no
    /// longer be cancelled and the batch's result is delivered.
    pub(crate) fn claim(&self) -> bool {
        self.slot.claim()
    }
}

impl<A, R> Drop for Submission<A, R> {
    fn drop(&mut self) {
        // Liveness backstop: a submission that falls out of the pipeline
        // unresolved (e.g. a worker pool that discards jobs) must not
        // strand its waiter. After normal delivery this is a no-op.
        self.slot.resolve(Err(CoalesceError::Disconnected));
    }
}

/// A closed batch: members in admission order plus the configuration
/// snapshot captured when the batch's window opened. In-flight batches never
/// observe later reconfiguration.
pub(crate) struct Batch<A, R> {
    pub(crate) members: Vec<Submission<A, R>>,
    pub(crate) snapshot: Arc<Snapshot<A, R>>,
}
