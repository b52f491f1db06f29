//! Single-assignment completion slots.
//!
//! A [`CompletionSlot`] is the one primitive under every result-delivery
//! modality: the first `resolve` wins, later attempts are ignored, and
//! resolution wakes blocking waiters (via [`Condvar`]) as well as any
//! registered task [`Waker`]s. [`ResultHandle`] is the consumer-side view:
//! blocking `get`, bounded `get_timeout`, non-blocking `try_get`,
//! best-effort `cancel`, and a [`Future`] implementation — all over the same
//! slot, so delivery stays runtime-agnostic.
//!
//! Cancellation and delivery are arbitrated by [`CompletionSlot::claim`]:
//! the batch driver claims a slot when it draws the request into a batch,
//! and a claimed slot can no longer be cancelled — at-most-once delivery
//! cannot be revoked once the batch has begun.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Condvar, Mutex};
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

use crate::error::{CoalesceError, CoalesceResult};

// ---------------------------------------------------------------------------
// CompletionSlot
// ---------------------------------------------------------------------------

/// Internal state behind the slot's mutex.
struct SlotState<T> {
    /// The resolved outcome, once a writer has won the assignment race.
    outcome: Option<CoalesceResult<T>>,
    /// Set when the request has been drawn into a batch; from then on
    /// delivery can no longer be revoked and `cancel` is a no-op.
    claimed: bool,
    /// Tasks to wake on resolution.
    wakers: Vec<Waker>,
}

/// A one-shot, single-assignment result cell.
///
/// Producers call [`resolve`](Self::resolve) exactly once per logical
/// completion; a second attempt is ignored and reported as lost via the
/// return value. Consumers observe the slot through [`ResultHandle`] or the
/// blocking accessors directly.
pub struct CompletionSlot<T> {
    state: Mutex<SlotState<T>>,
    resolved: Condvar,
}

impl<T> Default for CompletionSlot<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for CompletionSlot<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionSlot")
            .field("resolved", &self.is_resolved())
            .finish_non_exhaustive()
    }
}

impl<T> CompletionSlot<T> {
    /// Create an unresolved slot.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SlotState {
                outcome: None,
                claimed: false,
                wakers: Vec::new(),
            }),
            resolved: Condvar::new(),
        }
    }

    /// Resolve the slot. The first writer wins; returns `false` when the
    /// slot was already resolved and this outcome was discarded.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn resolve(&self, outcome: CoalesceResult<T>) -> bool {
        let wakers = {
            let mut state = self.state.lock().expect("completion slot lock poisoned");
            if state.outcome.is_some() {
                return false;
            }
            state.outcome = Some(outcome);
            std::mem::take(&mut state.wakers)
        };
        self.resolved.notify_all();
        for waker in wakers {
            waker.wake();
        }
        true
    }

    /// Claim the slot for delivery. A claimed slot can no longer be
    /// cancelled: the request is part of a running batch and at-most-once
    /// delivery cannot be revoked. Fails when the slot was already resolved
    /// (the caller cancelled it while it was still queued).
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn claim(&self) -> bool {
        let mut state = self.state.lock().expect("completion slot lock poisoned");
        if state.outcome.is_some() {
            return false;
        }
        state.claimed = true;
        true
    }

    /// Best-effort cancellation: resolve with [`CoalesceError::Cancelled`]
    /// unless the slot has been [`claim`](Self::claim)ed for delivery or
    /// already resolved. Returns `true` when this call won (the request
    /// will never observe a value).
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn cancel(&self) -> bool {
        let wakers = {
            let mut state = self.state.lock().expect("completion slot lock poisoned");
            if state.claimed || state.outcome.is_some() {
                return false;
            }
            state.outcome = Some(Err(CoalesceError::Cancelled));
            std::mem::take(&mut state.wakers)
        };
        self.resolved.notify_all();
        for waker in wakers {
            waker.wake();
        }
        true
    }

    /// Whether the slot has been resolved (successfully or not).
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        self.state
            .lock()
            .expect("completion slot lock poisoned")
            .outcome
            .is_some()
    }

    /// Whether the slot resolved to [`CoalesceError::Cancelled`].
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self.state
                .lock()
                .expect("completion slot lock poisoned")
                .outcome,
            Some(Err(CoalesceError::Cancelled))
        )
    }
}

impl<T: Clone> CompletionSlot<T> {
    /// Non-blocking read of the outcome, if resolved.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    #[must_use]
    pub fn try_get(&self) -> Option<CoalesceResult<T>> {
        self.state
            .lock()
            .expect("completion slot lock poisoned")
            .outcome
            .clone()
    }

    /// Park the calling thread until the slot resolves.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn wait(&self) -> CoalesceResult<T> {
        let mut state = self.state.lock().expect("completion slot lock poisoned");
        loop {
            if let Some(outcome) = &state.outcome {
                return outcome.clone();
            }
            state = self
                .resolved
                .wait(state)
                .expect("completion slot lock poisoned");
        }
    }

    /// Park the calling thread until the slot resolves or `timeout`
    /// elapses. Timing out does not affect the slot; waiting again later is
    /// legal.
    ///
    /// # Errors
    ///
    /// Returns [`CoalesceError::Timeout`] when the bound elapses first.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn wait_deadline(&self, timeout: Duration) -> CoalesceResult<T> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().expect("completion slot lock poisoned");
        loop {
            if let Some(outcome) = &state.outcome {
                return outcome.clone();
            }
            let now = Instant::now();
            if now >= deadline {
                #[allow(clippy::cast_possible_truncation)]
                return Err(CoalesceError::Timeout {
                    waited_ms: timeout.as_millis() as u64,
                });
            }
            let (next, _timed_out) = self
                .resolved
                .wait_timeout(state, deadline - now)
                .expect("completion slot lock poisoned");
            state = next;
        }
    }

    /// Task-based observation: returns `Ready` once resolved, otherwise
    /// registers the task's waker.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn poll_outcome(&self, cx: &mut Context<'_>) -> Poll<CoalesceResult<T>> {
        let mut state = self.state.lock().expect("completion slot lock poisoned");
        if let Some(outcome) = &state.outcome {
            return Poll::Ready(outcome.clone());
        }
        if !state.wakers.iter().any(|w| w.will_wake(cx.waker())) {
            state.wakers.push(cx.waker().clone());
        }
        Poll::Pending
    }
}

// ---------------------------------------------------------------------------
// ResultHandle
// ---------------------------------------------------------------------------

/// Consumer-side handle over a [`CompletionSlot`].
///
/// Cloning a handle yields another observer of the same request; all clones
/// see the same outcome.
#[derive(Debug)]
pub struct ResultHandle<T> {
    slot: Arc<CompletionSlot<T>>,
}

impl<T> Clone for ResultHandle<T> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<T> ResultHandle<T> {
    /// Wrap a slot. Used by submission plumbing; most consumers receive
    /// handles from a coalescer rather than constructing them.
    #[must_use]
    pub fn new(slot: Arc<CompletionSlot<T>>) -> Self {
        Self { slot }
    }

    /// Best-effort cancellation. Returns `true` when the request was still
    /// queued: it is cancelled now and will be discarded before it ever
    /// joins a batch. Returns `false` once the request has been drawn into
    /// a batch (delivery cannot be revoked; the real result arrives as
    /// usual) or once the outcome was already delivered.
    pub fn cancel(&self) -> bool {
        self.slot.cancel()
    }

    /// Whether an outcome (value, failure, or cancellation) is available.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.slot.is_resolved()
    }

    /// Whether this request resolved to [`CoalesceError::Cancelled`].
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.slot.is_cancelled()
    }
}

impl<T: Clone> ResultHandle<T> {
    /// Block until the batched result (or failure) arrives.
    pub fn get(&self) -> CoalesceResult<T> {
        self.slot.wait()
    }

    /// Block for at most `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`CoalesceError::Timeout`] when the bound elapses; the
    /// request itself is unaffected.
    pub fn get_timeout(&self, timeout: Duration) -> CoalesceResult<T> {
        self.slot.wait_deadline(timeout)
    }

    /// Non-blocking read: `None` while the request is still in flight.
    #[must_use]
    pub fn try_get(&self) -> Option<CoalesceResult<T>> {
        self.slot.try_get()
    }
}

impl<T: Clone> Future for ResultHandle<T> {
    type Output = CoalesceResult<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.slot.poll_outcome(cx)
    }
}
