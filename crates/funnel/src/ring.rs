//! Bounded blocking FIFO between producers and the batch driver.
//!
//! Producers from arbitrary threads [`put`](RingBuffer::put) submissions and
//! block while the buffer is full (backpressure); the single consumer — the
//! batch driver — drains with [`poll_batch`](RingBuffer::poll_batch), waiting
//! for the first item or an optional deadline. Capacity changes are
//! content-preserving: the bound is retuned under the same lock, so pending
//! items are never copied, dropped, or reordered.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::Instant;

use funnel_core::{CoalesceError, CoalesceResult};
use tracing::{debug, trace};

/// Mutable state behind the ring's mutex.
struct RingState<T> {
    items: VecDeque<T>,
    capacity: usize,
    shutdown: bool,
}

/// Bounded multi-producer FIFO with a single draining consumer.
pub struct RingBuffer<T> {
    state: Mutex<RingState<T>>,
    not_full: Condvar,
    not_empty: Condvar,
}

impl<T> std::fmt::Debug for RingBuffer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock().expect("ring buffer lock poisoned");
        f.debug_struct("RingBuffer")
            .field("len", &state.items.len())
            .field("capacity", &state.capacity)
            .field("shutdown", &state.shutdown)
            .finish()
    }
}

impl<T> RingBuffer<T> {
    /// Create a buffer bounded at `capacity` items.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(RingState {
                items: VecDeque::with_capacity(capacity.min(1024)),
                capacity,
                shutdown: false,
            }),
            not_full: Condvar::new(),
            not_empty: Condvar::new(),
        }
    }

    /// Append an item, blocking while the buffer is full.
    ///
    /// # Errors
    ///
    /// Returns [`CoalesceError::Shutdown`] once the buffer has been shut
    /// down; the item is dropped.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn put(&self, item: T) -> CoalesceResult<()> {
        let mut state = self.state.lock().expect("ring buffer lock poisoned");
        while state.items.len() >= state.capacity && !state.shutdown {
            trace!(
                target: "funnel.ring",
                pending = state.items.len(),
                capacity = state.capacity,
                "buffer full, producer waiting"
            );
            state = self
                .not_full
                .wait(state)
                .expect("ring buffer lock poisoned");
        }
        if state.shutdown {
            return Err(CoalesceError::Shutdown);
        }
        state.items.push_back(item);
        drop(state);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Append an item without blocking.
    ///
    /// # Errors
    ///
    /// Returns [`CoalesceError::BufferFull`] with the current occupancy when
    /// the buffer has no space, or [`CoalesceError::Shutdown`] after
    /// shutdown. The item is dropped on error.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn try_put(&self, item: T) -> CoalesceResult<()> {
        let mut state = self.state.lock().expect("ring buffer lock poisoned");
        if state.shutdown {
            return Err(CoalesceError::Shutdown);
        }
        if state.items.len() >= state.capacity {
            return Err(CoalesceError::BufferFull {
                pending: state.items.len(),
                capacity: state.capacity,
            });
        }
        state.items.push_back(item);
        drop(state);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Drain up to `max` items in FIFO order, waiting until at least one
    /// item is present. With a deadline, an empty result means the deadline
    /// elapsed; without one, an empty result means shutdown.
    ///
    /// Single-consumer: only the batch driver calls this.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn poll_batch(&self, max: usize, deadline: Option<Instant>) -> Vec<T> {
        let mut state = self.state.lock().expect("ring buffer lock poisoned");
        loop {
            if !state.items.is_empty() {
                break;
            }
            if state.shutdown {
                return Vec::new();
            }
            match deadline {
                None => {
                    state = self
                        .not_empty
                        .wait(state)
                        .expect("ring buffer lock poisoned");
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Vec::new();
                    }
                    let (next, _timed_out) = self
                        .not_empty
                        .wait_timeout(state, deadline - now)
                        .expect("ring buffer lock poisoned");
                    state = next;
                }
            }
        }
        let take = max.min(state.items.len());
        let drained: Vec<T> = state.items.drain(..take).collect();
        drop(state);
        self.not_full.notify_all();
        drained
    }

    /// Retune the capacity in place. Pending items are untouched; shrinking
    /// below the current occupancy is legal and simply keeps producers
    /// blocked until the consumer drains below the new bound.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn set_capacity(&self, capacity: usize) {
        let mut state = self.state.lock().expect("ring buffer lock poisoned");
        debug!(
            target: "funnel.ring",
            old = state.capacity,
            new = capacity,
            pending = state.items.len(),
            "capacity retuned"
        );
        state.capacity = capacity;
        drop(state);
        // Growth may have made room for blocked producers.
        self.not_full.notify_all();
    }

    /// Stop admissions and wake all parked producers and the consumer.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn shutdown(&self) {
        let mut state = self.state.lock().expect("ring buffer lock poisoned");
        state.shutdown = true;
        let pending = state.items.len();
        drop(state);
        debug!(target: "funnel.ring", pending, "buffer shut down");
        self.not_full.notify_all();
        self.not_empty.notify_all();
    }

    /// Whether shutdown has been requested.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.state
            .lock()
            .expect("ring buffer lock poisoned")
            .shutdown
    }

    /// Number of items currently buffered.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state
            .lock()
            .expect("ring buffer lock poisoned")
            .items
            .len()
    }

    /// Whether the buffer is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current capacity bound.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.state
            .lock()
            .expect("ring buffer lock poisoned")
            .capacity
    }
}
