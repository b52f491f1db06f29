//! Request coalescing for high-concurrency services.
//!
//! Many concurrent callers issuing identical-shape requests (e.g. "lookup by
//! id") are grouped into one batched callback invocation: a [`Coalescer`]
//! admits submissions from arbitrary threads, closes a batch when it reaches
//! `max_size` or when the window elapses after the first submission —
//! whichever comes first — runs the batch on a worker pool, and fans each
//! result back to its submitter by index. Structurally equal arguments can
//! be collapsed so the callback sees each distinct value once.
//!
//! # Delivery modalities
//!
//! - [`Coalescer::execute`] blocks the caller until its result arrives.
//! - [`Coalescer::submit`] returns a [`ResultHandle`]: blocking `get`,
//!   bounded `get_timeout`, `cancel`, or `.await`.
//! - [`Coalescer::submit_lazy`] returns a cold [`LazyRequest`] future that
//!   submits on first poll.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use funnel::Coalescer;
//!
//! let lookup: Coalescer<u64, String> =
//!     Coalescer::new(Duration::from_millis(5), 32, |ids: Vec<u64>| {
//!         // One backend round-trip for the whole batch.
//!         Ok(ids.into_iter().map(|id| format!("row-{id}")).collect())
//!     })?;
//!
//! let lookup = Arc::new(lookup);
//! let handles: Vec<_> = (0..4u64)
//!     .map(|id| {
//!         let lookup = Arc::clone(&lookup);
//!         std::thread::spawn(move || lookup.execute(id))
//!     })
//!     .collect();
//! for (id, handle) in handles.into_iter().enumerate() {
//!     assert_eq!(handle.join().unwrap()?, format!("row-{id}"));
//! }
//! # Ok::<(), funnel::CoalesceError>(())
//! ```

mod batcher;
pub mod coordinator;
mod dispatch;
pub mod pool;
pub mod ring;
mod submission;

pub use coordinator::{BatchFn, Coalescer, LazyRequest};
pub use pool::{FixedThreadPool, InlinePool, Job, WorkerPool};
pub use ring::RingBuffer;

pub use funnel_core::{
    BoxError, CoalesceError, CoalesceResult, CoalescerConfig, CoalescerMetrics, CompletionSlot,
    DEFAULT_BUFFER_CAPACITY, DEFAULT_MAX_SIZE, DEFAULT_WINDOW_MS, DEFAULT_WORKER_THREADS,
    MetricsSnapshot, ResultHandle,
};
