//! Core types for the funnel request-coalescing workspace.
//!
//! This crate defines the error type ([`CoalesceError`]), the serializable
//! configuration knobs ([`CoalescerConfig`]), lock-free telemetry counters
//! ([`CoalescerMetrics`]), and the single-assignment completion slot that
//! underlies every result-delivery modality ([`CompletionSlot`],
//! [`ResultHandle`]).
//!
//! It has minimal external dependencies and is intended to be depended on by
//! every other crate in the workspace.

pub mod completion;
pub mod config;
pub mod error;
pub mod metrics;

pub use completion::{CompletionSlot, ResultHandle};
pub use config::{
    CoalescerConfig, DEFAULT_BUFFER_CAPACITY, DEFAULT_MAX_SIZE, DEFAULT_WINDOW_MS,
    DEFAULT_WORKER_THREADS,
};
pub use error::{BoxError, CoalesceError, CoalesceResult};
pub use metrics::{CoalescerMetrics, MetricsSnapshot};
