use std::sync::Arc;

/// Boxed error type accepted from user batch callbacks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Unified error type covering all failure modes of the coalescing pipeline.
///
/// Every variant includes an actionable message guiding the consumer toward
/// resolution. The enum is `Clone` because a single batch failure is
/// delivered to every member of that batch: the underlying cause is held in
/// an [`Arc`] and shared across all of the batch's completion slots.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CoalesceError {
    // === Batch execution errors ===
    /// The user batch callback returned an error (or panicked). Every
    /// request in the failed batch observes this error with the same cause;
    /// subsequent batches are unaffected.
    #[error("Batch callback failed: {source}. All requests in this batch share the failure; the next batch runs independently.")]
    CallbackFailed {
        /// The underlying error, shared across the batch.
        #[source]
        source: Arc<dyn std::error::Error + Send + Sync>,
    },

    /// The callback returned a result sequence of the wrong length. The
    /// callback contract is one output per unique input, in input order.
    #[error("Batch callback returned {actual} results for {expected} inputs. Return exactly one result per input, in input order.")]
    ArityMismatch {
        /// Number of unique argument values passed to the callback.
        expected: usize,
        /// Number of results the callback actually returned.
        actual: usize,
    },

    // === Waiter-local errors ===
    /// The request was cancelled while it was still queued; it is discarded
    /// without ever reaching a batch. Cancellation is best-effort: once a
    /// request has been drawn into a batch, delivery cannot be revoked and
    /// the real result is delivered instead.
    #[error("Request cancelled before completion.")]
    Cancelled,

    /// A bounded wait elapsed. Observed only by the waiter that asked for
    /// the timeout; the request itself is unaffected and can be waited on
    /// again.
    #[error("Timed out after {waited_ms}ms waiting for a batched result. The request is still in flight; wait again or cancel it.")]
    Timeout {
        /// How long the waiter waited, in milliseconds.
        waited_ms: u64,
    },

    /// The result can no longer arrive: the coalescer was torn down before
    /// this request completed.
    #[error("Coalescer was torn down before this request completed.")]
    Disconnected,

    // === Admission errors ===
    /// Fast-fail admission found the submission buffer full. Only surfaced
    /// by the non-blocking submission variant; blocking submission waits
    /// for space instead.
    #[error("Submission buffer full ({pending}/{capacity} pending). Apply backpressure, use a blocking submit, or raise buffer_capacity.")]
    BufferFull {
        /// Number of submissions currently queued.
        pending: usize,
        /// Configured buffer capacity.
        capacity: usize,
    },

    /// The coalescer has been shut down and accepts no further submissions.
    #[error("Coalescer is shut down; no further submissions are accepted.")]
    Shutdown,

    // === Configuration errors ===
    /// A configuration value is invalid.
    #[error("Invalid config: {field} = \"{value}\" — {reason}")]
    InvalidConfig {
        /// Which config field.
        field: String,
        /// The invalid value.
        value: String,
        /// Why it is invalid.
        reason: String,
    },
}

/// Convenience alias used throughout the funnel crate hierarchy.
pub type CoalesceResult<T> = Result<T, CoalesceError>;
