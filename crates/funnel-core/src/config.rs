use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CoalesceError, CoalesceResult};

/// Default batch window in milliseconds.
pub const DEFAULT_WINDOW_MS: u64 = 10;
/// Default upper bound on members per batch.
pub const DEFAULT_MAX_SIZE: usize = 32;
/// Default submission buffer capacity.
pub const DEFAULT_BUFFER_CAPACITY: usize = 8192;
/// Default worker-thread count for the built-in pool.
pub const DEFAULT_WORKER_THREADS: usize = 4;

/// Tunable knobs of a coalescer.
///
/// The non-serializable parts of a running coalescer's configuration (the
/// worker pool and the batch callback) travel beside this struct; see the
/// engine crate's `update_config`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoalescerConfig {
    /// Maximum time (ms) between the first submission of a batch and batch
    /// close. Must be > 0. Default: 10.
    pub window_ms: u64,
    /// Maximum members per batch. Must be ≥ 1. Default: 32.
    pub max_size: usize,
    /// Submission buffer capacity. Must be ≥ `max_size`. Default: 8192.
    pub buffer_capacity: usize,
    /// Collapse structurally equal arguments before invoking the callback.
    /// Default: true.
    pub remove_duplicates: bool,
}

impl Default for CoalescerConfig {
    fn default() -> Self {
        Self {
            window_ms: DEFAULT_WINDOW_MS,
            max_size: DEFAULT_MAX_SIZE,
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            remove_duplicates: true,
        }
    }
}

impl CoalescerConfig {
    /// Config with the given window and batch bound, defaults elsewhere.
    ///
    /// Sub-millisecond windows are rounded up to 1 ms.
    #[must_use]
    pub fn new(window: Duration, max_size: usize) -> Self {
        #[allow(clippy::cast_possible_truncation)]
        let window_ms = (window.as_millis() as u64).max(1);
        Self {
            window_ms,
            max_size,
            ..Self::default()
        }
    }

    /// The batch window as a [`Duration`].
    #[must_use]
    pub const fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    /// Validate field bounds.
    ///
    /// # Errors
    ///
    /// Returns [`CoalesceError::InvalidConfig`] naming the offending field.
    pub fn validate(&self) -> CoalesceResult<()> {
        if self.window_ms == 0 {
            return Err(CoalesceError::InvalidConfig {
                field: "window_ms".into(),
                value: self.window_ms.to_string(),
                reason: "the batch window must be positive".into(),
            });
        }
        if self.max_size == 0 {
            return Err(CoalesceError::InvalidConfig {
                field: "max_size".into(),
                value: self.max_size.to_string(),
                reason: "a batch must admit at least one member".into(),
            });
        }
        if self.buffer_capacity < self.max_size {
            return Err(CoalesceError::InvalidConfig {
                field: "buffer_capacity".into(),
                value: self.buffer_capacity.to_string(),
                reason: format!("must be at least max_size ({})", self.max_size),
            });
        }
        Ok(())
    }
}
