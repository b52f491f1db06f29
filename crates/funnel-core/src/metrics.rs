use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free counters for coalescer telemetry.
///
/// Counters are updated with relaxed ordering from producer threads, the
/// batch driver, and worker-pool threads; [`snapshot`](Self::snapshot) takes
/// a point-in-time copy for reporting.
#[derive(Debug, Default)]
pub struct CoalescerMetrics {
    /// Submissions accepted into the buffer.
    pub total_submitted: AtomicU64,
    /// Batches formed and handed to the worker pool.
    pub total_batches: AtomicU64,
    /// Members included in dispatched batches.
    pub total_batched: AtomicU64,
    /// Batches closed because they reached `max_size`.
    pub size_closes: AtomicU64,
    /// Batches closed because the window elapsed.
    pub window_closes: AtomicU64,
    /// Batches closed by the shutdown drain.
    pub drain_closes: AtomicU64,
    /// Members collapsed into an earlier structurally equal member.
    pub duplicates_collapsed: AtomicU64,
    /// Batches whose callback returned an error or panicked.
    pub callback_failures: AtomicU64,
    /// Batches whose callback returned the wrong number of results.
    pub arity_mismatches: AtomicU64,
    /// Cancelled submissions discarded at drain time.
    pub cancelled_discards: AtomicU64,
    /// Fast-fail submissions rejected on a full buffer.
    pub rejected_full: AtomicU64,
    /// Live configuration replacements.
    pub config_updates: AtomicU64,
}

impl CoalescerMetrics {
    /// Average members per dispatched batch (0.0 if no batches).
    #[must_use]
    #[allow(clippy::cast_precision_loss)] // telemetry counters won't reach 2^52
    pub fn avg_batch_size(&self) -> f64 {
        let batches = self.total_batches.load(Ordering::Relaxed);
        if batches == 0 {
            return 0.0;
        }
        self.total_batched.load(Ordering::Relaxed) as f64 / batches as f64
    }

    /// Fraction of batched members collapsed by dedup (0.0 if none batched).
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn dedup_rate(&self) -> f64 {
        let batched = self.total_batched.load(Ordering::Relaxed);
        if batched == 0 {
            return 0.0;
        }
        self.duplicates_collapsed.load(Ordering::Relaxed) as f64 / batched as f64
    }

    /// Take a point-in-time copy of all counters.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_submitted: self.total_submitted.load(Ordering::Relaxed),
            total_batches: self.total_batches.load(Ordering::Relaxed),
            total_batched: self.total_batched.load(Ordering::Relaxed),
            size_closes: self.size_closes.load(Ordering::Relaxed),
            window_closes: self.window_closes.load(Ordering::Relaxed),
            drain_closes: self.drain_closes.load(Ordering::Relaxed),
            duplicates_collapsed: self.duplicates_collapsed.load(Ordering::Relaxed),
            callback_failures: self.callback_failures.load(Ordering::Relaxed),
            arity_mismatches: self.arity_mismatches.load(Ordering::Relaxed),
            cancelled_discards: self.cancelled_discards.load(Ordering::Relaxed),
            rejected_full: self.rejected_full.load(Ordering::Relaxed),
            config_updates: self.config_updates.load(Ordering::Relaxed),
        }
    }
}

/// Immutable snapshot of [`CoalescerMetrics`] for reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub total_submitted: u64,
    pub total_batches: u64,
    pub total_batched: u64,
    pub size_closes: u64,
    pub window_closes: u64,
    pub drain_closes: u64,
    pub duplicates_collapsed: u64,
    pub callback_failures: u64,
    pub arity_mismatches: u64,
    pub cancelled_discards: u64,
    pub rejected_full: u64,
    pub config_updates: u64,
}

impl MetricsSnapshot {
    /// Average members per dispatched batch (0.0 if no batches).
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn avg_batch_size(&self) -> f64 {
        if self.total_batches == 0 {
            return 0.0;
        }
        self.total_batched as f64 / self.total_batches as f64
    }
}
