//! Batch execution: dedup planning, callback invocation, result fan-out.
//!
//! Runs on a worker-pool thread, so multiple batches can execute
//! concurrently; the batch driver never waits for a dispatch to finish.

use std::collections::HashMap;
use std::hash::Hash;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use funnel_core::{BoxError, CoalesceError, CoalescerMetrics};
use tracing::{debug, warn};

use crate::submission::{Batch, Submission};

/// The arguments actually passed to the callback, plus the mapping from each
/// member back to its slot in them.
pub(crate) struct CallPlan<A> {
    /// Argument values handed to the callback, first occurrence wins,
    /// insertion order.
    pub(crate) unique_args: Vec<A>,
    /// `index_map[i]` is member *i*'s position in `unique_args`.
    pub(crate) index_map: Vec<usize>,
}

/// Build the call plan for a batch. With dedup enabled, identity is
/// structural equality over the argument value; otherwise the plan is the
/// identity mapping.
pub(crate) fn build_plan<A, R>(members: &[Submission<A, R>], remove_duplicates: bool) -> CallPlan<A>
where
    A: Clone + Eq + Hash,
{
    if !remove_duplicates {
        return CallPlan {
            unique_args: members.iter().map(|m| m.args.clone()).collect(),
            index_map: (0..members.len()).collect(),
        };
    }

    let mut seen: HashMap<A, usize> = HashMap::with_capacity(members.len());
    let mut unique_args = Vec::new();
    let mut index_map = Vec::with_capacity(members.len());
    for member in members {
        let next = unique_args.len();
        let slot = *seen.entry(member.args.clone()).or_insert_with(|| {
            unique_args.push(member.args.clone());
            next
        });
        index_map.push(slot);
    }
    CallPlan {
        unique_args,
        index_map,
    }
}

/// Execute a batch and resolve every member exactly once.
///
/// The callback's `Err` and a callback panic both fail the whole batch with
/// a shared cause; a result sequence of the wrong length fails it with the
/// observed arity. Members were claimed when the batch was drained, so a
/// `cancel()` racing this dispatch cannot revoke delivery: every member
/// receives the batch's real outcome.
pub(crate) fn run_batch<A, R>(batch: Batch<A, R>, metrics: &CoalescerMetrics)
where
    A: Clone + Eq + Hash,
    R: Clone,
{
    use std::sync::atomic::Ordering;

    let Batch { members, snapshot } = batch;
    let batch_size = members.len();

    let CallPlan {
        unique_args,
        index_map,
    } = build_plan(&members, snapshot.config.remove_duplicates);
    let expected = unique_args.len();
    let collapsed = batch_size - expected;
    if collapsed > 0 {
        metrics
            .duplicates_collapsed
            .fetch_add(collapsed as u64, Ordering::Relaxed);
    }

    let call = catch_unwind(AssertUnwindSafe(|| (snapshot.callback)(unique_args)));

    let outcome = match call {
        Err(payload) => Err(CoalesceError::CallbackFailed {
            source: Arc::from(BoxError::from(format!(
                "callback panicked: {}",
                panic_message(payload.as_ref())
            ))),
        }),
        Ok(Err(cause)) => Err(CoalesceError::CallbackFailed {
            source: Arc::from(cause),
        }),
        Ok(Ok(results)) if results.len() != expected => Err(CoalesceError::ArityMismatch {
            expected,
            actual: results.len(),
        }),
        Ok(Ok(results)) => Ok(results),
    };

    match outcome {
        Ok(results) => {
            debug!(
                target: "funnel.dispatch",
                batch_size,
                unique = expected,
                "batch completed"
            );
            for (member, index) in members.into_iter().zip(index_map) {
                member.slot.resolve(Ok(results[index].clone()));
            }
        }
        Err(err) => {
            match &err {
                CoalesceError::ArityMismatch { .. } => {
                    metrics.arity_mismatches.fetch_add(1, Ordering::Relaxed);
                }
                _ => {
                    metrics.callback_failures.fetch_add(1, Ordering::Relaxed);
                }
            }
            warn!(
                target: "funnel.dispatch",
                batch_size,
                error = %err,
                "batch failed"
            );
            for member in members {
                member.slot.resolve(Err(err.clone()));
            }
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}
