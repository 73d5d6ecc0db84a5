//! Bounded retry for optimistic-concurrency writes.

use std::future::Future;

use tracing::debug;

use crate::errors::{OperonError, OperonResult};

/// Run `operation` up to `attempts` times, returning the first success or
/// the last error. No backoff: callers retry read-modify-write cycles
/// against a local store where immediate retry is the right shape.
pub async fn with_retries<T, F, Fut>(
    operation: &str,
    attempts: u32,
    mut run: F,
) -> OperonResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = OperonResult<T>>,
{
    let mut last_error = None;
    for attempt in 1..=attempts {
        match run().await {
            Ok(value) => return Ok(value),
            // A failed precondition means the object moved on; re-running
            // the same write cannot succeed within this pass.
            Err(err) if err.is_precondition() => {
                debug!(operation, attempt, error = %err, "precondition failed, not retrying");
                return Err(err);
            }
            Err(err) => {
                debug!(operation, attempt, error = %err, "attempt failed");
                last_error = Some(err);
            }
        }
    }
    Err(last_error.unwrap_or_else(|| {
        OperonError::input(operation.to_owned(), "retry budget must be at least 1")
    }))
}
