//! Retry and timeout utilities.
//!
//! The helpers in this module are transport-agnostic and are shared by the
//! realtime and request clients, both of which treat transient transport
//! failures as retryable without limit.

use std::future::Future;
use std::time::Duration;

use tracing::debug;

/// Executes an async operation until it resolves to a terminal outcome.
///
/// `op` is re-invoked immediately — no backoff, no attempt cap — for as long
/// as `is_transient` classifies the error as a transient transport failure.
/// The first success or non-transient error is returned to the caller.
pub async fn retry_transient<T, E, Op, Fut, IsTransient>(
    mut op: Op,
    mut is_transient: IsTransient,
) -> Result<T, E>
where
    Op: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    IsTransient: FnMut(&E) -> bool,
{
    let mut attempt: u64 = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(error) => {
                if !is_transient(&error) {
                    return Err(error);
                }
                debug!(event = "transient_attempt_failed", attempt);
                attempt += 1;
            }
        }
    }
}

/// Applies a timeout to an async computation.
pub async fn with_timeout<T, Fut>(
    timeout: Duration,
    future: Fut,
) -> Result<T, tokio::time::error::Elapsed>
where
    Fut: Future<Output = T>,
{
    tokio::time::timeout(timeout, future).await
}
