//! Bounded exponential backoff for chain-view calls.
use std::future::Future;

use tokio_util::sync::CancellationToken;

use crate::{
    config::RetryPolicy,
    error::{RescanError, RescanResult},
};

/// Run `op` until it succeeds, fails with a non-transient error, runs out of
/// attempts or `cancel` fires. The delay doubles after each failure, capped at
/// `policy.max_delay`.
pub(crate) async fn with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    what: &str,
    mut op: F,
) -> RescanResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = RescanResult<T>>,
{
    let mut delay = policy.initial_delay;
    let mut attempt: u32 = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(RescanError::Cancelled);
        }

        let err = match op().await {
            Ok(v) => return Ok(v),
            Err(e) if !e.is_transient() => return Err(e),
            Err(e) => e,
        };

        attempt += 1;
        if policy.max_attempts.is_some_and(|max| attempt >= max) {
            tracing::error!(what, attempt, error = %err, "giving up");
            return Err(err);
        }
        tracing::warn!(what, attempt, retry_in = ?delay, error = %err, "transient failure, backing off");

        tokio::select! {
            _ = cancel.cancelled() => return Err(RescanError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
        delay = (delay * 2).min(policy.max_delay);
    }
}
