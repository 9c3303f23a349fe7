//! Bounded retry strategy

use std::fmt::Display;
use std::future::Future;

use tracing::{info, warn};

use crate::errors::Retryable;

/// Run `operation` up to `max_attempts` times.
///
/// `operation` receives the 1-based attempt number. After every failed attempt, including the
/// last one, `on_each_failure` is awaited with the attempt number and the error. Errors that are
/// not retryable stop the loop immediately. The last error is returned.
pub async fn with_retries<T, E, Op, Fut, Hook, HookFut>(
    max_attempts: u32,
    mut operation: Op,
    mut on_each_failure: Hook,
) -> Result<T, E>
where
    E: Retryable + Display,
    Op: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    Hook: FnMut(u32, &E) -> HookFut,
    HookFut: Future<Output = ()>,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                on_each_failure(attempt, &err).await;

                if !err.is_retryable() {
                    warn!(attempt, error = %err, "failure is not retryable");
                    return Err(err);
                }
                if attempt >= max_attempts {
                    warn!(attempt, max_attempts, error = %err, "retry attempts exhausted");
                    return Err(err);
                }

                info!(attempt, max_attempts, error = %err, "attempt failed, retrying");
                attempt += 1;
            }
        }
    }
}
