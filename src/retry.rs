// SPDX-License-Identifier: MIT
//! Bounded-backoff retry for fallible async operations.
//!
//! Provides [`retry_with_schedule`] — retries an operation over an explicit
//! delay schedule. The schedule is data, not a multiplier, because callers
//! like the router promise a fixed sequence of delays between attempts.

use std::time::Duration;
use tracing::{debug, warn};

/// Retry an async operation over an explicit backoff schedule.
///
/// Calls `f()` once, then once more after each delay in `delays` until one
/// attempt succeeds. A schedule of N delays therefore allows N+1 attempts.
///
/// Returns `Ok(value)` on the first success, or `Err(last_error)` once the
/// schedule is exhausted.
pub async fn retry_with_schedule<F, Fut, T, E>(delays: &[Duration], mut f: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Debug,
{
    let max_attempts = delays.len() + 1;
    let mut last_err: Option<E> = None;

    for attempt in 1..=max_attempts {
        match f().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(attempt, "succeeded after retrying");
                }
                return Ok(value);
            }
            Err(e) => {
                if attempt < max_attempts {
                    let delay = delays[attempt - 1];
                    warn!(
                        attempt,
                        max = max_attempts,
                        delay_ms = delay.as_millis(),
                        err = ?e,
                        "operation failed, next attempt scheduled"
                    );
                    tokio::time::sleep(delay).await;
                } else {
                    warn!(attempt, max = max_attempts, err = ?e, "giving up, schedule exhausted");
                    last_err = Some(e);
                }
            }
        }
    }

    // A fully failed schedule always leaves the final error behind.
    Err(last_err.expect("final failed attempt stored its error"))
}
