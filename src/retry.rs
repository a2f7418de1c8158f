use std::{
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use rand::Rng as _;

use crate::error::{Error, Result};

/// Backoff settings for polling loops and self-verification.
///
/// Attempts are spaced by an exponentially growing delay with jitter, always
/// clamped to `[min, max]`. The worst-case wall time of one polled operation
/// is therefore `attempts * max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of attempts before giving up.
    pub attempts: usize,

    /// Minimum delay between attempts.
    pub min: Duration,

    /// Maximum delay between attempts.
    pub max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            attempts: 5,
            min: Duration::from_millis(5_000),
            max: Duration::from_millis(30_000),
        }
    }
}

/// Caller-side cancellation for long-running operations.
///
/// Cloning shares the flag. Polling loops check it between attempts; the
/// orchestrator runs challenge cleanup before surfacing
/// [`Error::Cancelled`].
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Handed to each retry attempt; calling [`Abort::abort`] marks the
/// attempt's error as terminal so no further attempts are made.
#[derive(Debug, Clone, Default)]
pub struct Abort(Arc<AtomicBool>);

impl Abort {
    pub fn abort(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Runs `op` until it succeeds, aborts, or the policy's attempts run out.
///
/// Every attempt receives a fresh [`Abort`] handle. An `Err` from an attempt
/// that called `abort` is propagated immediately (used for terminal invalid
/// states); any other `Err` waits out the backoff delay and retries.
/// Exhausting all attempts yields [`Error::Timeout`] wrapping the last
/// error.
pub(crate) async fn retry<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancelHandle,
    mut op: F,
) -> Result<T>
where
    F: FnMut(Abort) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = policy.attempts.max(1);
    let mut last = None;

    for attempt in 0..attempts {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let abort = Abort::default();

        match op(abort.clone()).await {
            Ok(value) => return Ok(value),
            Err(err) if abort.is_aborted() => return Err(err),
            Err(Error::Cancelled) => return Err(Error::Cancelled),
            Err(err) => {
                log::debug!("attempt {} failed: {err}", attempt + 1);
                last = Some(err);
            }
        }

        if attempt + 1 < attempts {
            tokio::time::sleep(backoff_delay(policy, attempt)).await;
        }
    }

    Err(Error::Timeout {
        attempts,
        // attempts >= 1, so at least one error was recorded
        last: Box::new(last.expect("no error recorded for exhausted retry")),
    })
}

fn backoff_delay(policy: &RetryPolicy, attempt: usize) -> Duration {
    let factor = 1u32.checked_shl(attempt as u32).unwrap_or(u32::MAX);
    let base = policy.min.saturating_mul(factor).min(policy.max);
    let jittered = base.mul_f64(rand::thread_rng().gen_range(0.5..=1.0));

    jittered.clamp(policy.min, policy.max)
}
