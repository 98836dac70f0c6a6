//! Deadline-bounded polling for asynchronously converging cluster state.
//!
//! Node state (sealed, leader, membership) changes some time after the
//! command that caused it, and the admin API offers no way to be notified.
//! Everything in the bootstrap sequence that waits therefore polls on a fixed
//! interval until a predicate holds or a [`PollContext`] ends.
//!
//! There is no attempt limit. The wall-clock budget is owned entirely by the
//! caller through the context's deadline and cancellation token.
//!
//! # Example
//!
//! ```ignore
//! use acctest::poll::{wait_until, PollContext};
//!
//! let ctx = PollContext::with_timeout(Duration::from_secs(15));
//! let health = wait_until(&ctx, "node-0 unsealed", || client.health(), |h| {
//!     if h.sealed { Err("still sealed".to_string()) } else { Ok(()) }
//! }).await?;
//! ```

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{Error, Result};

/// Fixed delay between poll attempts
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Deadline-bearing cancellation token threaded through every poll loop
///
/// A context is done once its token is cancelled or its deadline passes.
/// Child contexts observe their parent's cancellation but never cancel it.
#[derive(Clone, Debug)]
pub struct PollContext {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Default for PollContext {
    fn default() -> Self {
        Self::background()
    }
}

impl PollContext {
    /// A context without deadline that ends only when cancelled
    pub fn background() -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: None,
        }
    }

    /// A context that ends `timeout` from now
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: Some(Instant::now() + timeout),
        }
    }

    /// A child context ending at the earlier of the parent's deadline and `timeout` from now
    pub fn child_with_timeout(&self, timeout: Duration) -> Self {
        let candidate = Instant::now() + timeout;
        let deadline = match self.deadline {
            Some(parent) if parent < candidate => parent,
            _ => candidate,
        };
        Self {
            token: self.token.child_token(),
            deadline: Some(deadline),
        }
    }

    /// Cancel this context and all of its children
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// The underlying cancellation token
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.token
    }

    /// When this context expires, if ever
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline (`None` without a deadline)
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Whether the context is cancelled or past its deadline
    pub fn is_done(&self) -> bool {
        self.token.is_cancelled() || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Completes once the context is done
    pub async fn done(&self) {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.token.cancelled() => {}
                    _ = tokio::time::sleep_until(deadline) => {}
                }
            }
            None => self.token.cancelled().await,
        }
    }

    /// Sleep for `interval`, waking early if the context ends
    async fn pause(&self, interval: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = self.done() => {}
        }
    }
}

/// Poll `fetch` until `predicate` accepts its value, using [`DEFAULT_POLL_INTERVAL`].
///
/// Returns the accepted value. See [`wait_until_with_interval`].
pub async fn wait_until<T, E, F, Fut, P>(
    ctx: &PollContext,
    operation: &str,
    fetch: F,
    predicate: P,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: Display,
    P: FnMut(&T) -> std::result::Result<(), String>,
{
    wait_until_with_interval(ctx, operation, DEFAULT_POLL_INTERVAL, fetch, predicate).await
}

/// Poll `fetch` until `predicate` accepts its value or `ctx` ends.
///
/// Each cycle calls `fetch` once; on success the value is handed to
/// `predicate`. A fetch error or a predicate rejection becomes the latest
/// failure reason and the loop sleeps `interval` before the next cycle. Once
/// the predicate accepts, the value is returned and `fetch` is never called
/// again. An in-flight fetch is abandoned when the context ends.
///
/// # Returns
/// The accepted value, or [`Error::Timeout`] carrying the last failure reason.
pub async fn wait_until_with_interval<T, E, F, Fut, P>(
    ctx: &PollContext,
    operation: &str,
    interval: Duration,
    mut fetch: F,
    mut predicate: P,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: Display,
    P: FnMut(&T) -> std::result::Result<(), String>,
{
    let mut attempt = 0u32;
    let mut last_error = "context ended before the first attempt".to_string();

    while !ctx.is_done() {
        attempt += 1;

        let outcome = tokio::select! {
            outcome = fetch() => outcome,
            _ = ctx.done() => break,
        };

        match outcome {
            Ok(value) => match predicate(&value) {
                Ok(()) => return Ok(value),
                Err(reason) => last_error = reason,
            },
            Err(e) => last_error = e.to_string(),
        }

        debug!(
            operation = %operation,
            attempt = attempt,
            error = %last_error,
            delay_ms = interval.as_millis(),
            "Condition not met, polling again"
        );

        ctx.pause(interval).await;
    }

    Err(Error::timeout(operation, last_error))
}

/// Retry a fallible submission on a fixed interval until it succeeds or `ctx` ends
pub async fn retry_until<T, E, F, Fut>(
    ctx: &PollContext,
    operation: &str,
    interval: Duration,
    op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: Display,
{
    wait_until_with_interval(ctx, operation, interval, op, |_| Ok(())).await
}
