//! Bounded polling
//!
//! The only way the probe waits on the cloud. A poll queries at a fixed
//! interval until a predicate holds, the probe reports a terminal failure, or
//! the deadline elapses.

use crate::error::{ProbeError, Result};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Default polling interval
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Default wait deadline
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(300);

/// Interval and deadline of a bounded poll
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    /// Time between two queries
    pub interval: Duration,
    /// Maximum total wait
    pub deadline: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            deadline: DEFAULT_WAIT_TIMEOUT,
        }
    }
}

impl PollPolicy {
    /// Create a poll policy
    pub fn new(interval: Duration, deadline: Duration) -> Self {
        Self { interval, deadline }
    }
}

/// Result of one poll query
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollState<T> {
    /// Desired state reached
    Ready(T),
    /// Not there yet, keep polling
    Pending,
}

/// Poll `query` until it yields [`PollState::Ready`] or the deadline passes.
///
/// Errors returned by `query` end the poll immediately; a resource that
/// entered an error state should be reported that way instead of waiting the
/// full deadline out. The last query always happens at or before the deadline.
pub async fn poll_until<T, F, Fut>(policy: PollPolicy, what: &str, mut query: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<PollState<T>>>,
{
    let start = Instant::now();
    let deadline = start + policy.deadline;
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        if let PollState::Ready(value) = query().await? {
            debug!(what, attempts, elapsed = ?start.elapsed(), "Poll satisfied");
            return Ok(value);
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(ProbeError::timeout(what, policy.deadline));
        }
        let sleep_for = policy.interval.min(deadline - now);
        tokio::time::sleep(sleep_for).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> PollPolicy {
        PollPolicy::new(Duration::from_millis(1), Duration::from_millis(200))
    }

    #[test]
    fn test_default_policy() {
        let policy = PollPolicy::default();
        assert_eq!(policy.interval.as_secs(), 5);
        assert_eq!(policy.deadline.as_secs(), 300);
    }

    #[tokio::test]
    async fn test_poll_returns_when_ready() {
        let calls = &AtomicU32::new(0);
        let value = poll_until(fast(), "counter to reach 3", || async move {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(if n >= 3 { PollState::Ready(n) } else { PollState::Pending })
        })
        .await;

        assert_eq!(tokio_test::assert_ok!(value), 3);
    }

    #[tokio::test]
    async fn test_poll_times_out() {
        let policy = PollPolicy::new(Duration::from_millis(5), Duration::from_millis(30));
        let err = poll_until::<(), _, _>(policy, "never", || async { Ok(PollState::Pending) })
            .await
            .unwrap_err();

        match err {
            ProbeError::Timeout { what, after } => {
                assert_eq!(what, "never");
                assert_eq!(after, Duration::from_millis(30));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_poll_stops_on_query_error() {
        let calls = &AtomicU32::new(0);
        let err = poll_until::<(), _, _>(fast(), "volume", || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(ProbeError::config("volume entered error state"))
        })
        .await
        .unwrap_err();

        assert!(matches!(err, ProbeError::InvalidConfig(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
