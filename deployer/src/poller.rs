// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bounded polling until a cluster reaches the state we asked for.
//!
//! Every bootstrap path waits the same way: fetch an observation, test it
//! against a predicate, sleep a fixed delay, and give up after a fixed number
//! of attempts. Only the predicate and the budget differ, so there is exactly
//! one loop, [`poll_until`], built on the `backoff` crate.

use backoff::backoff::Backoff;
use backoff::Error as BackoffError;
use serde::Deserialize;
use serde::Serialize;
use slog::info;
use slog::Logger;
use std::future::Future;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// How many times to look, and how long to wait between looks.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RetryPolicy {
    pub attempts: u32,
    #[serde(rename = "delay_secs", with = "duration_secs")]
    pub delay: Duration,
}

impl RetryPolicy {
    pub const fn new(attempts: u32, delay: Duration) -> Self {
        RetryPolicy { attempts, delay }
    }

    /// Replica catch-up in primary/replica and multi-primary groups.
    pub const REPLICATION: RetryPolicy =
        RetryPolicy::new(20, Duration::from_secs(3));

    /// Galera state transfer is slower, so quorum checks wait longer.
    pub const QUORUM: RetryPolicy = RetryPolicy::new(20, Duration::from_secs(6));

    pub const SHARD_REGISTRATION: RetryPolicy =
        RetryPolicy::new(6, Duration::from_secs(3));

    pub const ROUTER: RetryPolicy = RetryPolicy::new(6, Duration::from_secs(3));

    fn backoff(&self) -> FixedAttempts {
        FixedAttempts::new(*self)
    }
}

/// A [`Backoff`] that waits a constant delay and stops after
/// `attempts - 1` retries.
#[derive(Clone, Debug)]
pub struct FixedAttempts {
    delay: Duration,
    retries: u32,
    remaining: u32,
}

impl FixedAttempts {
    pub fn new(policy: RetryPolicy) -> Self {
        let retries = policy.attempts.saturating_sub(1);
        FixedAttempts { delay: policy.delay, retries, remaining: retries }
    }
}

impl Backoff for FixedAttempts {
    fn reset(&mut self) {
        self.remaining = self.retries;
    }

    fn next_backoff(&mut self) -> Option<Duration> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        Some(self.delay)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PollError {
    #[error(
        "{what} did not converge after {attempts} attempts \
         (last observed: {last_observation})"
    )]
    Timeout { what: String, attempts: u32, last_observation: String },

    #[error("cancelled while waiting for {what}")]
    Cancelled { what: String },
}

/// Calls `fetch` until `predicate` accepts what it returns, at most
/// `policy.attempts` times with `policy.delay` between calls.
///
/// The predicate returns `Err(description)` for an observation that is not
/// yet acceptable; the last description is carried in
/// [`PollError::Timeout`]. Cancelling `cancel` abandons the poll at the next
/// await point.
pub async fn poll_until<T, F, Fut, P>(
    log: &Logger,
    what: &str,
    policy: RetryPolicy,
    cancel: &CancellationToken,
    fetch: F,
    predicate: P,
) -> Result<T, PollError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = T>,
    P: Fn(&T) -> Result<(), String>,
{
    let attempt = AtomicU32::new(0);
    let fetch = &fetch;
    let predicate = &predicate;
    let counter = &attempt;

    let poll_once = || async move {
        counter.fetch_add(1, Ordering::Relaxed);
        let observed = fetch().await;
        match predicate(&observed) {
            Ok(()) => Ok(observed),
            Err(reason) => Err(BackoffError::transient(reason)),
        }
    };
    let log_failure = |reason: String, delay: Duration| {
        info!(
            log,
            "not converged yet";
            "what" => what,
            "attempt" => counter.load(Ordering::Relaxed),
            "of" => policy.attempts,
            "observed" => reason,
            "retry_in" => ?delay,
        );
    };

    let retry =
        backoff::future::retry_notify(policy.backoff(), poll_once, log_failure);
    tokio::select! {
        biased;

        _ = cancel.cancelled() => {
            Err(PollError::Cancelled { what: what.to_string() })
        }

        result = retry => match result {
            Ok(observed) => {
                info!(
                    log,
                    "converged";
                    "what" => what,
                    "attempts" => attempt.load(Ordering::Relaxed),
                );
                Ok(observed)
            }
            Err(last_observation) => Err(PollError::Timeout {
                what: what.to_string(),
                attempts: attempt.load(Ordering::Relaxed),
                last_observation,
            }),
        },
    }
}

mod duration_secs {
    use serde::Deserialize;
    use serde::Deserializer;
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        value: &Duration,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slog::o;

    fn log() -> Logger {
        Logger::root(slog::Discard, o!())
    }

    /// Polls a counter that becomes acceptable on call `k`.
    async fn poll_counter(
        policy: RetryPolicy,
        k: u32,
    ) -> (Result<u32, PollError>, u32) {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result = poll_until(
            &log(),
            "counter",
            policy,
            &CancellationToken::new(),
            || async move { calls.fetch_add(1, Ordering::SeqCst) + 1 },
            |n: &u32| {
                if *n >= k {
                    Ok(())
                } else {
                    Err(format!("call {n}"))
                }
            },
        )
        .await;
        (result, counter.load(Ordering::SeqCst))
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_on_first_attempt() {
        let start = tokio::time::Instant::now();
        let (result, calls) = poll_counter(RetryPolicy::REPLICATION, 1).await;
        assert_eq!(result.unwrap(), 1);
        assert_eq!(calls, 1);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_on_last_attempt() {
        let policy = RetryPolicy::new(5, Duration::from_secs(3));
        let start = tokio::time::Instant::now();
        let (result, calls) = poll_counter(policy, 5).await;
        assert_eq!(result.unwrap(), 5);
        assert_eq!(calls, 5);
        assert_eq!(start.elapsed(), Duration::from_secs(12));
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_one_past_the_budget() {
        let policy = RetryPolicy::new(5, Duration::from_secs(3));
        let (result, calls) = poll_counter(policy, 6).await;
        assert_eq!(calls, 5);
        match result {
            Err(PollError::Timeout { what, attempts, last_observation }) => {
                assert_eq!(what, "counter");
                assert_eq!(attempts, 5);
                assert_eq!(last_observation, "call 5");
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_the_poll() {
        let cancel = CancellationToken::new();
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let log = log();
        let poll = poll_until(
            &log,
            "never",
            RetryPolicy::QUORUM,
            &cancel,
            || async move { calls.fetch_add(1, Ordering::SeqCst) },
            |_: &u32| Err("not yet".to_string()),
        );
        let canceller = async {
            tokio::time::sleep(Duration::from_secs(7)).await;
            cancel.cancel();
        };
        let (result, ()) = tokio::join!(poll, canceller);
        assert!(matches!(result, Err(PollError::Cancelled { .. })));
        assert!(counter.load(Ordering::SeqCst) < RetryPolicy::QUORUM.attempts);
    }

    #[test]
    fn policies_parse_from_toml() {
        let policy: RetryPolicy =
            toml::from_str("attempts = 4\ndelay_secs = 10\n").unwrap();
        assert_eq!(policy, RetryPolicy::new(4, Duration::from_secs(10)));
    }
}
