//! Reconciliation loop primitives.
//!
//! This library provides helpers for implementing level-triggered
//! reconciliation loops that converge declared intent with observed state.
//! Key concepts:
//!
//! - **Requeue hint**: What the caller should do after a pass (nothing,
//!   run again now, or run again after a delay).
//! - **Conflict retry**: Bounded exponential backoff around a
//!   fetch-modify-write cycle that may lose an optimistic-concurrency race.
//! - **Restart budget**: Whether a failed long-running workload may be
//!   recreated, given how many restarts have already been spent.
//!
//! # Invariants
//!
//! - All decisions are deterministic given the same inputs
//! - Restart counts only ever increase
//! - Retry loops are always bounded

use std::future::Future;
use std::time::Duration;

use thiserror::Error;

/// Fixed delay before retrying a pass that failed on a transient dependency
/// (e.g. a backing store that is still starting).
pub const PROVISION_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Delay before re-examining a workload whose backing unit was just deleted
/// for a restart. Gives the deletion time to be observed.
pub const RESTART_REQUEUE_DELAY: Duration = Duration::from_secs(5);

/// `max_restarts` value meaning "restart forever".
pub const UNLIMITED_RESTARTS: i32 = -1;

/// Error returned by [`ConflictBackoff::retry_on_conflict`].
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// Every attempt lost an optimistic-concurrency race.
    #[error("still conflicting after {attempts} attempts")]
    Exhausted { attempts: u32, last: E },

    /// A non-conflict error ended the loop early.
    #[error(transparent)]
    Failed(E),
}

/// What the caller should do once a reconciliation pass returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requeue {
    /// Converged (or nothing to do): wait for the next change notification.
    Done,

    /// A step completed and the next one should run right away.
    Immediately,

    /// Run again after the given delay.
    After(Duration),
}

impl Requeue {
    /// Returns true if no follow-up pass was requested.
    pub fn is_done(&self) -> bool {
        matches!(self, Self::Done)
    }

    /// Delay before the follow-up pass, if any.
    pub fn delay(&self) -> Option<Duration> {
        match self {
            Self::Done => None,
            Self::Immediately => Some(Duration::ZERO),
            Self::After(d) => Some(*d),
        }
    }
}

/// Bounded exponential backoff for optimistic-concurrency retries.
#[derive(Debug, Clone)]
pub struct ConflictBackoff {
    /// Maximum number of attempts (including the first).
    pub max_attempts: u32,

    /// Delay after the first conflict.
    pub initial_delay: Duration,

    /// Multiplier applied to the delay after each conflict.
    pub factor: u32,

    /// Upper bound for a single delay.
    pub max_delay: Duration,
}

impl Default for ConflictBackoff {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(10),
            factor: 2,
            max_delay: Duration::from_millis(500),
        }
    }
}

impl ConflictBackoff {
    /// Delay to wait after the given (1-based) failed attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let scaled = self
            .initial_delay
            .saturating_mul(self.factor.saturating_pow(exp));
        scaled.min(self.max_delay)
    }

    /// Run `op` until it succeeds, fails with a non-conflict error, or the
    /// attempt budget is spent.
    ///
    /// `op` must re-read whatever state it writes on every call; the loop
    /// only decides whether to try again.
    pub async fn retry_on_conflict<T, E, F, Fut, C>(
        &self,
        is_conflict: C,
        mut op: F,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Fn(&E) -> bool,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if is_conflict(&e) => {
                    if attempt >= max_attempts {
                        return Err(RetryError::Exhausted {
                            attempts: attempt,
                            last: e,
                        });
                    }
                    tokio::time::sleep(self.delay_for(attempt)).await;
                    attempt += 1;
                }
                Err(e) => return Err(RetryError::Failed(e)),
            }
        }
    }
}

/// Outcome of evaluating a restart budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    /// Restart allowed; `attempt` is the new restart count.
    Restart { attempt: i32 },

    /// Budget spent. Terminal: no further automatic recovery.
    Exhausted { max_restarts: i32 },
}

/// Restart budget for long-running workloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartBudget {
    max_restarts: i32,
}

impl RestartBudget {
    /// Create a budget. Only [`UNLIMITED_RESTARTS`] is unlimited; any other
    /// negative value never restarts.
    pub fn new(max_restarts: i32) -> Self {
        Self { max_restarts }
    }

    /// Returns true if restarts never run out.
    pub fn is_unlimited(&self) -> bool {
        self.max_restarts == UNLIMITED_RESTARTS
    }

    /// Decide whether a workload that has already been restarted
    /// `restart_count` times may be restarted again.
    pub fn evaluate(&self, restart_count: i32) -> RestartDecision {
        if self.is_unlimited() || restart_count < self.max_restarts {
            RestartDecision::Restart {
                attempt: restart_count.saturating_add(1),
            }
        } else {
            RestartDecision::Exhausted {
                max_restarts: self.max_restarts,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_requeue_delay() {
        assert_eq!(Requeue::Done.delay(), None);
        assert_eq!(Requeue::Immediately.delay(), Some(Duration::ZERO));
        assert_eq!(
            Requeue::After(RESTART_REQUEUE_DELAY).delay(),
            Some(Duration::from_secs(5))
        );
        assert!(Requeue::Done.is_done());
        assert!(!Requeue::Immediately.is_done());
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let backoff = ConflictBackoff::default();
        assert_eq!(backoff.delay_for(1), Duration::from_millis(10));
        assert_eq!(backoff.delay_for(2), Duration::from_millis(20));
        assert_eq!(backoff.delay_for(3), Duration::from_millis(40));
        assert_eq!(backoff.delay_for(30), Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_conflicts() {
        let backoff = ConflictBackoff {
            initial_delay: Duration::from_millis(1),
            ..Default::default()
        };
        let calls = Cell::new(0);

        let result: Result<u32, RetryError<&str>> = backoff
            .retry_on_conflict(
                |e| *e == "conflict",
                |attempt| {
                    calls.set(calls.get() + 1);
                    async move {
                        if attempt < 3 {
                            Err("conflict")
                        } else {
                            Ok(attempt)
                        }
                    }
                },
            )
            .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.get(), 3);
    }

    #[tokio::test]
    async fn test_retry_is_bounded() {
        let backoff = ConflictBackoff {
            max_attempts: 4,
            initial_delay: Duration::from_millis(1),
            ..Default::default()
        };

        let result: Result<(), RetryError<&str>> = backoff
            .retry_on_conflict(|_| true, |_| async { Err("conflict") })
            .await;

        match result {
            Err(RetryError::Exhausted { attempts, last }) => {
                assert_eq!(attempts, 4);
                assert_eq!(last, "conflict");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_retry_stops_on_other_errors() {
        let backoff = ConflictBackoff::default();
        let calls = Cell::new(0);

        let result: Result<(), RetryError<&str>> = backoff
            .retry_on_conflict(
                |e| *e == "conflict",
                |_| {
                    calls.set(calls.get() + 1);
                    async { Err("gone") }
                },
            )
            .await;

        assert!(matches!(result, Err(RetryError::Failed("gone"))));
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_restart_budget() {
        let budget = RestartBudget::new(2);
        assert_eq!(budget.evaluate(0), RestartDecision::Restart { attempt: 1 });
        assert_eq!(budget.evaluate(1), RestartDecision::Restart { attempt: 2 });
        assert_eq!(
            budget.evaluate(2),
            RestartDecision::Exhausted { max_restarts: 2 }
        );
    }

    #[test]
    fn test_zero_budget_never_restarts() {
        let budget = RestartBudget::new(0);
        assert_eq!(
            budget.evaluate(0),
            RestartDecision::Exhausted { max_restarts: 0 }
        );
    }

    #[test]
    fn test_unlimited_budget() {
        let budget = RestartBudget::new(UNLIMITED_RESTARTS);
        assert!(budget.is_unlimited());
        assert_eq!(
            budget.evaluate(10_000),
            RestartDecision::Restart { attempt: 10_001 }
        );
    }

    #[test]
    fn test_other_negative_budgets_never_restart() {
        let budget = RestartBudget::new(-2);
        assert!(!budget.is_unlimited());
        assert_eq!(
            budget.evaluate(0),
            RestartDecision::Exhausted { max_restarts: -2 }
        );
        assert_eq!(
            budget.evaluate(7),
            RestartDecision::Exhausted { max_restarts: -2 }
        );
    }
}
