//! Retry/backoff policy for failed jobs.
//!
//! Pure exponential backoff keyed on the attempt count: the `n`-th failure
//! waits `2^n × base_unit`. There is no jitter and no cap; arithmetic
//! saturates instead of overflowing.

use std::time::Duration;

use chrono::{DateTime, Utc};

use super::types::Job;

/// Default backoff unit.
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(10);

/// Attempt ceiling actually applied to a job: the lower of the job's own
/// `max_attempts` and the worker's configured ceiling, never below 1.
pub fn effective_max_attempts(job_max_attempts: u32, policy_max_attempts: u32) -> u32 {
    job_max_attempts.min(policy_max_attempts).max(1)
}

/// Retry policy configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Worker-wide ceiling on attempts
    pub max_attempts: u32,
    /// Backoff multiplier unit
    pub base_unit: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_unit: DEFAULT_BACKOFF_BASE,
        }
    }
}

/// What to do with a job whose current attempt just failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Put it back in the pool at `next_schedule_at`.
    Retry {
        attempt: u32,
        backoff: Duration,
        next_schedule_at: DateTime<Utc>,
    },
    /// Attempts exhausted; park it in `dead`.
    DeadLetter { attempt: u32 },
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_unit: Duration) -> Self {
        Self {
            max_attempts,
            base_unit,
        }
    }

    /// Delay before the job becomes claimable again after failure number
    /// `attempt` (1-indexed).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        2u32.checked_pow(attempt)
            .and_then(|factor| self.base_unit.checked_mul(factor))
            .unwrap_or(Duration::MAX)
    }

    /// Decide between retry and dead-letter for a failed run of `job`.
    pub fn decide(&self, job: &Job, now: DateTime<Utc>) -> RetryDecision {
        let attempt = job.attempts.saturating_add(1);

        if attempt >= effective_max_attempts(job.max_attempts, self.max_attempts) {
            return RetryDecision::DeadLetter { attempt };
        }

        let backoff = self.backoff_for(attempt);
        let next_schedule_at = chrono::Duration::from_std(backoff)
            .ok()
            .and_then(|d| now.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        RetryDecision::Retry {
            attempt,
            backoff,
            next_schedule_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use searchsync_core::SubjectId;

    use crate::jobs::types::JobAction;

    fn job_with_attempts(attempts: u32, max_attempts: u32) -> Job {
        let mut job = Job::new(SubjectId::new(), JobAction::Index, max_attempts);
        job.attempts = attempts;
        job
    }

    #[test]
    fn first_failure_waits_twenty_seconds() {
        let policy = RetryPolicy::default();
        let now = Utc::now();

        match policy.decide(&job_with_attempts(0, 5), now) {
            RetryDecision::Retry {
                attempt,
                backoff,
                next_schedule_at,
            } => {
                assert_eq!(attempt, 1);
                assert_eq!(backoff, Duration::from_secs(20));
                assert_eq!(next_schedule_at, now + chrono::Duration::seconds(20));
            }
            other => panic!("expected retry, got {other:?}"),
        }
    }

    #[test]
    fn dead_letter_boundary() {
        let policy = RetryPolicy::new(3, Duration::from_secs(10));
        let now = Utc::now();

        assert!(matches!(
            policy.decide(&job_with_attempts(0, 3), now),
            RetryDecision::Retry { attempt: 1, .. }
        ));
        assert!(matches!(
            policy.decide(&job_with_attempts(1, 3), now),
            RetryDecision::Retry { attempt: 2, .. }
        ));
        assert_eq!(
            policy.decide(&job_with_attempts(2, 3), now),
            RetryDecision::DeadLetter { attempt: 3 }
        );
    }

    #[test]
    fn lower_of_job_and_worker_ceiling_applies() {
        let now = Utc::now();

        let strict_worker = RetryPolicy::new(2, Duration::from_secs(1));
        assert_eq!(
            strict_worker.decide(&job_with_attempts(1, 10), now),
            RetryDecision::DeadLetter { attempt: 2 }
        );

        let lenient_worker = RetryPolicy::new(10, Duration::from_secs(1));
        assert_eq!(
            lenient_worker.decide(&job_with_attempts(1, 2), now),
            RetryDecision::DeadLetter { attempt: 2 }
        );

        // A zero ceiling still behaves like a single attempt.
        assert_eq!(effective_max_attempts(0, 5), 1);
        assert_eq!(
            lenient_worker.decide(&job_with_attempts(0, 0), now),
            RetryDecision::DeadLetter { attempt: 1 }
        );
    }

    #[test]
    fn huge_attempt_counts_saturate() {
        let policy = RetryPolicy::new(u32::MAX, Duration::from_secs(10));
        assert_eq!(policy.backoff_for(40), Duration::MAX);

        match policy.decide(&job_with_attempts(100, u32::MAX), Utc::now()) {
            RetryDecision::Retry {
                next_schedule_at, ..
            } => assert_eq!(next_schedule_at, DateTime::<Utc>::MAX_UTC),
            other => panic!("expected retry, got {other:?}"),
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: the delay after a failure at `attempts = a` is
        /// `2^(a+1) × base` and strictly grows with `a`.
        #[test]
        fn backoff_is_exponential_and_strictly_increasing(
            a in 0u32..20,
            base_ms in 1u64..60_000,
        ) {
            let policy = RetryPolicy::new(u32::MAX, Duration::from_millis(base_ms));
            let now = Utc::now();

            let delay = |attempts: u32| match policy.decide(&job_with_attempts(attempts, u32::MAX), now) {
                RetryDecision::Retry { backoff, .. } => backoff,
                RetryDecision::DeadLetter { .. } => panic!("unexpected dead letter"),
            };

            prop_assert_eq!(delay(a), Duration::from_millis(base_ms) * 2u32.pow(a + 1));
            prop_assert!(delay(a + 1) > delay(a));
        }
    }
}
