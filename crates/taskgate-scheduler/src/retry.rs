//! Retry policy: attempt budget and exponential backoff.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Per-task retry state.
///
/// `RetryPolicy::none()` is the default for every new task: a task a guardrail
/// deliberately failed must not silently run again. Tasks opt in with
/// [`RetryPolicy::new`] or `Scheduler::set_retry_policy`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Failures recorded so far. Only grows on a transition into `failed`.
    pub attempts: u32,
    pub base_delay_secs: u64,
    /// While set and in the future, the task is not eligible.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<DateTime<Utc>>,
}

impl RetryPolicy {
    /// No automatic retry.
    pub fn none() -> Self {
        Self::new(0, 0)
    }

    pub fn new(max_attempts: u32, base_delay_secs: u64) -> Self {
        Self {
            max_attempts,
            attempts: 0,
            base_delay_secs,
            next_retry_at: None,
        }
    }

    /// Backoff before retry number `attempt` (1-indexed): `base * 2^(attempt-1)`.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(30);
        let secs = self.base_delay_secs.saturating_mul(1u64 << exp);
        let max_secs = (i64::MAX / 1000) as u64;
        Duration::seconds(secs.min(max_secs) as i64)
    }

    /// No retries remaining.
    pub fn exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }

    pub fn is_backing_off(&self, now: DateTime<Utc>) -> bool {
        self.next_retry_at.is_some_and(|at| at > now)
    }

    /// Consume one attempt and compute when the task may run again.
    /// Returns `None` when the budget is already spent.
    pub fn record_failure(&mut self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if self.exhausted() {
            return None;
        }
        self.attempts += 1;
        let at = now
            .checked_add_signed(self.backoff_for(self.attempts))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.next_retry_at = Some(at);
        Some(at)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::none()
    }
}
