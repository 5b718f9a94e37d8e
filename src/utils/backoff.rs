//! Fixed-interval retry policy shared by the initial connect and the
//! mid-stream reconnection path.

use std::time::Duration;

use crate::utils::error::{InboundError, Result};

/// Sentinel used in configuration for "retry forever".
pub const UNBOUNDED_RETRIES: i64 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryLimit {
    Unbounded,
    Bounded(u32),
}

/// How long to wait between attempts and how many attempts to make.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub interval: Duration,
    pub limit: RetryLimit,
}

impl RetryPolicy {
    /// Builds a policy from the raw configuration values.
    ///
    /// `retry_count` is `-1` for unbounded, `0` for no retry, `n` for at most
    /// `n` retries. Anything else, or a negative interval, is rejected.
    pub fn from_config(retry_interval_ms: i64, retry_count: i64) -> Result<Self> {
        if retry_interval_ms < 0 {
            return Err(InboundError::configuration(format!(
                "retry interval must be non-negative, got {retry_interval_ms}"
            )));
        }
        let limit = match retry_count {
            UNBOUNDED_RETRIES => RetryLimit::Unbounded,
            n if n >= 0 => RetryLimit::Bounded(u32::try_from(n).map_err(|_| {
                InboundError::configuration(format!("retry count {n} is too large"))
            })?),
            n => {
                return Err(InboundError::configuration(format!(
                    "retry count must be -1 or non-negative, got {n}"
                )));
            }
        };
        Ok(Self {
            interval: Duration::from_millis(retry_interval_ms as u64),
            limit,
        })
    }

    pub fn is_unbounded(&self) -> bool {
        self.limit == RetryLimit::Unbounded
    }

    /// Starts a fresh attempt budget.
    pub fn backoff(&self) -> Backoff {
        Backoff {
            policy: *self,
            attempts: 0,
        }
    }
}

/// One retry budget. Each call to [`Backoff::next_delay`] consumes an attempt.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    attempts: u32,
}

impl Backoff {
    /// Returns the delay to wait before the next attempt, or `None` once the
    /// budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.is_exhausted() {
            return None;
        }
        self.attempts = self.attempts.saturating_add(1);
        Some(self.policy.interval)
    }

    pub fn is_exhausted(&self) -> bool {
        match self.policy.limit {
            RetryLimit::Unbounded => false,
            RetryLimit::Bounded(max) => self.attempts >= max,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}
