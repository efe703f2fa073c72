// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Retry policy engine.
//!
//! Classification is a pure function of the error a step returned:
//!
//! | Error | Class | Behaviour |
//! |-------|-------|-----------|
//! | `Permanent`, `Forbidden`, `NotFound` | [`FailureClass::Permanent`] | surfaced immediately |
//! | `Transient` | [`FailureClass::Transient`] | retried with exponential backoff |
//! | `Snooze(d)` | [`FailureClass::Snooze`] | job deferred by `d`, attempt not consumed |
//!
//! The same [`RetryPolicy`] computes in-place step retries inside the executor and
//! job-level retries in the queue.

use std::time::Duration;

use crate::error::StepError;

/// How a failure should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Never retried.
    Permanent,
    /// Retried until attempts are exhausted.
    Transient,
    /// Re-run the whole job after the delay.
    Snooze(Duration),
    /// Cooperative cancellation was observed.
    Cancelled,
}

impl FailureClass {
    /// Returns the string representation of the class.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Permanent => "permanent",
            Self::Transient => "transient",
            Self::Snooze(_) => "snooze",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Classify a step failure.
pub fn classify(error: &StepError) -> FailureClass {
    match error {
        StepError::Permanent(_) | StepError::Forbidden(_) | StepError::NotFound(_) => {
            FailureClass::Permanent
        }
        StepError::Transient(_) => FailureClass::Transient,
        StepError::Snooze(delay) => FailureClass::Snooze(*delay),
    }
}

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Try again after the delay.
    Retry(Duration),
    /// Defer without consuming an attempt.
    Snooze(Duration),
    /// Stop and surface the failure.
    GiveUp,
}

/// Exponential backoff bounded by a cap: attempt `n` waits `base * 2^(n-1)`, at most `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Create a new retry policy.
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
        }
    }

    /// A policy that retries immediately. Useful in tests.
    pub fn immediate() -> Self {
        Self::new(Duration::ZERO, Duration::ZERO)
    }

    /// Calculate delay for a given attempt (1-indexed).
    ///
    /// Attempt 1 is the first retry (after the initial failure).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let multiplier = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay
            .checked_mul(multiplier)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Decide what happens after `attempt` (1-indexed) failed out of `max_attempts`.
    pub fn decide(&self, class: FailureClass, attempt: u32, max_attempts: u32) -> RetryDecision {
        match class {
            FailureClass::Transient if attempt < max_attempts => {
                RetryDecision::Retry(self.delay_for_attempt(attempt))
            }
            FailureClass::Snooze(delay) => RetryDecision::Snooze(delay),
            FailureClass::Transient | FailureClass::Permanent | FailureClass::Cancelled => {
                RetryDecision::GiveUp
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(3600),
        }
    }
}
