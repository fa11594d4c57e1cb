// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Retry and Backoff State
//!
//! Consumers retry a failing handler in place, waiting between attempts
//! according to a `BackoffPolicy`. The per-delivery `RetryState` lives only
//! as long as the delivery is in flight: a requeue or a process restart
//! starts the count from zero again.

use rand::Rng;
use std::time::Duration;

/// Exponential backoff: `initial * multiplier^attempt`, capped at
/// `max_interval`, optionally jittered by up to ±50%.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub multiplier: f64,
    pub max_interval: Duration,
    pub randomize: bool,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy {
            initial: Duration::from_millis(1000),
            multiplier: 2.0,
            max_interval: Duration::from_millis(10000),
            randomize: false,
        }
    }
}

impl BackoffPolicy {
    /// Same wait between every attempt.
    pub fn fixed(interval: Duration) -> BackoffPolicy {
        BackoffPolicy {
            initial: interval,
            multiplier: 1.0,
            max_interval: interval,
            randomize: false,
        }
    }

    /// Replaces the initial interval, raising the cap if it would sit below it.
    pub fn with_initial(mut self, initial: Duration) -> Self {
        self.initial = initial;
        if self.max_interval < initial {
            self.max_interval = initial;
        }
        self
    }

    /// Wait before the retry following the `attempt`-th failure (0-based).
    pub fn interval_for(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.initial.as_secs_f64() * self.multiplier.powi(exponent);

        if !secs.is_finite() || secs >= self.max_interval.as_secs_f64() {
            return self.max_interval;
        }

        Duration::from_secs_f64(secs.max(0.0))
    }
}

/// Ephemeral retry bookkeeping for one in-flight delivery.
#[derive(Debug, Clone)]
pub struct RetryState {
    policy: BackoffPolicy,
    attempts: u32,
    last_error: Option<String>,
}

impl RetryState {
    pub fn new(policy: BackoffPolicy) -> RetryState {
        RetryState {
            policy,
            attempts: 0,
            last_error: None,
        }
    }

    /// Number of failed attempts so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn record_failure(&mut self, error: impl Into<String>) {
        self.attempts += 1;
        self.last_error = Some(error.into());
    }

    /// True while fewer than `retry_count` retries have been spent.
    pub fn can_retry(&self, retry_count: u32) -> bool {
        self.attempts <= retry_count
    }

    /// Wait before the next attempt.
    pub fn next_interval(&self) -> Duration {
        let base = self
            .policy
            .interval_for(self.attempts.saturating_sub(1));

        if !self.policy.randomize || base.is_zero() {
            return base;
        }

        let factor = rand::rng().random_range(0.5..=1.5);
        base.mul_f64(factor).min(self.policy.max_interval)
    }
}
