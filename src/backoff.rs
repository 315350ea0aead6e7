//! Restart/reconnect pacing shared by the process supervisor and the RCON client.
//!
//! The delay for attempt `n` is `base × factor^n`, clamped to `max`. A run that
//! stayed healthy for at least `healthy_uptime` resets the attempt counter and
//! the crash window. `max_failures` failures inside `window` exhaust the budget.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
    pub factor: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(60),
            factor: 2.0,
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `attempt` (0-indexed).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.min(i32::MAX as u32) as i32;
        let secs = self.base.as_secs_f64() * self.factor.max(1.0).powi(exp);
        if !secs.is_finite() || secs > self.max.as_secs_f64() {
            self.max
        } else {
            Duration::from_secs_f64(secs).min(self.max)
        }
    }
}

/// Rolling window of failure timestamps.
#[derive(Debug, Clone)]
pub struct CrashBudget {
    max_failures: u32,
    window: Duration,
    failures: VecDeque<Instant>,
}

impl CrashBudget {
    pub fn new(max_failures: u32, window: Duration) -> Self {
        Self {
            max_failures: max_failures.max(1),
            window,
            failures: VecDeque::new(),
        }
    }

    /// Records a failure; returns `true` when the budget is exhausted.
    pub fn record(&mut self, at: Instant) -> bool {
        while let Some(first) = self.failures.front() {
            if at.saturating_duration_since(*first) > self.window {
                self.failures.pop_front();
            } else {
                break;
            }
        }
        self.failures.push_back(at);
        self.failures.len() as u32 >= self.max_failures
    }

    pub fn count(&self) -> u32 {
        self.failures.len() as u32
    }

    pub fn reset(&mut self) {
        self.failures.clear();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    Restart { delay: Duration, attempt: u32 },
    GiveUp { failures: u32 },
}

/// Backoff plus budget plus healthy-uptime reset.
#[derive(Debug, Clone)]
pub struct RestartTracker {
    policy: BackoffPolicy,
    budget: CrashBudget,
    healthy_uptime: Duration,
    attempt: u32,
}

impl RestartTracker {
    pub fn new(policy: BackoffPolicy, budget: CrashBudget, healthy_uptime: Duration) -> Self {
        Self {
            policy,
            budget,
            healthy_uptime,
            attempt: 0,
        }
    }

    /// `uptime` is how long the failed run lasted.
    pub fn on_failure(&mut self, uptime: Duration, at: Instant) -> RestartDecision {
        if uptime >= self.healthy_uptime {
            self.attempt = 0;
            self.budget.reset();
        }
        if self.budget.record(at) {
            return RestartDecision::GiveUp {
                failures: self.budget.count(),
            };
        }
        let delay = self.policy.delay(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        RestartDecision::Restart {
            delay,
            attempt: self.attempt,
        }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
        self.budget.reset();
    }
}
