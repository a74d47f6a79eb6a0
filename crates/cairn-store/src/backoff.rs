use std::hint;
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// How long and how aggressively to retry a failed non-blocking claim.
///
/// Waiting goes through three phases: a few busy spins, then a few
/// `yield_now` calls, then sleeps that double from `initial_sleep_us` up to
/// `max_sleep_us`. With `timeout_ms` set, retrying stops once that much time
/// has passed since the first attempt.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub spin_limit: u32,
    pub yield_limit: u32,
    pub initial_sleep_us: u64,
    pub max_sleep_us: u64,
    pub timeout_ms: Option<u64>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            spin_limit: 8,
            yield_limit: 8,
            initial_sleep_us: 50,
            max_sleep_us: 10_000,
            timeout_ms: Some(5_000),
        }
    }
}

impl RetryPolicy {
    /// A policy that gives up after the first failed attempt.
    pub fn no_wait() -> Self {
        Self {
            timeout_ms: Some(0),
            ..Self::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout_ms = timeout.map(|t| t.as_millis() as u64);
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    /// Call `attempt` until it yields a value or the policy gives up.
    pub fn retry<T>(&self, mut attempt: impl FnMut() -> Option<T>) -> Option<T> {
        let mut backoff = Backoff::new(self);
        loop {
            if let Some(value) = attempt() {
                return Some(value);
            }
            if !backoff.snooze() {
                return None;
            }
        }
    }
}

/// Stateful waiter driven by a [`RetryPolicy`].
#[derive(Debug)]
pub struct Backoff {
    spin_limit: u32,
    yield_limit: u32,
    max_sleep: Duration,
    sleep: Duration,
    step: u32,
    deadline: Option<Instant>,
}

impl Backoff {
    pub fn new(policy: &RetryPolicy) -> Self {
        Self {
            spin_limit: policy.spin_limit,
            yield_limit: policy.yield_limit,
            max_sleep: Duration::from_micros(policy.max_sleep_us.max(1)),
            sleep: Duration::from_micros(policy.initial_sleep_us.max(1)),
            step: 0,
            deadline: policy.timeout().map(|t| Instant::now() + t),
        }
    }

    /// Wait before the next attempt. Returns `false` once the deadline has
    /// passed, in which case the caller should give up.
    pub fn snooze(&mut self) -> bool {
        let now = Instant::now();
        if let Some(deadline) = self.deadline {
            if now >= deadline {
                return false;
            }
        }

        if self.step < self.spin_limit {
            for _ in 0..(1u32 << self.step.min(6)) {
                hint::spin_loop();
            }
        } else if self.step < self.spin_limit.saturating_add(self.yield_limit) {
            thread::yield_now();
        } else {
            let nap = match self.deadline {
                Some(deadline) => self.sleep.min(deadline.saturating_duration_since(now)),
                None => self.sleep,
            };
            thread::sleep(nap);
            self.sleep = (self.sleep * 2).min(self.max_sleep);
        }
        self.step = self.step.saturating_add(1);
        true
    }

    /// Number of completed waits.
    pub fn attempts(&self) -> u32 {
        self.step
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_wait_gives_up_immediately() {
        let mut calls = 0;
        let result: Option<()> = RetryPolicy::no_wait().retry(|| {
            calls += 1;
            None
        });
        assert!(result.is_none());
        assert_eq!(calls, 1);
    }

    #[test]
    fn retry_returns_first_success() {
        let mut calls = 0;
        let result = RetryPolicy::default().retry(|| {
            calls += 1;
            (calls == 20).then_some(calls)
        });
        assert_eq!(result, Some(20));
    }

    #[test]
    fn deadline_bounds_total_wait() {
        let policy = RetryPolicy::default().with_timeout(Some(Duration::from_millis(30)));
        let start = Instant::now();
        let result: Option<()> = policy.retry(|| None);
        assert!(result.is_none());
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(30));
        assert!(elapsed < Duration::from_secs(2));
    }

    #[test]
    fn sleeps_grow_up_to_cap() {
        let policy = RetryPolicy {
            spin_limit: 0,
            yield_limit: 0,
            initial_sleep_us: 10,
            max_sleep_us: 40,
            timeout_ms: None,
        };
        let mut backoff = Backoff::new(&policy);
        for _ in 0..5 {
            assert!(backoff.snooze());
        }
        assert_eq!(backoff.sleep, Duration::from_micros(40));
        assert_eq!(backoff.attempts(), 5);
    }

    #[test]
    fn policy_from_partial_toml() {
        let policy: RetryPolicy = toml::from_str("timeout_ms = 250").unwrap();
        assert_eq!(policy.timeout(), Some(Duration::from_millis(250)));
        assert_eq!(policy.spin_limit, RetryPolicy::default().spin_limit);
    }
}
