use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Failed attempts allowed in a row, `-1` for unlimited.
    pub max_retries: i64,
    pub reconnect_delay: Duration,
    /// Double the delay after each consecutive failure, capped at `max_delay`.
    pub backoff: bool,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: -1,
            reconnect_delay: Duration::from_secs(3),
            backoff: false,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn unlimited(&self) -> bool {
        self.max_retries < 0
    }

    fn delay_after(&self, failures: u32) -> Duration {
        if !self.backoff {
            return self.reconnect_delay;
        }
        let exp = failures.saturating_sub(1).min(16);
        self.reconnect_delay
            .saturating_mul(1 << exp)
            .min(self.max_delay.max(self.reconnect_delay))
    }
}

/// Failure counter for one run of the transport.
#[derive(Debug, Clone)]
pub struct TransportAttempt {
    attempt_count: u32,
    policy: RetryPolicy,
}

impl TransportAttempt {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            attempt_count: 0,
            policy,
        }
    }

    /// Failed attempts since the last reset.
    pub fn count(&self) -> u32 {
        self.attempt_count
    }

    /// Records a failed attempt. Returns the wait before the next one, or `None` once
    /// the policy is exhausted.
    pub fn record_failure(&mut self) -> Option<Duration> {
        self.attempt_count = self.attempt_count.saturating_add(1);
        if self.policy.unlimited() || i64::from(self.attempt_count) < self.policy.max_retries {
            Some(self.policy.delay_after(self.attempt_count))
        } else {
            None
        }
    }

    pub fn reset(&mut self) {
        self.attempt_count = 0;
    }
}
