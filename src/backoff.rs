/// Exponential backoff for redelivering failed jobs.
///
/// Jobs carry their own attempt count, so the policy is stateless: the
/// delay before attempt `n + 1` is `initial * multiplier^(n - 1)`, capped
/// at `max_delay`.
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    initial_delay: Duration,
    max_delay: Duration,
    multiplier: u32,
    /// Deliveries allowed per job, the first one included.
    max_attempts: u32,
}

impl Backoff {
    pub fn new(initial_delay: Duration, max_delay: Duration, multiplier: u32, max_attempts: u32) -> Self {
        Self {
            initial_delay,
            max_delay,
            multiplier: multiplier.max(1),
            max_attempts: max_attempts.max(1),
        }
    }

    /// Delay before the next delivery of a job that has failed
    /// `attempts` times.
    pub fn delay_after(&self, attempts: u32) -> Duration {
        let mut delay = self.initial_delay;
        for _ in 1..attempts {
            delay = delay.saturating_mul(self.multiplier);
            if delay >= self.max_delay {
                return self.max_delay;
            }
        }
        delay.min(self.max_delay)
    }

    /// Returns true if a job with `attempts` deliveries may not be retried.
    pub fn exceeded_max_attempts(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }
}
