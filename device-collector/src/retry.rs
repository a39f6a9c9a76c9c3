use std::time;

#[derive(Copy, Clone, Debug, PartialEq)]
/// The retry policy quarantine uses to space out re-validation attempts.
pub struct RetryPolicy {
    /// Coefficient to multiply initial_interval with for every past retry.
    backoff_coefficient: f64,
    /// The backoff interval before the first retry.
    initial_interval: time::Duration,
    /// The maximum possible backoff between retries.
    maximum_interval: time::Duration,
    /// Total number of attempts, the first one included.
    max_attempts: u32,
}

impl RetryPolicy {
    pub fn new(
        backoff_coefficient: f64,
        initial_interval: time::Duration,
        maximum_interval: time::Duration,
        max_attempts: u32,
    ) -> Self {
        Self {
            backoff_coefficient,
            initial_interval,
            maximum_interval,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Time to wait before running `attempt` (1-based). The first attempt runs immediately,
    /// the second waits `initial_interval`, and each following one multiplies the previous
    /// wait by the coefficient, capped at `maximum_interval`.
    pub fn delay_before(&self, attempt: u32) -> time::Duration {
        if attempt <= 1 {
            return time::Duration::ZERO;
        }

        let exponent = i32::try_from(attempt - 2).unwrap_or(i32::MAX);
        let factor = self.backoff_coefficient.powi(exponent);
        let candidate = self.initial_interval.as_secs_f64() * factor;

        if !candidate.is_finite() || candidate >= self.maximum_interval.as_secs_f64() {
            return self.maximum_interval;
        }

        std::cmp::min(
            time::Duration::from_secs_f64(candidate),
            self.maximum_interval,
        )
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff_coefficient: 2.0,
            initial_interval: time::Duration::from_secs(1),
            maximum_interval: time::Duration::from_secs(10),
            max_attempts: 3,
        }
    }
}
