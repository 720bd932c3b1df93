use std::time::Duration;

/// Exponential backoff for retryable step failures.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    initial_delay: Duration,
    exponentiation_factor: f64,
    max_delay: Duration,
    max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(60),
            exponentiation_factor: 2.0,
            max_delay: Duration::from_secs(3600),
            max_attempts: 5,
        }
    }
}

impl RetryPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn exponentiation_factor(mut self, factor: f64) -> Self {
        self.exponentiation_factor = factor.max(1.0);
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Delay before retrying after `attempt` consecutive failures, or `None`
    /// once the attempt budget is spent.
    pub fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt >= self.max_attempts {
            return None;
        }
        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let secs = self.initial_delay.as_secs_f64() * self.exponentiation_factor.powi(exponent);
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return Some(self.max_delay);
        }
        Some(Duration::from_secs_f64(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_until_capped() {
        let policy = RetryPolicy::new()
            .initial_delay(Duration::from_secs(60))
            .exponentiation_factor(2.0)
            .max_delay(Duration::from_secs(300))
            .max_attempts(10);

        assert_eq!(policy.next_delay(1), Some(Duration::from_secs(60)));
        assert_eq!(policy.next_delay(2), Some(Duration::from_secs(120)));
        assert_eq!(policy.next_delay(3), Some(Duration::from_secs(240)));
        assert_eq!(policy.next_delay(4), Some(Duration::from_secs(300)));
        assert_eq!(policy.next_delay(9), Some(Duration::from_secs(300)));
    }

    #[test]
    fn attempts_are_bounded() {
        let policy = RetryPolicy::new().max_attempts(3);
        assert!(policy.next_delay(2).is_some());
        assert_eq!(policy.next_delay(3), None);
        assert_eq!(policy.next_delay(4), None);
    }

    #[test]
    fn single_attempt_never_retries() {
        let policy = RetryPolicy::new().max_attempts(1);
        assert_eq!(policy.next_delay(1), None);
    }

    #[test]
    fn huge_exponents_saturate_at_max_delay() {
        let policy = RetryPolicy::new()
            .exponentiation_factor(10.0)
            .max_delay(Duration::from_secs(3600))
            .max_attempts(u32::MAX);
        assert_eq!(policy.next_delay(500), Some(Duration::from_secs(3600)));
    }
}
