use std::time::Duration;

/// Bounded reconnect attempts with exponential delay.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max_attempts: u32,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            max_attempts,
            attempt: 0,
        }
    }

    /// Counts an attempt and returns the delay before it.
    pub fn next(&mut self) -> Duration {
        self.attempt += 1;
        self.base
            .checked_mul(2u32.pow((self.attempt - 1).min(3)))
            .unwrap_or(Duration::MAX)
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
