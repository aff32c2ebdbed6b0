//! Pacing of upstream reconnect attempts

use std::time::Duration;

/// Delay grows by a factor of two per consecutive failed session, up to
/// `ceiling`, plus up to 25% random spread.
pub struct Backoff {
    floor: Duration,
    ceiling: Duration,
    failures: u32,
}

impl Backoff {
    pub fn new(initial_ms: u64, max_ms: u64) -> Self {
        Self {
            floor: Duration::from_millis(initial_ms),
            ceiling: Duration::from_millis(max_ms),
            failures: 0,
        }
    }

    /// Wait before the next connection attempt.
    pub fn next_delay(&mut self) -> Duration {
        let factor = 2u32.checked_pow(self.failures).unwrap_or(u32::MAX);
        let base = self.floor.saturating_mul(factor).min(self.ceiling);
        let spread = base.mul_f64(rand::random::<f64>() * 0.25);
        self.failures = self.failures.saturating_add(1);
        base + spread
    }

    /// Called once a subscription is accepted.
    pub fn reset(&mut self) {
        self.failures = 0;
    }

    /// Consecutive failed sessions so far.
    pub fn attempt(&self) -> u32 {
        self.failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_double() {
        let mut backoff = Backoff::new(100, 10_000);

        let d1 = backoff.next_delay().as_millis();
        let d2 = backoff.next_delay().as_millis();
        let d3 = backoff.next_delay().as_millis();

        assert!((100..=125).contains(&d1));
        assert!((200..=250).contains(&d2));
        assert!((400..=500).contains(&d3));
    }

    #[test]
    fn delays_are_capped() {
        let mut backoff = Backoff::new(100, 500);
        for _ in 0..80 {
            assert!(backoff.next_delay().as_millis() <= 625);
        }
    }

    #[test]
    fn reset_starts_over() {
        let mut backoff = Backoff::new(100, 10_000);
        backoff.next_delay();
        backoff.next_delay();
        assert_eq!(backoff.attempt(), 2);

        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert!(backoff.next_delay().as_millis() < 200);
    }
}
