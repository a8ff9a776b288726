//! Elapsed-time accumulator
//!
//! Fires once each time the accumulated cycle time crosses the period. Unlike a
//! wall-clock modulo check, a late tick cannot skip a deadline; it only fires
//! it late. Backlog beyond one period is dropped so a long stall produces one
//! firing instead of a burst.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Cadence {
    period: Duration,
    elapsed: Duration,
}

impl Cadence {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            elapsed: Duration::ZERO,
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Add `dt` and report whether the period has elapsed
    pub fn advance(&mut self, dt: Duration) -> bool {
        if self.period.is_zero() {
            return true;
        }
        self.elapsed += dt;
        if self.elapsed < self.period {
            return false;
        }
        self.elapsed -= self.period;
        if self.elapsed >= self.period {
            self.elapsed = Duration::ZERO;
        }
        true
    }

    pub fn reset(&mut self) {
        self.elapsed = Duration::ZERO;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_once_per_period_with_jitter() {
        let mut cadence = Cadence::new(Duration::from_millis(100));
        let ticks = [40, 55, 30, 48, 61, 20];
        let fired: Vec<bool> = ticks
            .iter()
            .map(|&ms| cadence.advance(Duration::from_millis(ms)))
            .collect();
        // 40, 95, 125 (fire, carry 25), 73, 134 (fire, carry 34), 54
        assert_eq!(fired, vec![false, false, true, false, true, false]);
    }

    #[test]
    fn long_stall_fires_once() {
        let mut cadence = Cadence::new(Duration::from_millis(10));
        assert!(cadence.advance(Duration::from_millis(95)));
        assert!(!cadence.advance(Duration::from_millis(1)));
    }
}
