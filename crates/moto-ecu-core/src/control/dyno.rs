//! Dyno-mode hold-to-latch input

use std::time::Duration;

/// Latches once the request input has been held continuously for `hold`.
/// Stays latched until [`DynoLatch::clear`].
#[derive(Debug, Clone)]
pub struct DynoLatch {
    hold: Duration,
    held_for: Duration,
    active: bool,
}

impl DynoLatch {
    pub fn new(hold: Duration) -> Self {
        Self {
            hold,
            held_for: Duration::ZERO,
            active: false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Feed one cycle of the input; returns true on the cycle the latch engages
    pub fn advance(&mut self, pressed: bool, dt: Duration) -> bool {
        if self.active {
            return false;
        }
        if !pressed {
            self.held_for = Duration::ZERO;
            return false;
        }
        self.held_for += dt;
        if self.held_for >= self.hold {
            self.active = true;
            return true;
        }
        false
    }

    pub fn clear(&mut self) {
        self.active = false;
        self.held_for = Duration::ZERO;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STEP: Duration = Duration::from_secs(1);

    #[test]
    fn latches_after_sustained_hold() {
        let mut latch = DynoLatch::new(Duration::from_secs(3));
        assert!(!latch.advance(true, STEP));
        assert!(!latch.advance(true, STEP));
        assert!(latch.advance(true, STEP));
        assert!(latch.is_active());

        // released input does not unlatch
        assert!(!latch.advance(false, STEP));
        assert!(latch.is_active());
    }

    #[test]
    fn release_restarts_hold() {
        let mut latch = DynoLatch::new(Duration::from_secs(3));
        latch.advance(true, STEP);
        latch.advance(true, STEP);
        latch.advance(false, STEP);
        latch.advance(true, STEP);
        assert!(!latch.advance(true, STEP));
        assert!(!latch.is_active());
    }

    #[test]
    fn clear_unlatches() {
        let mut latch = DynoLatch::new(Duration::ZERO);
        assert!(latch.advance(true, STEP));
        latch.clear();
        assert!(!latch.is_active());
    }
}
