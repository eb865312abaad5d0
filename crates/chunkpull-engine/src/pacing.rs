//! Burst sizing for the sender, AIMD style.
//!
//! A burst is the number of chunk requests issued in one round. The loss
//! signal is the in-flight table: entries still outstanding when the next
//! round starts were lost (or are late enough to count as lost).
//!
//! Algorithm, evaluated once per round:
//!   losses          -> burst = max(1, floor(burst * decrease_factor)), leave ramp-up
//!   no loss, ramp-up -> burst = burst * 2
//!   no loss          -> burst = burst + 1
//!
//! Doubling finds the usable throughput quickly. After the first loss the
//! additive step keeps the burst just under the point where the peer starts
//! dropping. The burst never exceeds `max_burst`.

/// Per-transfer burst controller.
#[derive(Debug, Clone)]
pub struct PacingController {
    burst: usize,
    ramp_up: bool,
    decrease_factor: f64,
    max_burst: usize,
}

impl PacingController {
    pub fn new(initial_burst: usize, decrease_factor: f64, max_burst: usize) -> Self {
        let max_burst = max_burst.max(1);
        Self {
            burst: initial_burst.clamp(1, max_burst),
            ramp_up: true,
            decrease_factor: decrease_factor.clamp(0.0, 1.0),
            max_burst,
        }
    }

    /// Adjust for the round that just ended and return this round's burst.
    ///
    /// A loss-free ramp-up round doubles the burst exactly only while it is at
    /// most `max_burst / 2`; above that the result is clamped to `max_burst`.
    pub fn begin_round(&mut self, had_losses: bool) -> usize {
        let next = if had_losses {
            self.ramp_up = false;
            ((self.burst as f64 * self.decrease_factor).floor() as usize).max(1)
        } else if self.ramp_up {
            self.burst.saturating_mul(2)
        } else {
            self.burst.saturating_add(1)
        };
        self.burst = next.min(self.max_burst);
        self.burst
    }

    pub fn burst_size(&self) -> usize {
        self.burst
    }

    pub fn in_ramp_up(&self) -> bool {
        self.ramp_up
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_while_ramping_up() {
        let mut pacing = PacingController::new(1, 0.5, 1024);
        assert_eq!(pacing.begin_round(false), 2);
        assert_eq!(pacing.begin_round(false), 4);
        assert_eq!(pacing.begin_round(false), 8);
        assert!(pacing.in_ramp_up());
    }

    #[test]
    fn loss_halves_and_ends_ramp_up() {
        let mut pacing = PacingController::new(16, 0.5, 1024);
        assert_eq!(pacing.begin_round(true), 8);
        assert!(!pacing.in_ramp_up());
        // additive from here on
        assert_eq!(pacing.begin_round(false), 9);
        assert_eq!(pacing.begin_round(false), 10);
        assert_eq!(pacing.begin_round(true), 5);
    }

    #[test]
    fn decrease_floors_and_never_drops_below_one() {
        let mut pacing = PacingController::new(7, 0.5, 1024);
        assert_eq!(pacing.begin_round(true), 3);
        assert_eq!(pacing.begin_round(true), 1);
        assert_eq!(pacing.begin_round(true), 1);
    }

    #[test]
    fn configured_decrease_factor() {
        let mut pacing = PacingController::new(10, 0.75, 1024);
        assert_eq!(pacing.begin_round(true), 7);
    }

    #[test]
    fn capped_at_max_burst() {
        let mut pacing = PacingController::new(1, 0.5, 5);
        for _ in 0..10 {
            pacing.begin_round(false);
        }
        assert_eq!(pacing.burst_size(), 5);
    }

    #[test]
    fn doubling_near_the_cap_is_clamped() {
        let mut pacing = PacingController::new(512, 0.5, 1024);
        assert_eq!(pacing.begin_round(false), 1024);

        let mut pacing = PacingController::new(600, 0.5, 1024);
        assert_eq!(pacing.begin_round(false), 1024);
        assert!(pacing.in_ramp_up());
        assert_eq!(pacing.begin_round(false), 1024);
    }

    #[test]
    fn doubling_is_exact_for_every_start() {
        for start in 1..200 {
            let mut pacing = PacingController::new(start, 0.5, usize::MAX);
            assert_eq!(pacing.begin_round(false), start * 2);

            let mut pacing = PacingController::new(start, 0.5, usize::MAX);
            assert_eq!(pacing.begin_round(true), (start / 2).max(1));
        }
    }
}
