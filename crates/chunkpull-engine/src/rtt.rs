//! Round-trip estimation and the in-flight request table.
//!
//! RTT is an EWMA over samples taken only from replies that match an
//! outstanding request:
//!
//! ```text
//! rtt' = alpha * sample + (1 - alpha) * rtt
//! ```
//!
//! Entries left in the table when the sender starts its next round are
//! expired and count as that round's losses. A reply for an expired entry is
//! stale: the chunk is still usable, but it says nothing about the current
//! round trip and is kept out of the estimate.

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Exponentially weighted round-trip estimate.
#[derive(Debug, Clone)]
pub struct RttEstimator {
    estimate: Duration,
    alpha: f64,
}

impl RttEstimator {
    /// `alpha` is the weight of a new sample, clamped to `0.0..=1.0`.
    pub fn new(initial: Duration, alpha: f64) -> Self {
        Self {
            estimate: initial,
            alpha: alpha.clamp(0.0, 1.0),
        }
    }

    pub fn on_sample(&mut self, sample: Duration) {
        let smoothed =
            self.alpha * sample.as_secs_f64() + (1.0 - self.alpha) * self.estimate.as_secs_f64();
        self.estimate = Duration::from_secs_f64(smoothed);
    }

    pub fn current(&self) -> Duration {
        self.estimate
    }
}

/// How a reply relates to the requests currently outstanding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attribution {
    /// Matched an outstanding request; carries the RTT sample.
    Fresh(Duration),
    /// No outstanding request for this offset.
    Stale,
}

/// In-flight table (offset -> issue time) plus the RTT estimate it feeds.
///
/// Shared between the two loops behind one mutex: the sender issues and
/// expires, the receiver consumes.
#[derive(Debug)]
pub struct FlightTracker {
    issued: HashMap<u64, Instant>,
    rtt: RttEstimator,
}

impl FlightTracker {
    pub fn new(rtt: RttEstimator) -> Self {
        Self {
            issued: HashMap::new(),
            rtt,
        }
    }

    /// Record a request for `offset`. A repeat request restarts the clock.
    ///
    /// Replies carry no request id, so a late reply to an expired request that
    /// lands after the offset was issued again is indistinguishable from a
    /// reply to the new request. It is attributed as `Fresh` with a sample
    /// measured from the re-issue, which is shorter than the real RTT.
    pub fn issue(&mut self, offset: u64, now: Instant) {
        self.issued.insert(offset, now);
    }

    pub fn contains(&self, offset: u64) -> bool {
        self.issued.contains_key(&offset)
    }

    pub fn outstanding(&self) -> usize {
        self.issued.len()
    }

    /// Drop every outstanding entry. Returns how many there were: the
    /// previous round's losses.
    pub fn expire_outstanding(&mut self) -> usize {
        let expired = self.issued.len();
        self.issued.clear();
        expired
    }

    /// Attribute a reply for `offset` received at `now`.
    pub fn on_response(&mut self, offset: u64, now: Instant) -> Attribution {
        match self.issued.remove(&offset) {
            Some(issued_at) => {
                let sample = now.saturating_duration_since(issued_at);
                self.rtt.on_sample(sample);
                Attribution::Fresh(sample)
            }
            None => Attribution::Stale,
        }
    }

    pub fn current_estimate(&self) -> Duration {
        self.rtt.current()
    }
}
