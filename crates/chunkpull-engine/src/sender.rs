//! Sender loop: paced chunk requests, one burst per round.
//!
//! ```text
//! round:  drain filled events -> expire in-flight (losses) -> burst = pacing(losses)
//!         -> request up to `burst` empty slots from the cursor -> wait k * RTT
//! ```
//!
//! The wait is a deadline receive on the filled-event channel, so the loop
//! wakes for fills and completion instead of sleeping blindly.

use std::sync::atomic::Ordering;
use std::time::Instant;

use crossbeam_channel::{Receiver, RecvTimeoutError};

use crate::bitfield::SlotBitfield;
use crate::chunk_store::ChunkLayout;
use crate::error::TransferError;
use crate::logging::{EventSink, TransferEvent};
use crate::pacing::PacingController;
use crate::protocol::encode_chunk_request;
use crate::session::LoopShared;
use crate::stats::TransferStats;

/// One chunk request planned for this round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRequest {
    pub index: usize,
    pub offset: u64,
    pub num_bytes: usize,
    /// This slot was requested in an earlier round too.
    pub repeat: bool,
}

/// The sender's view of the store: which slots are filled, which were ever
/// requested, and where the round-robin scan resumes.
pub struct RequestScheduler {
    layout: ChunkLayout,
    filled: SlotBitfield,
    requested: SlotBitfield,
    cursor: usize,
}

impl RequestScheduler {
    pub fn new(layout: ChunkLayout) -> Self {
        Self {
            layout,
            filled: SlotBitfield::new(layout.chunk_count()),
            requested: SlotBitfield::new(layout.chunk_count()),
            cursor: 0,
        }
    }

    /// Record a filled event from the receiver. Returns true if new.
    pub fn mark_filled(&mut self, index: usize) -> bool {
        self.filled.set(index)
    }

    pub fn filled_count(&self) -> usize {
        self.filled.count()
    }

    pub fn is_complete(&self) -> bool {
        self.filled.is_complete()
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Pick up to `burst` empty slots that are not in flight, scanning at most
    /// one full pass from the cursor. The cursor resumes after the last slot
    /// looked at.
    pub fn plan(&mut self, burst: usize, in_flight: impl Fn(u64) -> bool) -> Vec<ChunkRequest> {
        let slot_count = self.layout.chunk_count();
        let mut planned = Vec::new();
        let mut scanned = 0;

        while scanned < slot_count && planned.len() < burst {
            let index = self.cursor;
            self.cursor = (self.cursor + 1) % slot_count;
            scanned += 1;

            if self.filled.get(index) {
                continue;
            }
            let offset = self.layout.offset_of(index);
            if in_flight(offset) {
                continue;
            }
            planned.push(ChunkRequest {
                index,
                offset,
                num_bytes: self.layout.expected_len(index),
                repeat: !self.requested.set(index),
            });
        }
        planned
    }
}

/// Run the sender loop until the store is complete or the receiver stops.
pub(crate) fn run_sender(
    shared: LoopShared,
    layout: ChunkLayout,
    filled_rx: Receiver<usize>,
    events: EventSink,
) -> Result<(), TransferError> {
    let tuning = &shared.tuning;
    let stats = &shared.stats;

    let mut scheduler = RequestScheduler::new(layout);
    let mut pacing =
        PacingController::new(tuning.initial_burst, tuning.burst_decrease, tuning.max_burst);
    let mut first_round = true;
    let mut idle_rounds = 0u32;
    let mut last_filled = 0usize;

    loop {
        if shared.stopped.load(Ordering::Relaxed) {
            return Ok(());
        }
        while let Ok(index) = filled_rx.try_recv() {
            scheduler.mark_filled(index);
        }
        if scheduler.is_complete() {
            shared.stopped.store(true, Ordering::Relaxed);
            return Ok(());
        }

        if scheduler.filled_count() > last_filled {
            last_filled = scheduler.filled_count();
            idle_rounds = 0;
        } else if !first_round {
            idle_rounds += 1;
            if idle_rounds > tuning.max_idle_rounds {
                shared.stopped.store(true, Ordering::Relaxed);
                let err = TransferError::NoProgress {
                    rounds: idle_rounds,
                };
                events.emit(TransferEvent::Error {
                    message: err.to_string(),
                });
                return Err(err);
            }
        }

        // Anything still outstanding from the last round counts as lost.
        let (expired, rtt) = {
            let mut tracker = shared.tracker.lock();
            (tracker.expire_outstanding(), tracker.current_estimate())
        };
        let old_burst = pacing.burst_size();
        let burst = if first_round {
            old_burst
        } else {
            pacing.begin_round(expired > 0)
        };
        first_round = false;
        if burst != old_burst {
            events.emit(TransferEvent::BurstAdjusted {
                old_burst,
                new_burst: burst,
                expired,
            });
        }
        stats.set_pacing(burst, rtt);

        let requests = {
            let tracker = shared.tracker.lock();
            scheduler.plan(burst, |offset| tracker.contains(offset))
        };
        for request in &requests {
            // Record before sending so a fast reply is attributed to this round.
            shared.tracker.lock().issue(request.offset, Instant::now());
            if let Err(e) = shared
                .channel
                .send(&encode_chunk_request(request.offset, request.num_bytes))
            {
                shared.stopped.store(true, Ordering::Relaxed);
                return Err(e.into());
            }
            TransferStats::bump(&stats.requests);
            if request.repeat {
                TransferStats::bump(&stats.re_requests);
            }
        }
        events.emit(TransferEvent::RoundIssued {
            burst,
            issued: requests.len(),
            rtt_us: rtt.as_micros() as u64,
        });

        let deadline = Instant::now() + tuning.round_interval(rtt);
        loop {
            match filled_rx.recv_deadline(deadline) {
                Ok(index) => {
                    scheduler.mark_filled(index);
                    if scheduler.is_complete() {
                        break;
                    }
                }
                Err(RecvTimeoutError::Timeout) => break,
                // Receiver is gone: it either finished or failed, and reports that itself.
                Err(RecvTimeoutError::Disconnected) => return Ok(()),
            }
        }
    }
}
