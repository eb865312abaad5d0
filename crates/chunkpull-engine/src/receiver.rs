//! Receiver loop: consumes chunk replies and fills the store.
//!
//! ```text
//! [Channel] --recv(k * RTT)--> decode --> length/slot check --> attribute --> [ChunkStore]
//!                                                                    |            |
//!                                                              FlightTracker   filled event -> sender
//! ```
//!
//! The store is owned by this loop and handed back to the session when the
//! loop ends. Bad input never ends the loop; only the timeout budget does.

use std::sync::atomic::Ordering;
use std::time::Instant;

use bytes::Bytes;
use crossbeam_channel::Sender;

use crate::chunk_store::{ChunkStore, InsertOutcome};
use crate::error::TransferError;
use crate::logging::{EventSink, TransferEvent};
use crate::protocol::decode_chunk_response;
use crate::rtt::{Attribution, FlightTracker};
use crate::session::LoopShared;
use crate::stats::TransferStats;

/// What happened to one datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// Written into an empty slot.
    Stored {
        index: usize,
        fresh: bool,
        squished: bool,
    },
    /// Slot already held this chunk.
    Duplicate { index: usize, fresh: bool },
    /// Declared length disagrees with the payload or the slot.
    Corrupted {
        offset: u64,
        declared: usize,
        actual: usize,
        squished: bool,
    },
    /// Not a chunk reply.
    Malformed { len: usize },
}

/// Receiver state without the socket: the store plus the timeout budget.
pub struct Reassembler {
    store: ChunkStore,
    consecutive_timeouts: u32,
    retry_budget: u32,
}

impl Reassembler {
    pub fn new(store: ChunkStore, retry_budget: u32) -> Self {
        Self {
            store,
            consecutive_timeouts: 0,
            retry_budget,
        }
    }

    pub fn store(&self) -> &ChunkStore {
        &self.store
    }

    pub fn into_store(self) -> ChunkStore {
        self.store
    }

    pub fn is_complete(&self) -> bool {
        self.store.is_complete()
    }

    /// Handle one datagram from the peer received at `now`.
    ///
    /// Only intact replies that fit their slot reach the tracker, so a
    /// corrupted reply neither fills the store nor feeds the RTT estimate.
    pub fn on_datagram(&mut self, raw: Bytes, tracker: &mut FlightTracker, now: Instant) -> Delivery {
        self.consecutive_timeouts = 0;

        let len = raw.len();
        let response = match decode_chunk_response(raw) {
            Ok(response) => response,
            Err(_) => return Delivery::Malformed { len },
        };

        let corrupted = Delivery::Corrupted {
            offset: response.offset,
            declared: response.num_bytes,
            actual: response.data.len(),
            squished: response.is_squished,
        };
        if !response.is_intact() {
            return corrupted;
        }
        let index = match self.store.layout().slot_for(response.offset, response.num_bytes) {
            Ok(index) => index,
            Err(_) => return corrupted,
        };

        let fresh = matches!(tracker.on_response(response.offset, now), Attribution::Fresh(_));
        match self.store.insert(response.offset, response.data) {
            Ok(InsertOutcome::Filled) => Delivery::Stored {
                index,
                fresh,
                squished: response.is_squished,
            },
            Ok(InsertOutcome::Duplicate) => Delivery::Duplicate { index, fresh },
            // slot_for already accepted this offset and length
            Err(_) => corrupted,
        }
    }

    /// Count a receive timeout. Fails once the consecutive count exceeds the budget.
    pub fn on_timeout(&mut self) -> Result<u32, TransferError> {
        self.consecutive_timeouts += 1;
        if self.consecutive_timeouts > self.retry_budget {
            return Err(TransferError::Stalled {
                timeouts: self.consecutive_timeouts,
            });
        }
        Ok(self.consecutive_timeouts)
    }
}

/// Run the receiver loop until the store is complete, the sender stops, or
/// the timeout budget runs out. Returns the store in whatever state it reached.
pub(crate) fn run_receiver(
    shared: LoopShared,
    mut reassembler: Reassembler,
    filled_tx: Sender<usize>,
    events: EventSink,
) -> Result<ChunkStore, TransferError> {
    let stats = &shared.stats;

    loop {
        if reassembler.is_complete() {
            shared.stopped.store(true, Ordering::Relaxed);
            return Ok(reassembler.into_store());
        }
        if shared.stopped.load(Ordering::Relaxed) {
            return Ok(reassembler.into_store());
        }

        let timeout = shared
            .tuning
            .recv_timeout(shared.tracker.lock().current_estimate());

        let raw = match shared.channel.recv(timeout) {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                TransferStats::bump(&stats.receive_timeouts);
                match reassembler.on_timeout() {
                    Ok(consecutive) => {
                        events.emit(TransferEvent::ReceiveTimeout {
                            consecutive,
                            budget: shared.tuning.recv_retry_budget,
                        });
                        continue;
                    }
                    Err(e) => {
                        shared.stopped.store(true, Ordering::Relaxed);
                        events.emit(TransferEvent::Error {
                            message: e.to_string(),
                        });
                        return Err(e);
                    }
                }
            }
            Err(e) => {
                shared.stopped.store(true, Ordering::Relaxed);
                return Err(e.into());
            }
        };
        let now = Instant::now();

        let delivery = {
            let mut tracker = shared.tracker.lock();
            let delivery = reassembler.on_datagram(raw, &mut tracker, now);
            stats.rtt_us.store(
                tracker.current_estimate().as_micros() as u64,
                Ordering::Relaxed,
            );
            delivery
        };

        match delivery {
            Delivery::Stored {
                index,
                fresh,
                squished,
            } => {
                count_attribution(stats, fresh);
                if squished {
                    TransferStats::bump(&stats.squished_replies);
                }
                stats.record_chunk(reassembler.store().layout().expected_len(index));
                events.emit(TransferEvent::ChunkStored { index, fresh });
                // The sender may already be gone; the store is what matters.
                let _ = filled_tx.send(index);
            }
            Delivery::Duplicate { fresh, .. } => {
                count_attribution(stats, fresh);
                TransferStats::bump(&stats.duplicate_replies);
            }
            Delivery::Corrupted {
                offset,
                declared,
                actual,
                squished,
            } => {
                TransferStats::bump(&stats.corrupted_replies);
                if squished {
                    TransferStats::bump(&stats.squished_replies);
                    events.emit(TransferEvent::ChunkSquished {
                        offset,
                        declared,
                        actual,
                    });
                } else {
                    events.emit(TransferEvent::ChunkCorrupted {
                        offset,
                        declared,
                        actual,
                    });
                }
            }
            Delivery::Malformed { len } => {
                TransferStats::bump(&stats.malformed_replies);
                events.emit(TransferEvent::MalformedReply { len });
            }
        }
    }
}

fn count_attribution(stats: &TransferStats, fresh: bool) {
    if fresh {
        TransferStats::bump(&stats.fresh_replies);
    } else {
        TransferStats::bump(&stats.stale_replies);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::chunk_store::ChunkLayout;
    use crate::rtt::RttEstimator;

    fn reply(offset: u64, declared: usize, payload: &[u8]) -> Bytes {
        let mut raw = format!("Offset: {}\nNumBytes: {}\n\n", offset, declared).into_bytes();
        raw.extend_from_slice(payload);
        Bytes::from(raw)
    }

    fn setup() -> (Reassembler, FlightTracker) {
        let store = ChunkStore::new(ChunkLayout::new(3000, 1448));
        let tracker = FlightTracker::new(RttEstimator::new(Duration::from_millis(100), 0.8));
        (Reassembler::new(store, 20), tracker)
    }

    #[test]
    fn fresh_reply_is_stored_and_sampled() {
        let (mut asm, mut tracker) = setup();
        let t0 = Instant::now();
        tracker.issue(0, t0);

        let delivery = asm.on_datagram(reply(0, 1448, &[7u8; 1448]), &mut tracker, t0 + Duration::from_millis(10));
        assert_eq!(
            delivery,
            Delivery::Stored {
                index: 0,
                fresh: true,
                squished: false
            }
        );
        assert!(asm.store().is_filled(0));
        assert!(tracker.current_estimate() < Duration::from_millis(100));
    }

    #[test]
    fn stale_reply_is_stored_without_touching_rtt() {
        let (mut asm, mut tracker) = setup();
        let delivery = asm.on_datagram(reply(2896, 104, &[1u8; 104]), &mut tracker, Instant::now());
        assert_eq!(
            delivery,
            Delivery::Stored {
                index: 2,
                fresh: false,
                squished: false
            }
        );
        assert!(asm.store().is_filled(2));
        assert_eq!(tracker.current_estimate(), Duration::from_millis(100));
    }

    #[test]
    fn corrupted_length_is_never_stored() {
        let (mut asm, mut tracker) = setup();
        let t0 = Instant::now();
        tracker.issue(1448, t0);

        // declared 1448, carried 1000
        let delivery = asm.on_datagram(reply(1448, 1448, &[0u8; 1000]), &mut tracker, t0);
        assert!(matches!(delivery, Delivery::Corrupted { declared: 1448, actual: 1000, .. }));
        assert!(!asm.store().is_filled(1));
        // still outstanding, still no sample
        assert!(tracker.contains(1448));
        assert_eq!(tracker.current_estimate(), Duration::from_millis(100));
    }

    #[test]
    fn consistent_but_wrong_slot_length_is_rejected() {
        let (mut asm, mut tracker) = setup();
        // last slot holds 104 bytes, not 1448
        let delivery = asm.on_datagram(reply(2896, 1448, &[0u8; 1448]), &mut tracker, Instant::now());
        assert!(matches!(delivery, Delivery::Corrupted { .. }));
        let delivery = asm.on_datagram(reply(100, 5, b"hello"), &mut tracker, Instant::now());
        assert!(matches!(delivery, Delivery::Corrupted { .. }));
        assert_eq!(asm.store().filled_count(), 0);
    }

    #[test]
    fn squished_reply_goes_through_the_same_checks() {
        let (mut asm, mut tracker) = setup();
        let mut raw = b"Offset: 0\nNumBytes: 1448\nSquished\n\n".to_vec();
        raw.extend_from_slice(&[3u8; 700]);
        let delivery = asm.on_datagram(Bytes::from(raw), &mut tracker, Instant::now());
        assert!(matches!(delivery, Delivery::Corrupted { squished: true, .. }));

        let mut raw = b"Offset: 2896\nNumBytes: 104\nSquished\n\n".to_vec();
        raw.extend_from_slice(&[3u8; 104]);
        let delivery = asm.on_datagram(Bytes::from(raw), &mut tracker, Instant::now());
        assert!(matches!(delivery, Delivery::Stored { index: 2, squished: true, .. }));
    }

    #[test]
    fn malformed_input_is_discarded() {
        let (mut asm, mut tracker) = setup();
        let delivery = asm.on_datagram(Bytes::from_static(b"garbage"), &mut tracker, Instant::now());
        assert_eq!(delivery, Delivery::Malformed { len: 7 });
        assert_eq!(asm.store().filled_count(), 0);
    }

    #[test]
    fn duplicates_complete_the_store_once() {
        let (mut asm, mut tracker) = setup();
        let now = Instant::now();
        for (offset, len) in [(2896u64, 104usize), (0, 1448), (2896, 104), (1448, 1448), (0, 1448)] {
            asm.on_datagram(reply(offset, len, &vec![9u8; len]), &mut tracker, now);
        }
        assert!(asm.is_complete());
        let delivery = asm.on_datagram(reply(0, 1448, &[9u8; 1448]), &mut tracker, now);
        assert_eq!(delivery, Delivery::Duplicate { index: 0, fresh: false });
    }

    #[test]
    fn twenty_first_consecutive_timeout_stalls() {
        let (mut asm, _) = setup();
        for expected in 1..=20 {
            assert_eq!(asm.on_timeout().unwrap(), expected);
        }
        assert!(matches!(
            asm.on_timeout(),
            Err(TransferError::Stalled { timeouts: 21 })
        ));
    }

    #[test]
    fn any_datagram_resets_the_timeout_count() {
        let (mut asm, mut tracker) = setup();
        for _ in 0..20 {
            asm.on_timeout().unwrap();
        }
        asm.on_datagram(Bytes::from_static(b"noise"), &mut tracker, Instant::now());
        assert_eq!(asm.on_timeout().unwrap(), 1);
    }
}
