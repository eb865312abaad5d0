//! Pull session: size query, the two transfer loops, finalization.
//!
//! ```text
//! [caller] query_size ──> fetch ──────────────────────────────> finalize
//!                          ├─ sender thread:   requests ──> peer
//!                          └─ receiver thread: replies  <── peer, owns ChunkStore
//! ```
//!
//! The receiver owns the store and reports fills to the sender over a
//! channel. The in-flight table and RTT estimate sit behind one mutex. Both
//! loops watch the shared `stopped` flag once per iteration.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Instant;

use crossbeam_channel::unbounded;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, warn};

use crate::channel::Channel;
use crate::chunk_store::{ChunkLayout, ChunkStore};
use crate::config::{SessionConfig, TransferTuning};
use crate::error::TransferError;
use crate::finalize::{digest_hex, submit_digest};
use crate::logging::{EventSink, TransferEvent};
use crate::protocol::{
    REPLY_HEADER_SLACK, SubmitReply, decode_size_reply, encode_size_query, is_chunk_response,
};
use crate::receiver::{Reassembler, run_receiver};
use crate::rtt::{FlightTracker, RttEstimator};
use crate::sender::run_sender;
use crate::stats::{StatsSnapshot, TransferStats};

/// State both loops hold a handle to.
#[derive(Clone)]
pub(crate) struct LoopShared {
    pub(crate) channel: Arc<Channel>,
    pub(crate) tracker: Arc<Mutex<FlightTracker>>,
    pub(crate) stopped: Arc<AtomicBool>,
    pub(crate) stats: Arc<TransferStats>,
    pub(crate) tuning: TransferTuning,
}

/// Digest of a complete payload, plus the peer's verdict when submitted.
pub struct Finalized {
    pub payload: Vec<u8>,
    pub digest: String,
    pub submit: Option<SubmitReply>,
}

/// Result of a completed session.
#[derive(Debug, Serialize)]
pub struct TransferResult {
    pub total_size: u64,
    pub chunk_count: usize,
    pub digest: String,
    pub submit: Option<SubmitReply>,
    pub elapsed_ms: u64,
    pub stats: StatsSnapshot,
    #[serde(skip)]
    pub payload: Vec<u8>,
}

pub struct Session {
    config: SessionConfig,
    channel: Arc<Channel>,
    stats: Arc<TransferStats>,
}

impl Session {
    /// Validate the configuration and bind the session socket.
    pub fn connect(config: SessionConfig, stats: Arc<TransferStats>) -> Result<Self, TransferError> {
        config.tuning.validate()?;
        let channel = Channel::bind(
            config.local_bind_addr(),
            config.remote_addr,
            max_datagram(&config.tuning),
        )?;
        Self::with_channel(config, channel, stats)
    }

    /// Use an existing channel, e.g. one bound by the caller.
    pub fn with_channel(
        config: SessionConfig,
        channel: Channel,
        stats: Arc<TransferStats>,
    ) -> Result<Self, TransferError> {
        config.tuning.validate()?;
        let session = Self {
            config,
            channel: Arc::new(channel),
            stats,
        };
        session.events("session").emit(TransferEvent::SessionStarted {
            local_addr: session
                .channel
                .local_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "?".into()),
        });
        Ok(session)
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.channel.local_addr()
    }

    pub fn stats(&self) -> &Arc<TransferStats> {
        &self.stats
    }

    /// Ask the peer for the buffer size. Also resets its delivery cursor.
    pub fn query_size(&self) -> Result<u64, TransferError> {
        let tuning = &self.config.tuning;
        let reply = self.channel.request(
            &encode_size_query(),
            tuning.request_timeout,
            tuning.request_tries,
            |raw| !is_chunk_response(raw),
        )?;
        let total_size = decode_size_reply(&reply)?;
        let layout = self.layout_for(total_size)?;
        self.events("session").emit(TransferEvent::SizeDiscovered {
            total_size,
            chunk_count: layout.chunk_count(),
        });
        Ok(total_size)
    }

    /// Pull every chunk of a `total_size` buffer. Runs the sender and
    /// receiver loops on their own threads and returns the complete store.
    pub fn fetch(&self, total_size: u64) -> Result<ChunkStore, TransferError> {
        let tuning = &self.config.tuning;
        let layout = self.layout_for(total_size)?;
        self.stats
            .set_total(total_size, layout.chunk_count() as u64);

        let store = ChunkStore::new(layout);
        if store.is_complete() {
            return Ok(store);
        }

        let shared = LoopShared {
            channel: self.channel.clone(),
            tracker: Arc::new(Mutex::new(FlightTracker::new(RttEstimator::new(
                tuning.initial_rtt,
                tuning.rtt_alpha,
            )))),
            stopped: Arc::new(AtomicBool::new(false)),
            stats: self.stats.clone(),
            tuning: tuning.clone(),
        };
        // Each slot is reported at most once, so the queue stays below the chunk count.
        let (filled_tx, filled_rx) = unbounded::<usize>();
        let start = Instant::now();

        let receiver_handle = {
            let shared = shared.clone();
            let events = self.events("receiver");
            let reassembler = Reassembler::new(store, tuning.recv_retry_budget);
            thread::Builder::new()
                .name("chunkpull-recv".into())
                .spawn(move || run_receiver(shared, reassembler, filled_tx, events))?
        };

        let sender_handle = {
            let shared = shared.clone();
            let events = self.events("sender");
            thread::Builder::new()
                .name("chunkpull-send".into())
                .spawn(move || run_sender(shared, layout, filled_rx, events))
        };
        let sender_handle = match sender_handle {
            Ok(handle) => handle,
            Err(e) => {
                shared.stopped.store(true, Ordering::Relaxed);
                let _ = receiver_handle.join();
                return Err(e.into());
            }
        };

        let receiver_result = receiver_handle
            .join()
            .map_err(|_| TransferError::ThreadPanicked("receiver"));
        if receiver_result.is_err() {
            shared.stopped.store(true, Ordering::Relaxed);
        }
        let sender_result = sender_handle
            .join()
            .map_err(|_| TransferError::ThreadPanicked("sender"));

        let store = receiver_result??;
        if let Err(e) = sender_result? {
            self.log_abandoned(&store, &e);
            return Err(e);
        }
        if !store.is_complete() {
            let err = TransferError::Incomplete {
                missing: store.missing_count(),
            };
            self.log_abandoned(&store, &err);
            return Err(err);
        }

        let snapshot = self.stats.snapshot();
        self.events("session").emit(TransferEvent::TransferComplete {
            total_bytes: total_size,
            duration_ms: start.elapsed().as_millis() as u64,
            requests: snapshot.requests,
            re_requests: snapshot.re_requests,
        });
        Ok(store)
    }

    /// Reassemble, digest and (if configured) submit.
    pub fn finalize(&self, store: &ChunkStore) -> Result<Finalized, TransferError> {
        let payload = store.assemble()?;
        let digest = digest_hex(&payload);

        let submit = if self.config.submit {
            // Late chunk replies would otherwise sit in front of the submit reply.
            let flushed = self.channel.flush()?;
            if flushed > 0 {
                debug!(flushed, "flushed stale datagrams before submit");
            }
            let reply = submit_digest(
                &self.channel,
                &self.config.entry_id,
                &self.config.team,
                &digest,
                &self.config.tuning,
            )?;
            self.events("finalizer").emit(TransferEvent::Submitted {
                accepted: reply.accepted,
                elapsed: reply.elapsed.clone(),
                penalty: reply.penalty.clone(),
            });
            Some(reply)
        } else {
            None
        };

        Ok(Finalized {
            payload,
            digest,
            submit,
        })
    }

    /// Size query, fetch, finalize.
    pub fn run(&self) -> Result<TransferResult, TransferError> {
        let start = Instant::now();
        let total_size = self.query_size()?;
        let store = self.fetch(total_size)?;
        let chunk_count = store.layout().chunk_count();
        let Finalized {
            payload,
            digest,
            submit,
        } = self.finalize(&store)?;

        Ok(TransferResult {
            total_size,
            chunk_count,
            digest,
            submit,
            elapsed_ms: start.elapsed().as_millis() as u64,
            stats: self.stats.snapshot(),
            payload,
        })
    }

    /// Layout for a size reported by the peer, bounded by `max_total_size`.
    fn layout_for(&self, total_size: u64) -> Result<ChunkLayout, TransferError> {
        let tuning = &self.config.tuning;
        tuning.check_total_size(total_size)?;
        ChunkLayout::try_new(total_size, tuning.chunk_size).ok_or_else(|| {
            TransferError::MalformedResponse(format!(
                "advertised size {} cannot be laid out in {}-byte chunks",
                total_size, tuning.chunk_size
            ))
        })
    }

    fn log_abandoned(&self, store: &ChunkStore, err: &TransferError) {
        const SHOWN: usize = 16;
        let first_missing: Vec<usize> = store.missing_indices().into_iter().take(SHOWN).collect();
        warn!(
            progress = self.stats.progress(),
            missing = store.missing_count(),
            ?first_missing,
            error = %err,
            "transfer abandoned"
        );
    }

    fn events(&self, component: &'static str) -> EventSink {
        EventSink::new(component, self.config.remote_addr, self.config.logger.clone())
    }
}

/// Connect and run a whole session. Blocks until complete or failed.
pub fn run_transfer(
    config: SessionConfig,
    stats: Arc<TransferStats>,
) -> Result<TransferResult, TransferError> {
    Session::connect(config, stats)?.run()
}

fn max_datagram(tuning: &TransferTuning) -> usize {
    tuning.chunk_size + REPLY_HEADER_SLACK
}
