//! Transfer logging trait for structured session logs.
//!
//! The loops report what they do as [`TransferEvent`]s. Where those end up is
//! the caller's choice: `tracing`, nowhere, or a custom sink.

use std::fmt;
use std::net::SocketAddr;

/// Structured log entry for a transfer operation.
#[derive(Debug, Clone)]
pub struct TransferLog {
    pub component: &'static str,
    pub peer: SocketAddr,
    pub event: TransferEvent,
}

/// Transfer events that can be logged.
#[derive(Debug, Clone)]
pub enum TransferEvent {
    /// Socket bound, session ready
    SessionStarted {
        local_addr: String,
    },
    /// Size reply received
    SizeDiscovered {
        total_size: u64,
        chunk_count: usize,
    },
    /// Sender: burst changed between rounds
    BurstAdjusted {
        old_burst: usize,
        new_burst: usize,
        expired: usize,
    },
    /// Sender: requests issued for one round
    RoundIssued {
        burst: usize,
        issued: usize,
        rtt_us: u64,
    },
    /// Receiver: chunk written into the store
    ChunkStored {
        index: usize,
        fresh: bool,
    },
    /// Receiver: chunk reply failed the length or slot check
    ChunkCorrupted {
        offset: u64,
        declared: usize,
        actual: usize,
    },
    /// Receiver: reply carried the squished marker
    ChunkSquished {
        offset: u64,
        declared: usize,
        actual: usize,
    },
    /// Receiver: datagram could not be decoded
    MalformedReply {
        len: usize,
    },
    /// Receiver: no datagram within the timeout
    ReceiveTimeout {
        consecutive: u32,
        budget: u32,
    },
    /// All chunks present
    TransferComplete {
        total_bytes: u64,
        duration_ms: u64,
        requests: u64,
        re_requests: u64,
    },
    /// Submit reply received
    Submitted {
        accepted: bool,
        elapsed: String,
        penalty: String,
    },
    /// Error occurred
    Error {
        message: String,
    },
}

impl fmt::Display for TransferEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SessionStarted { local_addr } => {
                write!(f, "session_started local={}", local_addr)
            }
            Self::SizeDiscovered { total_size, chunk_count } => {
                write!(f, "size_discovered bytes={} chunks={}", total_size, chunk_count)
            }
            Self::BurstAdjusted { old_burst, new_burst, expired } => {
                write!(f, "burst_adjusted old={} new={} expired={}", old_burst, new_burst, expired)
            }
            Self::RoundIssued { burst, issued, rtt_us } => {
                write!(f, "round_issued burst={} issued={} rtt_us={}", burst, issued, rtt_us)
            }
            Self::ChunkStored { index, fresh } => {
                write!(f, "chunk_stored idx={} fresh={}", index, fresh)
            }
            Self::ChunkCorrupted { offset, declared, actual } => {
                write!(f, "chunk_corrupted offset={} declared={} actual={}", offset, declared, actual)
            }
            Self::ChunkSquished { offset, declared, actual } => {
                write!(f, "chunk_squished offset={} declared={} actual={}", offset, declared, actual)
            }
            Self::MalformedReply { len } => {
                write!(f, "malformed_reply len={}", len)
            }
            Self::ReceiveTimeout { consecutive, budget } => {
                write!(f, "receive_timeout consecutive={} budget={}", consecutive, budget)
            }
            Self::TransferComplete { total_bytes, duration_ms, requests, re_requests } => {
                write!(
                    f,
                    "transfer_complete bytes={} duration_ms={} requests={} re_requests={}",
                    total_bytes, duration_ms, requests, re_requests
                )
            }
            Self::Submitted { accepted, elapsed, penalty } => {
                write!(f, "submitted accepted={} elapsed={} penalty={}", accepted, elapsed, penalty)
            }
            Self::Error { message } => {
                write!(f, "error: {}", message)
            }
        }
    }
}

/// Trait for transfer logging. Implementations can write to tracing,
/// collect entries in tests, or discard them.
pub trait TransferLogger: Send + Sync {
    fn log(&self, entry: TransferLog);
}

/// Logger that uses the `tracing` crate.
pub struct TracingLogger;

impl TransferLogger for TracingLogger {
    fn log(&self, entry: TransferLog) {
        // per-round and per-chunk events stay at debug
        match &entry.event {
            TransferEvent::SessionStarted { .. }
            | TransferEvent::SizeDiscovered { .. }
            | TransferEvent::TransferComplete { .. }
            | TransferEvent::Submitted { .. } => {
                tracing::info!(
                    component = entry.component,
                    peer = %entry.peer,
                    "{}",
                    entry.event,
                );
            }
            TransferEvent::Error { .. } => {
                tracing::warn!(
                    component = entry.component,
                    peer = %entry.peer,
                    "{}",
                    entry.event,
                );
            }
            _ => {
                tracing::debug!(
                    component = entry.component,
                    peer = %entry.peer,
                    "{}",
                    entry.event,
                );
            }
        }
    }
}

/// No-op logger that discards all log entries.
pub struct NullLogger;

impl TransferLogger for NullLogger {
    fn log(&self, _entry: TransferLog) {}
}

/// Logger handle bound to one component and peer.
#[derive(Clone)]
pub(crate) struct EventSink {
    component: &'static str,
    peer: SocketAddr,
    logger: Option<std::sync::Arc<dyn TransferLogger>>,
}

impl EventSink {
    pub(crate) fn new(
        component: &'static str,
        peer: SocketAddr,
        logger: Option<std::sync::Arc<dyn TransferLogger>>,
    ) -> Self {
        Self {
            component,
            peer,
            logger,
        }
    }

    pub(crate) fn emit(&self, event: TransferEvent) {
        if let Some(ref logger) = self.logger {
            logger.log(TransferLog {
                component: self.component,
                peer: self.peer,
                event,
            });
        }
    }
}
