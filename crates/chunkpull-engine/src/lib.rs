//! Chunkpull engine: adaptive chunked pull of a byte buffer over UDP.
//!
//! Provides a client for a simple text-header datagram protocol with:
//! - Size discovery with retry
//! - Sender loop: paced chunk requests, AIMD burst size driven by losses
//! - Receiver loop: header validation, slot mapping, RTT sampling
//! - First-copy-wins chunk store with gap tracking
//! - MD5 digest and submit/confirm exchange

pub mod bitfield;
pub mod channel;
pub mod chunk_store;
pub mod config;
pub mod error;
pub mod finalize;
pub mod logging;
pub mod pacing;
pub mod protocol;
pub mod receiver;
pub mod rtt;
pub mod sender;
pub mod session;
pub mod stats;

// Re-export key types for convenience.
pub use bitfield::SlotBitfield;
pub use channel::Channel;
pub use chunk_store::{ChunkLayout, ChunkStore, InsertOutcome, SlotRejection};
pub use config::{SessionConfig, TransferTuning};
pub use error::TransferError;
pub use finalize::{digest_hex, submit_digest};
pub use logging::{NullLogger, TracingLogger, TransferEvent, TransferLog, TransferLogger};
pub use pacing::PacingController;
pub use protocol::{CHUNK_SIZE, ChunkResponse, SubmitReply};
pub use receiver::{Delivery, Reassembler};
pub use rtt::{Attribution, FlightTracker, RttEstimator};
pub use sender::{ChunkRequest, RequestScheduler};
pub use session::{Finalized, Session, TransferResult, run_transfer};
pub use stats::{StatsSnapshot, TransferStats};
