//! Terminal errors of a pull session.
//!
//! Transient loss, corrupted chunk replies and stale replies never show up
//! here: the loops absorb them and only count them in [`crate::TransferStats`].

use std::io;

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("no reply from peer after {tries} tries")]
    NoReply { tries: u32 },

    #[error("transfer stalled: {timeouts} consecutive receive timeouts")]
    Stalled { timeouts: u32 },

    #[error("transfer made no progress for {rounds} request rounds")]
    NoProgress { rounds: u32 },

    #[error("chunk store incomplete: {missing} chunks missing")]
    Incomplete { missing: usize },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("{0} thread panicked")]
    ThreadPanicked(&'static str),
}

pub(crate) fn malformed(message: impl Into<String>) -> TransferError {
    TransferError::MalformedResponse(message.into())
}
