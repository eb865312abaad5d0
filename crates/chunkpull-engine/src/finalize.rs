//! Integrity finalizer: digest of the reassembled payload and the
//! submit/confirm exchange.
//!
//! MD5 is what the peer verifies against. It is a compatibility requirement
//! of the protocol, not a security control.

use md5::{Digest, Md5};

use crate::channel::Channel;
use crate::config::TransferTuning;
use crate::error::TransferError;
use crate::protocol::{SubmitReply, decode_submit_reply, encode_submit, is_chunk_response};

/// Lowercase hex MD5 of `payload`.
pub fn digest_hex(payload: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(payload);
    hex::encode(hasher.finalize())
}

/// Submit `digest` for `entry_id@team` and return the peer's verdict as sent.
/// A rejection is a valid reply, not an error, and is not retried.
pub fn submit_digest(
    channel: &Channel,
    entry_id: &str,
    team: &str,
    digest: &str,
    tuning: &TransferTuning,
) -> Result<SubmitReply, TransferError> {
    let reply = channel.request(
        &encode_submit(entry_id, team, digest),
        tuning.request_timeout,
        tuning.request_tries,
        |raw| !is_chunk_response(raw),
    )?;
    decode_submit_reply(&reply)
}
