//! Text-line wire protocol spoken with the remote buffer peer.
//!
//! Every request is a few `\n`-terminated lines followed by a blank line.
//!
//! ```text
//! SendSize\nReset\n\n                      -> "<status> <total_size>\n..."
//! Offset: <n>\nNumBytes: <n>\n\n           -> "Offset: <n>\nNumBytes: <n>\n[Squished\n]\n<raw bytes>"
//! Submit: <entry>@<team>\nMD5: <hex>\n\n   -> "<w> <true|false> <w> <elapsed> <w> <penalty>"
//! ```
//!
//! Submit replies are parsed by token position. That layout is fragile but it
//! is what the peer sends, so it stays contained in this module.

use std::str::FromStr;

use bytes::Bytes;
use serde::Serialize;

use crate::error::{TransferError, malformed};

/// Default chunk size in bytes, as served by the peer.
pub const CHUNK_SIZE: usize = 1448;

/// Extra room on top of the chunk size for the reply header lines.
pub const REPLY_HEADER_SLACK: usize = 512;

/// OS receive buffer size (4 MB).
pub const UDP_RECV_BUFFER: usize = 4 * 1024 * 1024;

const SIZE_QUERY: &[u8] = b"SendSize\nReset\n\n";
const OFFSET_PREFIX: &str = "Offset:";
const NUM_BYTES_PREFIX: &str = "NumBytes:";
const SQUISHED_MARKER: &[u8] = b"Squished";

/// Submit reply token positions.
const SUBMIT_ACCEPTED_TOKEN: usize = 1;
const SUBMIT_ELAPSED_TOKEN: usize = 3;
const SUBMIT_PENALTY_TOKEN: usize = 5;

/// Size query. Also rewinds the peer's delivery cursor.
pub fn encode_size_query() -> Vec<u8> {
    SIZE_QUERY.to_vec()
}

/// Total buffer size from a size reply: the second whitespace-separated token.
pub fn decode_size_reply(raw: &[u8]) -> Result<u64, TransferError> {
    let text = String::from_utf8_lossy(raw);
    text.split_whitespace()
        .nth(1)
        .and_then(|token| token.parse().ok())
        .ok_or_else(|| malformed(format!("size reply without a size: {:?}", text)))
}

pub fn encode_chunk_request(offset: u64, num_bytes: usize) -> Vec<u8> {
    format!("Offset: {}\nNumBytes: {}\n\n", offset, num_bytes).into_bytes()
}

/// Decoded chunk reply. `data` is untrusted until checked with [`ChunkResponse::is_intact`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkResponse {
    pub offset: u64,
    pub num_bytes: usize,
    /// The peer marked this reply as squished. Its meaning is not pinned down;
    /// the reply goes through the same length checks as any other.
    pub is_squished: bool,
    pub data: Bytes,
}

impl ChunkResponse {
    /// True when the payload length matches the declared `NumBytes`.
    pub fn is_intact(&self) -> bool {
        self.data.len() == self.num_bytes
    }
}

/// Whether a datagram looks like a chunk reply. Used to skip late chunk
/// replies while waiting for a control reply.
pub fn is_chunk_response(raw: &[u8]) -> bool {
    raw.starts_with(OFFSET_PREFIX.as_bytes())
}

/// Decode a chunk reply. The payload is a zero-copy slice of `raw`.
pub fn decode_chunk_response(raw: Bytes) -> Result<ChunkResponse, TransferError> {
    let mut pos = 0;
    let offset: u64 = parse_header_line(&raw, &mut pos, OFFSET_PREFIX)?;
    let num_bytes: usize = parse_header_line(&raw, &mut pos, NUM_BYTES_PREFIX)?;

    let mut is_squished = false;
    let mut line = next_line(&raw, &mut pos)
        .ok_or_else(|| malformed("chunk reply header not terminated"))?;
    if line.trim_ascii() == SQUISHED_MARKER {
        is_squished = true;
        line = next_line(&raw, &mut pos)
            .ok_or_else(|| malformed("chunk reply header not terminated"))?;
    }
    if !line.trim_ascii().is_empty() {
        return Err(malformed(format!(
            "unexpected header line: {:?}",
            String::from_utf8_lossy(line)
        )));
    }

    Ok(ChunkResponse {
        offset,
        num_bytes,
        is_squished,
        data: raw.slice(pos..),
    })
}

pub fn encode_submit(entry_id: &str, team: &str, digest: &str) -> Vec<u8> {
    format!("Submit: {}@{}\nMD5: {}\n\n", entry_id, team, digest).into_bytes()
}

/// The peer's verdict on a submitted digest, kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubmitReply {
    pub accepted: bool,
    pub elapsed: String,
    pub penalty: String,
}

pub fn decode_submit_reply(raw: &[u8]) -> Result<SubmitReply, TransferError> {
    let text = String::from_utf8_lossy(raw);
    let tokens: Vec<&str> = text.split_whitespace().collect();
    if tokens.len() <= SUBMIT_PENALTY_TOKEN {
        return Err(malformed(format!(
            "submit reply has {} tokens, expected at least {}",
            tokens.len(),
            SUBMIT_PENALTY_TOKEN + 1
        )));
    }
    Ok(SubmitReply {
        accepted: tokens[SUBMIT_ACCEPTED_TOKEN] == "true",
        elapsed: tokens[SUBMIT_ELAPSED_TOKEN].to_string(),
        penalty: tokens[SUBMIT_PENALTY_TOKEN].to_string(),
    })
}

/// Next `\n`-terminated line starting at `pos`, without the terminator.
fn next_line<'a>(raw: &'a [u8], pos: &mut usize) -> Option<&'a [u8]> {
    let rest = &raw[*pos..];
    let end = rest.iter().position(|&b| b == b'\n')?;
    *pos += end + 1;
    Some(&rest[..end])
}

fn parse_header_line<T: FromStr>(
    raw: &[u8],
    pos: &mut usize,
    prefix: &str,
) -> Result<T, TransferError> {
    let line = next_line(raw, pos).ok_or_else(|| malformed(format!("missing {} line", prefix)))?;
    let line = std::str::from_utf8(line)
        .map_err(|_| malformed(format!("{} line is not UTF-8", prefix)))?;
    line.trim()
        .strip_prefix(prefix)
        .and_then(|value| value.trim().parse().ok())
        .ok_or_else(|| malformed(format!("bad {} line: {:?}", prefix, line)))
}
