use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, bail};
use chunkpull_engine::SessionConfig;

/// Everything the binary needs for one run.
pub struct ClientConfig {
    pub session: SessionConfig,
    pub output: PathBuf,
}

/// Build the client configuration from `CHUNKPULL_*` variables. `lookup` is
/// `std::env::var` in production.
pub fn load_config(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<ClientConfig> {
    let remote_addr: SocketAddr = lookup("CHUNKPULL_REMOTE_ADDR")
        .context("CHUNKPULL_REMOTE_ADDR is not set")?
        .parse()
        .context("CHUNKPULL_REMOTE_ADDR is not a socket address")?;

    let skip_submit = lookup("CHUNKPULL_SKIP_SUBMIT")
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false);

    let entry_id = lookup("CHUNKPULL_ENTRY_ID").unwrap_or_default();
    let team = lookup("CHUNKPULL_TEAM").unwrap_or_default();
    if !skip_submit && (entry_id.is_empty() || team.is_empty()) {
        bail!("CHUNKPULL_ENTRY_ID and CHUNKPULL_TEAM are required unless CHUNKPULL_SKIP_SUBMIT is set");
    }

    let mut session = SessionConfig::new(remote_addr, entry_id, team);
    session.submit = !skip_submit;
    session.bind_addr = lookup("CHUNKPULL_BIND_ADDR")
        .map(|v| v.parse())
        .transpose()
        .context("CHUNKPULL_BIND_ADDR is not a socket address")?;

    if let Some(v) = lookup("CHUNKPULL_CHUNK_SIZE") {
        session.tuning.chunk_size = v.parse().context("CHUNKPULL_CHUNK_SIZE is not a number")?;
    }
    if let Some(v) = lookup("CHUNKPULL_MAX_SIZE") {
        session.tuning.max_total_size = v.parse().context("CHUNKPULL_MAX_SIZE is not a number")?;
    }
    if let Some(v) = lookup("CHUNKPULL_RETRY_BUDGET") {
        session.tuning.recv_retry_budget =
            v.parse().context("CHUNKPULL_RETRY_BUDGET is not a number")?;
    }

    let output: PathBuf = lookup("CHUNKPULL_OUTPUT")
        .unwrap_or_else(|| "output.txt".into())
        .into();

    Ok(ClientConfig { session, output })
}
