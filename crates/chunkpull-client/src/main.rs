mod config;

use std::sync::Arc;

use anyhow::Context;
use chunkpull_engine::{TracingLogger, TransferStats, run_transfer};
use tracing::{error, info, warn};

/// Exit status when the peer rejects the submitted digest.
const EXIT_REJECTED: i32 = 2;

fn main() {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "chunkpull_client=info,chunkpull_engine=info".into()),
        )
        .init();

    match run() {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            error!("{e:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> anyhow::Result<i32> {
    let client = config::load_config(|key| std::env::var(key).ok())?;
    let mut session = client.session;
    session.logger = Some(Arc::new(TracingLogger));

    info!(
        remote = %session.remote_addr,
        output = %client.output.display(),
        "starting pull"
    );

    let stats = Arc::new(TransferStats::new());
    let result = run_transfer(session, stats).context("transfer failed")?;

    std::fs::write(&client.output, &result.payload)
        .with_context(|| format!("failed to write {}", client.output.display()))?;
    println!("{}", serde_json::to_string_pretty(&result)?);

    match &result.submit {
        Some(reply) if reply.accepted => {
            info!(digest = %result.digest, elapsed = %reply.elapsed, penalty = %reply.penalty, "digest accepted");
            Ok(0)
        }
        Some(reply) => {
            warn!(digest = %result.digest, elapsed = %reply.elapsed, penalty = %reply.penalty, "digest rejected");
            Ok(EXIT_REJECTED)
        }
        None => {
            info!(digest = %result.digest, "submit skipped");
            Ok(0)
        }
    }
}
