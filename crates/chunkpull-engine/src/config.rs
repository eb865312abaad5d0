//! Session configuration. Everything a session needs is passed in here;
//! nothing is discovered from the environment.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{TransferError, malformed};
use crate::logging::TransferLogger;
use crate::protocol::CHUNK_SIZE;

/// 1 GiB.
pub const DEFAULT_MAX_TOTAL_SIZE: u64 = 1 << 30;

/// Tunables for pacing, timeouts and retries.
#[derive(Debug, Clone)]
pub struct TransferTuning {
    /// Bytes per chunk. Must match what the peer serves.
    pub chunk_size: usize,
    /// Timeout of one size-query or submit attempt.
    pub request_timeout: Duration,
    /// Attempts for the size query and the submit.
    pub request_tries: u32,
    /// RTT assumed before the first sample arrives.
    pub initial_rtt: Duration,
    /// Weight of a new RTT sample (0..1).
    pub rtt_alpha: f64,
    /// Requests in the first round.
    pub initial_burst: usize,
    /// Multiplier applied to the burst after a lossy round.
    pub burst_decrease: f64,
    pub max_burst: usize,
    /// Sender round interval as a multiple of RTT.
    pub round_interval_factor: f64,
    pub min_round_interval: Duration,
    /// Receiver timeout as a multiple of RTT, clamped to the bounds below.
    pub recv_timeout_factor: f64,
    pub min_recv_timeout: Duration,
    pub max_recv_timeout: Duration,
    /// Consecutive receive timeouts tolerated before the transfer is declared stalled.
    pub recv_retry_budget: u32,
    /// Consecutive sender rounds without a new chunk before giving up.
    pub max_idle_rounds: u32,
    /// Largest buffer size accepted from the peer. The store is allocated up
    /// front from the advertised size, so this bounds memory use.
    pub max_total_size: u64,
}

impl Default for TransferTuning {
    fn default() -> Self {
        TransferTuning {
            chunk_size: CHUNK_SIZE,
            request_timeout: Duration::from_secs(2),
            request_tries: 5,
            initial_rtt: Duration::from_millis(100),
            rtt_alpha: 0.8,
            initial_burst: 1,
            burst_decrease: 0.5,
            max_burst: 1024,
            round_interval_factor: 1.5,
            min_round_interval: Duration::from_millis(1),
            recv_timeout_factor: 4.0,
            min_recv_timeout: Duration::from_millis(20),
            max_recv_timeout: Duration::from_secs(2),
            recv_retry_budget: 20,
            max_idle_rounds: 500,
            max_total_size: DEFAULT_MAX_TOTAL_SIZE,
        }
    }
}

impl TransferTuning {
    /// How long the sender waits between rounds for a given RTT.
    pub fn round_interval(&self, rtt: Duration) -> Duration {
        rtt.mul_f64(self.round_interval_factor)
            .max(self.min_round_interval)
    }

    /// How long the receiver blocks for one datagram for a given RTT.
    pub fn recv_timeout(&self, rtt: Duration) -> Duration {
        rtt.mul_f64(self.recv_timeout_factor)
            .clamp(self.min_recv_timeout, self.max_recv_timeout)
    }

    pub fn validate(&self) -> Result<(), TransferError> {
        let invalid = |msg: &str| Err(TransferError::InvalidConfig(msg.to_string()));
        if self.chunk_size == 0 {
            return invalid("chunk_size must be non-zero");
        }
        if self.request_tries == 0 {
            return invalid("request_tries must be at least 1");
        }
        if self.request_timeout.is_zero() {
            return invalid("request_timeout must be non-zero");
        }
        if !(0.0..=1.0).contains(&self.rtt_alpha) {
            return invalid("rtt_alpha must be within 0..=1");
        }
        if !(0.0..1.0).contains(&self.burst_decrease) {
            return invalid("burst_decrease must be within 0..1");
        }
        if self.initial_burst == 0 || self.max_burst == 0 {
            return invalid("burst sizes must be at least 1");
        }
        if self.min_recv_timeout.is_zero() || self.min_recv_timeout > self.max_recv_timeout {
            return invalid("receive timeout bounds are inconsistent");
        }
        if self.round_interval_factor <= 0.0 || self.recv_timeout_factor <= 0.0 {
            return invalid("timing factors must be positive");
        }
        if self.max_total_size == 0 {
            return invalid("max_total_size must be non-zero");
        }
        if usize::try_from(self.max_total_size.div_ceil(self.chunk_size as u64)).is_err() {
            return invalid("max_total_size needs more chunks than this platform can index");
        }
        Ok(())
    }

    /// Reject an advertised buffer size above `max_total_size`.
    pub fn check_total_size(&self, total_size: u64) -> Result<(), TransferError> {
        if total_size > self.max_total_size {
            return Err(malformed(format!(
                "advertised size {} exceeds the limit of {} bytes",
                total_size, self.max_total_size
            )));
        }
        Ok(())
    }
}

/// Configuration for one pull session.
#[derive(Clone)]
pub struct SessionConfig {
    pub remote_addr: SocketAddr,
    /// Local bind address. `None` binds the unspecified address of the
    /// remote's family on an ephemeral port.
    pub bind_addr: Option<SocketAddr>,
    pub entry_id: String,
    pub team: String,
    /// Submit the digest after the payload is complete.
    pub submit: bool,
    pub tuning: TransferTuning,
    pub logger: Option<Arc<dyn TransferLogger>>,
}

impl SessionConfig {
    pub fn new(remote_addr: SocketAddr, entry_id: impl Into<String>, team: impl Into<String>) -> Self {
        Self {
            remote_addr,
            bind_addr: None,
            entry_id: entry_id.into(),
            team: team.into(),
            submit: true,
            tuning: TransferTuning::default(),
            logger: None,
        }
    }

    pub(crate) fn local_bind_addr(&self) -> SocketAddr {
        use std::net::{Ipv4Addr, Ipv6Addr};

        self.bind_addr.unwrap_or_else(|| match self.remote_addr {
            SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(TransferTuning::default().validate().is_ok());
    }

    fn assert_close(actual: Duration, expected: Duration) {
        let diff = actual.as_secs_f64() - expected.as_secs_f64();
        assert!(diff.abs() < 1e-6, "{:?} != {:?}", actual, expected);
    }

    #[test]
    fn timeouts_follow_rtt_within_bounds() {
        let tuning = TransferTuning::default();
        assert_close(
            tuning.recv_timeout(Duration::from_millis(100)),
            Duration::from_millis(400),
        );
        assert_eq!(
            tuning.recv_timeout(Duration::from_micros(50)),
            tuning.min_recv_timeout
        );
        assert_eq!(
            tuning.recv_timeout(Duration::from_secs(10)),
            tuning.max_recv_timeout
        );
        assert_close(
            tuning.round_interval(Duration::from_millis(10)),
            Duration::from_millis(15),
        );
        assert_eq!(
            tuning.round_interval(Duration::ZERO),
            tuning.min_round_interval
        );
    }

    #[test]
    fn rejects_zero_chunk_size() {
        let tuning = TransferTuning {
            chunk_size: 0,
            ..Default::default()
        };
        assert!(matches!(
            tuning.validate(),
            Err(TransferError::InvalidConfig(_))
        ));
    }

    #[test]
    fn rejects_zero_size_limit() {
        let tuning = TransferTuning {
            max_total_size: 0,
            ..Default::default()
        };
        assert!(matches!(
            tuning.validate(),
            Err(TransferError::InvalidConfig(_))
        ));
    }

    #[test]
    fn size_limit_is_inclusive() {
        let tuning = TransferTuning {
            max_total_size: 4096,
            ..Default::default()
        };
        assert!(tuning.check_total_size(0).is_ok());
        assert!(tuning.check_total_size(4096).is_ok());
        assert!(matches!(
            tuning.check_total_size(4097),
            Err(TransferError::MalformedResponse(_))
        ));
        assert!(TransferTuning::default().check_total_size(u64::MAX).is_err());
    }

    #[test]
    fn unspecified_bind_matches_remote_family() {
        let config = SessionConfig::new("127.0.0.1:9801".parse().unwrap(), "id", "team");
        assert_eq!(config.local_bind_addr(), "0.0.0.0:0".parse::<SocketAddr>().unwrap());

        let config = SessionConfig::new("[::1]:9801".parse().unwrap(), "id", "team");
        assert_eq!(config.local_bind_addr(), "[::]:0".parse::<SocketAddr>().unwrap());
    }
}
