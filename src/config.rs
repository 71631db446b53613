use std::time::Duration;

use anyhow::bail;
use bytes::Bytes;

/// Upper bound for waiting on a transport's `open()` when the caller did not pass a timeout of
///  its own, e.g. when a [crate::transport::mux::MuxTransport] waits for its children.
pub const DEFAULT_START_TIMEOUT: Duration = Duration::from_secs(10);

/// Idle keepalive for stream transports: whenever a connection has seen neither a send nor a
///  receive for `interval`, `payload` is written verbatim.
///
/// The payload should be something the peer's decoder skips, e.g. a bare newline for the terse
///  codec.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeepaliveConfig {
    pub payload: Bytes,
    pub interval: Duration,
}

impl KeepaliveConfig {
    pub fn new(payload: impl Into<Bytes>, interval: Duration) -> KeepaliveConfig {
        KeepaliveConfig {
            payload: payload.into(),
            interval,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.payload.is_empty() {
            bail!("keepalive payload must not be empty");
        }
        if self.interval.is_zero() {
            bail!("keepalive interval must be positive");
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RestartConfig {
    /// Time between restart attempts of a stopped child. This is not kept exactly: it is counted
    ///  down in steps of `poll_interval`.
    pub check_interval: Duration,
    pub poll_interval: Duration,
}

impl Default for RestartConfig {
    fn default() -> Self {
        RestartConfig {
            check_interval: Duration::from_secs(10),
            poll_interval: Duration::from_secs(1),
        }
    }
}

impl RestartConfig {
    pub fn with_check_interval(check_interval: Duration) -> RestartConfig {
        RestartConfig {
            check_interval,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.poll_interval.is_zero() {
            bail!("poll interval must be positive");
        }
        if self.check_interval < self.poll_interval {
            bail!("check interval {:?} is shorter than the poll interval {:?}", self.check_interval, self.poll_interval);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    #[rstest]
    #[case::regular(b"\n", 1000, true)]
    #[case::empty_payload(b"", 1000, false)]
    #[case::zero_interval(b"\n", 0, false)]
    fn test_keepalive_validate(#[case] payload: &'static [u8], #[case] interval_millis: u64, #[case] expected_valid: bool) {
        let config = KeepaliveConfig::new(payload, Duration::from_millis(interval_millis));
        assert_eq!(config.validate().is_ok(), expected_valid);
    }

    #[rstest]
    #[case::default(10_000, 1_000, true)]
    #[case::equal(1_000, 1_000, true)]
    #[case::check_shorter_than_poll(500, 1_000, false)]
    #[case::zero_poll(1_000, 0, false)]
    fn test_restart_validate(#[case] check_millis: u64, #[case] poll_millis: u64, #[case] expected_valid: bool) {
        let config = RestartConfig {
            check_interval: Duration::from_millis(check_millis),
            poll_interval: Duration::from_millis(poll_millis),
        };
        assert_eq!(config.validate().is_ok(), expected_valid);
    }

    #[test]
    fn test_restart_with_check_interval() {
        let config = RestartConfig::with_check_interval(Duration::from_secs(3));
        assert_eq!(config.check_interval, Duration::from_secs(3));
        assert_eq!(config.poll_interval, Duration::from_secs(1));
    }
}
