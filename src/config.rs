//! Connection configuration
//!
//! All durations are plain millisecond fields so configs read naturally in
//! YAML:
//!
//! ```yaml
//! request_timeout_ms: 2000
//! reconnect:
//!   max_attempts: 20
//! while_reconnecting:
//!   policy: fail_fast
//! queue:
//!   freshness_ms: 5000
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::codec::Dialect;
use crate::{LinkError, Result};

/// Everything tunable about one connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Override the transport's default wire dialect.
    pub dialect: Option<Dialect>,
    pub connect_timeout_ms: u64,
    /// Default timeout for synchronous requests.
    pub request_timeout_ms: u64,
    /// Idle period after which the receive loop runs housekeeping.
    pub read_timeout_ms: u64,
    pub reconnect: BackoffPolicy,
    pub while_reconnecting: ReconnectWait,
    pub queue: QueueConfig,
    pub publish: PublishConfig,
    /// Items buffered per telemetry subscriber before drops start.
    pub subscriber_capacity: usize,
    /// Read the robot identity at open and re-check it after reconnecting.
    pub verify_identity: bool,
    /// Serial baud rate override.
    pub serial_baud: Option<u32>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            dialect: None,
            connect_timeout_ms: 5_000,
            request_timeout_ms: 1_500,
            read_timeout_ms: 250,
            reconnect: BackoffPolicy::default(),
            while_reconnecting: ReconnectWait::default(),
            queue: QueueConfig::default(),
            publish: PublishConfig::default(),
            subscriber_capacity: 64,
            verify_identity: true,
            serial_baud: None,
        }
    }
}

impl ConnectionConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml_ng::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path)
            .map_err(|e| LinkError::config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_yaml_str(&yaml)
    }

    /// Reject settings the link cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.request_timeout_ms == 0 {
            return Err(LinkError::config("request_timeout_ms must be positive"));
        }
        if self.read_timeout_ms == 0 {
            return Err(LinkError::config("read_timeout_ms must be positive"));
        }
        if self.subscriber_capacity == 0 {
            return Err(LinkError::config("subscriber_capacity must be positive"));
        }
        if self.reconnect.multiplier.is_nan() || self.reconnect.multiplier < 1.0 {
            return Err(LinkError::config("reconnect.multiplier must be at least 1.0"));
        }
        if self.reconnect.initial_delay_ms > self.reconnect.max_delay_ms {
            return Err(LinkError::config("reconnect.initial_delay_ms exceeds max_delay_ms"));
        }
        if self.queue.freshness_ms == 0 {
            return Err(LinkError::config("queue.freshness_ms must be positive"));
        }
        if self.publish.rate_hz.is_nan() || self.publish.rate_hz <= 0.0 {
            return Err(LinkError::config("publish.rate_hz must be positive"));
        }
        if self.publish.enabled && self.publish.resubscribe_after_ms == 0 {
            return Err(LinkError::config("publish.resubscribe_after_ms must be positive"));
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

/// Bounded exponential backoff between reconnection attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffPolicy {
    pub enabled: bool,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    /// Give up after this many failed attempts.
    pub max_attempts: u32,
    /// Give up once this much time has passed since the link dropped.
    pub max_elapsed_ms: u64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_delay_ms: 100,
            max_delay_ms: 5_000,
            multiplier: 2.0,
            max_attempts: 10,
            max_elapsed_ms: 60_000,
        }
    }
}

/// What synchronous calls do while the link is being re-established.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum ReconnectWait {
    /// Fail immediately with `NotConnected`.
    FailFast,
    /// Wait up to `max_wait_ms` for the link to come back.
    Queue { max_wait_ms: u64 },
}

impl Default for ReconnectWait {
    fn default() -> Self {
        ReconnectWait::Queue { max_wait_ms: 5_000 }
    }
}

/// Queue tracking and blocking-call tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// How long a robot status report stays valid.
    pub freshness_ms: u64,
    /// Grace period before a drain waiter trusts an idle report.
    pub settle_ms: u64,
    /// Extra wait allowed beyond a motion's expected duration.
    pub max_blocking_wait_ms: u64,
    /// Whether motion calls block by default.
    pub blocking: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { freshness_ms: 3_000, settle_ms: 250, max_blocking_wait_ms: 120_000, blocking: true }
    }
}

impl QueueConfig {
    pub fn freshness(&self) -> Duration {
        Duration::from_millis(self.freshness_ms)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn max_blocking_wait(&self) -> Duration {
        Duration::from_millis(self.max_blocking_wait_ms)
    }
}

/// Telemetry publishing requested from the robot on the REST dialect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PublishConfig {
    pub enabled: bool,
    /// Rate for status and add-on telemetry. Power status is always 1 Hz.
    pub rate_hz: f64,
    /// Re-send the subscription if no telemetry arrives for this long.
    pub resubscribe_after_ms: u64,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self { enabled: true, rate_hz: 10.0, resubscribe_after_ms: 10_000 }
    }
}

impl PublishConfig {
    pub fn resubscribe_after(&self) -> Duration {
        Duration::from_millis(self.resubscribe_after_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = ConnectionConfig::default();
        config.validate().unwrap();
        assert_eq!(config.request_timeout(), Duration::from_millis(1500));
        assert_eq!(config.queue.freshness(), Duration::from_secs(3));
    }

    #[test]
    fn partial_yaml_keeps_defaults() {
        let config = ConnectionConfig::from_yaml_str(
            "request_timeout_ms: 2000\nwhile_reconnecting:\n  policy: fail_fast\nqueue:\n  freshness_ms: 5000\ndialect: ric_rest\n",
        )
        .unwrap();
        assert_eq!(config.request_timeout_ms, 2000);
        assert_eq!(config.while_reconnecting, ReconnectWait::FailFast);
        assert_eq!(config.queue.freshness_ms, 5000);
        assert_eq!(config.queue.settle_ms, 250);
        assert_eq!(config.dialect, Some(Dialect::RicRest));
        assert_eq!(config.reconnect, BackoffPolicy::default());
    }

    #[test]
    fn queue_policy_with_wait() {
        let config =
            ConnectionConfig::from_yaml_str("while_reconnecting:\n  policy: queue\n  max_wait_ms: 750\n").unwrap();
        assert_eq!(config.while_reconnecting, ReconnectWait::Queue { max_wait_ms: 750 });
    }

    #[test]
    fn invalid_values_are_config_errors() {
        for yaml in [
            "request_timeout_ms: 0",
            "subscriber_capacity: 0",
            "reconnect:\n  multiplier: 0.5",
            "reconnect:\n  initial_delay_ms: 9000\n  max_delay_ms: 100",
            "publish:\n  rate_hz: 0",
            "dialect: carrier_pigeon",
        ] {
            let err = ConnectionConfig::from_yaml_str(yaml).unwrap_err();
            assert!(matches!(err, LinkError::Config { .. }), "{yaml}: {err:?}");
        }
    }

    #[test]
    fn missing_file_is_config_error() {
        let err = ConnectionConfig::from_yaml_file("/nonexistent/martylink.yaml").unwrap_err();
        assert!(matches!(err, LinkError::Config { .. }));
    }
}
