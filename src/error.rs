//! Error types for the robot link.
//!
//! Every fallible operation in martylink returns [`LinkError`]. Errors carry
//! structured context for logging and recovery guidance.
//!
//! ## Error Categories
//!
//! - **Configuration**: unknown connection method, malformed locator or config file
//! - **Connection**: the initial connect failed or the link dropped for good
//! - **Request**: a reply did not arrive in time, or the robot rejected a command
//! - **Protocol**: a frame or reply could not be encoded or understood
//! - **Status**: robot status telemetry is missing or stale
//!
//! ## Recovery and Retry
//!
//! ```rust
//! use martylink::LinkError;
//!
//! let error = LinkError::connect_failed("192.168.1.40:80", "connection refused");
//! if error.is_retryable() {
//!     for suggestion in error.recovery_suggestions() {
//!         println!("  - {}", suggestion);
//!     }
//! }
//! ```

use std::time::Duration;
use thiserror::Error;

use crate::types::LinkState;

/// Result type alias for link operations.
pub type Result<T, E = LinkError> = std::result::Result<T, E>;

/// Main error type for link operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum LinkError {
    #[error("Configuration error: {reason}")]
    Config { reason: String },

    #[error("Failed to connect to {target}: {reason}")]
    Connect {
        target: String,
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Link lost: {reason}")]
    LinkLost {
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Operation timed out after {duration:?}")]
    Timeout { duration: Duration },

    #[error("Protocol error in {context}: {details}")]
    Protocol { context: String, details: String },

    #[error("Unknown target '{target}'")]
    UnknownTarget { target: String },

    #[error("Robot rejected '{command}': {result}")]
    Rejected { command: String, result: String },

    #[error("Not connected (link is {state:?})")]
    NotConnected { state: LinkState },

    #[error("Robot status unavailable: {reason}")]
    StatusUnavailable { reason: String },

    #[error("Robot identity changed: expected {expected}, found {found}")]
    IdentityMismatch { expected: String, found: String },

    #[error("Connection closed")]
    Closed,
}

impl LinkError {
    /// Returns whether this error is potentially recoverable through retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            LinkError::Connect { .. } => true,
            LinkError::LinkLost { .. } => true,
            LinkError::Timeout { .. } => true,
            LinkError::NotConnected { .. } => true,
            LinkError::StatusUnavailable { .. } => true,
            LinkError::Config { .. } => false,
            LinkError::Protocol { .. } => false,
            LinkError::UnknownTarget { .. } => false,
            LinkError::Rejected { .. } => false,
            LinkError::IdentityMismatch { .. } => false,
            LinkError::Closed => false,
        }
    }

    /// Returns suggested recovery actions for this error.
    pub fn recovery_suggestions(&self) -> Vec<&'static str> {
        match self {
            LinkError::Config { .. } => vec![
                "Use one of the methods usb, exp, wifi or socket",
                "Check the locator (serial port path or host name)",
                "Validate the configuration file against the documented keys",
            ],
            LinkError::Connect { .. } => vec![
                "Check the robot is switched on",
                "Verify the serial port or IP address",
                "Make sure no other program holds the serial port",
            ],
            LinkError::LinkLost { .. } => vec![
                "Check the cable or WiFi signal strength",
                "Check the robot battery level",
                "Increase the reconnection attempt budget",
            ],
            LinkError::Timeout { .. } => vec![
                "Increase the request timeout",
                "Check the robot is not busy updating firmware",
                "Verify the link is still up",
            ],
            LinkError::Protocol { .. } => vec![
                "Check the firmware version is supported",
                "Verify the selected wire dialect matches the transport",
            ],
            LinkError::UnknownTarget { .. } => vec![
                "Check the command or element name spelling",
                "Verify the add-on is attached and configured",
            ],
            LinkError::Rejected { .. } => vec![
                "Check the command arguments",
                "Verify the robot is in a state that accepts the command",
            ],
            LinkError::NotConnected { .. } => vec![
                "Wait for the reconnection to complete",
                "Use the queue policy while reconnecting",
            ],
            LinkError::StatusUnavailable { .. } => vec![
                "Check that telemetry publishing is enabled on the robot",
                "Increase the status freshness window",
            ],
            LinkError::IdentityMismatch { .. } => vec![
                "Another robot now answers on this address",
                "Reconnect explicitly to the intended robot",
            ],
            LinkError::Closed => vec!["Open a new connection"],
        }
    }

    /// Helper constructor for configuration errors.
    pub fn config(reason: impl Into<String>) -> Self {
        LinkError::Config { reason: reason.into() }
    }

    /// Helper constructor for connection failures.
    pub fn connect_failed(target: impl Into<String>, reason: impl Into<String>) -> Self {
        LinkError::Connect { target: target.into(), reason: reason.into(), source: None }
    }

    /// Helper constructor for connection failures with source.
    pub fn connect_failed_with_source(
        target: impl Into<String>,
        reason: impl Into<String>,
        source: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        LinkError::Connect { target: target.into(), reason: reason.into(), source: Some(source) }
    }

    /// Helper constructor for link loss.
    pub fn link_lost(reason: impl Into<String>) -> Self {
        LinkError::LinkLost { reason: reason.into(), source: None }
    }

    /// Helper constructor for protocol errors.
    pub fn protocol(context: impl Into<String>, details: impl Into<String>) -> Self {
        LinkError::Protocol { context: context.into(), details: details.into() }
    }

    /// Helper constructor for unknown targets.
    pub fn unknown_target(target: impl Into<String>) -> Self {
        LinkError::UnknownTarget { target: target.into() }
    }

    pub fn status_unavailable(reason: impl Into<String>) -> Self {
        LinkError::StatusUnavailable { reason: reason.into() }
    }
}

impl From<std::io::Error> for LinkError {
    fn from(err: std::io::Error) -> Self {
        LinkError::LinkLost { reason: err.kind().to_string(), source: Some(Box::new(err)) }
    }
}

impl From<serde_json::Error> for LinkError {
    fn from(err: serde_json::Error) -> Self {
        LinkError::protocol("JSON reply", err.to_string())
    }
}

impl From<serde_yaml_ng::Error> for LinkError {
    fn from(err: serde_yaml_ng::Error) -> Self {
        LinkError::config(format!("invalid YAML: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn error_messages_carry_their_context(
                target in "[a-z0-9.:/]{1,30}",
                reason in ".*",
                duration_ms in 1u64..60000u64
            ) {
                let connect = LinkError::connect_failed(target.clone(), reason.clone());
                let msg = connect.to_string();
                prop_assert!(msg.contains(&target));
                prop_assert!(msg.contains(&reason));

                let lost = LinkError::link_lost(reason.clone());
                prop_assert!(lost.to_string().contains(&reason));

                let timeout = LinkError::Timeout { duration: Duration::from_millis(duration_ms) };
                prop_assert!(!timeout.to_string().is_empty());
            }

            #[test]
            fn io_errors_become_link_loss_with_source(message in ".*") {
                let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, message.clone());
                let converted: LinkError = io_err.into();
                match &converted {
                    LinkError::LinkLost { source: Some(source), .. } => {
                        prop_assert_eq!(source.to_string(), message);
                    }
                    other => prop_assert!(false, "expected LinkLost, got {:?}", other),
                }
                prop_assert!(converted.is_retryable());
            }
        }
    }

    #[test]
    fn error_traits_validation() {
        fn assert_send_sync_static<T: Send + Sync + 'static>() {}
        assert_send_sync_static::<LinkError>();

        let error = LinkError::link_lost("test");
        let _: &dyn std::error::Error = &error;
    }

    #[test]
    fn retry_classification() {
        assert!(LinkError::connect_failed("COM3", "busy").is_retryable());
        assert!(LinkError::Timeout { duration: Duration::from_millis(1500) }.is_retryable());
        assert!(!LinkError::config("unknown method 'bluetooth'").is_retryable());
        assert!(!LinkError::unknown_target("addon/LeftEye").is_retryable());
        assert!(!LinkError::Closed.is_retryable());
        assert!(
            !LinkError::IdentityMismatch { expected: "A1".into(), found: "B2".into() }
                .is_retryable()
        );
    }

    #[test]
    fn every_variant_has_suggestions() {
        let errors = vec![
            LinkError::config("x"),
            LinkError::connect_failed("x", "y"),
            LinkError::link_lost("x"),
            LinkError::Timeout { duration: Duration::from_secs(1) },
            LinkError::protocol("x", "y"),
            LinkError::unknown_target("x"),
            LinkError::Rejected { command: "x".into(), result: "fail".into() },
            LinkError::NotConnected { state: LinkState::Reconnecting },
            LinkError::status_unavailable("x"),
            LinkError::IdentityMismatch { expected: "a".into(), found: "b".into() },
            LinkError::Closed,
        ];
        for error in errors {
            let suggestions = error.recovery_suggestions();
            assert!(!suggestions.is_empty(), "no suggestions for {error:?}");
            assert!(suggestions.iter().all(|s| s.len() > 5));
        }
    }

    #[test]
    fn json_errors_are_protocol_errors() {
        let err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let converted: LinkError = err.into();
        assert!(matches!(converted, LinkError::Protocol { .. }));
    }
}
