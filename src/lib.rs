//! Async client protocol engine for Marty-style robots.
//!
//! martylink speaks the robot's two wire dialects over serial, WiFi and raw
//! socket links and gives a facade a small, typed core API.
//!
//! # Features
//!
//! - **Two dialects**: checksummed ROS-serial frames (serial, legacy socket) and
//!   numbered RIC REST frames (WiFi)
//! - **Request/reply correlation**: by message number, or strictly one at a
//!   time on links without numbers
//! - **Telemetry**: per-topic callbacks and streams that never block the reader
//! - **Resilience**: automatic reconnection with bounded backoff, keeping
//!   subscriptions and re-checking robot identity
//! - **Blocking moves**: wait for the robot's command queue to drain
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use martylink::{Marty, Request, TopicId};
//! use futures::StreamExt;
//!
//! #[tokio::main]
//! async fn main() -> martylink::Result<()> {
//!     let marty = Marty::connect("wifi", "192.168.86.41").await?;
//!
//!     let reply = marty.request(Request::rest("v")).await?.check()?;
//!     println!("{:?}", reply.json()?);
//!
//!     let mut status = marty.subscribe_stream(TopicId::ROBOT_STATUS);
//!     if let Some(item) = status.next().await {
//!         println!("status: {:?}", item.payload);
//!     }
//!
//!     marty.close().await
//! }
//! ```

// Core types and error handling
pub mod codec;
pub mod config;
mod error;
pub mod request;
pub mod stats;
#[cfg(any(test, feature = "benchmark"))]
pub mod test_utils;
pub mod types;

// Link machinery
pub mod connection;
pub mod correlator;
pub mod queue;
mod receiver;
pub mod reconnect;
pub mod stream;
pub mod subscriptions;
pub mod transfer;
pub mod transport;
pub mod transports;

// Tooling
pub mod discovery;
pub mod sim;

// Core exports
pub use error::*;
pub use types::*;

// Main API exports
pub use codec::Dialect;
pub use config::{BackoffPolicy, ConnectionConfig, PublishConfig, QueueConfig, ReconnectWait};
pub use connection::Connection;
pub use correlator::ReplyMatcher;
pub use discovery::{Prober, RestIdentityProber, probe, probe_candidates};
pub use receiver::ReceiverExit;
pub use request::{Reply, Request};
pub use stats::LinkStats;
pub use stream::SampleExt;
pub use subscriptions::SubscriptionHandle;
pub use transfer::{UploadSummary, UploadTarget};
pub use transport::{Link, LinkHandle, Transport};

use transports::{LEGACY_SOCKET_PORT, LegacySocketTransport, WifiTransport};

/// Where and how to reach a robot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// USB serial; `None` auto-detects the port.
    Usb(Option<String>),
    /// Expansion-header UART; `None` auto-detects the port.
    Expansion(Option<String>),
    Wifi { host: String, port: u16 },
    Socket { host: String, port: u16 },
    /// In-process simulated robot.
    Test,
}

impl Target {
    /// Parse a method and locator.
    ///
    /// `method` is one of `usb`, `exp`, `wifi`, `socket` or `test`, or a URL
    /// such as `wifi://192.168.86.41` whose remainder replaces `locator`.
    pub fn parse(method: &str, locator: &str) -> Result<Self> {
        let (method, locator) = match method.split_once("://") {
            Some((scheme, rest)) if !rest.is_empty() => (scheme, rest),
            Some((scheme, _)) => (scheme, locator),
            None => (method, locator),
        };
        let method = method.trim().to_ascii_lowercase();
        let locator = locator.trim();
        let port_path = (!locator.is_empty()).then(|| locator.to_string());

        match method.as_str() {
            "usb" => Ok(Target::Usb(port_path)),
            "exp" => Ok(Target::Expansion(port_path)),
            "wifi" => {
                let (host, port) = host_and_port(locator, transports::DEFAULT_WIFI_PORT)?;
                Ok(Target::Wifi { host, port })
            }
            "socket" => {
                let (host, port) = host_and_port(locator, LEGACY_SOCKET_PORT)?;
                Ok(Target::Socket { host, port })
            }
            "test" => Ok(Target::Test),
            other => Err(LinkError::config(format!(
                "unknown connection method '{other}' (expected usb, exp, wifi, socket or test)"
            ))),
        }
    }

    /// Build the transport for this target.
    pub fn into_transport(self, config: &ConnectionConfig) -> Result<Box<dyn Transport>> {
        match self {
            #[cfg(feature = "serial")]
            Target::Usb(port) => Ok(Box::new(serial_transport(transports::SerialPortKind::Usb, port, config))),
            #[cfg(feature = "serial")]
            Target::Expansion(port) => {
                Ok(Box::new(serial_transport(transports::SerialPortKind::Expansion, port, config)))
            }
            #[cfg(not(feature = "serial"))]
            Target::Usb(_) | Target::Expansion(_) => {
                let _ = config;
                Err(LinkError::config("serial links need the `serial` feature"))
            }
            Target::Wifi { host, port } => Ok(Box::new(WifiTransport::new(host).with_port(port))),
            Target::Socket { host, port } => Ok(Box::new(LegacySocketTransport::new(host).with_port(port))),
            Target::Test => {
                let (transport, _robot) = sim::SimRobot::pair(Dialect::RicRest);
                Ok(Box::new(transport))
            }
        }
    }
}

#[cfg(feature = "serial")]
fn serial_transport(
    kind: transports::SerialPortKind,
    port: Option<String>,
    config: &ConnectionConfig,
) -> transports::SerialTransport {
    let transport = transports::SerialTransport::new(kind, port);
    match config.serial_baud {
        Some(baud) => transport.with_baud(baud),
        None => transport,
    }
}

fn host_and_port(locator: &str, default_port: u16) -> Result<(String, u16)> {
    if locator.is_empty() {
        return Err(LinkError::config("a host name or IP address is required"));
    }
    match locator.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() => {
            let port = port.parse().map_err(|_| LinkError::config(format!("invalid port in '{locator}'")))?;
            Ok((host.to_string(), port))
        }
        _ => Ok((locator.to_string(), default_port)),
    }
}

/// Unified entry point for robot connections.
///
/// # Examples
///
/// ## WiFi
/// ```rust,no_run
/// use martylink::Marty;
///
/// #[tokio::main]
/// async fn main() -> martylink::Result<()> {
///     let connection = Marty::connect("wifi", "192.168.86.41").await?;
///     // Use connection...
///     Ok(())
/// }
/// ```
///
/// ## USB serial with auto-detected port
/// ```rust,no_run
/// use martylink::Marty;
///
/// #[tokio::main]
/// async fn main() -> martylink::Result<()> {
///     let connection = Marty::connect("usb", "").await?;
///     // Use connection...
///     Ok(())
/// }
/// ```
pub struct Marty;

impl Marty {
    /// Connect with the default configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - the method is unknown or the locator malformed (`Config`)
    /// - the robot cannot be reached (`Connect`)
    pub async fn connect(method: &str, locator: &str) -> Result<Connection> {
        Self::connect_with(method, locator, ConnectionConfig::default()).await
    }

    pub async fn connect_with(method: &str, locator: &str, config: ConnectionConfig) -> Result<Connection> {
        let transport = Target::parse(method, locator)?.into_transport(&config)?;
        Connection::open_boxed(transport, config).await
    }
}
