//! TCP transports: WiFi REST and the legacy raw socket

use std::time::Duration;

use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::codec::Dialect;
use crate::transport::{Link, Transport};
use crate::{LinkError, Result};

/// Default port of the robot's WiFi command endpoint.
pub const DEFAULT_WIFI_PORT: u16 = 80;

/// Port of the legacy raw socket interface.
pub const LEGACY_SOCKET_PORT: u16 = 24;

/// REST dialect over TCP on the robot's WiFi interface
///
/// DHCP can hand the same address to another robot while we are away, so
/// reconnects re-check the robot identity.
#[derive(Debug, Clone)]
pub struct WifiTransport {
    host: String,
    port: u16,
}

impl WifiTransport {
    pub fn new(host: impl Into<String>) -> Self {
        Self { host: host.into(), port: DEFAULT_WIFI_PORT }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }
}

#[async_trait::async_trait]
impl Transport for WifiTransport {
    fn locator(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn dialect(&self) -> Dialect {
        Dialect::RicRest
    }

    fn revalidates_identity(&self) -> bool {
        true
    }

    async fn connect(&self, timeout: Duration) -> Result<Link> {
        dial(&self.host, self.port, timeout).await
    }
}

/// Binary dialect over the legacy raw socket interface
#[derive(Debug, Clone)]
pub struct LegacySocketTransport {
    host: String,
    port: u16,
}

impl LegacySocketTransport {
    pub fn new(host: impl Into<String>) -> Self {
        Self { host: host.into(), port: LEGACY_SOCKET_PORT }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }
}

#[async_trait::async_trait]
impl Transport for LegacySocketTransport {
    fn locator(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn dialect(&self) -> Dialect {
        Dialect::RosSerial
    }

    async fn connect(&self, timeout: Duration) -> Result<Link> {
        dial(&self.host, self.port, timeout).await
    }
}

pub(crate) async fn dial(host: &str, port: u16, timeout: Duration) -> Result<Link> {
    let target = format!("{host}:{port}");
    debug!(target = %target, ?timeout, "Dialling robot");

    let stream = tokio::time::timeout(timeout, TcpStream::connect(&target))
        .await
        .map_err(|_| LinkError::connect_failed(&target, format!("no answer within {timeout:?}")))?
        .map_err(|e| LinkError::connect_failed_with_source(&target, "TCP connect failed", Box::new(e)))?;

    // Small command frames; do not let Nagle hold them back
    stream
        .set_nodelay(true)
        .map_err(|e| LinkError::connect_failed_with_source(&target, "socket setup failed", Box::new(e)))?;

    info!(target = %target, "TCP link established");
    let (reader, writer) = stream.into_split();
    Ok(Link::new(reader, writer))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn locators_and_dialects() {
        let wifi = WifiTransport::new("192.168.1.40");
        assert_eq!(wifi.locator(), "192.168.1.40:80");
        assert_eq!(wifi.dialect(), Dialect::RicRest);
        assert!(wifi.revalidates_identity());

        let legacy = LegacySocketTransport::new("marty.local").with_port(2424);
        assert_eq!(legacy.locator(), "marty.local:2424");
        assert_eq!(legacy.dialect(), Dialect::RosSerial);
        assert!(!legacy.revalidates_identity());
    }

    #[tokio::test]
    async fn connects_to_listening_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accept = tokio::spawn(async move { listener.accept().await.map(|_| ()) });

        let transport = WifiTransport::new("127.0.0.1").with_port(port);
        assert!(transport.connect(Duration::from_secs(2)).await.is_ok());
        accept.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn refused_connection_is_a_connect_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let transport = LegacySocketTransport::new("127.0.0.1").with_port(port);
        let err = transport.connect(Duration::from_secs(2)).await.err().unwrap();
        assert!(matches!(err, LinkError::Connect { .. }));
    }
}
