//! In-memory loopback transport
//!
//! Each connect creates a fresh duplex pipe and hands the far end to the
//! paired [`MemoryRobot`]. Used by simulators and the test-suite.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use tokio::io::DuplexStream;
use tokio::sync::{Mutex, mpsc};
use tracing::debug;

use crate::codec::Dialect;
use crate::transport::{Link, Transport};
use crate::{LinkError, Result};

const PIPE_CAPACITY: usize = 64 * 1024;

/// Transport half of an in-memory robot link.
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    dialect: Dialect,
    revalidate: bool,
    endpoints: mpsc::UnboundedSender<DuplexStream>,
    online: Arc<AtomicBool>,
    connects: Arc<AtomicU32>,
}

/// Robot half: receives one stream per successful connect.
#[derive(Debug)]
pub struct MemoryRobot {
    endpoints: Mutex<mpsc::UnboundedReceiver<DuplexStream>>,
    online: Arc<AtomicBool>,
    connects: Arc<AtomicU32>,
}

impl MemoryTransport {
    pub fn pair(dialect: Dialect) -> (MemoryTransport, MemoryRobot) {
        let (tx, rx) = mpsc::unbounded_channel();
        let online = Arc::new(AtomicBool::new(true));
        let connects = Arc::new(AtomicU32::new(0));
        (
            MemoryTransport {
                dialect,
                revalidate: false,
                endpoints: tx,
                online: Arc::clone(&online),
                connects: Arc::clone(&connects),
            },
            MemoryRobot { endpoints: Mutex::new(rx), online, connects },
        )
    }

    /// Make reconnects re-check robot identity, as the WiFi transport does.
    pub fn with_identity_check(mut self, revalidate: bool) -> Self {
        self.revalidate = revalidate;
        self
    }
}

impl MemoryRobot {
    /// Wait for the next connection from the client side.
    pub async fn accept(&self) -> Option<DuplexStream> {
        self.endpoints.lock().await.recv().await
    }

    /// While offline, connects fail with `LinkError::Connect`.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Number of successful connects so far.
    pub fn connect_count(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Transport for MemoryTransport {
    fn locator(&self) -> String {
        "memory".to_string()
    }

    fn dialect(&self) -> Dialect {
        self.dialect
    }

    fn revalidates_identity(&self) -> bool {
        self.revalidate
    }

    async fn connect(&self, _timeout: Duration) -> Result<Link> {
        if !self.online.load(Ordering::SeqCst) {
            return Err(LinkError::connect_failed("memory", "robot offline"));
        }
        let (near, far) = tokio::io::duplex(PIPE_CAPACITY);
        self.endpoints
            .send(far)
            .map_err(|_| LinkError::connect_failed("memory", "robot endpoint dropped"))?;
        let count = self.connects.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(connects = count, "Memory link established");
        Ok(Link::from_stream(near))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn each_connect_reaches_the_robot() {
        let (transport, robot) = MemoryTransport::pair(Dialect::RosSerial);

        let link = transport.connect(Duration::from_secs(1)).await.unwrap();
        let (_reader, mut writer, _handle) = link.into_parts(CancellationToken::new());
        writer.send(b"hi").await.unwrap();

        let mut far = robot.accept().await.unwrap();
        let mut got = [0u8; 2];
        far.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"hi");
        far.write_all(b"ok").await.unwrap();

        assert_eq!(robot.connect_count(), 1);
    }

    #[tokio::test]
    async fn offline_robot_refuses() {
        let (transport, robot) = MemoryTransport::pair(Dialect::RicRest);
        robot.set_online(false);
        let err = transport.connect(Duration::from_secs(1)).await.err().unwrap();
        assert!(matches!(err, LinkError::Connect { .. }));
        robot.set_online(true);
        assert!(transport.connect(Duration::from_secs(1)).await.is_ok());
    }

    #[tokio::test]
    async fn dropped_robot_refuses() {
        let (transport, robot) = MemoryTransport::pair(Dialect::RicRest);
        drop(robot);
        assert!(transport.connect(Duration::from_secs(1)).await.is_err());
    }
}
