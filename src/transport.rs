//! Transport trait for robot links

use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::codec::Dialect;
use crate::{LinkError, Result};

/// Bytes reserved in the receive buffer before each read.
const READ_CHUNK: usize = 4096;

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Trait for byte-stream endpoints that reach a robot
///
/// A transport is a connector: each successful [`connect`](Transport::connect)
/// yields a fresh [`Link`]. The reconnection manager calls it again after the
/// link drops, so implementations must be reusable.
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Endpoint description for logs and errors (port path, `host:port`, ...).
    fn locator(&self) -> String;

    /// Wire dialect spoken over this transport unless configured otherwise.
    fn dialect(&self) -> Dialect;

    /// Whether a reconnect may land on a different robot, so identity must be re-checked.
    fn revalidates_identity(&self) -> bool {
        false
    }

    /// Open a new link, giving up after `timeout`.
    ///
    /// Returns `LinkError::Connect` when the endpoint cannot be reached.
    async fn connect(&self, timeout: Duration) -> Result<Link>;
}

/// A connected byte stream, not yet split.
pub struct Link {
    reader: BoxedReader,
    writer: BoxedWriter,
}

impl Link {
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self { reader: Box::new(reader), writer: Box::new(writer) }
    }

    /// Wrap a bidirectional stream.
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self::new(reader, writer)
    }

    /// Split into independently owned halves that share `cancel`.
    ///
    /// Cancelling the token (directly or through the returned [`LinkHandle`])
    /// interrupts a pending read and fails further writes.
    pub fn into_parts(self, cancel: CancellationToken) -> (LinkReader, LinkWriter, LinkHandle) {
        (
            LinkReader { inner: self.reader, cancel: cancel.clone() },
            LinkWriter { inner: self.writer, cancel: cancel.clone() },
            LinkHandle { cancel },
        )
    }
}

/// Outcome of a single [`LinkReader::read`].
#[derive(Debug)]
pub enum ReadOutcome {
    /// `n` bytes were appended to the buffer.
    Data(usize),
    /// Nothing arrived within the idle timeout. The link is still up.
    Idle,
    /// The peer closed the stream or an I/O error occurred.
    Lost(LinkError),
    /// [`LinkHandle::disconnect`] was called.
    Cancelled,
}

/// Read half of a link.
pub struct LinkReader {
    inner: BoxedReader,
    cancel: CancellationToken,
}

impl LinkReader {
    /// Append whatever arrives next to `buf`.
    ///
    /// Distinguishes "no data yet" ([`ReadOutcome::Idle`]) from a dead link
    /// ([`ReadOutcome::Lost`]).
    pub async fn read(&mut self, buf: &mut BytesMut, idle_after: Duration) -> ReadOutcome {
        let Self { inner, cancel } = self;
        buf.reserve(READ_CHUNK);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => ReadOutcome::Cancelled,
            result = tokio::time::timeout(idle_after, inner.read_buf(buf)) => match result {
                Err(_) => ReadOutcome::Idle,
                Ok(Ok(0)) => ReadOutcome::Lost(LinkError::link_lost("stream closed by peer")),
                Ok(Ok(n)) => ReadOutcome::Data(n),
                Ok(Err(e)) => ReadOutcome::Lost(e.into()),
            },
        }
    }
}

/// Write half of a link.
pub struct LinkWriter {
    inner: BoxedWriter,
    cancel: CancellationToken,
}

impl LinkWriter {
    /// Write one encoded frame and flush it.
    pub async fn send(&mut self, bytes: &[u8]) -> Result<()> {
        let Self { inner, cancel } = self;
        if cancel.is_cancelled() {
            return Err(LinkError::link_lost("link disconnected"));
        }
        let write = async {
            inner.write_all(bytes).await?;
            inner.flush().await
        };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(LinkError::link_lost("link disconnected during write")),
            result = write => result.map_err(LinkError::from),
        }
    }
}

/// Cloneable, non-blocking disconnect switch for a link.
#[derive(Debug, Clone)]
pub struct LinkHandle {
    cancel: CancellationToken,
}

impl LinkHandle {
    /// Disconnect the link. Safe to call from any thread, any number of times.
    pub fn disconnect(&self) {
        self.cancel.cancel();
    }

    pub fn is_disconnected(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn read_reports_data_idle_and_loss() {
        let (near, mut far) = tokio::io::duplex(256);
        let (mut reader, _writer, _handle) = Link::from_stream(near).into_parts(CancellationToken::new());
        let mut buf = BytesMut::new();

        far.write_all(&[1, 2, 3]).await.unwrap();
        assert!(matches!(reader.read(&mut buf, Duration::from_millis(200)).await, ReadOutcome::Data(3)));
        assert_eq!(&buf[..], &[1, 2, 3]);

        assert!(matches!(reader.read(&mut buf, Duration::from_millis(20)).await, ReadOutcome::Idle));

        drop(far);
        assert!(matches!(reader.read(&mut buf, Duration::from_millis(200)).await, ReadOutcome::Lost(_)));
    }

    #[tokio::test]
    async fn disconnect_interrupts_blocked_read() {
        let (near, _far) = tokio::io::duplex(256);
        let (mut reader, mut writer, handle) = Link::from_stream(near).into_parts(CancellationToken::new());

        let remote = handle.clone();
        std::thread::spawn(move || remote.disconnect());

        let mut buf = BytesMut::new();
        let outcome = reader.read(&mut buf, Duration::from_secs(30)).await;
        assert!(matches!(outcome, ReadOutcome::Cancelled));
        assert!(handle.is_disconnected());
        assert!(writer.send(&[1]).await.is_err());
    }

    #[tokio::test]
    async fn writes_arrive_in_order() {
        let (near, mut far) = tokio::io::duplex(256);
        let (_reader, mut writer, _handle) = Link::from_stream(near).into_parts(CancellationToken::new());
        writer.send(&[1, 2]).await.unwrap();
        writer.send(&[3]).await.unwrap();

        let mut got = [0u8; 3];
        far.read_exact(&mut got).await.unwrap();
        assert_eq!(got, [1, 2, 3]);
    }
}
