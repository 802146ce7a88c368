//! Robot discovery
//!
//! Checks candidate addresses concurrently and keeps the ones that answer
//! like a robot. Unreachable, slow or unrelated hosts are simply left out.

use std::time::Duration;

use bytes::{Buf, BytesMut};
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::Result;
use crate::codec::{Decoded, ELEM_URL, FrameCodec, RicRestCodec};
use crate::transport::ReadOutcome;
use crate::transports::DEFAULT_WIFI_PORT;
use crate::transports::tcp::dial;
use crate::types::{Frame, FrameKind, TopicId};

/// Candidates checked at once when no limit is given.
pub const DEFAULT_MAX_CONCURRENCY: usize = 16;

/// Handshake deciding whether a candidate is a robot.
#[async_trait::async_trait]
pub trait Prober: Send + Sync {
    /// `Ok(true)` if `candidate` is a robot. Errors count as "not a robot".
    async fn probe(&self, candidate: &str) -> Result<bool>;
}

/// Dials the WiFi REST port and asks for the version report.
#[derive(Debug, Clone)]
pub struct RestIdentityProber {
    port: u16,
}

impl Default for RestIdentityProber {
    fn default() -> Self {
        Self { port: DEFAULT_WIFI_PORT }
    }
}

impl RestIdentityProber {
    pub fn with_port(port: u16) -> Self {
        Self { port }
    }
}

#[async_trait::async_trait]
impl Prober for RestIdentityProber {
    async fn probe(&self, candidate: &str) -> Result<bool> {
        // The caller bounds the whole check; this only stops a dial from hanging forever
        let link = dial(candidate, self.port, Duration::from_secs(30)).await?;
        let (mut reader, mut writer, _handle) = link.into_parts(CancellationToken::new());

        let request = Frame::new(TopicId::RIC_REST, FrameKind::Command, RicRestCodec::rest_payload(ELEM_URL, "v"))
            .with_correlation(1);
        writer.send(&RicRestCodec.encode(&request)?).await?;

        let mut buf = BytesMut::with_capacity(512);
        loop {
            match reader.read(&mut buf, Duration::from_millis(250)).await {
                ReadOutcome::Data(_) | ReadOutcome::Idle => {}
                ReadOutcome::Lost(e) => return Err(e),
                ReadOutcome::Cancelled => return Ok(false),
            }
            loop {
                match RicRestCodec.decode(&buf) {
                    Decoded::Frame { frame, consumed } => {
                        buf.advance(consumed);
                        if frame.topic == TopicId::RIC_REST && frame.kind == FrameKind::Response {
                            return Ok(is_robot_identity(&frame));
                        }
                    }
                    Decoded::Discard { consumed, .. } => buf.advance(consumed),
                    Decoded::Incomplete => break,
                }
            }
        }
    }
}

fn is_robot_identity(frame: &Frame) -> bool {
    RicRestCodec::rest_text(&frame.payload)
        .and_then(|text| serde_json::from_str::<serde_json::Value>(text).ok())
        .is_some_and(|info| info.get("SystemName").and_then(|v| v.as_str()).is_some())
}

/// Run `prober` against every candidate, at most `max_concurrency` at a time.
///
/// Each candidate gets `timeout_per_candidate`. Confirmed candidates come back in
/// completion order.
pub async fn probe<P, I>(
    prober: &P,
    candidates: I,
    timeout_per_candidate: Duration,
    max_concurrency: usize,
) -> Vec<String>
where
    P: Prober + ?Sized,
    I: IntoIterator<Item = String>,
{
    let found: Vec<String> = futures::stream::iter(candidates)
        .map(|candidate| async move {
            match tokio::time::timeout(timeout_per_candidate, prober.probe(&candidate)).await {
                Ok(Ok(true)) => Some(candidate),
                Ok(Ok(false)) => {
                    debug!(%candidate, "Not a robot");
                    None
                }
                Ok(Err(e)) => {
                    debug!(%candidate, error = %e, "Candidate check failed");
                    None
                }
                Err(_) => {
                    debug!(%candidate, timeout = ?timeout_per_candidate, "Candidate check timed out");
                    None
                }
            }
        })
        .buffer_unordered(max_concurrency.max(1))
        .filter_map(|found| async move { found })
        .collect()
        .await;

    info!(found = found.len(), "Discovery finished");
    found
}

/// Look for a robot on the default WiFi port.
pub async fn probe_candidates<I>(candidates: I, timeout_per_candidate: Duration) -> Vec<String>
where
    I: IntoIterator<Item = String>,
{
    probe(&RestIdentityProber::default(), candidates, timeout_per_candidate, DEFAULT_MAX_CONCURRENCY).await
}
