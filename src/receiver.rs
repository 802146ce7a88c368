//! Background receive loop
//!
//! One loop runs per live link. It owns the read half, decodes frames out of a
//! growing buffer and routes each one:
//!
//! 1. to the [`Correlator`] if it answers a pending request or carries the
//!    `msgKey` of a pending add-on query
//! 2. dropped (and counted) if it is a reply nobody is waiting for
//! 3. otherwise to telemetry subscribers by topic, after unpacking bundles
//!
//! The loop never fails on bad input; garbage is skipped and counted. It ends
//! only when the link is lost or cancelled, and reports which through
//! [`ReceiverExit`].

use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::LinkError;
use crate::codec::{Decoded, FrameCodec, RicRestCodec, split_bundle};
use crate::correlator::Correlator;
use crate::queue::CommandQueueTracker;
use crate::stats::{Counters, PublishMonitor};
use crate::subscriptions::SubscriptionTable;
use crate::transport::{LinkReader, ReadOutcome};
use crate::types::{Frame, FrameKind, QueueState, Telemetry, TopicId};

const PURGE_INTERVAL: Duration = Duration::from_secs(1);

/// Why a receive loop stopped.
#[derive(Debug)]
pub enum ReceiverExit {
    /// Peer closed the stream or an I/O error occurred.
    LinkLost(LinkError),
    /// The link was disconnected locally.
    Cancelled,
}

/// Destinations for decoded frames.
pub(crate) struct Router {
    pub correlator: Correlator,
    pub subscriptions: SubscriptionTable,
    pub queue: Arc<CommandQueueTracker>,
    pub counters: Arc<Counters>,
    pub publish: Arc<PublishMonitor>,
}

impl Router {
    pub fn route(&self, frame: Frame) {
        Counters::bump(&self.counters.frames);
        if frame.correlation.is_none() {
            Counters::bump(&self.counters.unnumbered);
        }

        if self.correlator.resolve(&frame) {
            Counters::bump(&self.counters.replies_matched);
            return;
        }

        if frame.kind == FrameKind::Response {
            Counters::bump(&self.counters.replies_unmatched);
            debug!(topic = %frame.topic, msg_num = ?frame.correlation, "Dropping reply with no pending request");
            return;
        }

        let now = Instant::now();
        match frame.topic {
            TopicId::RIC_ROSSERIAL => {
                for inner in split_bundle(&frame.payload) {
                    self.deliver(inner.topic, inner.payload, now);
                }
            }
            TopicId::RIC_REST if frame.kind == FrameKind::Report => {
                if let Some(msg_key) = report_key(&frame.payload) {
                    if self.correlator.resolve_report(msg_key, &frame) {
                        Counters::bump(&self.counters.replies_matched);
                        return;
                    }
                    debug!(msg_key, "Report with no pending query");
                }
                self.deliver(TopicId::REPORT, frame.payload, now);
            }
            topic => self.deliver(topic, frame.payload, now),
        }
    }

    fn deliver(&self, topic: TopicId, payload: Arc<[u8]>, now: Instant) {
        if topic == TopicId::ROBOT_STATUS {
            match QueueState::from_robot_status(&payload, now) {
                Some(state) => self.queue.apply(state),
                None => debug!(len = payload.len(), "Robot status too short"),
            }
        }
        self.publish.record(topic, now);
        Counters::bump(&self.counters.telemetry);

        let outcome = self.subscriptions.dispatch(&Telemetry { topic, payload, received_at: now });
        if outcome.dropped > 0 {
            Counters::add(&self.counters.telemetry_dropped, outcome.dropped as u64);
        }
    }
}

/// The non-zero `msgKey` of a JSON report, sent either as a number or a string.
fn report_key(payload: &[u8]) -> Option<u32> {
    let report: serde_json::Value = serde_json::from_str(RicRestCodec::rest_text(payload)?).ok()?;
    let key = match report.get("msgKey")? {
        serde_json::Value::Number(n) => u32::try_from(n.as_u64()?).ok()?,
        serde_json::Value::String(s) => s.trim().parse().ok()?,
        _ => return None,
    };
    (key != 0).then_some(key)
}

/// Decode and route every complete frame in `buf`, leaving any partial tail.
pub(crate) fn drain(buf: &mut BytesMut, codec: &dyn FrameCodec, router: &Router) {
    loop {
        match codec.decode(buf) {
            Decoded::Frame { frame, consumed } => {
                buf.advance(consumed);
                trace!(topic = %frame.topic, kind = ?frame.kind, len = frame.payload.len(), "Frame");
                router.route(frame);
            }
            Decoded::Discard { consumed, reason } => {
                buf.advance(consumed);
                Counters::bump(&router.counters.discards);
                Counters::add(&router.counters.garbage_bytes, consumed as u64);
                trace!(consumed, ?reason, "Discarded bytes");
            }
            Decoded::Incomplete => break,
        }
    }
}

/// Run the receive loop until the link ends.
pub(crate) async fn run(
    mut reader: LinkReader,
    codec: &'static dyn FrameCodec,
    router: Arc<Router>,
    idle_after: Duration,
) -> ReceiverExit {
    info!(dialect = ?codec.dialect(), "Receive loop started");
    let mut buf = BytesMut::with_capacity(4096);
    let mut bytes_read = 0u64;
    let mut last_purge = Instant::now();

    let exit = loop {
        match reader.read(&mut buf, idle_after).await {
            ReadOutcome::Data(n) => {
                bytes_read += n as u64;
                drain(&mut buf, codec, &router);
            }
            ReadOutcome::Idle => {}
            ReadOutcome::Lost(err) => {
                warn!(error = %err, "Link lost");
                break ReceiverExit::LinkLost(err);
            }
            ReadOutcome::Cancelled => break ReceiverExit::Cancelled,
        }

        if last_purge.elapsed() >= PURGE_INTERVAL {
            let purged = router.correlator.purge_expired(Instant::now());
            if purged > 0 {
                debug!(purged, "Expired fire-and-forget entries");
            }
            last_purge = Instant::now();
        }
    };

    info!(bytes_read, buffered = buf.len(), ?exit, "Receive loop ended");
    exit
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{Dialect, RicRestCodec, RosSerialCodec};
    use crate::correlator::ReplyMatcher;
    use crate::test_utils::{bundle, robot_status};
    use crate::transport::Link;
    use std::sync::atomic::Ordering;
    use tokio::io::AsyncWriteExt;
    use tokio_util::sync::CancellationToken;

    fn router() -> Router {
        Router {
            correlator: Correlator::new(),
            subscriptions: SubscriptionTable::new(16),
            queue: Arc::new(CommandQueueTracker::new(Duration::from_secs(3), Duration::ZERO)),
            counters: Arc::new(Counters::default()),
            publish: Arc::new(PublishMonitor::default()),
        }
    }

    fn encode(codec: &dyn FrameCodec, frame: Frame) -> Vec<u8> {
        codec.encode(&frame).unwrap()
    }

    #[test]
    fn garbage_between_frames_is_skipped_and_counted() {
        let router = router();
        let (_, mut rx) = router.subscriptions.subscribe_channel(TopicId::ACCEL);

        let codec = Dialect::RosSerial.codec();
        let good = encode(codec, Frame::new(TopicId::ACCEL, FrameKind::Publish, vec![1u8; 14]));
        let mut corrupt = good.clone();
        let last = corrupt.len() - 1;
        corrupt[last] ^= 0xFF;
        let garbage = [0x01u8, 0x02, 0x03, 0x04, 0x05];

        let mut wire = Vec::new();
        wire.extend_from_slice(&good);
        wire.extend_from_slice(&garbage);
        wire.extend_from_slice(&corrupt);
        wire.extend_from_slice(&good);

        let mut buf = BytesMut::from(&wire[..]);
        drain(&mut buf, codec, &router);

        assert!(buf.is_empty());
        assert_eq!(rx.try_recv().unwrap().payload.len(), 14);
        assert_eq!(rx.try_recv().unwrap().payload.len(), 14);
        assert!(rx.try_recv().is_err());
        let garbage_bytes = router.counters.garbage_bytes.load(Ordering::Relaxed);
        assert_eq!(garbage_bytes, (garbage.len() + corrupt.len()) as u64);
    }

    #[test]
    fn split_frames_decode_once_complete() {
        let router = router();
        let (_, mut rx) = router.subscriptions.subscribe_channel(TopicId::POWER_STATUS);
        let codec = Dialect::RosSerial.codec();
        let bytes = encode(codec, Frame::new(TopicId::POWER_STATUS, FrameKind::Publish, vec![7u8; 13]));

        let mut buf = BytesMut::new();
        for chunk in bytes.chunks(3) {
            buf.extend_from_slice(chunk);
            drain(&mut buf, codec, &router);
        }
        assert_eq!(rx.try_recv().unwrap().payload[0], 7);
        assert_eq!(router.counters.discards.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn bundles_fan_out_and_feed_queue_state() {
        let router = router();
        let (_, mut servos) = router.subscriptions.subscribe_channel(TopicId::SMART_SERVOS);

        let publish = Frame::new(
            TopicId::RIC_ROSSERIAL,
            FrameKind::Publish,
            bundle(&[(TopicId::SMART_SERVOS, vec![0u8; 6]), (TopicId::ROBOT_STATUS, robot_status(true, 3))]),
        );
        router.route(publish);

        assert!(servos.try_recv().is_ok());
        let state = router.queue.current().known().unwrap();
        assert!(state.is_moving);
        assert_eq!(state.work_q_count, 3);
        assert_eq!(router.counters.telemetry.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn replies_go_to_waiters_and_late_replies_are_dropped() {
        let router = router();
        let (_, mut reports) = router.subscriptions.subscribe_channel(TopicId::REPORT);
        let (num, pending) = router.correlator.register_numbered(Duration::from_secs(5)).unwrap();

        let reply = Frame::new(TopicId::RIC_REST, FrameKind::Response, RicRestCodec::rest_payload(1, "{}"))
            .with_correlation(num);
        router.route(reply.clone());
        assert!(pending.wait().await.is_ok());

        router.route(reply);
        assert_eq!(router.counters.replies_matched.load(Ordering::Relaxed), 1);
        assert_eq!(router.counters.replies_unmatched.load(Ordering::Relaxed), 1);

        router.route(Frame::new(TopicId::RIC_REST, FrameKind::Report, RicRestCodec::rest_payload(1, "{}")));
        assert!(reports.try_recv().is_ok());
    }

    #[tokio::test]
    async fn keyed_reports_reach_their_query() {
        let router = router();
        let (_, mut reports) = router.subscriptions.subscribe_channel(TopicId::REPORT);
        let (msg_key, pending) = router.correlator.register_report(Duration::from_secs(5)).unwrap();
        let report = |body: &str| Frame::new(TopicId::RIC_REST, FrameKind::Report, RicRestCodec::rest_payload(1, body));

        // Keys arrive as strings from the robot
        router.route(report(&format!(r#"{{"msgType":"raw","msgKey":"{msg_key}","hexRd":"a0a1"}}"#)));
        let answered = pending.wait().await.unwrap();
        assert!(RicRestCodec::rest_text(&answered.payload).unwrap().contains("a0a1"));
        assert!(reports.try_recv().is_err());

        // No waiter for this key: still a report for subscribers
        router.route(report(r#"{"msgKey":42}"#));
        assert!(reports.try_recv().is_ok());
        assert_eq!(router.counters.replies_matched.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn report_keys_parse_from_numbers_and_strings() {
        let payload = |body: &str| RicRestCodec::rest_payload(1, body);
        assert_eq!(report_key(&payload(r#"{"msgKey":17}"#)), Some(17));
        assert_eq!(report_key(&payload(r#"{"msgKey":"99999"}"#)), Some(99_999));
        assert_eq!(report_key(&payload(r#"{"msgKey":"0"}"#)), None);
        assert_eq!(report_key(&payload(r#"{"msgType":"raw"}"#)), None);
        assert_eq!(report_key(&payload("not json")), None);
    }

    #[tokio::test]
    async fn fifo_reply_is_not_also_telemetry() {
        let router = router();
        let (_, mut rx) = router.subscriptions.subscribe_channel(TopicId::REST_RESPONSE);
        let pending = router.correlator.register_fifo(ReplyMatcher::Topic(TopicId::REST_RESPONSE), Duration::from_secs(5));

        router.route(Frame::new(TopicId::REST_RESPONSE, RosSerialCodec::kind_for(TopicId::REST_RESPONSE), b"ok".to_vec()));
        assert!(pending.wait().await.is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn loop_reports_loss_and_cancellation() {
        let codec = Dialect::RosSerial.codec();

        let (near, mut far) = tokio::io::duplex(1024);
        let (reader, _writer, _handle) = Link::from_stream(near).into_parts(CancellationToken::new());
        let shared = Arc::new(router());
        let (_, mut rx) = shared.subscriptions.subscribe_channel(TopicId::ROBOT_STATUS);
        let task = tokio::spawn(run(reader, codec, Arc::clone(&shared), Duration::from_millis(50)));

        far.write_all(&encode(codec, Frame::new(TopicId::ROBOT_STATUS, FrameKind::Publish, robot_status(false, 0))))
            .await
            .unwrap();
        assert!(rx.recv().await.is_some());
        drop(far);
        assert!(matches!(task.await.unwrap(), ReceiverExit::LinkLost(_)));

        let (near, _far) = tokio::io::duplex(1024);
        let (reader, _writer, handle) = Link::from_stream(near).into_parts(CancellationToken::new());
        let task = tokio::spawn(run(reader, codec, shared, Duration::from_millis(50)));
        handle.disconnect();
        assert!(matches!(task.await.unwrap(), ReceiverExit::Cancelled));
    }
}
