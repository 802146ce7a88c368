//! Request/reply correlation
//!
//! Every synchronous request registers a [`PendingReply`] before its frame is
//! written. The receive loop offers each decoded frame to [`Correlator::resolve`]:
//!
//! - frames carrying a message number match only the pending entry with that number
//! - unnumbered frames match the oldest pending entry whose [`ReplyMatcher`] accepts them
//!
//! Report frames answering add-on queries carry a `msgKey` instead of a
//! message number. They are matched through [`Correlator::resolve_report`]
//! against keys from [`Correlator::register_report`].
//!
//! Each entry completes exactly once: by reply, by timeout, by link loss or
//! close, or by its waiter going away. A reply that shows up after its entry
//! is gone is reported as unmatched and never resurrects the request.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::stats::Averager;
use crate::types::{Frame, FrameKind, TopicId};
use crate::{LinkError, Result};

/// Predicate deciding whether an unnumbered frame answers a pending request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyMatcher {
    /// Any frame on this topic.
    Topic(TopicId),
    /// A frame on this topic whose payload starts with the prefix.
    TopicPrefix(TopicId, Vec<u8>),
    /// The next unnumbered reply of any topic. Published telemetry never matches.
    Any,
}

impl ReplyMatcher {
    pub fn accepts(&self, frame: &Frame) -> bool {
        match self {
            ReplyMatcher::Topic(topic) => frame.topic == *topic,
            ReplyMatcher::TopicPrefix(topic, prefix) => {
                frame.topic == *topic && frame.payload.starts_with(prefix)
            }
            ReplyMatcher::Any => frame.kind != FrameKind::Publish,
        }
    }
}

/// Why outstanding requests are being failed in bulk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    LinkLost,
    Closed,
}

impl CancelReason {
    fn to_error(self) -> LinkError {
        match self {
            CancelReason::LinkLost => LinkError::link_lost("link dropped while waiting for a reply"),
            CancelReason::Closed => LinkError::Closed,
        }
    }
}

type ReplySlot = oneshot::Sender<Result<Frame>>;

/// Report keys wrap after this value.
pub const MAX_REPORT_KEY: u32 = 99_999;

struct Entry {
    key: u64,
    /// `None` for fire-and-forget sends whose reply is absorbed.
    slot: Option<ReplySlot>,
    deadline: Instant,
    sent_at: Instant,
}

struct FifoEntry {
    entry: Entry,
    matcher: ReplyMatcher,
}

#[derive(Default)]
struct Inner {
    next_key: u64,
    /// Last message number handed out; numbers run 1..=255.
    last_msg_num: u8,
    numbered: HashMap<u8, Entry>,
    fifo: VecDeque<FifoEntry>,
    /// Last report key handed out; keys run 1..=MAX_REPORT_KEY.
    last_report_key: u32,
    reports: HashMap<u32, Entry>,
}

impl Inner {
    fn allocate_key(&mut self) -> u64 {
        self.next_key += 1;
        self.next_key
    }

    fn allocate_msg_num(&mut self) -> Option<u8> {
        for _ in 0..255 {
            self.last_msg_num = if self.last_msg_num == 255 { 1 } else { self.last_msg_num + 1 };
            if !self.numbered.contains_key(&self.last_msg_num) {
                return Some(self.last_msg_num);
            }
        }
        None
    }

    fn allocate_report_key(&mut self) -> Option<u32> {
        for _ in 0..MAX_REPORT_KEY {
            self.last_report_key = if self.last_report_key >= MAX_REPORT_KEY { 1 } else { self.last_report_key + 1 };
            if !self.reports.contains_key(&self.last_report_key) {
                return Some(self.last_report_key);
            }
        }
        None
    }

    fn len(&self) -> usize {
        self.numbered.len() + self.fifo.len() + self.reports.len()
    }

    fn remove(&mut self, key: u64) -> bool {
        if let Some(num) = self.numbered.iter().find_map(|(num, e)| (e.key == key).then_some(*num)) {
            self.numbered.remove(&num);
            return true;
        }
        if let Some(pos) = self.fifo.iter().position(|f| f.entry.key == key) {
            self.fifo.remove(pos);
            return true;
        }
        if let Some(msg_key) = self.reports.iter().find_map(|(k, e)| (e.key == key).then_some(*k)) {
            self.reports.remove(&msg_key);
            return true;
        }
        false
    }
}

/// Table of requests awaiting replies. Cheap to clone.
#[derive(Clone, Default)]
pub struct Correlator {
    inner: Arc<Mutex<Inner>>,
    round_trip: Arc<Mutex<Averager>>,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a message number and register a numbered request.
    ///
    /// Numbers still in flight are skipped. Fails when all 255 are pending.
    pub fn register_numbered(&self, timeout: Duration) -> Result<(u8, PendingReply)> {
        let (tx, rx) = oneshot::channel();
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let msg_num = inner.allocate_msg_num().ok_or_else(|| {
            LinkError::protocol("request numbering", "all 255 message numbers are in flight")
        })?;
        let key = inner.allocate_key();
        inner
            .numbered
            .insert(msg_num, Entry { key, slot: Some(tx), deadline: now + timeout, sent_at: now });
        drop(inner);

        trace!(msg_num, key, "Registered numbered request");
        Ok((msg_num, self.pending(key, rx, now + timeout, timeout)))
    }

    /// Allocate a message number for a send whose reply nobody waits for.
    ///
    /// The reply is absorbed when it arrives; the entry lapses at `timeout`.
    pub fn register_detached(&self, timeout: Duration) -> Result<u8> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let msg_num = inner.allocate_msg_num().ok_or_else(|| {
            LinkError::protocol("request numbering", "all 255 message numbers are in flight")
        })?;
        let key = inner.allocate_key();
        inner.numbered.insert(msg_num, Entry { key, slot: None, deadline: now + timeout, sent_at: now });
        Ok(msg_num)
    }

    /// Register a request answered by the first unnumbered frame `matcher` accepts.
    pub fn register_fifo(&self, matcher: ReplyMatcher, timeout: Duration) -> PendingReply {
        let (tx, rx) = oneshot::channel();
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let key = inner.allocate_key();
        inner.fifo.push_back(FifoEntry {
            entry: Entry { key, slot: Some(tx), deadline: now + timeout, sent_at: now },
            matcher,
        });
        drop(inner);

        trace!(key, "Registered FIFO request");
        self.pending(key, rx, now + timeout, timeout)
    }

    /// Allocate a report key and wait for the report frame carrying it.
    pub fn register_report(&self, timeout: Duration) -> Result<(u32, PendingReply)> {
        let (tx, rx) = oneshot::channel();
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let msg_key = inner
            .allocate_report_key()
            .ok_or_else(|| LinkError::protocol("report keys", "every report key is in flight"))?;
        let key = inner.allocate_key();
        inner.reports.insert(msg_key, Entry { key, slot: Some(tx), deadline: now + timeout, sent_at: now });
        drop(inner);

        trace!(msg_key, key, "Registered report wait");
        Ok((msg_key, self.pending(key, rx, now + timeout, timeout)))
    }

    /// Offer a report frame carrying `msg_key`. Returns `true` when a waiter took it.
    pub fn resolve_report(&self, msg_key: u32, frame: &Frame) -> bool {
        let Some(entry) = self.inner.lock().reports.remove(&msg_key) else {
            return false;
        };
        match entry.slot {
            Some(slot) => {
                if slot.send(Ok(frame.clone())).is_err() {
                    debug!(msg_key, "Report arrived after its waiter left");
                }
            }
            None => trace!(msg_key, "Absorbed report"),
        }
        true
    }

    fn pending(
        &self,
        key: u64,
        rx: oneshot::Receiver<Result<Frame>>,
        deadline: Instant,
        timeout: Duration,
    ) -> PendingReply {
        PendingReply { key, rx, deadline, timeout, correlator: self.clone() }
    }

    /// Offer a decoded frame. Returns `true` when it was consumed as a reply.
    pub fn resolve(&self, frame: &Frame) -> bool {
        let entry = {
            let mut inner = self.inner.lock();
            match frame.correlation {
                Some(num) => inner.numbered.remove(&num),
                None => {
                    let pos = inner.fifo.iter().position(|f| f.matcher.accepts(frame));
                    pos.and_then(|pos| inner.fifo.remove(pos)).map(|f| f.entry)
                }
            }
        };
        let Some(entry) = entry else {
            return false;
        };

        self.round_trip.lock().add(entry.sent_at.elapsed());
        match entry.slot {
            Some(slot) => {
                if slot.send(Ok(frame.clone())).is_err() {
                    debug!(key = entry.key, "Reply arrived after its waiter left");
                }
            }
            None => trace!(key = entry.key, "Absorbed reply to fire-and-forget send"),
        }
        true
    }

    /// Fail every outstanding request.
    pub fn cancel_all(&self, reason: CancelReason) -> usize {
        let (numbered, fifo, reports) = {
            let mut inner = self.inner.lock();
            (
                std::mem::take(&mut inner.numbered),
                std::mem::take(&mut inner.fifo),
                std::mem::take(&mut inner.reports),
            )
        };
        let entries: Vec<Entry> = numbered
            .into_values()
            .chain(fifo.into_iter().map(|f| f.entry))
            .chain(reports.into_values())
            .collect();
        let count = entries.len();
        for slot in entries.into_iter().filter_map(|e| e.slot) {
            let _ = slot.send(Err(reason.to_error()));
        }
        if count > 0 {
            debug!(count, ?reason, "Cancelled pending requests");
        }
        count
    }

    /// Drop entries whose deadline has passed without a waiter to time them out.
    pub fn purge_expired(&self, now: Instant) -> usize {
        let mut inner = self.inner.lock();
        let before = inner.len();
        inner.numbered.retain(|_, e| e.deadline > now || e.slot.is_some());
        inner.fifo.retain(|f| f.entry.deadline > now || f.entry.slot.is_some());
        inner.reports.retain(|_, e| e.deadline > now || e.slot.is_some());
        before - inner.len()
    }

    pub fn pending_count(&self) -> usize {
        self.inner.lock().len()
    }

    /// Mean round-trip time over the last replies, if any arrived.
    pub fn round_trip_avg(&self) -> Option<Duration> {
        self.round_trip.lock().average()
    }

    fn remove(&self, key: u64) -> bool {
        self.inner.lock().remove(key)
    }
}

/// Waiter side of a registered request.
///
/// Dropping it without waiting removes the request from the table.
pub struct PendingReply {
    key: u64,
    rx: oneshot::Receiver<Result<Frame>>,
    deadline: Instant,
    timeout: Duration,
    correlator: Correlator,
}

impl PendingReply {
    /// Wait for the reply until the deadline set at registration.
    pub async fn wait(mut self) -> Result<Frame> {
        match tokio::time::timeout_at(self.deadline, &mut self.rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(LinkError::Closed),
            Err(_) => {
                if self.correlator.remove(self.key) {
                    debug!(key = self.key, timeout = ?self.timeout, "Request timed out");
                    return Err(LinkError::Timeout { duration: self.timeout });
                }
                // Lost the race: the entry was resolved or cancelled just before removal
                match self.rx.try_recv() {
                    Ok(result) => result,
                    Err(_) => Err(LinkError::Timeout { duration: self.timeout }),
                }
            }
        }
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        self.correlator.remove(self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply(msg_num: u8, body: &[u8]) -> Frame {
        Frame::new(TopicId::RIC_REST, FrameKind::Response, body.to_vec()).with_correlation(msg_num)
    }

    fn unnumbered(topic: TopicId, body: &[u8]) -> Frame {
        Frame::new(topic, FrameKind::Publish, body.to_vec())
    }

    #[tokio::test]
    async fn out_of_order_replies_reach_their_own_waiters() {
        let correlator = Correlator::new();
        let (a, wait_a) = correlator.register_numbered(Duration::from_secs(5)).unwrap();
        let (b, wait_b) = correlator.register_numbered(Duration::from_secs(5)).unwrap();
        assert_ne!(a, b);

        assert!(correlator.resolve(&reply(b, b"second")));
        assert!(correlator.resolve(&reply(a, b"first")));
        // Duplicate reply for an already-answered number
        assert!(!correlator.resolve(&reply(a, b"again")));

        assert_eq!(&*wait_a.wait().await.unwrap().payload, b"first");
        assert_eq!(&*wait_b.wait().await.unwrap().payload, b"second");
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_removes_entry_and_late_reply_is_unmatched() {
        let correlator = Correlator::new();
        let (num, pending) = correlator.register_numbered(Duration::from_millis(1500)).unwrap();

        let err = pending.wait().await.unwrap_err();
        assert!(matches!(err, LinkError::Timeout { duration } if duration == Duration::from_millis(1500)));
        assert_eq!(correlator.pending_count(), 0);
        assert!(!correlator.resolve(&reply(num, b"late")));
    }

    #[tokio::test]
    async fn fifo_matches_oldest_accepting_entry() {
        let correlator = Correlator::new();
        let first = correlator.register_fifo(ReplyMatcher::Topic(TopicId::REST_RESPONSE), Duration::from_secs(5));
        let second = correlator.register_fifo(ReplyMatcher::Topic(TopicId::REST_RESPONSE), Duration::from_secs(5));

        assert!(!correlator.resolve(&unnumbered(TopicId::ROBOT_STATUS, &[0, 0])));
        assert!(correlator.resolve(&unnumbered(TopicId::REST_RESPONSE, b"one")));
        assert!(correlator.resolve(&unnumbered(TopicId::REST_RESPONSE, b"two")));

        assert_eq!(&*first.wait().await.unwrap().payload, b"one");
        assert_eq!(&*second.wait().await.unwrap().payload, b"two");
    }

    #[test]
    fn prefix_matcher_checks_topic_and_payload() {
        let matcher = ReplyMatcher::TopicPrefix(TopicId(42), vec![0xAA]);
        assert!(matcher.accepts(&unnumbered(TopicId(42), &[0xAA, 1])));
        assert!(!matcher.accepts(&unnumbered(TopicId(42), &[0xAB])));
        assert!(!matcher.accepts(&unnumbered(TopicId(43), &[0xAA])));
        let response = Frame::new(TopicId(1), FrameKind::Response, vec![]);
        assert!(ReplyMatcher::Any.accepts(&response));
        assert!(!ReplyMatcher::Any.accepts(&unnumbered(TopicId(1), &[])));
    }

    #[tokio::test]
    async fn cancel_all_fails_waiters_with_reason() {
        let correlator = Correlator::new();
        let (_, numbered) = correlator.register_numbered(Duration::from_secs(5)).unwrap();
        let fifo = correlator.register_fifo(ReplyMatcher::Any, Duration::from_secs(5));

        assert_eq!(correlator.cancel_all(CancelReason::LinkLost), 2);
        assert!(matches!(numbered.wait().await, Err(LinkError::LinkLost { .. })));
        assert!(matches!(fifo.wait().await, Err(LinkError::LinkLost { .. })));

        let (_, closed) = correlator.register_numbered(Duration::from_secs(5)).unwrap();
        correlator.cancel_all(CancelReason::Closed);
        assert!(matches!(closed.wait().await, Err(LinkError::Closed)));
    }

    #[test]
    fn dropping_waiter_unregisters() {
        let correlator = Correlator::new();
        let pending = correlator.register_fifo(ReplyMatcher::Any, Duration::from_secs(5));
        assert_eq!(correlator.pending_count(), 1);
        drop(pending);
        assert_eq!(correlator.pending_count(), 0);
    }

    #[test]
    fn message_numbers_wrap_and_skip_zero_and_in_flight() {
        let correlator = Correlator::new();
        let (first, _held) = correlator.register_numbered(Duration::from_secs(60)).unwrap();
        assert_eq!(first, 1);
        let mut seen = Vec::new();
        for _ in 0..254 {
            let (num, pending) = correlator.register_numbered(Duration::from_secs(60)).unwrap();
            seen.push(num);
            drop(pending);
        }
        assert_eq!(seen.first(), Some(&2));
        assert_eq!(seen.last(), Some(&255));
        // 1 is still held, so the wrap skips it
        let (num, _p) = correlator.register_numbered(Duration::from_secs(60)).unwrap();
        assert_eq!(num, 2);
    }

    #[test]
    fn exhausted_numbers_are_an_error() {
        let correlator = Correlator::new();
        let held: Vec<_> =
            (0..255).map(|_| correlator.register_numbered(Duration::from_secs(60)).unwrap()).collect();
        assert_eq!(held.len(), 255);
        assert!(correlator.register_numbered(Duration::from_secs(60)).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn detached_entries_absorb_replies_then_lapse() {
        let correlator = Correlator::new();
        let absorbed = correlator.register_detached(Duration::from_millis(100)).unwrap();
        let lapsed = correlator.register_detached(Duration::from_millis(100)).unwrap();

        assert!(correlator.resolve(&reply(absorbed, b"{}")));
        tokio::time::advance(Duration::from_millis(150)).await;
        assert_eq!(correlator.purge_expired(Instant::now()), 1);
        assert!(!correlator.resolve(&reply(lapsed, b"{}")));
    }

    #[tokio::test(start_paused = true)]
    async fn reports_match_by_key_only() {
        let correlator = Correlator::new();
        let (first, wait_first) = correlator.register_report(Duration::from_secs(5)).unwrap();
        let (second, wait_second) = correlator.register_report(Duration::from_secs(5)).unwrap();
        assert_eq!((first, second), (1, 2));

        let report = |body: &[u8]| Frame::new(TopicId::RIC_REST, FrameKind::Report, body.to_vec());
        assert!(!correlator.resolve_report(77, &report(b"stray")));
        // Report frames never satisfy numbered or FIFO entries
        assert!(!correlator.resolve(&report(b"unkeyed")));
        assert!(correlator.resolve_report(second, &report(b"two")));
        assert!(!correlator.resolve_report(second, &report(b"again")));

        assert_eq!(&*wait_second.wait().await.unwrap().payload, b"two");
        let err = wait_first.wait().await.unwrap_err();
        assert!(matches!(err, LinkError::Timeout { .. }));
        assert_eq!(correlator.pending_count(), 0);
    }

    #[test]
    fn report_keys_wrap_and_skip_in_flight() {
        let correlator = Correlator::new();
        let (held, _held) = correlator.register_report(Duration::from_secs(60)).unwrap();
        assert_eq!(held, 1);
        correlator.inner.lock().last_report_key = MAX_REPORT_KEY - 1;
        let (last, _p) = correlator.register_report(Duration::from_secs(60)).unwrap();
        assert_eq!(last, MAX_REPORT_KEY);
        let (wrapped, _q) = correlator.register_report(Duration::from_secs(60)).unwrap();
        assert_eq!(wrapped, 2);
    }

    #[tokio::test]
    async fn cancel_all_includes_report_waits() {
        let correlator = Correlator::new();
        let (_, report) = correlator.register_report(Duration::from_secs(5)).unwrap();
        assert_eq!(correlator.cancel_all(CancelReason::Closed), 1);
        assert!(matches!(report.wait().await, Err(LinkError::Closed)));
    }

    #[tokio::test]
    async fn round_trip_average_tracks_replies() {
        let correlator = Correlator::new();
        assert_eq!(correlator.round_trip_avg(), None);
        let (num, pending) = correlator.register_numbered(Duration::from_secs(5)).unwrap();
        correlator.resolve(&reply(num, b"{}"));
        pending.wait().await.unwrap();
        assert!(correlator.round_trip_avg().is_some());
    }
}
