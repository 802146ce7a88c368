//! Link statistics and publish-rate monitoring

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;

use crate::types::TopicId;

const AVERAGE_WINDOW: usize = 10;

/// Sliding mean over the last few samples.
#[derive(Debug, Default)]
pub struct Averager {
    samples: VecDeque<Duration>,
}

impl Averager {
    pub fn add(&mut self, sample: Duration) {
        if self.samples.len() == AVERAGE_WINDOW {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn average(&self) -> Option<Duration> {
        if self.samples.is_empty() {
            return None;
        }
        Some(self.samples.iter().sum::<Duration>() / self.samples.len() as u32)
    }
}

/// Counters updated by the receive loop and the connection.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub frames: AtomicU64,
    pub replies_matched: AtomicU64,
    pub replies_unmatched: AtomicU64,
    pub unnumbered: AtomicU64,
    pub telemetry: AtomicU64,
    pub telemetry_dropped: AtomicU64,
    pub garbage_bytes: AtomicU64,
    pub discards: AtomicU64,
    pub reconnects: AtomicU64,
}

impl Counters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self, round_trip_avg: Option<Duration>) -> LinkStats {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        LinkStats {
            frames: load(&self.frames),
            replies_matched: load(&self.replies_matched),
            replies_unmatched: load(&self.replies_unmatched),
            unnumbered: load(&self.unnumbered),
            telemetry: load(&self.telemetry),
            telemetry_dropped: load(&self.telemetry_dropped),
            garbage_bytes: load(&self.garbage_bytes),
            discards: load(&self.discards),
            reconnects: load(&self.reconnects),
            round_trip_avg,
        }
    }
}

/// Point-in-time copy of the link counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LinkStats {
    /// Frames decoded successfully.
    pub frames: u64,
    /// Replies delivered to a pending request.
    pub replies_matched: u64,
    /// Numbered replies with no pending request (late or duplicate).
    pub replies_unmatched: u64,
    /// Frames without a message number.
    pub unnumbered: u64,
    /// Telemetry items routed to subscribers.
    pub telemetry: u64,
    /// Telemetry items dropped because a subscriber queue was full.
    pub telemetry_dropped: u64,
    /// Bytes skipped while hunting for a frame boundary.
    pub garbage_bytes: u64,
    /// Discard events (bad header, checksum, oversize or no sync).
    pub discards: u64,
    pub reconnects: u64,
    pub round_trip_avg: Option<Duration>,
}

#[derive(Debug)]
struct PublishRecord {
    last_seen: Instant,
    intervals: Averager,
}

/// Per-topic publish rate tracker.
#[derive(Debug, Default)]
pub struct PublishMonitor {
    records: Mutex<HashMap<TopicId, PublishRecord>>,
    last_any: Mutex<Option<Instant>>,
}

impl PublishMonitor {
    pub fn record(&self, topic: TopicId, at: Instant) {
        *self.last_any.lock() = Some(at);
        let mut records = self.records.lock();
        match records.get_mut(&topic) {
            Some(record) => {
                record.intervals.add(at.saturating_duration_since(record.last_seen));
                record.last_seen = at;
            }
            None => {
                records.insert(topic, PublishRecord { last_seen: at, intervals: Averager::default() });
            }
        }
    }

    /// When any telemetry last arrived.
    pub fn last_publish(&self) -> Option<Instant> {
        *self.last_any.lock()
    }

    /// Messages per second by topic, keyed `servosPS`, `imuPS`, ...
    pub fn rates(&self) -> BTreeMap<String, f64> {
        self.records
            .lock()
            .iter()
            .map(|(topic, record)| {
                let rate = match record.intervals.average() {
                    Some(avg) if !avg.is_zero() => (100.0 / avg.as_secs_f64()).round() / 100.0,
                    _ => 0.0,
                };
                (format!("{}PS", topic.name()), rate)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn averager_keeps_last_ten() {
        let mut avg = Averager::default();
        assert_eq!(avg.average(), None);
        for _ in 0..20 {
            avg.add(Duration::from_millis(500));
        }
        for _ in 0..10 {
            avg.add(Duration::from_millis(100));
        }
        assert_eq!(avg.average(), Some(Duration::from_millis(100)));
    }

    #[test]
    fn publish_rates_by_topic_name() {
        let monitor = PublishMonitor::default();
        let start = Instant::now();
        for i in 0..5 {
            monitor.record(TopicId::ROBOT_STATUS, start + Duration::from_millis(100 * i));
        }
        monitor.record(TopicId::POWER_STATUS, start);

        let rates = monitor.rates();
        assert_eq!(rates.get("robotPS"), Some(&10.0));
        assert_eq!(rates.get("powerPS"), Some(&0.0));
        assert_eq!(monitor.last_publish(), Some(start));
    }

    #[test]
    fn snapshot_copies_counters() {
        let counters = Counters::default();
        Counters::bump(&counters.frames);
        Counters::add(&counters.garbage_bytes, 7);
        let stats = counters.snapshot(Some(Duration::from_millis(12)));
        assert_eq!(stats.frames, 1);
        assert_eq!(stats.garbage_bytes, 7);
        assert_eq!(stats.round_trip_avg, Some(Duration::from_millis(12)));
    }
}
