//! Command-queue tracking and the blocking-call contract
//!
//! The robot reports its motion flags and queued work count on the
//! robot-status topic. The receive loop feeds those reports in through
//! [`CommandQueueTracker::apply`]; everything else reads snapshots.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::types::{QueueState, QueueStatus};
use crate::{LinkError, Result};

#[derive(Debug, Clone, Copy)]
struct Snapshot {
    state: QueueState,
    /// Local arrival order of status reports.
    seq: u64,
}

/// Tracks robot queue state and the default blocking mode.
#[derive(Debug)]
pub struct CommandQueueTracker {
    tx: watch::Sender<Option<Snapshot>>,
    seq: AtomicU64,
    freshness: Duration,
    settle: Duration,
    blocking: AtomicBool,
}

impl CommandQueueTracker {
    /// `freshness`: how long a status report stays valid.
    /// `settle`: how long drain waiters give the robot to report a newly queued motion.
    pub fn new(freshness: Duration, settle: Duration) -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx, seq: AtomicU64::new(0), freshness, settle, blocking: AtomicBool::new(true) }
    }

    /// Record a status report. Last received wins.
    pub(crate) fn apply(&self, state: QueueState) {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        trace!(seq, work_q_count = state.work_q_count, is_moving = state.is_moving, "Queue state");
        self.tx.send_replace(Some(Snapshot { state, seq }));
    }

    /// Forget the last report, e.g. after the link dropped.
    pub(crate) fn invalidate(&self) {
        self.tx.send_replace(None);
    }

    /// Latest state, or `Unknown` when none arrived or it has gone stale.
    pub fn current(&self) -> QueueStatus {
        match *self.tx.borrow() {
            Some(snap) if snap.state.updated_at.elapsed() <= self.freshness => QueueStatus::Known(snap.state),
            _ => QueueStatus::Unknown,
        }
    }

    pub fn set_blocking(&self, blocking: bool) {
        self.blocking.store(blocking, Ordering::SeqCst);
    }

    /// Effective blocking mode for one call.
    pub fn is_blocking(&self, override_mode: Option<bool>) -> bool {
        override_mode.unwrap_or_else(|| self.blocking.load(Ordering::SeqCst))
    }

    /// Wait until the robot reports it has stopped and worked its queue down to `baseline`.
    ///
    /// Only reports that arrive after the call count, and only once the settle
    /// delay has passed. Returns `Ok(false)` if `timeout` elapses first and
    /// `StatusUnavailable` if status reports stop for longer than the freshness
    /// window.
    pub async fn wait_for_drain(&self, timeout: Duration, baseline: u8) -> Result<bool> {
        let start = Instant::now();
        let deadline = start + timeout;
        let settled_at = start + self.settle;
        let start_seq = self.seq.load(Ordering::SeqCst);
        let mut rx = self.tx.subscribe();

        loop {
            let now = Instant::now();
            let latest = *rx.borrow_and_update();
            let mut next_check = deadline;

            match latest {
                Some(snap) => {
                    let age = now.saturating_duration_since(snap.state.updated_at);
                    if age > self.freshness {
                        return Err(LinkError::status_unavailable(format!(
                            "no robot status for {age:?}"
                        )));
                    }
                    if snap.seq > start_seq && now >= settled_at && snap.state.is_drained(baseline) {
                        debug!(waited = ?now - start, "Robot queue drained");
                        return Ok(true);
                    }
                    next_check = next_check.min(snap.state.updated_at + self.freshness);
                }
                None => {
                    if now.saturating_duration_since(start) > self.freshness {
                        return Err(LinkError::status_unavailable("no robot status received"));
                    }
                    next_check = next_check.min(start + self.freshness);
                }
            }

            if now >= deadline {
                return Ok(false);
            }
            if now < settled_at {
                next_check = next_check.min(settled_at);
            }

            // Wake just past the boundary so the staleness comparison is strict
            let wake = next_check.max(now) + Duration::from_millis(1);
            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Err(LinkError::Closed);
                    }
                }
                _ = tokio::time::sleep_until(wake.min(deadline)) => {}
            }
        }
    }
}
