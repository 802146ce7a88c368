//! Robot command-queue state

use tokio::time::Instant;

const IS_MOVING_MASK: u8 = 0x01;
const IS_PAUSED_MASK: u8 = 0x02;
const FW_UPDATE_MASK: u8 = 0x04;

/// Minimum robot-status payload: motion flags plus queued work count.
pub const ROBOT_STATUS_MIN_LEN: usize = 2;

/// Last robot-reported command-queue and motion state.
///
/// Decoded from the robot-status topic. The robot does not sequence these
/// reports, so the most recently received one wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueState {
    pub work_q_count: u8,
    pub is_moving: bool,
    pub is_paused: bool,
    pub is_fw_updating: bool,
    pub updated_at: Instant,
}

impl QueueState {
    /// Decode a robot-status payload. Returns `None` when it is too short.
    ///
    /// Only the leading motion flags and work count are read; the extended
    /// fields (heap, indicators, loop timing) are left to telemetry consumers.
    pub fn from_robot_status(payload: &[u8], received_at: Instant) -> Option<Self> {
        if payload.len() < ROBOT_STATUS_MIN_LEN {
            return None;
        }
        let flags = payload[0];
        Some(Self {
            work_q_count: payload[1],
            is_moving: flags & IS_MOVING_MASK != 0,
            is_paused: flags & IS_PAUSED_MASK != 0,
            is_fw_updating: flags & FW_UPDATE_MASK != 0,
            updated_at: received_at,
        })
    }

    /// Whether the robot has stopped and worked its queue down to `baseline`.
    pub fn is_drained(&self, baseline: u8) -> bool {
        !self.is_moving && self.work_q_count <= baseline
    }
}

/// Result of a queue-state query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueStatus {
    Known(QueueState),
    /// No robot status received yet, or the last one is older than the freshness window.
    Unknown,
}

impl QueueStatus {
    pub fn known(self) -> Option<QueueState> {
        match self {
            QueueStatus::Known(state) => Some(state),
            QueueStatus::Unknown => None,
        }
    }
}
