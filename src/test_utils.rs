//! Test utilities shared by unit tests, integration tests and benchmarks
//!
//! Builders for robot payloads and wire captures, so tests describe what the
//! robot says rather than hand-assembling bytes.

#![cfg(any(test, feature = "benchmark"))]

use crate::codec::{Dialect, FrameCodec, RosSerialCodec};
use crate::sim::RobotStatus;
use crate::types::{Frame, FrameKind, TopicId};

/// Robot-status payload with the given motion flag and queued work count.
pub fn robot_status(is_moving: bool, work_q_count: u8) -> Vec<u8> {
    RobotStatus { is_moving, is_paused: false, work_q_count }.encode()
}

/// ROS-serial bundle carrying one message per `(topic, payload)`.
pub fn bundle(items: &[(TopicId, Vec<u8>)]) -> Vec<u8> {
    items
        .iter()
        .flat_map(|(topic, payload)| {
            RosSerialCodec
                .encode(&Frame::new(*topic, FrameKind::Publish, payload.clone()))
                .expect("bundle item fits a ROS-serial frame")
        })
        .collect()
}

/// Encode frames back to back as they would appear on the wire.
pub fn wire_capture(dialect: Dialect, frames: &[Frame]) -> Vec<u8> {
    let codec = dialect.codec();
    frames.iter().flat_map(|frame| codec.encode(frame).expect("frame encodes")).collect()
}

/// A typical telemetry mix: servo, accelerometer and status messages.
pub fn telemetry_mix(count: usize) -> Vec<Frame> {
    (0..count)
        .map(|i| match i % 3 {
            0 => Frame::new(TopicId::SMART_SERVOS, FrameKind::Publish, vec![i as u8; 54]),
            1 => Frame::new(TopicId::ACCEL, FrameKind::Publish, vec![i as u8; 13]),
            _ => Frame::new(TopicId::ROBOT_STATUS, FrameKind::Publish, robot_status(i % 2 == 0, (i % 5) as u8)),
        })
        .collect()
}

/// Install a test log subscriber once; later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().with_env_filter("martylink=debug").try_init();
}
