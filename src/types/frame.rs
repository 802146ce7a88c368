//! Wire frame and telemetry types

use std::fmt;
use std::sync::Arc;

use tokio::time::Instant;

/// Topic identifier carried by every frame.
///
/// Values below `0xFE00` are robot topics (ROS-serial message ids). The
/// `0xFE00..` range is reserved for link-level keys used by the REST dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicId(pub u16);

impl TopicId {
    /// Command strings tunnelled over the binary dialect.
    pub const REST_COMMAND: TopicId = TopicId(100);
    /// Replies to [`TopicId::REST_COMMAND`] on the binary dialect.
    pub const REST_RESPONSE: TopicId = TopicId(101);

    pub const SMART_SERVOS: TopicId = TopicId(120);
    pub const ACCEL: TopicId = TopicId(121);
    pub const POWER_STATUS: TopicId = TopicId(122);
    pub const ADDONS: TopicId = TopicId(123);
    pub const ROBOT_STATUS: TopicId = TopicId(124);

    /// Unsolicited report messages on the REST dialect.
    pub const REPORT: TopicId = TopicId(0xFE03);

    /// REST dialect frames wrapping a bundle of ROS-serial messages.
    pub const RIC_ROSSERIAL: TopicId = TopicId(0xFF00);
    /// REST dialect frames of the legacy M1SC protocol.
    pub const RIC_M1SC: TopicId = TopicId(0xFF01);
    /// REST dialect RICREST frames (URLs, JSON, command frames).
    pub const RIC_REST: TopicId = TopicId(0xFF02);

    /// Short name used in publish statistics (`servos`, `imu`, ...).
    pub fn name(self) -> &'static str {
        match self {
            TopicId::SMART_SERVOS => "servos",
            TopicId::ACCEL => "imu",
            TopicId::POWER_STATUS => "power",
            TopicId::ADDONS => "addons",
            TopicId::ROBOT_STATUS => "robot",
            TopicId::REPORT => "report",
            _ => "unknown",
        }
    }

    /// Map a REST dialect protocol code to its topic.
    pub fn from_ric_protocol(protocol: u8) -> Option<TopicId> {
        match protocol {
            0 => Some(TopicId::RIC_ROSSERIAL),
            1 => Some(TopicId::RIC_M1SC),
            2 => Some(TopicId::RIC_REST),
            _ => None,
        }
    }

    /// REST dialect protocol code for this topic, if it is one of the RIC topics.
    pub fn ric_protocol(self) -> Option<u8> {
        match self {
            TopicId::RIC_ROSSERIAL => Some(0),
            TopicId::RIC_M1SC => Some(1),
            TopicId::RIC_REST => Some(2),
            _ => None,
        }
    }
}

impl fmt::Display for TopicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name(), self.0)
    }
}

/// Direction and role of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    Command,
    Response,
    Publish,
    Report,
}

impl FrameKind {
    /// Two-bit message type code used by the REST dialect.
    pub fn code(self) -> u8 {
        match self {
            FrameKind::Command => 0,
            FrameKind::Response => 1,
            FrameKind::Publish => 2,
            FrameKind::Report => 3,
        }
    }

    pub fn from_code(code: u8) -> Self {
        match code & 0x03 {
            0 => FrameKind::Command,
            1 => FrameKind::Response,
            2 => FrameKind::Publish,
            _ => FrameKind::Report,
        }
    }
}

/// Immutable unit of wire traffic.
///
/// Produced by the codecs on decode and consumed by them on encode. Frames that
/// fail checksum validation are never constructed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub topic: TopicId,
    pub kind: FrameKind,
    /// REST dialect message number; `None` for unnumbered frames.
    pub correlation: Option<u8>,
    /// Payload bytes (zero-copy via Arc)
    pub payload: Arc<[u8]>,
}

impl Frame {
    pub fn new(topic: TopicId, kind: FrameKind, payload: impl Into<Arc<[u8]>>) -> Self {
        Self { topic, kind, correlation: None, payload: payload.into() }
    }

    /// Attach a message number. Zero means unnumbered and is stored as `None`.
    pub fn with_correlation(mut self, msg_num: u8) -> Self {
        self.correlation = (msg_num != 0).then_some(msg_num);
        self
    }
}

/// Telemetry item delivered to subscribers.
#[derive(Debug, Clone)]
pub struct Telemetry {
    pub topic: TopicId,
    pub payload: Arc<[u8]>,
    pub received_at: Instant,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_message_number_is_unnumbered() {
        let frame = Frame::new(TopicId::RIC_REST, FrameKind::Report, vec![1u8]).with_correlation(0);
        assert_eq!(frame.correlation, None);
        let frame = frame.with_correlation(7);
        assert_eq!(frame.correlation, Some(7));
    }

    #[test]
    fn ric_protocol_codes_map_both_ways() {
        for code in 0..3u8 {
            let topic = TopicId::from_ric_protocol(code).unwrap();
            assert_eq!(topic.ric_protocol(), Some(code));
        }
        assert_eq!(TopicId::from_ric_protocol(9), None);
        assert_eq!(TopicId::ROBOT_STATUS.ric_protocol(), None);
    }

    #[test]
    fn frame_kind_codes() {
        for kind in [FrameKind::Command, FrameKind::Response, FrameKind::Publish, FrameKind::Report] {
            assert_eq!(FrameKind::from_code(kind.code()), kind);
        }
    }

    #[test]
    fn topic_names_match_publish_stat_keys() {
        assert_eq!(TopicId::ACCEL.name(), "imu");
        assert_eq!(TopicId(9).name(), "unknown");
        assert_eq!(TopicId::ROBOT_STATUS.to_string(), "robot(124)");
    }
}
