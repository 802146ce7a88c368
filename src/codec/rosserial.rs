//! ROS-serial style binary framing
//!
//! ```text
//! 0xFF 0xFE len_lo len_hi len_chk topic_lo topic_hi payload.. payload_chk
//! ```
//!
//! `len_chk = 255 - ((len_lo + len_hi) % 256)` and
//! `payload_chk = 255 - ((topic_lo + topic_hi + sum(payload)) % 256)`.

use super::{Decoded, DiscardReason, FrameCodec, scan_for_sync};
use crate::codec::Dialect;
use crate::types::{Frame, FrameKind, TopicId};
use crate::{LinkError, Result};

const SYNC: [u8; 2] = [0xFF, 0xFE];
const HEADER_LEN: usize = 7;
const MIN_FRAME_LEN: usize = HEADER_LEN + 1;

/// Largest payload the robot will send or accept in one message.
pub const MAX_PAYLOAD_LEN: usize = 1000;

/// Codec for the checksummed binary dialect.
#[derive(Debug, Clone, Copy, Default)]
pub struct RosSerialCodec;

impl RosSerialCodec {
    /// Frame kind implied by a topic; the binary wire has no kind field.
    pub fn kind_for(topic: TopicId) -> FrameKind {
        match topic {
            TopicId::REST_COMMAND => FrameKind::Command,
            TopicId::REST_RESPONSE => FrameKind::Response,
            _ => FrameKind::Publish,
        }
    }
}

fn length_checksum(lo: u8, hi: u8) -> u8 {
    255 - ((lo as u16 + hi as u16) % 256) as u8
}

fn payload_checksum(topic: u16, payload: &[u8]) -> u8 {
    let [lo, hi] = topic.to_le_bytes();
    let sum = payload.iter().fold(lo as u32 + hi as u32, |acc, b| acc + *b as u32);
    255 - (sum % 256) as u8
}

impl FrameCodec for RosSerialCodec {
    fn dialect(&self) -> Dialect {
        Dialect::RosSerial
    }

    fn encode(&self, frame: &Frame) -> Result<Vec<u8>> {
        if frame.payload.len() > MAX_PAYLOAD_LEN {
            return Err(LinkError::protocol(
                "binary encode",
                format!("payload of {} bytes exceeds {MAX_PAYLOAD_LEN}", frame.payload.len()),
            ));
        }
        if frame.correlation.is_some() {
            return Err(LinkError::protocol(
                "binary encode",
                "binary dialect frames cannot carry message numbers",
            ));
        }

        let [len_lo, len_hi] = (frame.payload.len() as u16).to_le_bytes();
        let [topic_lo, topic_hi] = frame.topic.0.to_le_bytes();

        let mut out = Vec::with_capacity(MIN_FRAME_LEN + frame.payload.len());
        out.extend_from_slice(&SYNC);
        out.extend_from_slice(&[len_lo, len_hi, length_checksum(len_lo, len_hi), topic_lo, topic_hi]);
        out.extend_from_slice(&frame.payload);
        out.push(payload_checksum(frame.topic.0, &frame.payload));
        Ok(out)
    }

    fn decode(&self, buf: &[u8]) -> Decoded {
        match scan_for_sync(buf, &SYNC) {
            None if buf.is_empty() => return Decoded::Incomplete,
            None => return Decoded::Discard { consumed: buf.len(), reason: DiscardReason::NoSync },
            Some(0) => {}
            Some(start) => return Decoded::Discard { consumed: start, reason: DiscardReason::NoSync },
        }

        if buf.len() < HEADER_LEN {
            return Decoded::Incomplete;
        }

        // Bad header or trailer: drop only the sync byte so the scan restarts inside the region
        if buf[4] != length_checksum(buf[2], buf[3]) {
            return Decoded::Discard { consumed: 1, reason: DiscardReason::BadHeader };
        }
        let len = u16::from_le_bytes([buf[2], buf[3]]) as usize;
        if len > MAX_PAYLOAD_LEN {
            return Decoded::Discard { consumed: 1, reason: DiscardReason::Oversize };
        }

        let total = MIN_FRAME_LEN + len;
        if buf.len() < total {
            return Decoded::Incomplete;
        }

        let topic = u16::from_le_bytes([buf[5], buf[6]]);
        let payload = &buf[HEADER_LEN..HEADER_LEN + len];
        if buf[total - 1] != payload_checksum(topic, payload) {
            return Decoded::Discard { consumed: 1, reason: DiscardReason::BadChecksum };
        }

        let topic = TopicId(topic);
        let frame = Frame::new(topic, RosSerialCodec::kind_for(topic), payload.to_vec());
        Decoded::Frame { frame, consumed: total }
    }
}

/// Split a bundle of back-to-back binary messages into frames.
///
/// Bundles arrive inside REST dialect publish frames, which are already CRC
/// protected, so the inner checksums are not verified. Parsing stops at the
/// first message whose declared length does not fit.
pub fn split_bundle(bundle: &[u8]) -> Vec<Frame> {
    let mut frames = Vec::new();
    let mut pos = 0;

    while bundle.len() - pos >= MIN_FRAME_LEN {
        let msg = &bundle[pos..];
        let len = u16::from_le_bytes([msg[2], msg[3]]) as usize;
        if len > MAX_PAYLOAD_LEN || msg.len() < MIN_FRAME_LEN + len {
            break;
        }
        let topic = TopicId(u16::from_le_bytes([msg[5], msg[6]]));
        frames.push(Frame::new(topic, FrameKind::Publish, msg[HEADER_LEN..HEADER_LEN + len].to_vec()));
        pos += MIN_FRAME_LEN + len;
    }

    frames
}
