//! Wire framing for the two robot dialects.
//!
//! Codecs are pure: they turn a [`Frame`] into bytes and pull frames back out
//! of a growing receive buffer. No I/O happens here.
//!
//! Decoding is resync-safe. When the buffer does not start with a valid frame
//! the decoder reports how many bytes to drop ([`Decoded::Discard`]) and the
//! caller tries again, so a corrupt region costs exactly its own bytes.
//!
//! ```rust
//! use martylink::codec::{Decoded, Dialect};
//! use martylink::{Frame, FrameKind, TopicId};
//!
//! let codec = Dialect::RosSerial.codec();
//! let frame = Frame::new(TopicId::ROBOT_STATUS, FrameKind::Publish, vec![0x01, 3]);
//! let bytes = codec.encode(&frame).unwrap();
//!
//! match codec.decode(&bytes) {
//!     Decoded::Frame { frame: decoded, consumed } => {
//!         assert_eq!(decoded, frame);
//!         assert_eq!(consumed, bytes.len());
//!     }
//!     other => panic!("unexpected {other:?}"),
//! }
//! ```

mod ricrest;
mod rosserial;

use serde::{Deserialize, Serialize};

use crate::Result;
use crate::types::Frame;

pub use ricrest::{
    ELEM_BODY, ELEM_CMD_FRAME, ELEM_FILE_BLOCK, ELEM_JSON, ELEM_URL, MAX_BODY_LEN, RicRestCodec,
};
pub use rosserial::{MAX_PAYLOAD_LEN, RosSerialCodec, split_bundle};

/// Wire dialect spoken on a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dialect {
    /// Checksummed ROS-serial style binary framing (serial and legacy socket links).
    RosSerial,
    /// Numbered RIC frames carrying REST commands and JSON replies (WiFi links).
    RicRest,
}

impl Dialect {
    /// Whether replies carry the request's message number.
    ///
    /// Dialects without correlation ids allow a single synchronous request in flight.
    pub fn has_correlation_ids(self) -> bool {
        matches!(self, Dialect::RicRest)
    }

    pub fn codec(self) -> &'static dyn FrameCodec {
        match self {
            Dialect::RosSerial => &RosSerialCodec,
            Dialect::RicRest => &RicRestCodec,
        }
    }
}

/// Why bytes were dropped from the receive buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardReason {
    /// No sync marker at the head of the buffer.
    NoSync,
    /// Sync marker found but the header is inconsistent.
    BadHeader,
    /// Declared length exceeds the dialect maximum.
    Oversize,
    /// Trailer checksum does not match.
    BadChecksum,
}

/// Outcome of one decode attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// A complete frame occupied the first `consumed` bytes.
    Frame { frame: Frame, consumed: usize },
    /// The first `consumed` bytes cannot start a frame and must be dropped.
    Discard { consumed: usize, reason: DiscardReason },
    /// More bytes are needed.
    Incomplete,
}

/// Encoder/decoder for one wire dialect.
pub trait FrameCodec: Send + Sync {
    fn dialect(&self) -> Dialect;

    /// Serialise a frame. Fails when the frame cannot be represented in this dialect.
    fn encode(&self, frame: &Frame) -> Result<Vec<u8>>;

    /// Try to pull one frame from the head of `buf`.
    fn decode(&self, buf: &[u8]) -> Decoded;
}

/// Find the first offset at which `sync` could begin a frame.
///
/// A trailing partial marker is kept so the next read can complete it.
fn scan_for_sync(buf: &[u8], sync: &[u8]) -> Option<usize> {
    (0..buf.len()).find(|&start| {
        let tail = &buf[start..];
        let n = tail.len().min(sync.len());
        tail[..n] == sync[..n]
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_scan_finds_full_and_partial_markers() {
        assert_eq!(scan_for_sync(&[1, 2, 0xFF, 0xFE, 9], &[0xFF, 0xFE]), Some(2));
        assert_eq!(scan_for_sync(&[1, 2, 0xFF], &[0xFF, 0xFE]), Some(2));
        assert_eq!(scan_for_sync(&[0xFF, 0x01, 0xFF, 0xFE], &[0xFF, 0xFE]), Some(2));
        assert_eq!(scan_for_sync(&[1, 2, 3], &[0xE7]), None);
        assert_eq!(scan_for_sync(&[], &[0xE7]), None);
    }

    #[test]
    fn only_rest_dialect_correlates() {
        assert!(Dialect::RicRest.has_correlation_ids());
        assert!(!Dialect::RosSerial.has_correlation_ids());
        assert_eq!(Dialect::RicRest.codec().dialect(), Dialect::RicRest);
        assert_eq!(Dialect::RosSerial.codec().dialect(), Dialect::RosSerial);
    }
}
