//! Numbered RIC framing used by the REST dialect
//!
//! ```text
//! 0xE7 len_lo len_hi | msg_num (type << 6 | protocol) payload.. | crc_hi crc_lo
//! ```
//!
//! `len` counts the body between the bars. The CRC-16/CCITT-FALSE trailer
//! covers the length field and the body. RICREST payloads start with an
//! element code followed by NUL-terminated text.

use crc::{CRC_16_IBM_3740, Crc};

use super::{Decoded, DiscardReason, FrameCodec, scan_for_sync};
use crate::codec::Dialect;
use crate::types::{Frame, FrameKind, TopicId};
use crate::{LinkError, Result};

const SYNC: u8 = 0xE7;
const PREFIX_LEN: usize = 3;
const TRAILER_LEN: usize = 2;
const BODY_HEADER_LEN: usize = 2;

/// Largest body (message number, protocol byte and payload) accepted on the wire.
pub const MAX_BODY_LEN: usize = 8192;

pub const ELEM_URL: u8 = 0;
pub const ELEM_JSON: u8 = 1;
pub const ELEM_BODY: u8 = 2;
pub const ELEM_CMD_FRAME: u8 = 3;
pub const ELEM_FILE_BLOCK: u8 = 4;

const FRAME_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);

/// Codec for the numbered REST dialect.
#[derive(Debug, Clone, Copy, Default)]
pub struct RicRestCodec;

impl RicRestCodec {
    /// Build a RICREST payload: element code, text, NUL terminator.
    pub fn rest_payload(elem: u8, text: &str) -> Vec<u8> {
        let mut payload = Vec::with_capacity(text.len() + 2);
        payload.push(elem);
        payload.extend_from_slice(text.as_bytes());
        payload.push(0);
        payload
    }

    /// Text of a RICREST payload with the element code and trailing NULs removed.
    ///
    /// Binary elements (raw bodies and file blocks) have no text.
    pub fn rest_text(payload: &[u8]) -> Option<&str> {
        let (&elem, body) = payload.split_first()?;
        if matches!(elem, ELEM_BODY | ELEM_FILE_BLOCK) {
            return None;
        }
        let end = body.iter().rposition(|b| *b != 0).map_or(0, |i| i + 1);
        std::str::from_utf8(&body[..end]).ok()
    }
}

impl FrameCodec for RicRestCodec {
    fn dialect(&self) -> Dialect {
        Dialect::RicRest
    }

    fn encode(&self, frame: &Frame) -> Result<Vec<u8>> {
        let protocol = frame.topic.ric_protocol().ok_or_else(|| {
            LinkError::protocol("REST encode", format!("topic {} is not a RIC protocol", frame.topic))
        })?;
        let body_len = BODY_HEADER_LEN + frame.payload.len();
        if body_len > MAX_BODY_LEN {
            return Err(LinkError::protocol(
                "REST encode",
                format!("body of {body_len} bytes exceeds {MAX_BODY_LEN}"),
            ));
        }

        let mut out = Vec::with_capacity(PREFIX_LEN + body_len + TRAILER_LEN);
        out.push(SYNC);
        out.extend_from_slice(&(body_len as u16).to_le_bytes());
        out.push(frame.correlation.unwrap_or(0));
        out.push((frame.kind.code() << 6) | protocol);
        out.extend_from_slice(&frame.payload);
        let crc = FRAME_CRC.checksum(&out[1..]);
        out.extend_from_slice(&crc.to_be_bytes());
        Ok(out)
    }

    fn decode(&self, buf: &[u8]) -> Decoded {
        match scan_for_sync(buf, &[SYNC]) {
            None if buf.is_empty() => return Decoded::Incomplete,
            None => return Decoded::Discard { consumed: buf.len(), reason: DiscardReason::NoSync },
            Some(0) => {}
            Some(start) => return Decoded::Discard { consumed: start, reason: DiscardReason::NoSync },
        }

        if buf.len() < PREFIX_LEN {
            return Decoded::Incomplete;
        }
        let len = u16::from_le_bytes([buf[1], buf[2]]) as usize;
        if len < BODY_HEADER_LEN {
            return Decoded::Discard { consumed: 1, reason: DiscardReason::BadHeader };
        }
        if len > MAX_BODY_LEN {
            return Decoded::Discard { consumed: 1, reason: DiscardReason::Oversize };
        }

        let body_end = PREFIX_LEN + len;
        let total = body_end + TRAILER_LEN;
        if buf.len() < total {
            return Decoded::Incomplete;
        }

        let expected = u16::from_be_bytes([buf[body_end], buf[body_end + 1]]);
        if FRAME_CRC.checksum(&buf[1..body_end]) != expected {
            return Decoded::Discard { consumed: 1, reason: DiscardReason::BadChecksum };
        }

        let body = &buf[PREFIX_LEN..body_end];
        let Some(topic) = TopicId::from_ric_protocol(body[1] & 0x3F) else {
            // Intact frame of a protocol we do not speak
            return Decoded::Discard { consumed: total, reason: DiscardReason::BadHeader };
        };
        let frame = Frame::new(topic, FrameKind::from_code(body[1] >> 6), body[BODY_HEADER_LEN..].to_vec())
            .with_correlation(body[0]);
        Decoded::Frame { frame, consumed: total }
    }
}
