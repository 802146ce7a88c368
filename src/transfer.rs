//! File upload to the robot
//!
//! An upload is a `ufStart` command frame, the file as position-tagged
//! file-block elements, then a `ufEnd` command frame carrying the block count.
//! Blocks are unnumbered and unacknowledged; the robot checks the total at
//! `ufEnd`.

use std::time::Duration;

use serde_json::json;

use crate::codec::{ELEM_FILE_BLOCK, MAX_BODY_LEN};
use crate::request::{Reply, Request};
use crate::types::{Frame, FrameKind, TopicId};

/// Block size offered in `ufStart`. The robot may answer with its own.
pub const DEFAULT_BLOCK_SIZE: usize = 200;

/// Largest block that fits one REST frame after the element code and position.
pub const MAX_BLOCK_SIZE: usize = MAX_BODY_LEN - 2 - 1 - 4;

/// Gap between blocks so the robot's receive buffer keeps up.
pub(crate) const BLOCK_PACING: Duration = Duration::from_millis(10);

/// Where an upload lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadTarget {
    /// A file on the robot file system.
    FileSystem,
    /// A main-board firmware image.
    Firmware,
}

impl UploadTarget {
    fn file_type(self) -> &'static str {
        match self {
            UploadTarget::FileSystem => "fs",
            UploadTarget::Firmware => "ricfw",
        }
    }

    fn request_name(self) -> &'static str {
        match self {
            UploadTarget::FileSystem => "fileupload",
            UploadTarget::Firmware => "espfwupdate",
        }
    }

    /// Name sent to the robot. Firmware images are always called `fw`.
    pub(crate) fn upload_name(self, name: &str) -> &str {
        match self {
            UploadTarget::FileSystem => name,
            UploadTarget::Firmware => "fw",
        }
    }
}

/// Outcome of a finished upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadSummary {
    pub bytes: usize,
    pub blocks: usize,
    pub block_size: usize,
}

pub(crate) fn start_request(target: UploadTarget, name: &str, len: u32) -> Request {
    Request::command_frame(&json!({
        "cmdName": "ufStart",
        "reqStr": target.request_name(),
        "fileType": target.file_type(),
        "batchMsgSize": DEFAULT_BLOCK_SIZE,
        "batchAckSize": 1,
        "fileName": name,
        "fileLen": len,
    }))
}

pub(crate) fn end_request(target: UploadTarget, name: &str, len: u32, block_count: usize) -> Request {
    Request::command_frame(&json!({
        "cmdName": "ufEnd",
        "reqStr": target.request_name(),
        "fileType": target.file_type(),
        "fileName": name,
        "fileLen": len,
        "blockCount": block_count,
    }))
}

/// Block size for this upload: the robot's `batchMsgSize` if it sent one.
pub(crate) fn negotiated_block_size(started: &Reply) -> usize {
    started
        .json()
        .ok()
        .and_then(|body| body.get("batchMsgSize")?.as_u64())
        .map_or(DEFAULT_BLOCK_SIZE, |size| (size as usize).clamp(1, MAX_BLOCK_SIZE))
}

/// File-block element: big-endian file position followed by the data.
pub(crate) fn block_frame(position: u32, chunk: &[u8]) -> Frame {
    let mut payload = Vec::with_capacity(1 + 4 + chunk.len());
    payload.push(ELEM_FILE_BLOCK);
    payload.extend_from_slice(&position.to_be_bytes());
    payload.extend_from_slice(chunk);
    Frame::new(TopicId::RIC_REST, FrameKind::Command, payload)
}

/// Split a file-block payload into its position and data.
pub fn parse_block(payload: &[u8]) -> Option<(u32, &[u8])> {
    if payload.first() != Some(&ELEM_FILE_BLOCK) {
        return None;
    }
    let position = u32::from_be_bytes(payload.get(1..5)?.try_into().ok()?);
    Some((position, &payload[5..]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{Dialect, ELEM_JSON, FrameCodec, RicRestCodec};

    fn reply(body: &str) -> Reply {
        let frame = Frame::new(TopicId::RIC_REST, FrameKind::Response, RicRestCodec::rest_payload(ELEM_JSON, body));
        Reply::new(frame, "ufStart".into())
    }

    #[test]
    fn block_carries_position_then_data() {
        let frame = block_frame(0x0102_0304, b"abc");
        assert_eq!(&*frame.payload, &[ELEM_FILE_BLOCK, 1, 2, 3, 4, b'a', b'b', b'c']);
        assert_eq!(frame.correlation, None);
        assert_eq!(parse_block(&frame.payload), Some((0x0102_0304, &b"abc"[..])));
        assert_eq!(parse_block(&[ELEM_FILE_BLOCK, 0, 0]), None);
        assert_eq!(parse_block(&[ELEM_JSON, 0, 0, 0, 0]), None);
    }

    #[test]
    fn largest_block_still_encodes() {
        let frame = block_frame(0, &vec![0x55; MAX_BLOCK_SIZE]);
        assert!(Dialect::RicRest.codec().encode(&frame).is_ok());
        let frame = block_frame(0, &vec![0x55; MAX_BLOCK_SIZE + 1]);
        assert!(RicRestCodec.encode(&frame).is_err());
    }

    #[test]
    fn robot_can_choose_block_size() {
        assert_eq!(negotiated_block_size(&reply(r#"{"rslt":"ok"}"#)), DEFAULT_BLOCK_SIZE);
        assert_eq!(negotiated_block_size(&reply(r#"{"rslt":"ok","batchMsgSize":500}"#)), 500);
        assert_eq!(negotiated_block_size(&reply(r#"{"rslt":"ok","batchMsgSize":100000}"#)), MAX_BLOCK_SIZE);
    }

    #[test]
    fn firmware_uploads_use_fixed_name() {
        assert_eq!(UploadTarget::Firmware.upload_name("marty.bin"), "fw");
        assert_eq!(UploadTarget::FileSystem.upload_name("dance.json"), "dance.json");
        let out = format!("{:?}", end_request(UploadTarget::Firmware, "fw", 10, 1));
        assert!(out.contains("ricfw") && out.contains("blockCount"));
    }
}
