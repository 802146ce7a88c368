//! Outgoing requests and their replies

use serde_json::Value;

use crate::codec::{Dialect, ELEM_CMD_FRAME, ELEM_URL, RicRestCodec, RosSerialCodec};
use crate::correlator::ReplyMatcher;
use crate::types::{Frame, FrameKind, TopicId};
use crate::{LinkError, Result};

#[derive(Debug, Clone, PartialEq)]
enum Body {
    /// REST command such as `traj/dance?side=0`.
    Rest(String),
    /// JSON command frame such as a telemetry subscription.
    CommandFrame(String),
    /// Pre-built payload on an explicit topic.
    Raw { topic: TopicId, payload: Vec<u8>, reply: ReplyMatcher },
}

/// A command for the robot, independent of the wire dialect.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    body: Body,
}

/// A request rendered for a particular dialect.
#[derive(Debug, Clone)]
pub(crate) struct Outbound {
    /// Frame without a message number; numbering happens at send time.
    pub frame: Frame,
    /// How to recognise the reply on dialects without message numbers.
    pub matcher: ReplyMatcher,
}

impl Request {
    pub fn rest(command: impl Into<String>) -> Self {
        Self { body: Body::Rest(command.into()) }
    }

    pub fn command_frame(json: &Value) -> Self {
        Self { body: Body::CommandFrame(json.to_string()) }
    }

    /// Raw register access on an add-on. The data read comes back in a report
    /// frame tagged with `msg_key`, after the command's own reply.
    pub fn add_on_raw(add_on: &str, write: &[u8], read_len: usize, msg_key: u32) -> Self {
        Self::rest(format!(
            "elem/{add_on}/json?cmd=raw&hexWr={}&numToRd={read_len}&msgKey={msg_key}",
            hex::encode(write)
        ))
    }

    /// Raw payload on `topic`, answered by the first unnumbered frame `reply` accepts.
    ///
    /// On numbered dialects the message number decides and `reply` is unused.
    pub fn raw(topic: TopicId, payload: impl Into<Vec<u8>>, reply: ReplyMatcher) -> Self {
        Self { body: Body::Raw { topic, payload: payload.into(), reply } }
    }

    /// Short description for logs and errors.
    pub fn describe(&self) -> String {
        match &self.body {
            Body::Rest(cmd) => cmd.clone(),
            Body::CommandFrame(json) => json.clone(),
            Body::Raw { topic, payload, .. } => format!("{topic} [{} bytes]", payload.len()),
        }
    }

    pub(crate) fn render(&self, dialect: Dialect) -> Result<Outbound> {
        match (dialect, &self.body) {
            (Dialect::RicRest, Body::Rest(cmd)) => Ok(Outbound {
                frame: Frame::new(TopicId::RIC_REST, FrameKind::Command, RicRestCodec::rest_payload(ELEM_URL, cmd)),
                matcher: ReplyMatcher::Topic(TopicId::RIC_REST),
            }),
            (Dialect::RicRest, Body::CommandFrame(json)) => Ok(Outbound {
                frame: Frame::new(
                    TopicId::RIC_REST,
                    FrameKind::Command,
                    RicRestCodec::rest_payload(ELEM_CMD_FRAME, json),
                ),
                matcher: ReplyMatcher::Topic(TopicId::RIC_REST),
            }),
            (Dialect::RicRest, Body::Raw { topic, payload, reply }) => {
                if topic.ric_protocol().is_none() {
                    return Err(LinkError::unknown_target(format!("{topic} on the REST dialect")));
                }
                Ok(Outbound {
                    frame: Frame::new(*topic, FrameKind::Command, payload.clone()),
                    matcher: reply.clone(),
                })
            }
            (Dialect::RosSerial, Body::Rest(text) | Body::CommandFrame(text)) => Ok(Outbound {
                frame: Frame::new(TopicId::REST_COMMAND, FrameKind::Command, text.as_bytes().to_vec()),
                matcher: ReplyMatcher::Topic(TopicId::REST_RESPONSE),
            }),
            (Dialect::RosSerial, Body::Raw { topic, payload, reply }) => Ok(Outbound {
                frame: Frame::new(*topic, RosSerialCodec::kind_for(*topic), payload.clone()),
                matcher: reply.clone(),
            }),
        }
    }
}

/// Reply frame returned by a synchronous request.
#[derive(Debug, Clone)]
pub struct Reply {
    frame: Frame,
    command: String,
}

impl Reply {
    pub(crate) fn new(frame: Frame, command: String) -> Self {
        Self { frame, command }
    }

    pub fn frame(&self) -> &Frame {
        &self.frame
    }

    pub fn into_frame(self) -> Frame {
        self.frame
    }

    /// Reply text with framing bytes and NUL terminators removed.
    pub fn text(&self) -> Option<&str> {
        if self.frame.topic == TopicId::RIC_REST {
            return RicRestCodec::rest_text(&self.frame.payload);
        }
        let payload = &self.frame.payload[..];
        let end = payload.iter().rposition(|b| *b != 0).map_or(0, |i| i + 1);
        std::str::from_utf8(&payload[..end]).ok()
    }

    pub fn json(&self) -> Result<Value> {
        let text = self
            .text()
            .ok_or_else(|| LinkError::protocol("reply", format!("reply to '{}' is not text", self.command)))?;
        Ok(serde_json::from_str(text)?)
    }

    /// The `rslt` field of a JSON reply.
    pub fn result_code(&self) -> Option<String> {
        self.json().ok()?.get("rslt")?.as_str().map(str::to_owned)
    }

    pub fn is_ok(&self) -> bool {
        self.result_code().as_deref() == Some("ok")
    }

    /// Turn a failure `rslt` into an error.
    ///
    /// `failUnknown*` results become `UnknownTarget`; any other non-ok result is
    /// `Rejected`. Replies without a `rslt` field pass through.
    pub fn check(self) -> Result<Self> {
        match self.result_code() {
            None => Ok(self),
            Some(code) if code == "ok" => Ok(self),
            Some(code) if code.starts_with("failUnknown") => Err(LinkError::unknown_target(self.command)),
            Some(code) => Err(LinkError::Rejected { command: self.command, result: code }),
        }
    }
}
