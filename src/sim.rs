//! Simulated robot
//!
//! Serves the far end of a [`MemoryTransport`]: answers REST commands on
//! either dialect, publishes robot status and can be scripted to reply late,
//! stay silent, change identity or drop the link. It also answers raw add-on
//! queries with a keyed report and reassembles uploaded files. Backs the
//! `test` connect method.

use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use parking_lot::Mutex;
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, WriteHalf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::codec::{Decoded, Dialect, ELEM_JSON, FrameCodec, RicRestCodec, RosSerialCodec};
use crate::transfer::parse_block;
use crate::transports::{MemoryRobot, MemoryTransport};
use crate::types::{Frame, FrameKind, TopicId};

/// Default interval between robot-status publishes.
pub const DEFAULT_PUBLISH_PERIOD: Duration = Duration::from_millis(50);

/// Motion state the simulated robot reports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RobotStatus {
    pub is_moving: bool,
    pub is_paused: bool,
    pub work_q_count: u8,
}

impl RobotStatus {
    pub fn idle() -> Self {
        Self::default()
    }

    pub fn moving(work_q_count: u8) -> Self {
        Self { is_moving: true, is_paused: false, work_q_count }
    }

    /// Robot-status topic payload.
    pub fn encode(&self) -> Vec<u8> {
        let flags = u8::from(self.is_moving) | (u8::from(self.is_paused) << 1);
        vec![flags, self.work_q_count]
    }
}

/// Scripted answer to commands starting with a prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimReply {
    Json(String),
    /// Answer after a delay; other commands are served meanwhile.
    Delayed(Duration, String),
    /// Never answer.
    Silent,
}

type SimWriter = Arc<tokio::sync::Mutex<WriteHalf<DuplexStream>>>;

struct SimState {
    robot: MemoryRobot,
    dialect: Dialect,
    serial_no: Mutex<String>,
    status: Mutex<RobotStatus>,
    publish_period: Mutex<Option<Duration>>,
    scripts: Mutex<Vec<(String, SimReply)>>,
    commands: Mutex<Vec<String>>,
    uploaded: Mutex<Vec<u8>>,
    session: Mutex<Session>,
}

/// The live session, plus a drop requested before any session was live.
#[derive(Default)]
struct Session {
    current: Option<CancellationToken>,
    drop_pending: bool,
}

/// Handle to a running simulated robot. Cheap to clone.
#[derive(Clone)]
pub struct SimRobot {
    state: Arc<SimState>,
}

impl SimRobot {
    /// Create a transport and a robot serving it.
    pub fn pair(dialect: Dialect) -> (MemoryTransport, SimRobot) {
        let (transport, robot) = MemoryTransport::pair(dialect);
        (transport, Self::spawn(robot, dialect))
    }

    /// Serve every connection `robot` accepts until its transport is dropped.
    pub fn spawn(robot: MemoryRobot, dialect: Dialect) -> Self {
        let state = Arc::new(SimState {
            robot,
            dialect,
            serial_no: Mutex::new("SIM0001".to_string()),
            status: Mutex::new(RobotStatus::idle()),
            publish_period: Mutex::new(Some(DEFAULT_PUBLISH_PERIOD)),
            scripts: Mutex::new(Vec::new()),
            commands: Mutex::new(Vec::new()),
            uploaded: Mutex::new(Vec::new()),
            session: Mutex::new(Session::default()),
        });

        let accepting = Arc::clone(&state);
        tokio::spawn(async move {
            while let Some(stream) = accepting.robot.accept().await {
                let cancel = CancellationToken::new();
                {
                    let mut session = accepting.session.lock();
                    if let Some(previous) = session.current.replace(cancel.clone()) {
                        previous.cancel();
                    }
                    if std::mem::take(&mut session.drop_pending) {
                        cancel.cancel();
                    }
                }
                tokio::spawn(serve(Arc::clone(&accepting), stream, cancel));
            }
            debug!("Simulated robot shut down");
        });

        Self { state }
    }

    /// Reply to commands starting with `prefix`. Later scripts take precedence.
    pub fn script(&self, prefix: impl Into<String>, reply: SimReply) {
        self.state.scripts.lock().push((prefix.into(), reply));
    }

    pub fn set_status(&self, status: RobotStatus) {
        *self.state.status.lock() = status;
    }

    /// `None` stops status publishing.
    pub fn set_publish_period(&self, period: Option<Duration>) {
        *self.state.publish_period.lock() = period;
    }

    pub fn set_serial_no(&self, serial_no: impl Into<String>) {
        *self.state.serial_no.lock() = serial_no.into();
    }

    /// Commands received so far, oldest first.
    pub fn commands(&self) -> Vec<String> {
        self.state.commands.lock().clone()
    }

    /// Close the current link from the robot side.
    ///
    /// When no session is live yet (the client connected but the robot has
    /// not picked the stream up) the next session is closed as soon as it starts.
    pub fn drop_link(&self) {
        let mut session = self.state.session.lock();
        match session.current.take() {
            Some(live) if !live.is_cancelled() => live.cancel(),
            _ => session.drop_pending = true,
        }
    }

    /// File contents reassembled from the blocks of the latest upload.
    pub fn uploaded(&self) -> Vec<u8> {
        self.state.uploaded.lock().clone()
    }

    pub fn set_online(&self, online: bool) {
        self.state.robot.set_online(online);
    }

    pub fn connect_count(&self) -> u32 {
        self.state.robot.connect_count()
    }
}

impl SimState {
    fn command_text(&self, frame: &Frame) -> Option<String> {
        match (self.dialect, frame.topic) {
            (Dialect::RicRest, TopicId::RIC_REST) if frame.kind == FrameKind::Command => {
                RicRestCodec::rest_text(&frame.payload).map(str::to_owned)
            }
            (Dialect::RosSerial, TopicId::REST_COMMAND) => {
                let text = std::str::from_utf8(&frame.payload).ok()?;
                Some(text.trim_end_matches('\0').to_owned())
            }
            _ => None,
        }
    }

    fn scripted(&self, command: &str) -> Option<SimReply> {
        self.scripts
            .lock()
            .iter()
            .rev()
            .find(|(prefix, _)| command.starts_with(prefix.as_str()))
            .map(|(_, reply)| reply.clone())
    }

    fn reply_for(&self, command: &str) -> SimReply {
        if let Some(reply) = self.scripted(command) {
            return reply;
        }

        let body = if command == "v" {
            json!({
                "SystemName": "Marty",
                "SystemVersion": "1.3.0",
                "SerialNo": self.serial_no.lock().clone(),
                "rslt": "ok",
            })
        } else if command.starts_with('{') || command.starts_with("traj/") || is_raw_query(command) {
            json!({"rslt": "ok"})
        } else {
            json!({"rslt": "failUnknownAPI"})
        };
        SimReply::Json(body.to_string())
    }

    fn reply_frame(&self, request: &Frame, body: &str) -> Frame {
        match self.dialect {
            Dialect::RicRest => {
                Frame::new(TopicId::RIC_REST, FrameKind::Response, RicRestCodec::rest_payload(ELEM_JSON, body))
                    .with_correlation(request.correlation.unwrap_or(0))
            }
            Dialect::RosSerial => Frame::new(TopicId::REST_RESPONSE, FrameKind::Response, body.as_bytes().to_vec()),
        }
    }

    /// Report answering an unscripted raw add-on query: `numToRd` bytes
    /// counting up from `0xA0`, tagged with the query's `msgKey`.
    fn raw_report(&self, command: &str) -> Option<Frame> {
        if self.dialect != Dialect::RicRest || !is_raw_query(command) || self.scripted(command).is_some() {
            return None;
        }
        let read_len: u8 = query_param(command, "numToRd")?.parse().ok()?;
        let data: Vec<u8> = (0..read_len).map(|i| 0xA0u8.wrapping_add(i)).collect();
        let body = json!({"msgType": "raw", "msgKey": query_param(command, "msgKey")?, "hexRd": hex::encode(data)});
        Some(Frame::new(TopicId::RIC_REST, FrameKind::Report, RicRestCodec::rest_payload(ELEM_JSON, &body.to_string())))
    }

    /// Store a file block; `true` if `frame` was one.
    fn absorb_block(&self, frame: &Frame) -> bool {
        if self.dialect != Dialect::RicRest || frame.topic != TopicId::RIC_REST {
            return false;
        }
        let Some((position, data)) = parse_block(&frame.payload) else {
            return false;
        };
        let start = position as usize;
        let mut uploaded = self.uploaded.lock();
        if uploaded.len() < start + data.len() {
            uploaded.resize(start + data.len(), 0);
        }
        uploaded[start..start + data.len()].copy_from_slice(data);
        true
    }

    fn status_frame(&self) -> Frame {
        let payload = self.status.lock().encode();
        match self.dialect {
            Dialect::RosSerial => Frame::new(TopicId::ROBOT_STATUS, FrameKind::Publish, payload),
            Dialect::RicRest => {
                let inner = Frame::new(TopicId::ROBOT_STATUS, FrameKind::Publish, payload);
                let bundle = RosSerialCodec.encode(&inner).unwrap_or_default();
                Frame::new(TopicId::RIC_ROSSERIAL, FrameKind::Publish, bundle)
            }
        }
    }
}

async fn write_frame(dialect: Dialect, writer: &SimWriter, frame: &Frame) {
    let Ok(bytes) = dialect.codec().encode(frame) else {
        return;
    };
    let mut writer = writer.lock().await;
    if writer.write_all(&bytes).await.is_err() {
        trace!("Simulated robot write failed");
    }
}

async fn serve(state: Arc<SimState>, stream: DuplexStream, cancel: CancellationToken) {
    debug!(dialect = ?state.dialect, "Simulated robot session started");
    let (mut reader, writer) = tokio::io::split(stream);
    let writer: SimWriter = Arc::new(tokio::sync::Mutex::new(writer));
    tokio::spawn(publish(Arc::clone(&state), Arc::clone(&writer), cancel.clone()));

    let codec = state.dialect.codec();
    let mut buf = BytesMut::with_capacity(1024);
    loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => break,
            read = reader.read_buf(&mut buf) => read,
        };
        match read {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }

        loop {
            match codec.decode(&buf) {
                Decoded::Frame { frame, consumed } => {
                    buf.advance(consumed);
                    handle(&state, &writer, &cancel, frame).await;
                }
                Decoded::Discard { consumed, .. } => buf.advance(consumed),
                Decoded::Incomplete => break,
            }
        }
    }

    cancel.cancel();
    debug!("Simulated robot session ended");
}

fn query_param<'a>(command: &'a str, name: &str) -> Option<&'a str> {
    let query = command.split_once('?')?.1;
    query.split('&').find_map(|pair| pair.strip_prefix(name)?.strip_prefix('='))
}

fn is_raw_query(command: &str) -> bool {
    command.starts_with("elem/") && command.contains("cmd=raw")
}

async fn handle(state: &Arc<SimState>, writer: &SimWriter, cancel: &CancellationToken, frame: Frame) {
    if state.absorb_block(&frame) {
        return;
    }
    let Some(command) = state.command_text(&frame) else {
        return;
    };
    state.commands.lock().push(command.clone());
    if command.contains(r#""cmdName":"ufStart""#) {
        state.uploaded.lock().clear();
    }
    let report = state.raw_report(&command);

    match state.reply_for(&command) {
        SimReply::Json(body) => write_frame(state.dialect, writer, &state.reply_frame(&frame, &body)).await,
        SimReply::Delayed(delay, body) => {
            let reply = state.reply_frame(&frame, &body);
            let (dialect, writer, cancel) = (state.dialect, Arc::clone(writer), cancel.clone());
            tokio::spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = tokio::time::sleep(delay) => write_frame(dialect, &writer, &reply).await,
                }
            });
        }
        SimReply::Silent => {}
    }
    if let Some(report) = report {
        write_frame(state.dialect, writer, &report).await;
    }
}

async fn publish(state: Arc<SimState>, writer: SimWriter, cancel: CancellationToken) {
    loop {
        let period = *state.publish_period.lock();
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(period.unwrap_or(DEFAULT_PUBLISH_PERIOD)) => {}
        }
        if period.is_some() {
            write_frame(state.dialect, &writer, &state.status_frame()).await;
        }
    }
}
