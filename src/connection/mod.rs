//! Robot sessions
//!
//! A [`Connection`] owns one transport and everything that hangs off the live
//! link: the writer, the receive loop, the reconnect supervisor, the reply
//! correlator, telemetry subscriptions and queue tracking. Facades drive the
//! robot exclusively through it.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::Stream;
use serde_json::json;
use tokio::sync::{OwnedMutexGuard, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_stream::wrappers::{ReceiverStream, WatchStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::codec::{Dialect, FrameCodec};
use crate::config::{ConnectionConfig, ReconnectWait};
use crate::correlator::{CancelReason, Correlator};
use crate::queue::CommandQueueTracker;
use crate::receiver::{self, ReceiverExit, Router};
use crate::request::{Reply, Request};
use crate::stats::{Counters, LinkStats, PublishMonitor};
use crate::stream::SampleExt;
use crate::subscriptions::{SubscriptionHandle, SubscriptionTable, TelemetryCallback};
use crate::transfer::{self, UploadSummary, UploadTarget};
use crate::transport::{Link, LinkHandle, LinkWriter, Transport};
use crate::types::{Frame, LinkState, QueueStatus, Telemetry, TopicId};
use crate::{LinkError, Result};


/// State shared by the public handle, the receive loop and the supervisor.
pub(crate) struct Shared {
    pub config: ConnectionConfig,
    pub transport: Box<dyn Transport>,
    pub dialect: Dialect,
    pub codec: &'static dyn FrameCodec,
    pub router: Arc<Router>,
    pub state: watch::Sender<LinkState>,
    writer: tokio::sync::Mutex<Option<LinkWriter>>,
    link: parking_lot::Mutex<Option<LinkHandle>>,
    /// Serialises synchronous requests on dialects without message numbers.
    gate: Arc<tokio::sync::Mutex<()>>,
    identity: parking_lot::Mutex<Option<String>>,
    /// Root token; cancelled on close or drop.
    pub cancel: CancellationToken,
    closed: AtomicBool,
}

impl Shared {
    pub fn correlator(&self) -> &Correlator {
        &self.router.correlator
    }

    pub fn counters(&self) -> &Counters {
        &self.router.counters
    }

    /// Install a fresh link and start its receive loop.
    pub async fn attach(self: &Arc<Self>, link: Link) -> JoinHandle<ReceiverExit> {
        let (reader, writer, handle) = link.into_parts(self.cancel.child_token());
        *self.writer.lock().await = Some(writer);
        *self.link.lock() = Some(handle);
        tokio::spawn(receiver::run(reader, self.codec, Arc::clone(&self.router), self.config.read_timeout()))
    }

    /// Disconnect the current link without touching pending requests.
    pub async fn drop_link(&self) {
        if let Some(handle) = self.link.lock().take() {
            handle.disconnect();
        }
        *self.writer.lock().await = None;
    }

    /// Tear down a lost link: fail waiters and forget robot state tied to it.
    pub async fn detach(&self) {
        self.drop_link().await;
        self.correlator().cancel_all(CancelReason::LinkLost);
        self.router.queue.invalidate();
    }

    /// Final teardown once the supervisor stops.
    pub async fn finish(&self) {
        self.drop_link().await;
        let reason = if self.closed.load(Ordering::SeqCst) { CancelReason::Closed } else { CancelReason::LinkLost };
        self.correlator().cancel_all(reason);
        self.router.queue.invalidate();
        self.state.send_replace(LinkState::Disconnected);
        self.cancel.cancel();
    }

    /// Encode and write one frame. A failed write takes the link down.
    async fn write_frame(&self, frame: &Frame) -> Result<()> {
        let bytes = self.codec.encode(frame)?;
        let mut writer = self.writer.lock().await;
        let Some(link) = writer.as_mut() else {
            return Err(LinkError::NotConnected { state: *self.state.borrow() });
        };
        if let Err(e) = link.send(&bytes).await {
            warn!(error = %e, "Write failed, dropping link");
            *writer = None;
            if let Some(handle) = self.link.lock().take() {
                handle.disconnect();
            }
            return Err(e);
        }
        Ok(())
    }

    /// Send a request and wait for its reply, regardless of link state.
    ///
    /// `timeout` covers the whole call, including any wait at the request gate.
    pub async fn exchange(&self, request: &Request, timeout: Duration) -> Result<Reply> {
        let deadline = Instant::now() + timeout;
        let outbound = request.render(self.dialect)?;
        let command = request.describe();

        let (frame, pending, _turn) = if self.dialect.has_correlation_ids() {
            let (msg_num, pending) = self.correlator().register_numbered(timeout)?;
            (outbound.frame.with_correlation(msg_num), pending, None)
        } else {
            let turn = self.take_turn(deadline, timeout).await?;
            let pending = self.correlator().register_fifo(outbound.matcher, remaining(deadline, timeout)?);
            (outbound.frame, pending, Some(turn))
        };

        debug!(%command, msg_num = ?frame.correlation, "Sending request");
        self.write_frame(&frame).await?;
        let reply = pending.wait().await.map_err(|e| match e {
            LinkError::Timeout { .. } => LinkError::Timeout { duration: timeout },
            other => other,
        })?;
        Ok(Reply::new(reply, command))
    }

    /// Write a request whose reply nobody waits for.
    ///
    /// Numbered dialects register a detached entry so the reply is absorbed.
    /// Otherwise the request takes its turn at the gate and a background task
    /// swallows the reply before releasing it.
    pub async fn send_detached(&self, request: &Request) -> Result<()> {
        let outbound = request.render(self.dialect)?;
        let timeout = self.config.request_timeout();

        if self.dialect.has_correlation_ids() {
            let msg_num = self.correlator().register_detached(timeout)?;
            return self.write_frame(&outbound.frame.with_correlation(msg_num)).await;
        }

        let deadline = Instant::now() + timeout;
        let turn = self.take_turn(deadline, timeout).await?;
        let pending = self.correlator().register_fifo(outbound.matcher, remaining(deadline, timeout)?);
        self.write_frame(&outbound.frame).await?;
        tokio::spawn(async move {
            let _turn = turn;
            if let Err(e) = pending.wait().await {
                debug!(error = %e, "No reply to detached send");
            }
        });
        Ok(())
    }

    /// Wait for the request gate until `deadline`. A connection closed
    /// meanwhile fails with `Closed`.
    async fn take_turn(&self, deadline: Instant, timeout: Duration) -> Result<OwnedMutexGuard<()>> {
        let turn = tokio::time::timeout_at(deadline, Arc::clone(&self.gate).lock_owned())
            .await
            .map_err(|_| LinkError::Timeout { duration: timeout })?;
        if self.closed.load(Ordering::SeqCst) {
            return Err(LinkError::Closed);
        }
        Ok(turn)
    }

    /// Gate a caller on the link state and reconnect policy.
    pub async fn ensure_connected(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(LinkError::Closed);
        }
        let mut rx = self.state.subscribe();
        let state = *rx.borrow_and_update();
        match state {
            LinkState::Connected => return Ok(()),
            LinkState::Disconnected => return Err(LinkError::NotConnected { state }),
            LinkState::Connecting | LinkState::Reconnecting => {}
        }

        let ReconnectWait::Queue { max_wait_ms } = self.config.while_reconnecting else {
            return Err(LinkError::NotConnected { state });
        };
        let settled = tokio::time::timeout(
            Duration::from_millis(max_wait_ms),
            rx.wait_for(|s| matches!(s, LinkState::Connected | LinkState::Disconnected)),
        )
        .await;
        match settled {
            Ok(Ok(state)) if state.is_connected() => Ok(()),
            Ok(Ok(state)) => Err(LinkError::NotConnected { state: *state }),
            Ok(Err(_)) => Err(LinkError::Closed),
            Err(_) => Err(LinkError::NotConnected { state: *self.state.borrow() }),
        }
    }

    /// Ask the robot for its identity: serial number, else system name.
    pub async fn read_identity(&self) -> Result<Option<String>> {
        let reply = self.exchange(&Request::rest("v"), self.config.request_timeout()).await?.check()?;
        let info = reply.json()?;
        let field = |name: &str| {
            info.get(name).and_then(|v| v.as_str()).filter(|s| !s.is_empty()).map(str::to_owned)
        };
        Ok(field("SerialNo").or_else(|| field("SystemName")))
    }

    pub fn identity(&self) -> Option<String> {
        self.identity.lock().clone()
    }

    /// After a reconnect, make sure we reached the same robot.
    pub async fn revalidate_identity(&self) -> Result<()> {
        if !self.verifies_identity() || !self.transport.revalidates_identity() {
            return Ok(());
        }
        let found = self.read_identity().await?;
        let mut known = self.identity.lock();
        match (known.clone(), found) {
            (Some(expected), Some(found)) if expected != found => Err(LinkError::IdentityMismatch { expected, found }),
            (None, found) => {
                *known = found;
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn verifies_identity(&self) -> bool {
        self.config.verify_identity && self.dialect == Dialect::RicRest
    }

    fn publishes_on_request(&self) -> bool {
        self.config.publish.enabled && self.dialect == Dialect::RicRest
    }

    /// (Re-)send the telemetry subscription command, if this dialect needs one.
    pub async fn resubscribe(&self) {
        if !self.publishes_on_request() {
            return;
        }
        let request = subscription_request(self.config.publish.rate_hz);
        if let Err(e) = self.send_detached(&request).await {
            warn!(error = %e, "Failed to send telemetry subscription");
        }
    }
}

/// Time left before `deadline`; `Timeout` when none is.
fn remaining(deadline: Instant, timeout: Duration) -> Result<Duration> {
    let left = deadline.saturating_duration_since(Instant::now());
    if left.is_zero() {
        return Err(LinkError::Timeout { duration: timeout });
    }
    Ok(left)
}

/// Subscription command for status, power and add-on telemetry. A rate of 0 stops publishing.
fn subscription_request(rate_hz: f64) -> Request {
    let power_hz = if rate_hz > 0.0 { 1.0 } else { 0.0 };
    Request::command_frame(&json!({
        "cmdName": "subscription",
        "action": "update",
        "pubRecs": [
            {"name": "MultiStatus", "rateHz": rate_hz},
            {"name": "PowerStatus", "rateHz": power_hz},
            {"name": "AddOnStatus", "rateHz": rate_hz},
        ],
    }))
}

/// Re-send the subscription whenever telemetry goes quiet.
async fn publish_keepalive(shared: Arc<Shared>) {
    let quiet_after = shared.config.publish.resubscribe_after();
    let mut ticker = tokio::time::interval(quiet_after / 2);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut watching_since = tokio::time::Instant::now();

    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        if !shared.state.borrow().is_connected() {
            watching_since = tokio::time::Instant::now();
            continue;
        }
        let last = shared.router.publish.last_publish().unwrap_or(watching_since).max(watching_since);
        if last.elapsed() >= quiet_after {
            info!(quiet = ?last.elapsed(), "Telemetry stalled, re-sending subscription");
            shared.resubscribe().await;
            watching_since = tokio::time::Instant::now();
        }
    }
    debug!("Publish keepalive stopped");
}

/// A session with one robot.
///
/// Dropping the connection cancels its background tasks; call
/// [`close`](Connection::close) to also stop telemetry publishing and wait for
/// shutdown.
pub struct Connection {
    shared: Arc<Shared>,
    supervisor: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    /// Connect over `transport`.
    ///
    /// The first connect is not retried: an unreachable robot is reported as
    /// `LinkError::Connect` straight away.
    pub async fn open(transport: impl Transport, config: ConnectionConfig) -> Result<Self> {
        Self::open_boxed(Box::new(transport), config).await
    }

    pub async fn open_boxed(transport: Box<dyn Transport>, config: ConnectionConfig) -> Result<Self> {
        config.validate()?;
        let dialect = config.dialect.unwrap_or_else(|| transport.dialect());
        let locator = transport.locator();
        info!(%locator, ?dialect, "Opening robot connection");

        let router = Router {
            correlator: Correlator::new(),
            subscriptions: SubscriptionTable::new(config.subscriber_capacity),
            queue: Arc::new(CommandQueueTracker::new(config.queue.freshness(), config.queue.settle())),
            counters: Arc::new(Counters::default()),
            publish: Arc::new(PublishMonitor::default()),
        };
        router.queue.set_blocking(config.queue.blocking);
        let (state, _) = watch::channel(LinkState::Connecting);

        let link = transport.connect(config.connect_timeout()).await?;
        let shared = Arc::new(Shared {
            config,
            transport,
            dialect,
            codec: dialect.codec(),
            router: Arc::new(router),
            state,
            writer: tokio::sync::Mutex::new(None),
            link: parking_lot::Mutex::new(None),
            gate: Arc::new(tokio::sync::Mutex::new(())),
            identity: parking_lot::Mutex::new(None),
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
        });

        let receiver = shared.attach(link).await;
        shared.state.send_replace(LinkState::Connected);

        if shared.verifies_identity() {
            match shared.read_identity().await {
                Ok(identity) => {
                    info!(identity = identity.as_deref().unwrap_or("unknown"), "Robot identified");
                    *shared.identity.lock() = identity;
                }
                Err(e) => warn!(error = %e, "Could not read robot identity"),
            }
        }
        shared.resubscribe().await;

        let supervisor = tokio::spawn(crate::reconnect::supervise(Arc::clone(&shared), receiver));
        if shared.publishes_on_request() {
            tokio::spawn(publish_keepalive(Arc::clone(&shared)));
        }

        info!(%locator, "Robot connection established");
        Ok(Self { shared, supervisor: parking_lot::Mutex::new(Some(supervisor)) })
    }

    /// Send a request and wait up to `timeout` for its reply.
    pub async fn request_sync(&self, request: Request, timeout: Duration) -> Result<Reply> {
        self.shared.ensure_connected().await?;
        self.shared.exchange(&request, timeout).await
    }

    /// [`request_sync`](Self::request_sync) with the configured request timeout.
    pub async fn request(&self, request: Request) -> Result<Reply> {
        self.request_sync(request, self.shared.config.request_timeout()).await
    }

    /// Send without waiting for a reply. Returns once the frame is written.
    pub async fn send_async(&self, request: Request) -> Result<()> {
        self.shared.ensure_connected().await?;
        self.shared.send_detached(&request).await
    }

    /// Send a motion request and, if blocking, wait for the robot to finish it.
    ///
    /// `blocking` overrides the connection default for this call. The wait is
    /// bounded by `expected_duration` plus the configured maximum blocking wait.
    pub async fn execute(
        &self,
        request: Request,
        expected_duration: Duration,
        blocking: Option<bool>,
    ) -> Result<Reply> {
        let reply = self.request(request).await?.check()?;
        if !self.shared.router.queue.is_blocking(blocking) {
            return Ok(reply);
        }
        let bound = expected_duration + self.shared.config.queue.max_blocking_wait();
        if self.wait_for_queue_drain(bound).await? {
            Ok(reply)
        } else {
            Err(LinkError::Timeout { duration: bound })
        }
    }

    /// Write `write` to an add-on and read back `read_len` bytes.
    ///
    /// The robot answers the command, then sends the data in a report frame
    /// matched by its `msgKey`. `request_timeout` bounds the whole exchange.
    /// REST dialect only.
    pub async fn add_on_query_raw(&self, add_on: &str, write: &[u8], read_len: usize) -> Result<Vec<u8>> {
        self.shared.ensure_connected().await?;
        if !self.shared.dialect.has_correlation_ids() {
            return Err(LinkError::unknown_target(format!("raw query of {add_on} on the binary dialect")));
        }
        let timeout = self.shared.config.request_timeout();
        let (msg_key, report) = self.shared.correlator().register_report(timeout)?;
        let request = Request::add_on_raw(add_on, write, read_len, msg_key);
        let command = request.describe();
        self.shared.exchange(&request, timeout).await?.check()?;

        let report = Reply::new(report.wait().await?, command).json()?;
        let hex_read = report.get("hexRd").and_then(|v| v.as_str()).unwrap_or_default();
        hex::decode(hex_read).map_err(|e| LinkError::protocol("add-on report", format!("hexRd: {e}")))
    }

    /// Upload `data` under `name`.
    ///
    /// Sends `ufStart`, the file in position-tagged blocks, then `ufEnd` with
    /// the block count. Either command being rejected fails the upload. REST
    /// dialect only.
    pub async fn upload_file(&self, name: &str, data: &[u8], target: UploadTarget) -> Result<UploadSummary> {
        self.shared.ensure_connected().await?;
        if !self.shared.dialect.has_correlation_ids() {
            return Err(LinkError::unknown_target(format!("file upload of {name} on the binary dialect")));
        }
        let len = u32::try_from(data.len())
            .map_err(|_| LinkError::protocol("file upload", format!("{} bytes is too large", data.len())))?;
        let timeout = self.shared.config.request_timeout();
        let name = target.upload_name(name);
        info!(file = name, bytes = data.len(), ?target, "Starting file upload");

        let started = self.shared.exchange(&transfer::start_request(target, name, len), timeout).await?.check()?;
        let block_size = transfer::negotiated_block_size(&started);

        let mut blocks = 0;
        for (index, chunk) in data.chunks(block_size).enumerate() {
            let position = (index * block_size) as u32;
            self.shared.write_frame(&transfer::block_frame(position, chunk)).await?;
            blocks += 1;
            tokio::time::sleep(transfer::BLOCK_PACING).await;
        }
        debug!(file = name, blocks, block_size, "File blocks sent");

        self.shared.exchange(&transfer::end_request(target, name, len, blocks), timeout).await?.check()?;
        info!(file = name, blocks, "File upload finished");
        Ok(UploadSummary { bytes: data.len(), blocks, block_size })
    }

    /// Call `callback` for every telemetry item on `topic`.
    pub fn subscribe<F>(&self, topic: TopicId, callback: F) -> SubscriptionHandle
    where
        F: Fn(&Telemetry) + Send + Sync + 'static,
    {
        let callback: TelemetryCallback = Arc::new(callback);
        self.shared.router.subscriptions.subscribe_callback(topic, callback)
    }

    /// Telemetry on `topic` as a stream. Dropping the stream unsubscribes.
    pub fn subscribe_stream(&self, topic: TopicId) -> impl Stream<Item = Telemetry> + Send + 'static {
        let (_, rx) = self.shared.router.subscriptions.subscribe_channel(topic);
        ReceiverStream::new(rx)
    }

    /// Like [`subscribe_stream`](Self::subscribe_stream), but yields at most one item per `period`.
    ///
    /// The stream is `!Unpin`; wrap it in `Box::pin` to poll it with `next()`.
    pub fn subscribe_sampled(
        &self,
        topic: TopicId,
        period: Duration,
    ) -> impl Stream<Item = Telemetry> + Send + 'static {
        self.subscribe_stream(topic).sample(period)
    }

    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        self.shared.router.subscriptions.unsubscribe(handle)
    }

    pub fn current_queue_state(&self) -> QueueStatus {
        self.shared.router.queue.current()
    }

    /// Wait until the robot reports an empty queue and no motion.
    pub async fn wait_for_queue_drain(&self, timeout: Duration) -> Result<bool> {
        self.shared.router.queue.wait_for_drain(timeout, 0).await
    }

    /// Default blocking mode for [`execute`](Self::execute).
    pub fn set_blocking(&self, blocking: bool) {
        self.shared.router.queue.set_blocking(blocking);
    }

    pub fn is_blocking(&self) -> bool {
        self.shared.router.queue.is_blocking(None)
    }

    pub fn link_state(&self) -> LinkState {
        *self.shared.state.borrow()
    }

    /// Current link state followed by every change.
    pub fn link_states(&self) -> impl Stream<Item = LinkState> + Send + 'static {
        WatchStream::new(self.shared.state.subscribe())
    }

    pub fn stats(&self) -> LinkStats {
        self.shared.counters().snapshot(self.shared.correlator().round_trip_avg())
    }

    /// Telemetry messages per second by topic name.
    pub fn publish_rates(&self) -> std::collections::BTreeMap<String, f64> {
        self.shared.router.publish.rates()
    }

    /// Robot serial number (or name) read when the connection opened.
    pub fn identity(&self) -> Option<String> {
        self.shared.identity()
    }

    pub fn dialect(&self) -> Dialect {
        self.shared.dialect
    }

    pub fn locator(&self) -> String {
        self.shared.transport.locator()
    }

    /// Stop telemetry, fail pending requests with `Closed` and shut the link down.
    ///
    /// Idempotent.
    pub async fn close(&self) -> Result<()> {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!(locator = %self.shared.transport.locator(), "Closing robot connection");

        if self.shared.publishes_on_request() && self.link_state().is_connected() {
            if let Err(e) = self.shared.send_detached(&subscription_request(0.0)).await {
                debug!(error = %e, "Could not stop telemetry publishing");
            }
        }

        self.shared.cancel.cancel();
        self.shared.correlator().cancel_all(CancelReason::Closed);
        self.shared.state.send_replace(LinkState::Disconnected);

        let supervisor = self.supervisor.lock().take();
        if let Some(task) = supervisor {
            if let Err(e) = task.await {
                warn!(error = %e, "Connection supervisor failed");
            }
        }
        Ok(())
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        debug!("Dropping robot connection");
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.cancel.cancel();
    }
}
