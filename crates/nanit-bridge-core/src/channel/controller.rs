//! Per-camera control channel supervision.
//!
//! `StreamController` owns one `CameraSession` per camera. Each open channel
//! is driven by its own task that sends keepalives, dispatches inbound frames
//! and reports the close back to the controller. A close of the current
//! channel schedules exactly one reconnect; closes of replaced channels are
//! ignored.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::proto::{request_type_name, Frame, Response};
use super::transport::{Connector, Inbound, Outbound, Transport};
use crate::api::{AccountApi, Baby};
use crate::auth::{AuthOutcome, AuthSession};
use crate::config::{IngestTarget, Timings};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    #[error("Unknown camera: {0}")]
    UnknownCamera(String),

    #[error("Camera {0} has no stream target")]
    NoStreamTarget(String),

    #[error("Timed out opening control channel")]
    ConnectTimeout,

    #[error("Control channel rejected: {0}")]
    ConnectRejected(String),

    #[error("Not authenticated")]
    NotAuthenticated,

    #[error("Failed to load cameras: {0}")]
    Directory(String),

    #[error("Camera {0} was released")]
    Released(String),

    #[error("Control channels shut down")]
    ShutDown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Idle,
    Connecting,
    Connected,
    Streaming,
    Failed,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    StartStreaming,
}

#[derive(Debug, Clone)]
struct PendingRequest {
    issued_at: Instant,
    kind: RequestKind,
}

/// The controller's end of an open channel. Dropping it closes the channel.
struct ChannelHandle {
    id: u64,
    close: Option<oneshot::Sender<()>>,
}

impl ChannelHandle {
    /// Ask the channel task to close while keeping this handle current, so
    /// the close goes through the normal reconnect path.
    fn request_close(&mut self) {
        if let Some(close) = self.close.take() {
            let _ = close.send(());
        }
    }
}

struct ReconnectTimer {
    id: u64,
    task: JoinHandle<()>,
}

struct CameraSession {
    state: ChannelState,
    channel: Option<ChannelHandle>,
    pending: HashMap<i32, PendingRequest>,
    last_activity: Option<Instant>,
    stream_target: Option<String>,
    reconnect: Option<ReconnectTimer>,
    connect_lock: Arc<Mutex<()>>,
    connect_generation: u64,
    last_connect: Option<Result<(), StreamError>>,
}

impl CameraSession {
    fn new() -> Self {
        Self {
            state: ChannelState::Idle,
            channel: None,
            pending: HashMap::new(),
            last_activity: None,
            stream_target: None,
            reconnect: None,
            connect_lock: Arc::new(Mutex::new(())),
            connect_generation: 0,
            last_connect: None,
        }
    }

    fn channel_id(&self) -> Option<u64> {
        self.channel.as_ref().map(|c| c.id)
    }

    fn streaming_active(&self) -> bool {
        self.state == ChannelState::Streaming
    }

    fn has_pending(&self, kind: RequestKind) -> bool {
        self.pending.values().any(|p| p.kind == kind)
    }

    fn cancel_reconnect(&mut self) {
        if let Some(timer) = self.reconnect.take() {
            timer.task.abort();
        }
    }
}

impl Drop for CameraSession {
    fn drop(&mut self) {
        self.cancel_reconnect();
    }
}

/// Snapshot of one camera's control state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CameraStatus {
    pub state: ChannelState,
    pub streaming_active: bool,
    pub has_channel: bool,
    pub pending_requests: usize,
    pub reconnect_scheduled: bool,
    pub last_activity: Option<Instant>,
}

struct ControllerInner {
    api: Arc<dyn AccountApi>,
    auth: Arc<AuthSession>,
    connector: Arc<dyn Connector>,
    ingest: IngestTarget,
    timings: Timings,
    sessions: Mutex<HashMap<String, CameraSession>>,
    cameras: Mutex<Vec<Baby>>,
    next_request_id: AtomicI32,
    next_id: AtomicU64,
    /// Bumped by every shutdown; a connect started before it must not install
    shutdown_epoch: AtomicU64,
}

/// Control-Channel Engine. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct StreamController {
    inner: Arc<ControllerInner>,
}

impl StreamController {
    pub fn new(
        api: Arc<dyn AccountApi>,
        auth: Arc<AuthSession>,
        connector: Arc<dyn Connector>,
        ingest: IngestTarget,
        timings: Timings,
    ) -> Self {
        Self {
            inner: Arc::new(ControllerInner {
                api,
                auth,
                connector,
                ingest,
                timings,
                sessions: Mutex::new(HashMap::new()),
                cameras: Mutex::new(Vec::new()),
                next_request_id: AtomicI32::new(1),
                next_id: AtomicU64::new(1),
                shutdown_epoch: AtomicU64::new(0),
            }),
        }
    }

    pub fn ingest(&self) -> &IngestTarget {
        &self.inner.ingest
    }

    fn next_request_id(&self) -> i32 {
        let id = self.inner.next_request_id.fetch_add(1, Ordering::Relaxed) & i32::MAX;
        id.max(1)
    }

    fn next_id(&self) -> u64 {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn shutdown_epoch(&self) -> u64 {
        self.inner.shutdown_epoch.load(Ordering::Acquire)
    }

    // ========================================================================
    // Camera directory
    // ========================================================================

    /// Fetch the account's cameras and replace the cached list
    pub async fn refresh_cameras(&self) -> Result<Vec<Baby>, StreamError> {
        let cameras = self.fetch_cameras().await?;
        *self.inner.cameras.lock().await = cameras.clone();
        Ok(cameras)
    }

    pub async fn cameras(&self) -> Vec<Baby> {
        self.inner.cameras.lock().await.clone()
    }

    async fn fetch_cameras(&self) -> Result<Vec<Baby>, StreamError> {
        let token = self
            .inner
            .auth
            .access_token()
            .await
            .ok_or(StreamError::NotAuthenticated)?;
        self.inner.api.list_babies(&token).await.map_err(|e| {
            if e.is_unauthorized() {
                StreamError::NotAuthenticated
            } else {
                StreamError::Directory(e.to_string())
            }
        })
    }

    async fn resolve_stream_target(&self, camera: &str) -> Result<String, StreamError> {
        let mut cameras = self.inner.cameras.lock().await;
        if cameras.is_empty() {
            debug!(camera, "Camera list empty, loading it first");
            *cameras = self.fetch_cameras().await?;
        }
        let Some(baby) = cameras.iter().find(|b| b.uid == camera) else {
            error!(camera, "Camera not found in account");
            return Err(StreamError::UnknownCamera(camera.to_string()));
        };
        match baby.camera_uid.as_deref() {
            Some(target) if !target.is_empty() => Ok(target.to_string()),
            _ => {
                error!(camera, "Camera has no stream target");
                Err(StreamError::NoStreamTarget(camera.to_string()))
            }
        }
    }

    // ========================================================================
    // Connect
    // ========================================================================

    /// Make sure the camera is streaming or about to be. Returns once a
    /// channel is open and the start request sent; the camera's answer to that
    /// request arrives later and only changes the streaming flag.
    pub async fn ensure_streaming_active(&self, camera: &str) -> Result<(), StreamError> {
        let epoch = self.shutdown_epoch();
        let (lock, seen) = {
            let mut sessions = self.inner.sessions.lock().await;
            let session = sessions
                .entry(camera.to_string())
                .or_insert_with(CameraSession::new);
            (session.connect_lock.clone(), session.connect_generation)
        };
        let _guard = lock.lock().await;

        {
            let mut sessions = self.inner.sessions.lock().await;
            let session = sessions
                .entry(camera.to_string())
                .or_insert_with(CameraSession::new);

            if session.connect_generation != seen {
                if let Some(result) = session.last_connect.clone() {
                    debug!(camera, "Joined in-flight connect");
                    return result;
                }
            }

            if session.channel.is_some() {
                if session.streaming_active() {
                    debug!(camera, "Streaming already active");
                    return Ok(());
                }
                if session.has_pending(RequestKind::StartStreaming) {
                    debug!(camera, "Streaming request already in flight");
                    return Ok(());
                }
            } else if session.streaming_active() {
                info!(camera, "Streaming flagged active without a channel, resetting");
                session.state = ChannelState::Idle;
            }
        }

        let target = self.resolve_stream_target(camera).await?;
        self.connect_locked(camera, &target, epoch).await
    }

    /// Open a fresh channel for `camera`, replacing any existing one.
    pub async fn connect(&self, camera: &str, stream_target: &str) -> Result<(), StreamError> {
        self.connect_if_current(camera, stream_target, None, self.shutdown_epoch())
            .await
    }

    /// Connect unless another connect completed since `seen` was observed.
    async fn connect_if_current(
        &self,
        camera: &str,
        stream_target: &str,
        seen: Option<u64>,
        epoch: u64,
    ) -> Result<(), StreamError> {
        let lock = {
            let mut sessions = self.inner.sessions.lock().await;
            let session = sessions
                .entry(camera.to_string())
                .or_insert_with(CameraSession::new);
            session.connect_lock.clone()
        };
        let _guard = lock.lock().await;

        if let Some(seen) = seen {
            let sessions = self.inner.sessions.lock().await;
            match sessions.get(camera) {
                Some(session) if session.connect_generation == seen => {}
                Some(_) => {
                    debug!(camera, "Superseded by a newer connect");
                    return Ok(());
                }
                None => return Err(StreamError::Released(camera.to_string())),
            }
        }

        self.connect_locked(camera, stream_target, epoch).await
    }

    /// Caller holds the camera's connect lock. `epoch` is the shutdown epoch
    /// observed when the connect was requested.
    async fn connect_locked(
        &self,
        camera: &str,
        stream_target: &str,
        epoch: u64,
    ) -> Result<(), StreamError> {
        let result = self.open_channel(camera, stream_target, epoch).await;
        let mut sessions = self.inner.sessions.lock().await;
        if let Some(session) = sessions.get_mut(camera) {
            session.connect_generation += 1;
            session.last_connect = Some(result.clone());
        }
        result
    }

    async fn open_channel(
        &self,
        camera: &str,
        stream_target: &str,
        epoch: u64,
    ) -> Result<(), StreamError> {
        let token = self
            .inner
            .auth
            .access_token()
            .await
            .ok_or(StreamError::NotAuthenticated)?;

        {
            let mut sessions = self.inner.sessions.lock().await;
            if self.shutdown_epoch() != epoch {
                debug!(camera, "Shut down before the channel was opened");
                return Err(StreamError::ShutDown);
            }
            let session = sessions
                .entry(camera.to_string())
                .or_insert_with(CameraSession::new);
            session.cancel_reconnect();
            if session.channel.take().is_some() {
                debug!(camera, "Replacing existing control channel");
            }
            session.pending.clear();
            session.state = ChannelState::Connecting;
            session.stream_target = Some(stream_target.to_string());
        }

        info!(camera, stream_target, "Opening control channel");
        let opened = tokio::time::timeout(
            self.inner.timings.connect_timeout(),
            self.inner.connector.open(stream_target, &token),
        )
        .await;

        let transport = match opened {
            Ok(Ok(transport)) => transport,
            Ok(Err(e)) => {
                error!(camera, error = %e, "Control channel failed to open");
                self.set_state(camera, ChannelState::Failed).await;
                if e.is_auth_rejection() {
                    self.inner.auth.invalidate_access_token().await;
                }
                return Err(StreamError::ConnectRejected(e.to_string()));
            }
            Err(_) => {
                error!(camera, "Timed out opening control channel");
                self.set_state(camera, ChannelState::Failed).await;
                return Err(StreamError::ConnectTimeout);
            }
        };

        let channel_id = self.next_id();
        let request_id = self.next_request_id();
        let (close_tx, close_rx) = oneshot::channel();
        {
            let mut sessions = self.inner.sessions.lock().await;
            let Some(session) = sessions.get_mut(camera) else {
                let _ = transport.outbound.send(Outbound::Close).await;
                return Err(StreamError::Released(camera.to_string()));
            };
            if self.shutdown_epoch() != epoch {
                info!(camera, "Shut down while opening, closing the new channel");
                let _ = transport.outbound.send(Outbound::Close).await;
                return Err(StreamError::ShutDown);
            }
            session.channel = Some(ChannelHandle {
                id: channel_id,
                close: Some(close_tx),
            });
            session.state = ChannelState::Connected;
            session.pending.insert(
                request_id,
                PendingRequest {
                    issued_at: Instant::now(),
                    kind: RequestKind::StartStreaming,
                },
            );
        }
        info!(camera, "Control channel open");

        let ingest_url = self.inner.ingest.url_for(camera);
        debug!(camera, request_id, %ingest_url, "Requesting stream");
        let frame = Frame::start_streaming(request_id, &ingest_url).encode();
        if transport.outbound.send(Outbound::Frame(frame)).await.is_err() {
            warn!(camera, "Control channel went away before the streaming request was sent");
        }

        tokio::spawn(
            self.clone()
                .run_channel(camera.to_string(), channel_id, transport, close_rx),
        );
        Ok(())
    }

    async fn set_state(&self, camera: &str, state: ChannelState) {
        if let Some(session) = self.inner.sessions.lock().await.get_mut(camera) {
            session.state = state;
        }
    }

    // ========================================================================
    // Channel task
    // ========================================================================

    async fn run_channel(
        self,
        camera: String,
        channel_id: u64,
        transport: Transport,
        mut close_rx: oneshot::Receiver<()>,
    ) {
        let Transport {
            outbound,
            mut inbound,
        } = transport;
        let period = self.inner.timings.keepalive_interval();
        let mut keepalive = tokio::time::interval_at(Instant::now() + period, period);

        let reason = loop {
            tokio::select! {
                _ = &mut close_rx => {
                    let _ = outbound.send(Outbound::Close).await;
                    break "closed locally".to_string();
                }
                _ = keepalive.tick() => {
                    if outbound.send(Outbound::Frame(Frame::Keepalive.encode())).await.is_err() {
                        break "transport gone".to_string();
                    }
                    self.expire_pending(&camera, channel_id).await;
                }
                event = inbound.recv() => match event {
                    Some(Inbound::Frame(bytes)) => self.handle_frame(&camera, channel_id, &bytes).await,
                    Some(Inbound::Closed(reason)) => {
                        break reason.unwrap_or_else(|| "closed by peer".to_string());
                    }
                    None => break "transport gone".to_string(),
                },
            }
        };

        self.on_channel_closed(&camera, channel_id, &reason).await;
    }

    async fn handle_frame(&self, camera: &str, channel_id: u64, bytes: &[u8]) {
        let frame = match Frame::decode(bytes) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(camera, error = %e, len = bytes.len(), "Dropping undecodable control frame");
                return;
            }
        };

        match frame {
            Frame::Response(response) => self.handle_response(camera, channel_id, response).await,
            Frame::Request(request) => {
                debug!(
                    camera,
                    request_id = request.id,
                    request_type = %request_type_name(request.r#type),
                    "Request from camera"
                );
            }
            Frame::Keepalive => debug!(camera, "Keepalive from camera"),
            Frame::Unknown(kind) => debug!(camera, kind, "Ignoring unknown control frame"),
        }
    }

    async fn handle_response(&self, camera: &str, channel_id: u64, response: Response) {
        let mut sessions = self.inner.sessions.lock().await;
        let Some(session) = sessions.get_mut(camera) else {
            return;
        };
        if session.channel_id() != Some(channel_id) {
            return;
        }
        let Some(pending) = session.pending.remove(&response.request_id) else {
            debug!(
                camera,
                request_id = response.request_id,
                request_type = %request_type_name(response.request_type),
                status_code = response.status_code,
                "Response without a pending request"
            );
            return;
        };

        match pending.kind {
            RequestKind::StartStreaming => {
                if response.status_code == 200 {
                    info!(camera, "Streaming started");
                    session.state = ChannelState::Streaming;
                } else {
                    error!(
                        camera,
                        status_code = response.status_code,
                        status_message = response.status_message.as_deref().unwrap_or(""),
                        "Camera refused to start streaming"
                    );
                    session.state = ChannelState::Failed;
                }
            }
        }
    }

    async fn expire_pending(&self, camera: &str, channel_id: u64) {
        let timeout = self.inner.timings.pending_request_timeout();
        let mut sessions = self.inner.sessions.lock().await;
        let Some(session) = sessions.get_mut(camera) else {
            return;
        };
        if session.channel_id() != Some(channel_id) {
            return;
        }
        let now = Instant::now();
        session.pending.retain(|request_id, pending| {
            let expired = now.saturating_duration_since(pending.issued_at) > timeout;
            if expired {
                warn!(camera, request_id, kind = ?pending.kind, "Request timed out without a response");
            }
            !expired
        });
    }

    // ========================================================================
    // Close and reconnect
    // ========================================================================

    async fn on_channel_closed(&self, camera: &str, channel_id: u64, reason: &str) {
        let mut sessions = self.inner.sessions.lock().await;
        let Some(session) = sessions.get_mut(camera) else {
            debug!(camera, reason, "Control channel of a released camera closed");
            return;
        };
        if session.channel_id() != Some(channel_id) {
            debug!(camera, channel_id, reason, "Replaced control channel closed");
            return;
        }

        info!(camera, reason, "Control channel closed");
        session.channel = None;
        session.pending.clear();
        session.state = ChannelState::Closed;
        if let Some(target) = session.stream_target.clone() {
            self.schedule_reconnect(session, camera, target);
        }
    }

    fn schedule_reconnect(&self, session: &mut CameraSession, camera: &str, target: String) {
        session.cancel_reconnect();
        let timer_id = self.next_id();
        let delay = self.inner.timings.reconnect_delay();
        let controller = self.clone();
        let camera_id = camera.to_string();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            controller
                .run_scheduled_reconnect(&camera_id, &target, timer_id)
                .await;
        });
        session.reconnect = Some(ReconnectTimer { id: timer_id, task });
        info!(camera, delay_secs = delay.as_secs(), "Reconnect scheduled");
    }

    async fn run_scheduled_reconnect(&self, camera: &str, target: &str, timer_id: u64) {
        let (seen, epoch) = {
            let mut sessions = self.inner.sessions.lock().await;
            match sessions.get_mut(camera) {
                Some(session) if session.reconnect.as_ref().map(|t| t.id) == Some(timer_id) => {
                    // Detach without aborting: this is the timer's own task
                    session.reconnect = None;
                    (session.connect_generation, self.shutdown_epoch())
                }
                _ => return,
            }
        };

        info!(camera, "Reconnecting control channel");
        match self.inner.auth.ensure_authenticated(None).await {
            Ok(AuthOutcome::Authenticated) => {}
            Ok(AuthOutcome::MfaRequired) => {
                error!(camera, "Reconnect needs an MFA code, giving up until the next request");
                return;
            }
            Err(e) => {
                error!(camera, error = %e, "Reconnect could not authenticate");
                self.reschedule(camera, target, epoch).await;
                return;
            }
        }

        match self.connect_if_current(camera, target, Some(seen), epoch).await {
            Ok(()) => {}
            Err(StreamError::Released(_) | StreamError::ShutDown) => {}
            Err(e) => {
                error!(camera, error = %e, "Reconnect failed");
                self.reschedule(camera, target, epoch).await;
            }
        }
    }

    async fn reschedule(&self, camera: &str, target: &str, epoch: u64) {
        let mut sessions = self.inner.sessions.lock().await;
        if self.shutdown_epoch() != epoch {
            return;
        }
        if let Some(session) = sessions.get_mut(camera) {
            if session.channel.is_none() && session.reconnect.is_none() {
                self.schedule_reconnect(session, camera, target.to_string());
            }
        }
    }

    /// Close the camera's channel through the normal reconnect path.
    pub async fn force_close(&self, camera: &str) -> bool {
        let mut sessions = self.inner.sessions.lock().await;
        match sessions.get_mut(camera).and_then(|s| s.channel.as_mut()) {
            Some(channel) => {
                channel.request_close();
                true
            }
            None => false,
        }
    }

    /// Close the camera's channel for good and forget its session.
    pub async fn release(&self, camera: &str) {
        if self.inner.sessions.lock().await.remove(camera).is_some() {
            info!(camera, "Released camera");
        }
    }

    /// Close every channel and cancel every timer.
    pub async fn shutdown(&self) {
        let mut sessions = self.inner.sessions.lock().await;
        self.inner.shutdown_epoch.fetch_add(1, Ordering::AcqRel);
        for (camera, session) in sessions.iter_mut() {
            session.cancel_reconnect();
            if session.channel.take().is_some() {
                debug!(camera = %camera, "Closing control channel");
            }
            session.pending.clear();
            session.last_activity = None;
            session.state = ChannelState::Idle;
        }
        info!(cameras = sessions.len(), "Control channels shut down");
    }

    // ========================================================================
    // Ingest activity
    // ========================================================================

    /// Media arrived for `camera`.
    pub async fn record_activity(&self, camera: &str, at: Instant) {
        let mut sessions = self.inner.sessions.lock().await;
        let session = sessions
            .entry(camera.to_string())
            .or_insert_with(CameraSession::new);
        session.last_activity = Some(at);
    }

    /// Media stopped for `camera`.
    pub async fn record_stream_ended(&self, camera: &str) {
        let mut sessions = self.inner.sessions.lock().await;
        if let Some(session) = sessions.get_mut(camera) {
            session.last_activity = None;
            if session.streaming_active() {
                session.state = if session.channel.is_some() {
                    ChannelState::Connected
                } else {
                    ChannelState::Idle
                };
            }
        }
    }

    /// Clear every active stream silent for longer than `window` and close its
    /// channel. Returns the affected cameras.
    pub async fn sweep_stalled(&self, now: Instant, window: Duration) -> Vec<String> {
        let mut sessions = self.inner.sessions.lock().await;
        let mut stalled = Vec::new();
        for (camera, session) in sessions.iter_mut() {
            let Some(last) = session.last_activity else {
                continue;
            };
            if !session.streaming_active() || now.saturating_duration_since(last) <= window {
                continue;
            }
            warn!(camera = %camera, silent_secs = now.saturating_duration_since(last).as_secs(), "Stream stalled, resetting control channel");
            session.last_activity = None;
            session.state = ChannelState::Connected;
            if let Some(channel) = session.channel.as_mut() {
                channel.request_close();
            }
            stalled.push(camera.clone());
        }
        stalled
    }

    // ========================================================================
    // Inspection
    // ========================================================================

    pub async fn is_streaming_active(&self, camera: &str) -> bool {
        self.inner
            .sessions
            .lock()
            .await
            .get(camera)
            .map(CameraSession::streaming_active)
            .unwrap_or(false)
    }

    pub async fn status(&self, camera: &str) -> Option<CameraStatus> {
        let sessions = self.inner.sessions.lock().await;
        sessions.get(camera).map(|session| CameraStatus {
            state: session.state,
            streaming_active: session.streaming_active(),
            has_channel: session.channel.is_some(),
            pending_requests: session.pending.len(),
            reconnect_scheduled: session.reconnect.is_some(),
            last_activity: session.last_activity,
        })
    }
}

impl std::fmt::Debug for StreamController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamController")
            .field("ingest", &self.inner.ingest)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ApiError;
    use crate::auth::MemoryStore;
    use crate::channel::proto::{Envelope, MessageType, RequestType};
    use crate::channel::transport::OpenError;
    use crate::test_support::{live_session, FakeAccountApi, FakeConnector, FakeOpen, FakePeer};
    use prost::Message;
    use tokio::sync::mpsc::error::TryRecvError;

    struct Fixture {
        api: Arc<FakeAccountApi>,
        auth: Arc<AuthSession>,
        connector: Arc<FakeConnector>,
        controller: StreamController,
    }

    fn fixture() -> Fixture {
        let api = Arc::new(FakeAccountApi::with_cameras());
        let auth = Arc::new(live_session(api.clone(), MemoryStore::with_login("me@example.com", "pw")));
        let connector = Arc::new(FakeConnector::default());
        let controller = StreamController::new(
            api.clone(),
            auth.clone(),
            connector.clone(),
            IngestTarget::new("10.0.0.5", 1935),
            Timings::default(),
        );
        Fixture {
            api,
            auth,
            connector,
            controller,
        }
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    async fn streaming_peer(f: &Fixture) -> FakePeer {
        f.controller.ensure_streaming_active("baby1").await.unwrap();
        let mut peer = f.connector.next_peer().await;
        let request = peer.expect_start_request().await;
        peer.respond(request.id, 200).await;
        settle().await;
        peer
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_request_sent_on_open() {
        let f = fixture();
        f.controller.ensure_streaming_active("baby1").await.unwrap();

        let mut peer = f.connector.next_peer().await;
        assert_eq!(peer.stream_target, "cam1");
        assert_eq!(peer.bearer, "live");

        let request = peer.expect_start_request().await;
        assert_eq!(request.r#type, i32::from(RequestType::PutStreaming));
        let streaming = request.streaming.expect("streaming body");
        assert_eq!(streaming.rtmp_url, "rtmp://10.0.0.5:1935/live/baby1");

        let status = f.controller.status("baby1").await.unwrap();
        assert_eq!(status.state, ChannelState::Connected);
        assert_eq!(status.pending_requests, 1);
        assert!(!status.streaming_active);
    }

    #[tokio::test(start_paused = true)]
    async fn test_response_200_activates_and_fast_path_reuses() {
        let f = fixture();
        let _peer = streaming_peer(&f).await;
        assert!(f.controller.is_streaming_active("baby1").await);
        assert_eq!(f.controller.status("baby1").await.unwrap().pending_requests, 0);

        f.controller.ensure_streaming_active("baby1").await.unwrap();
        assert_eq!(f.connector.open_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_response_500_marks_failed() {
        let f = fixture();
        f.controller.ensure_streaming_active("baby1").await.unwrap();
        let mut peer = f.connector.next_peer().await;
        let request = peer.expect_start_request().await;
        peer.respond(request.id, 500).await;
        settle().await;

        assert!(!f.controller.is_streaming_active("baby1").await);
        assert_eq!(f.controller.status("baby1").await.unwrap().state, ChannelState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unmatched_response_and_garbage_ignored() {
        let f = fixture();
        f.controller.ensure_streaming_active("baby1").await.unwrap();
        let mut peer = f.connector.next_peer().await;
        let request = peer.expect_start_request().await;

        peer.respond(request.id + 1000, 200).await;
        peer.send_raw(vec![0xff, 0xff, 0xff]).await;
        settle().await;
        let status = f.controller.status("baby1").await.unwrap();
        assert!(!status.streaming_active);
        assert!(status.has_channel);
        assert_eq!(status.pending_requests, 1);

        peer.respond(request.id, 200).await;
        settle().await;
        assert!(f.controller.is_streaming_active("baby1").await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_camera_and_missing_target() {
        let f = fixture();
        assert_eq!(
            f.controller.ensure_streaming_active("nobody").await,
            Err(StreamError::UnknownCamera("nobody".to_string()))
        );
        assert_eq!(
            f.controller.ensure_streaming_active("baby2").await,
            Err(StreamError::NoStreamTarget("baby2".to_string()))
        );
        assert_eq!(f.connector.open_count(), 0);
        // Directory loaded once, then served from the cache
        assert_eq!(f.api.calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_requests_open_one_channel() {
        let f = fixture();
        let (a, b) = tokio::join!(
            f.controller.ensure_streaming_active("baby1"),
            f.controller.ensure_streaming_active("baby1")
        );
        assert_eq!(a, Ok(()));
        assert_eq!(b, Ok(()));
        assert_eq!(f.connector.open_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout() {
        let f = fixture();
        f.connector.script(FakeOpen::Hang);
        let started = Instant::now();
        assert_eq!(
            f.controller.ensure_streaming_active("baby1").await,
            Err(StreamError::ConnectTimeout)
        );
        assert!(started.elapsed() >= Duration::from_secs(30));
        assert_eq!(f.controller.status("baby1").await.unwrap().state, ChannelState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_rejection_clears_token() {
        let f = fixture();
        f.connector.script(FakeOpen::Reject(OpenError::Rejected(401)));
        let result = f.controller.ensure_streaming_active("baby1").await;
        assert!(matches!(result, Err(StreamError::ConnectRejected(_))));
        assert_eq!(f.auth.access_token().await, None);

        // The next open fails fast without a token
        assert_eq!(
            f.controller.ensure_streaming_active("baby1").await,
            Err(StreamError::NotAuthenticated)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_every_interval() {
        let f = fixture();
        let mut peer = streaming_peer(&f).await;

        tokio::time::sleep(Duration::from_secs(19)).await;
        assert!(peer.try_next_frame().is_none());
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(peer.try_next_frame(), Some(Frame::Keepalive));
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(peer.try_next_frame(), Some(Frame::Keepalive));

        peer.close().await;
        settle().await;
        peer.drain_frames();
        tokio::time::sleep(Duration::from_secs(40)).await;
        assert!(!peer.drain_frames().contains(&Frame::Keepalive));
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_expires_unanswered_request() {
        let f = fixture();
        f.controller.ensure_streaming_active("baby1").await.unwrap();
        let mut peer = f.connector.next_peer().await;
        peer.expect_start_request().await;

        tokio::time::sleep(Duration::from_secs(21)).await;
        assert_eq!(f.controller.status("baby1").await.unwrap().pending_requests, 1);
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(f.controller.status("baby1").await.unwrap().pending_requests, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_schedules_one_reconnect_each_time() {
        let f = fixture();
        let mut peer = streaming_peer(&f).await;

        for round in 0..3 {
            peer.close().await;
            settle().await;
            let status = f.controller.status("baby1").await.unwrap();
            assert!(!status.has_channel);
            assert!(!status.streaming_active);
            assert!(status.reconnect_scheduled);

            tokio::time::sleep(Duration::from_secs(29)).await;
            assert_eq!(f.connector.open_count(), round + 1);

            tokio::time::sleep(Duration::from_secs(2)).await;
            assert_eq!(f.connector.open_count(), round + 2);
            peer = f.connector.next_peer().await;
            assert_eq!(peer.stream_target, "cam1");
            assert!(matches!(f.connector.try_next_peer(), Err(TryRecvError::Empty)));
            assert!(f.controller.status("baby1").await.unwrap().has_channel);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fresh_request_cancels_scheduled_reconnect() {
        let f = fixture();
        let peer = streaming_peer(&f).await;
        peer.close().await;
        settle().await;
        assert!(f.controller.status("baby1").await.unwrap().reconnect_scheduled);

        f.controller.ensure_streaming_active("baby1").await.unwrap();
        assert_eq!(f.connector.open_count(), 2);
        assert!(!f.controller.status("baby1").await.unwrap().reconnect_scheduled);

        tokio::time::sleep(Duration::from_secs(90)).await;
        assert_eq!(f.connector.open_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_replaced_channel_close_is_ignored() {
        let f = fixture();
        let old = streaming_peer(&f).await;

        f.controller.connect("baby1", "cam1").await.unwrap();
        let _new = f.connector.next_peer().await;
        old.close().await;
        settle().await;

        let status = f.controller.status("baby1").await.unwrap();
        assert!(status.has_channel);
        assert!(!status.reconnect_scheduled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_reconnect_retries() {
        let f = fixture();
        let peer = streaming_peer(&f).await;
        f.connector.script(FakeOpen::Reject(OpenError::Failed("refused".to_string())));
        peer.close().await;
        settle().await;

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(f.connector.open_count(), 2);
        assert!(f.controller.status("baby1").await.unwrap().reconnect_scheduled);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(f.connector.open_count(), 3);
        assert!(f.controller.status("baby1").await.unwrap().has_channel);
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_stops_reconnect() {
        let f = fixture();
        let peer = streaming_peer(&f).await;
        peer.close().await;
        settle().await;

        f.controller.release("baby1").await;
        assert_eq!(f.controller.status("baby1").await, None);
        tokio::time::sleep(Duration::from_secs(90)).await;
        assert_eq!(f.connector.open_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_closes_live_channel() {
        let f = fixture();
        let mut peer = streaming_peer(&f).await;

        f.controller.release("baby1").await;
        settle().await;
        assert!(peer.saw_close().await);
        tokio::time::sleep(Duration::from_secs(90)).await;
        assert_eq!(f.connector.open_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_clears_everything() {
        let f = fixture();
        let _peer = streaming_peer(&f).await;
        f.controller.record_activity("baby1", Instant::now()).await;

        f.controller.shutdown().await;
        settle().await;
        let status = f.controller.status("baby1").await.unwrap();
        assert_eq!(status.state, ChannelState::Idle);
        assert!(!status.has_channel);
        assert_eq!(status.last_activity, None);

        tokio::time::sleep(Duration::from_secs(90)).await;
        assert_eq!(f.connector.open_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_during_connect_discards_channel() {
        let f = fixture();
        f.connector.script(FakeOpen::Delay(Duration::from_secs(5)));
        let controller = f.controller.clone();
        let connecting =
            tokio::spawn(async move { controller.ensure_streaming_active("baby1").await });
        for _ in 0..100 {
            if f.connector.open_count() == 1 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(f.connector.open_count(), 1);

        f.controller.shutdown().await;
        assert_eq!(connecting.await.unwrap(), Err(StreamError::ShutDown));

        let mut peer = f.connector.next_peer().await;
        assert!(peer.saw_close().await);
        let status = f.controller.status("baby1").await.unwrap();
        assert_eq!(status.state, ChannelState::Idle);
        assert!(!status.has_channel);
        assert!(!status.reconnect_scheduled);

        tokio::time::sleep(Duration::from_secs(90)).await;
        assert_eq!(f.connector.open_count(), 1);
        assert!(peer.drain_frames().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_requests_after_shutdown_connect_again() {
        let f = fixture();
        let _old = streaming_peer(&f).await;
        f.controller.shutdown().await;

        f.controller.ensure_streaming_active("baby1").await.unwrap();
        assert_eq!(f.connector.open_count(), 2);
        assert!(f.controller.status("baby1").await.unwrap().has_channel);
    }

    #[tokio::test(start_paused = true)]
    async fn test_directory_error_surfaces() {
        let f = fixture();
        f.api.push_babies(Err(ApiError::ServerError("down".to_string())));
        let result = f.controller.ensure_streaming_active("baby1").await;
        assert!(matches!(result, Err(StreamError::Directory(_))));
    }

    #[test]
    fn test_keepalive_frame_shape() {
        let envelope = Envelope::decode(Frame::Keepalive.encode().as_slice()).unwrap();
        assert_eq!(envelope.r#type, i32::from(MessageType::Keepalive));
    }
}
