//! Fakes shared by the unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;

use crate::api::{AccountApi, ApiError, Baby, LoginOutcome, TokenPair};
use crate::auth::{AuthSession, CredentialKey, CredentialStore, MemoryStore};
use crate::channel::proto::{Frame, Request, RequestType, Response};
use crate::channel::transport::{Connector, Inbound, OpenError, Outbound, Transport};
use crate::clock::Clock;

// ============================================================================
// Clock
// ============================================================================

pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl Default for ManualClock {
    fn default() -> Self {
        let start = Utc
            .with_ymd_and_hms(2024, 3, 1, 8, 0, 0)
            .single()
            .unwrap_or_default();
        Self {
            now: Mutex::new(start),
        }
    }
}

impl ManualClock {
    pub fn advance(&self, by: Duration) {
        *self.now.lock().unwrap() += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

// ============================================================================
// Account API
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiCall {
    ListBabies(String),
    Refresh(String),
    Login,
    LoginMfa { mfa_token: String, mfa_code: String },
}

/// Scripted account API. Unscripted calls fall back to: the default camera
/// list, a 401 on refresh, and a server error on login.
#[derive(Default)]
pub struct FakeAccountApi {
    cameras: Vec<Baby>,
    calls: Mutex<Vec<ApiCall>>,
    babies: Mutex<VecDeque<Result<Vec<Baby>, ApiError>>>,
    refresh: Mutex<VecDeque<Result<TokenPair, ApiError>>>,
    login: Mutex<VecDeque<Result<LoginOutcome, ApiError>>>,
    login_mfa: Mutex<VecDeque<Result<TokenPair, ApiError>>>,
}

impl FakeAccountApi {
    /// `baby1` streams through `cam1`; `baby2` has no camera.
    pub fn with_cameras() -> Self {
        Self {
            cameras: vec![
                Baby {
                    uid: "baby1".to_string(),
                    name: "Nursery".to_string(),
                    camera_uid: Some("cam1".to_string()),
                },
                Baby {
                    uid: "baby2".to_string(),
                    name: "Guest room".to_string(),
                    camera_uid: None,
                },
            ],
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<ApiCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn push_babies(&self, result: Result<Vec<Baby>, ApiError>) {
        self.babies.lock().unwrap().push_back(result);
    }

    pub fn push_refresh(&self, result: Result<TokenPair, ApiError>) {
        self.refresh.lock().unwrap().push_back(result);
    }

    pub fn push_login(&self, result: Result<LoginOutcome, ApiError>) {
        self.login.lock().unwrap().push_back(result);
    }

    pub fn push_login_mfa(&self, result: Result<TokenPair, ApiError>) {
        self.login_mfa.lock().unwrap().push_back(result);
    }

    fn record(&self, call: ApiCall) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl AccountApi for FakeAccountApi {
    async fn list_babies(&self, access_token: &str) -> Result<Vec<Baby>, ApiError> {
        self.record(ApiCall::ListBabies(access_token.to_string()));
        tokio::task::yield_now().await;
        let next = self.babies.lock().unwrap().pop_front();
        next.unwrap_or_else(|| Ok(self.cameras.clone()))
    }

    async fn refresh_tokens(&self, refresh_token: &str) -> Result<TokenPair, ApiError> {
        self.record(ApiCall::Refresh(refresh_token.to_string()));
        tokio::task::yield_now().await;
        let next = self.refresh.lock().unwrap().pop_front();
        next.unwrap_or(Err(ApiError::Unauthorized))
    }

    async fn login(&self, _email: &str, _password: &str) -> Result<LoginOutcome, ApiError> {
        self.record(ApiCall::Login);
        tokio::task::yield_now().await;
        let next = self.login.lock().unwrap().pop_front();
        next.unwrap_or_else(|| Err(ApiError::ServerError("unscripted login".to_string())))
    }

    async fn login_mfa(
        &self,
        _email: &str,
        _password: &str,
        mfa_token: &str,
        mfa_code: &str,
    ) -> Result<TokenPair, ApiError> {
        self.record(ApiCall::LoginMfa {
            mfa_token: mfa_token.to_string(),
            mfa_code: mfa_code.to_string(),
        });
        tokio::task::yield_now().await;
        let next = self.login_mfa.lock().unwrap().pop_front();
        next.unwrap_or_else(|| Err(ApiError::ServerError("unscripted MFA login".to_string())))
    }
}

/// Session whose store already holds the live access token `live`.
pub fn live_session(api: Arc<FakeAccountApi>, store: MemoryStore) -> AuthSession {
    let clock = Arc::new(ManualClock::default());
    store.put(CredentialKey::AccessToken, "live").unwrap();
    let expiry = clock.now() + Duration::hours(1);
    store
        .put(CredentialKey::Expiration, &expiry.timestamp_millis().to_string())
        .unwrap();
    AuthSession::new(api, Arc::new(store), clock)
}

// ============================================================================
// Control channel
// ============================================================================

pub enum FakeOpen {
    Accept,
    Reject(OpenError),
    /// Never resolves; the caller's timeout decides
    Hang,
    /// Accepts after the given delay
    Delay(std::time::Duration),
}

/// Camera side of a fake channel.
pub struct FakePeer {
    pub stream_target: String,
    pub bearer: String,
    outbound: mpsc::Receiver<Outbound>,
    inbound: mpsc::Sender<Inbound>,
}

impl FakePeer {
    pub async fn expect_start_request(&mut self) -> Request {
        match self.outbound.recv().await {
            Some(Outbound::Frame(bytes)) => match Frame::decode(&bytes).unwrap() {
                Frame::Request(request) => request,
                other => panic!("expected a request, got {:?}", other),
            },
            other => panic!("expected a frame, got {:?}", other),
        }
    }

    pub fn try_next_frame(&mut self) -> Option<Frame> {
        match self.outbound.try_recv() {
            Ok(Outbound::Frame(bytes)) => Some(Frame::decode(&bytes).unwrap()),
            _ => None,
        }
    }

    /// Every frame queued so far, skipping close requests
    pub fn drain_frames(&mut self) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Ok(outbound) = self.outbound.try_recv() {
            if let Outbound::Frame(bytes) = outbound {
                frames.push(Frame::decode(&bytes).unwrap());
            }
        }
        frames
    }

    /// Drain frames until the controller asks to close
    pub async fn saw_close(&mut self) -> bool {
        loop {
            match self.outbound.recv().await {
                Some(Outbound::Close) => return true,
                Some(Outbound::Frame(_)) => continue,
                None => return false,
            }
        }
    }

    pub async fn respond(&self, request_id: i32, status_code: i32) {
        let frame = Frame::Response(Response {
            request_id,
            request_type: RequestType::PutStreaming.into(),
            status_code,
            status_message: (status_code != 200).then(|| "error".to_string()),
        });
        self.send_raw(frame.encode()).await;
    }

    pub async fn send_raw(&self, bytes: Vec<u8>) {
        let _ = self.inbound.send(Inbound::Frame(bytes)).await;
    }

    pub async fn close(&self) {
        let _ = self
            .inbound
            .send(Inbound::Closed(Some("1006 peer went away".to_string())))
            .await;
    }
}

pub struct FakeConnector {
    opens: AtomicUsize,
    script: Mutex<VecDeque<FakeOpen>>,
    peers_tx: mpsc::UnboundedSender<FakePeer>,
    peers_rx: Mutex<mpsc::UnboundedReceiver<FakePeer>>,
}

impl Default for FakeConnector {
    fn default() -> Self {
        let (peers_tx, peers_rx) = mpsc::unbounded_channel();
        Self {
            opens: AtomicUsize::new(0),
            script: Mutex::new(VecDeque::new()),
            peers_tx,
            peers_rx: Mutex::new(peers_rx),
        }
    }
}

impl FakeConnector {
    /// Outcome of the next open; unscripted opens are accepted
    pub fn script(&self, outcome: FakeOpen) {
        self.script.lock().unwrap().push_back(outcome);
    }

    /// Open attempts so far, including failed ones
    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn try_next_peer(&self) -> Result<FakePeer, TryRecvError> {
        self.peers_rx.lock().unwrap().try_recv()
    }

    pub async fn next_peer(&self) -> FakePeer {
        for _ in 0..100 {
            if let Ok(peer) = self.try_next_peer() {
                return peer;
            }
            tokio::task::yield_now().await;
        }
        panic!("no channel was opened");
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn open(&self, stream_target: &str, bearer_token: &str) -> Result<Transport, OpenError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;
        let next = self.script.lock().unwrap().pop_front();
        match next.unwrap_or(FakeOpen::Accept) {
            FakeOpen::Accept => {}
            FakeOpen::Delay(by) => tokio::time::sleep(by).await,
            FakeOpen::Reject(e) => return Err(e),
            FakeOpen::Hang => std::future::pending().await,
        }

        let (outbound_tx, outbound_rx) = mpsc::channel(32);
        let (inbound_tx, inbound_rx) = mpsc::channel(32);
        let peer = FakePeer {
            stream_target: stream_target.to_string(),
            bearer: bearer_token.to_string(),
            outbound: outbound_rx,
            inbound: inbound_tx,
        };
        let _ = self.peers_tx.send(peer);
        Ok(Transport {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}
