//! Entry point for the device layer.
//!
//! `NanitBridge` wires the account session, the control channels and the
//! stream reconciler together. Media requests authenticate first, then make
//! sure the camera is pushing to the local ingest server, and finally hand
//! back where to read the stream from.

use std::sync::Arc;

use anyhow::Context;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::info;

use crate::api::{AccountApi, Baby, NanitClient};
use crate::auth::{AuthError, AuthOutcome, AuthSession, CredentialKey, CredentialStore};
use crate::channel::{CameraStatus, Connector, StreamController, StreamError, WsConnector};
use crate::clock::SystemClock;
use crate::config::{Config, IngestTarget, Timings};
use crate::reconciler::{IngestNotifier, ReconcilerHandle, StreamReconciler};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BridgeError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Stream(#[from] StreamError),

    #[error("MFA code required, check your email or phone and log in with the code")]
    MfaRequired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Video,
    Picture,
}

/// Where and how to read a camera's media from the local ingest server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MediaSource {
    pub camera: String,
    pub kind: MediaKind,
    pub url: String,
    /// ffmpeg input arguments
    pub input_arguments: Vec<String>,
}

impl MediaSource {
    fn video(camera: &str, url: String) -> Self {
        Self {
            camera: camera.to_string(),
            kind: MediaKind::Video,
            input_arguments: vec!["-i".to_string(), url.clone()],
            url,
        }
    }

    fn picture(camera: &str, url: String) -> Self {
        let input_arguments = ["-i", url.as_str(), "-vframes", "1", "-q:v", "2"]
            .iter()
            .map(|arg| arg.to_string())
            .collect();
        Self {
            camera: camera.to_string(),
            kind: MediaKind::Picture,
            input_arguments,
            url,
        }
    }
}

pub struct NanitBridge {
    auth: Arc<AuthSession>,
    controller: StreamController,
    notifier: IngestNotifier,
    reconciler: Mutex<Option<ReconcilerHandle>>,
}

impl NanitBridge {
    /// Must be called inside a tokio runtime; the reconciler starts immediately.
    pub fn new(
        api: Arc<dyn AccountApi>,
        auth: Arc<AuthSession>,
        connector: Arc<dyn Connector>,
        ingest: IngestTarget,
        timings: Timings,
    ) -> Self {
        let controller = StreamController::new(api, auth.clone(), connector, ingest, timings);
        let reconciler = StreamReconciler::new(controller.clone(), &timings).spawn();
        Self {
            auth,
            controller,
            notifier: reconciler.notifier(),
            reconciler: Mutex::new(Some(reconciler)),
        }
    }

    /// Build the production stack from configuration. Email and password from
    /// the configuration replace the stored login when they differ.
    pub async fn from_config(config: &Config) -> anyhow::Result<Self> {
        let api: Arc<dyn AccountApi> = Arc::new(NanitClient::with_base_url(&config.api_base_url)?);
        let store = config.credential_store()?;
        let ingest = config.ingest_target()?;
        info!(host = %ingest.host, port = ingest.port, "Ingest target");

        let auth = Arc::new(
            AuthSession::new(api.clone(), store.clone(), Arc::new(SystemClock))
                .with_token_validity(config.timings.token_validity()),
        );

        if let (Some(email), Some(password)) = (&config.email, &config.password) {
            let stored_email = store.get(CredentialKey::Email)?;
            let stored_password = store.get(CredentialKey::Password)?;
            if stored_email.as_deref() != Some(email.as_str())
                || stored_password.as_deref() != Some(password.as_str())
            {
                info!("Account login changed, resetting session");
                auth.update_login(email, password)
                    .await
                    .context("Failed to store account login")?;
            }
        }

        let connector = Arc::new(WsConnector::new(&config.control_base_url));
        Ok(Self::new(api, auth, connector, ingest, config.timings))
    }

    pub fn auth(&self) -> &Arc<AuthSession> {
        &self.auth
    }

    pub fn controller(&self) -> &StreamController {
        &self.controller
    }

    /// Publish/unpublish reporting for the ingest server
    pub fn notifier(&self) -> IngestNotifier {
        self.notifier.clone()
    }

    /// Authenticate, continuing a pending MFA challenge when a code is given.
    pub async fn login(&self, mfa_code: Option<&str>) -> Result<AuthOutcome, AuthError> {
        self.auth.ensure_authenticated(mfa_code).await
    }

    pub async fn update_login(&self, email: &str, password: &str) -> Result<(), AuthError> {
        self.auth.update_login(email, password).await
    }

    async fn authenticate(&self) -> Result<(), BridgeError> {
        match self.auth.ensure_authenticated(None).await? {
            AuthOutcome::Authenticated => Ok(()),
            AuthOutcome::MfaRequired => Err(BridgeError::MfaRequired),
        }
    }

    /// Load the account's cameras
    pub async fn sync_devices(&self) -> Result<Vec<Baby>, BridgeError> {
        self.authenticate().await?;
        let cameras = self.controller.refresh_cameras().await?;
        info!(count = cameras.len(), "Synced cameras");
        Ok(cameras)
    }

    pub async fn request_stream(&self, camera: &str) -> Result<MediaSource, BridgeError> {
        self.authenticate().await?;
        self.controller.ensure_streaming_active(camera).await?;
        Ok(MediaSource::video(camera, self.controller.ingest().url_for(camera)))
    }

    pub async fn take_picture(&self, camera: &str) -> Result<MediaSource, BridgeError> {
        self.authenticate().await?;
        self.controller.ensure_streaming_active(camera).await?;
        Ok(MediaSource::picture(camera, self.controller.ingest().url_for(camera)))
    }

    pub async fn camera_status(&self, camera: &str) -> Option<CameraStatus> {
        self.controller.status(camera).await
    }

    /// The device was removed: close its channel without reconnecting.
    pub async fn release_device(&self, camera: &str) {
        self.controller.release(camera).await;
    }

    /// Close every channel and stop the reconciler.
    pub async fn shutdown(&self) {
        self.controller.shutdown().await;
        if let Some(reconciler) = self.reconciler.lock().await.take() {
            reconciler.shutdown().await;
        }
        info!("Bridge stopped");
    }
}
