use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::credentials::{CredentialKey, CredentialStore};
use crate::api::{AccountApi, ApiError, LoginOutcome, TokenPair};
use crate::clock::Clock;

/// Nominal access token validity. The account API does not report expiry,
/// so a fresh token is assumed good for 4 hours.
pub const TOKEN_VALIDITY_HOURS: i64 = 4;

/// Consecutive 401 rejections tolerated before authentication gives up.
const MAX_CONSECUTIVE_FAILURES: u32 = 2;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("Email and password required")]
    MissingCredentials,

    #[error("Failed to verify access token: {0}")]
    VerifyFailed(String),

    #[error("Exceeded consecutive authentication failures")]
    ExceededRetries,

    #[error("Login failed: {0}")]
    LoginFailed(String),

    #[error("Login with MFA code failed: {0}")]
    MfaFailed(String),

    #[error("Credential storage error: {0}")]
    Storage(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Unauthenticated,
    AwaitingMfa,
    Authenticated,
}

/// Successful result of [`AuthSession::ensure_authenticated`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthOutcome {
    Authenticated,
    /// A challenge was issued; call again with the code the user received.
    MfaRequired,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credential {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: Option<DateTime<Utc>>,
    /// Never persisted; cleared once a MFA login consumes it.
    pub mfa_challenge_token: Option<String>,
}

impl Credential {
    pub fn has_live_access_token(&self, now: DateTime<Utc>) -> bool {
        !self.access_token.is_empty() && self.expires_at.map(|at| at > now).unwrap_or(false)
    }

    /// Load the persisted fields, keeping any in-memory MFA challenge.
    fn reload(&mut self, store: &dyn CredentialStore) -> Result<(), AuthError> {
        let get = |key| {
            store
                .get(key)
                .map_err(|e| AuthError::Storage(e.to_string()))
                .map(Option::unwrap_or_default)
        };
        self.access_token = get(CredentialKey::AccessToken)?;
        self.refresh_token = get(CredentialKey::RefreshToken)?;
        self.expires_at = get(CredentialKey::Expiration)?
            .parse::<i64>()
            .ok()
            .and_then(DateTime::from_timestamp_millis);
        Ok(())
    }
}

struct SessionInner {
    credential: Credential,
    state: AuthState,
    failed_count: u32,
    last_outcome: Option<Result<AuthOutcome, AuthError>>,
}

/// Owns the token lifecycle and hands out bearer credentials.
///
/// Concurrent `ensure_authenticated` calls are serialized; a caller that
/// waited while another attempt completed takes that attempt's result
/// instead of starting a new one.
pub struct AuthSession {
    api: Arc<dyn AccountApi>,
    store: Arc<dyn CredentialStore>,
    clock: Arc<dyn Clock>,
    token_validity: Duration,
    inner: Mutex<SessionInner>,
    completed_attempts: AtomicU64,
}

impl AuthSession {
    pub fn new(
        api: Arc<dyn AccountApi>,
        store: Arc<dyn CredentialStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let mut credential = Credential::default();
        if let Err(e) = credential.reload(store.as_ref()) {
            warn!(error = %e, "Failed to load stored tokens");
        }
        Self {
            api,
            store,
            clock,
            token_validity: Duration::hours(TOKEN_VALIDITY_HOURS),
            inner: Mutex::new(SessionInner {
                credential,
                state: AuthState::Unauthenticated,
                failed_count: 0,
                last_outcome: None,
            }),
            completed_attempts: AtomicU64::new(0),
        }
    }

    pub fn with_token_validity(mut self, validity: std::time::Duration) -> Self {
        self.token_validity =
            Duration::from_std(validity).unwrap_or_else(|_| Duration::hours(TOKEN_VALIDITY_HOURS));
        self
    }

    /// Current bearer token, if one has been acquired
    pub async fn access_token(&self) -> Option<String> {
        let inner = self.inner.lock().await;
        let token = &inner.credential.access_token;
        (!token.is_empty()).then(|| token.clone())
    }

    pub async fn state(&self) -> AuthState {
        self.inner.lock().await.state
    }

    pub async fn failed_count(&self) -> u32 {
        self.inner.lock().await.failed_count
    }

    pub async fn credential(&self) -> Credential {
        self.inner.lock().await.credential.clone()
    }

    /// Produce a valid bearer credential, choosing between token reuse,
    /// refresh, password login and MFA continuation.
    pub async fn ensure_authenticated(
        &self,
        mfa_code: Option<&str>,
    ) -> Result<AuthOutcome, AuthError> {
        let mfa_code = mfa_code.map(str::trim).filter(|code| !code.is_empty());
        let seen = self.completed_attempts.load(Ordering::Acquire);
        let mut inner = self.inner.lock().await;

        if mfa_code.is_none() && self.completed_attempts.load(Ordering::Acquire) != seen {
            if let Some(outcome) = inner.last_outcome.clone() {
                debug!("Reusing result of concurrent authentication attempt");
                return outcome;
            }
        }

        let outcome = self.authenticate(&mut inner, mfa_code).await;
        inner.last_outcome = Some(outcome.clone());
        self.completed_attempts.fetch_add(1, Ordering::Release);
        outcome
    }

    async fn authenticate(
        &self,
        inner: &mut SessionInner,
        mfa_code: Option<&str>,
    ) -> Result<AuthOutcome, AuthError> {
        let (email, password) = self.login_credentials()?;
        inner.credential.reload(self.store.as_ref())?;

        // Stored token that has not expired: verify it against the account API
        while inner.credential.has_live_access_token(self.clock.now()) {
            debug!("Access token exists and is not expired, verifying");
            match self.api.list_babies(&inner.credential.access_token).await {
                Ok(_) => {
                    inner.failed_count = 0;
                    inner.state = AuthState::Authenticated;
                    debug!("Token verified successfully");
                    return Ok(AuthOutcome::Authenticated);
                }
                Err(ApiError::Unauthorized) if inner.failed_count < MAX_CONSECUTIVE_FAILURES => {
                    inner.failed_count += 1;
                    debug!(failed_count = inner.failed_count, "Token invalid (401), clearing and retrying");
                    self.clear_access_token(inner);
                }
                Err(ApiError::Unauthorized) => {
                    error!(failed_count = inner.failed_count, "Token rejected too many times");
                    self.clear_access_token(inner);
                    return Err(AuthError::ExceededRetries);
                }
                Err(e) => {
                    warn!(error = %e, "Token verification failed");
                    return Err(AuthError::VerifyFailed(e.to_string()));
                }
            }
        }

        if !inner.credential.refresh_token.is_empty() {
            debug!("Using refresh token to get new access token");
            match self.api.refresh_tokens(&inner.credential.refresh_token).await {
                Ok(tokens) => {
                    self.store_tokens(inner, tokens);
                    info!("Access token refreshed successfully");
                    return Ok(AuthOutcome::Authenticated);
                }
                Err(e) => {
                    debug!(error = %e, "Failed to refresh token, will try full login");
                }
            }
        }

        let challenge = inner.credential.mfa_challenge_token.clone();
        match (mfa_code, challenge) {
            (Some(code), Some(challenge)) => {
                debug!("Performing login with MFA code");
                match self.api.login_mfa(&email, &password, &challenge, code).await {
                    Ok(tokens) => {
                        self.store_tokens(inner, tokens);
                        info!("Login with MFA successful");
                        Ok(AuthOutcome::Authenticated)
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to login with MFA");
                        Err(AuthError::MfaFailed(e.to_string()))
                    }
                }
            }
            _ => {
                debug!("Performing initial login");
                match self.api.login(&email, &password).await {
                    Ok(LoginOutcome::MfaRequired { mfa_token }) => {
                        inner.credential.mfa_challenge_token = Some(mfa_token);
                        inner.state = AuthState::AwaitingMfa;
                        info!("Initial login accepted, MFA code required");
                        Ok(AuthOutcome::MfaRequired)
                    }
                    Ok(LoginOutcome::Tokens(tokens)) => {
                        self.store_tokens(inner, tokens);
                        info!("Login successful");
                        Ok(AuthOutcome::Authenticated)
                    }
                    Err(e) => {
                        error!(error = %e, "Failed initial login");
                        Err(AuthError::LoginFailed(e.to_string()))
                    }
                }
            }
        }
    }

    fn login_credentials(&self) -> Result<(String, String), AuthError> {
        let get = |key| {
            self.store
                .get(key)
                .map_err(|e| AuthError::Storage(e.to_string()))
        };
        match (get(CredentialKey::Email)?, get(CredentialKey::Password)?) {
            (Some(email), Some(password)) if !email.is_empty() && !password.is_empty() => {
                Ok((email, password))
            }
            _ => Err(AuthError::MissingCredentials),
        }
    }

    fn store_tokens(&self, inner: &mut SessionInner, tokens: TokenPair) {
        let expires_at = self.clock.now() + self.token_validity;
        inner.credential.access_token = tokens.access_token;
        inner.credential.refresh_token = tokens.refresh_token;
        inner.credential.expires_at = Some(expires_at);
        inner.credential.mfa_challenge_token = None;
        inner.failed_count = 0;
        inner.state = AuthState::Authenticated;

        let writes = [
            (CredentialKey::AccessToken, inner.credential.access_token.clone()),
            (CredentialKey::RefreshToken, inner.credential.refresh_token.clone()),
            (CredentialKey::Expiration, expires_at.timestamp_millis().to_string()),
        ];
        for (key, value) in writes {
            if let Err(e) = self.store.put(key, &value) {
                warn!(key = key.as_str(), error = %e, "Failed to persist token");
            }
        }
    }

    fn clear_access_token(&self, inner: &mut SessionInner) {
        inner.credential.access_token.clear();
        inner.state = AuthState::Unauthenticated;
        if let Err(e) = self.store.delete(CredentialKey::AccessToken) {
            warn!(error = %e, "Failed to clear stored access token");
        }
    }

    /// Forced reset after the token was rejected elsewhere (e.g. by the control
    /// channel). Only the access token is dropped; refresh token and login stay.
    pub async fn invalidate_access_token(&self) {
        let mut inner = self.inner.lock().await;
        info!("Clearing access token, next request will re-authenticate");
        self.clear_access_token(&mut inner);
    }

    /// Replace the account login. Any token or pending challenge belongs to the
    /// previous login, so the access token and challenge are dropped.
    pub async fn update_login(&self, email: &str, password: &str) -> Result<(), AuthError> {
        let mut inner = self.inner.lock().await;
        for (key, value) in [(CredentialKey::Email, email), (CredentialKey::Password, password)] {
            self.store
                .put(key, value)
                .map_err(|e| AuthError::Storage(e.to_string()))?;
        }
        inner.credential.mfa_challenge_token = None;
        self.clear_access_token(&mut inner);
        Ok(())
    }
}
