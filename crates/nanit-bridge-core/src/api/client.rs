//! API client for the Nanit account service.
//!
//! This module provides the `NanitClient` struct for the four account calls
//! the bridge needs: the authenticated baby list (also used as a token probe),
//! token refresh, password login and MFA login.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, warn};

use super::ApiError;

// ============================================================================
// Constants
// ============================================================================

/// Base URL for the account API
pub const DEFAULT_API_BASE_URL: &str = "https://api.nanit.com";

/// Version header required on every account call
const API_VERSION_HEADER: &str = "nanit-api-version";
const API_VERSION: &str = "1";

/// HTTP request timeout in seconds.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Maximum number of retries for rate-limited (429) requests.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Initial backoff delay in milliseconds for rate limiting.
const INITIAL_BACKOFF_MS: u64 = 1000;

// ============================================================================
// Wire models
// ============================================================================

/// A baby profile on the account. `uid` is the stable camera identifier used
/// throughout the bridge; `camera_uid` is the stream target for its control channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Baby {
    pub uid: String,
    pub name: String,
    #[serde(default)]
    pub camera_uid: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BabiesResponse {
    #[serde(default)]
    babies: Vec<Baby>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
}

/// Result of a password login.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginOutcome {
    /// The account has MFA enabled; a code must be submitted with this challenge.
    MfaRequired { mfa_token: String },
    /// The account issued tokens directly.
    Tokens(TokenPair),
}

#[derive(Debug, Default, Deserialize)]
struct LoginResponse {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    mfa_token: Option<String>,
}

impl LoginResponse {
    fn into_outcome(self) -> Option<LoginOutcome> {
        match (self.access_token, self.refresh_token, self.mfa_token) {
            (Some(access_token), Some(refresh_token), _) if !access_token.is_empty() => {
                Some(LoginOutcome::Tokens(TokenPair {
                    access_token,
                    refresh_token,
                }))
            }
            (_, _, Some(mfa_token)) if !mfa_token.is_empty() => {
                Some(LoginOutcome::MfaRequired { mfa_token })
            }
            _ => None,
        }
    }
}

#[derive(Serialize)]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
}

#[derive(Serialize)]
struct LoginRequest<'a> {
    email: &'a str,
    password: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    mfa_token: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    mfa_code: Option<&'a str>,
}

// ============================================================================
// AccountApi
// ============================================================================

/// The remote account operations used by the auth session and the stream controller.
#[async_trait]
pub trait AccountApi: Send + Sync {
    /// `GET /babies`. A rejected token yields `ApiError::Unauthorized`.
    async fn list_babies(&self, access_token: &str) -> Result<Vec<Baby>, ApiError>;

    /// `POST /tokens/refresh`
    async fn refresh_tokens(&self, refresh_token: &str) -> Result<TokenPair, ApiError>;

    /// `POST /login` with email and password only.
    async fn login(&self, email: &str, password: &str) -> Result<LoginOutcome, ApiError>;

    /// `POST /login` completing a pending MFA challenge.
    async fn login_mfa(
        &self,
        email: &str,
        password: &str,
        mfa_token: &str,
        mfa_code: &str,
    ) -> Result<TokenPair, ApiError>;
}

/// API client for the Nanit account service.
#[derive(Clone)]
pub struct NanitClient {
    client: Client,
    base_url: String,
}

impl NanitClient {
    pub fn with_base_url(base_url: &str) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Send a request, retrying with exponential backoff while rate limited.
    /// Returns the response for any other status so callers can inspect error bodies.
    async fn send(&self, build: impl Fn() -> RequestBuilder) -> Result<Response, ApiError> {
        let mut retries = 0;
        let mut backoff_ms = INITIAL_BACKOFF_MS;

        loop {
            let response = build()
                .header(API_VERSION_HEADER, API_VERSION)
                .send()
                .await?;

            if response.status().as_u16() != 429 {
                return Ok(response);
            }

            retries += 1;
            if retries > MAX_RATE_LIMIT_RETRIES {
                return Err(ApiError::RateLimited);
            }
            warn!(url = %response.url(), retry = retries, backoff_ms = backoff_ms, "Rate limited, backing off");
            tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
            backoff_ms *= 2; // Exponential backoff
        }
    }

    /// Check if response is successful, returning an error with body if not.
    async fn check_response(response: Response) -> Result<Response, ApiError> {
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(ApiError::from_status(status, &body))
        }
    }

    async fn parse<T: DeserializeOwned>(response: Response) -> Result<T, ApiError> {
        let text = response.text().await?;
        serde_json::from_str(&text).map_err(|e| ApiError::InvalidResponse(e.to_string()))
    }
}

#[async_trait]
impl AccountApi for NanitClient {
    async fn list_babies(&self, access_token: &str) -> Result<Vec<Baby>, ApiError> {
        let url = self.url("/babies");
        // The account API takes the raw token, without a Bearer prefix
        let response = self
            .send(|| self.client.get(&url).header(reqwest::header::AUTHORIZATION, access_token))
            .await?;
        let response = Self::check_response(response).await?;
        let parsed: BabiesResponse = Self::parse(response).await?;
        debug!(count = parsed.babies.len(), "Fetched babies");
        Ok(parsed.babies)
    }

    async fn refresh_tokens(&self, refresh_token: &str) -> Result<TokenPair, ApiError> {
        let url = self.url("/tokens/refresh");
        let body = RefreshRequest { refresh_token };
        let response = self.send(|| self.client.post(&url).json(&body)).await?;
        let response = Self::check_response(response).await?;
        Self::parse(response).await
    }

    async fn login(&self, email: &str, password: &str) -> Result<LoginOutcome, ApiError> {
        let url = self.url("/login");
        let body = LoginRequest {
            email,
            password,
            mfa_token: None,
            mfa_code: None,
        };
        let response = self.send(|| self.client.post(&url).json(&body)).await?;
        let status = response.status();
        let text = response.text().await?;

        if status.is_success() {
            let parsed: LoginResponse = serde_json::from_str(&text)
                .map_err(|e| ApiError::InvalidResponse(e.to_string()))?;
            return parsed.into_outcome().ok_or_else(|| {
                ApiError::InvalidResponse("login response carried neither tokens nor mfa_token".to_string())
            });
        }

        // MFA-enabled accounts answer the first login with an error status whose body
        // carries the challenge token
        if let Ok(LoginResponse {
            mfa_token: Some(mfa_token),
            ..
        }) = serde_json::from_str::<LoginResponse>(&text)
        {
            if !mfa_token.is_empty() {
                debug!(%status, "MFA challenge received from error response");
                return Ok(LoginOutcome::MfaRequired { mfa_token });
            }
        }

        Err(ApiError::from_status(status, &text))
    }

    async fn login_mfa(
        &self,
        email: &str,
        password: &str,
        mfa_token: &str,
        mfa_code: &str,
    ) -> Result<TokenPair, ApiError> {
        let url = self.url("/login");
        let body = LoginRequest {
            email,
            password,
            mfa_token: Some(mfa_token),
            mfa_code: Some(mfa_code),
        };
        let response = self.send(|| self.client.post(&url).json(&body)).await?;
        let response = Self::check_response(response).await?;
        Self::parse(response).await
    }
}
