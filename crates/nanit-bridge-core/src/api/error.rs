use thiserror::Error;

/// Failure talking to the Nanit account service. `Clone` so a coalesced
/// authentication result can be handed to every waiter.
#[derive(Error, Debug, Clone)]
pub enum ApiError {
    #[error("Account service refused the request: {0}")]
    AccessDenied(String),

    #[error("Access token rejected")]
    Unauthorized,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Account service rate limit hit, retries exhausted")]
    RateLimited,

    #[error("Account service error: {0}")]
    ServerError(String),

    #[error("Could not reach account service: {0}")]
    NetworkError(String),

    #[error("Unexpected response from account service: {0}")]
    InvalidResponse(String),
}

/// Response bodies kept in error messages are cut to this many bytes
const MAX_BODY_BYTES: usize = 500;

impl From<reqwest::Error> for ApiError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            ApiError::InvalidResponse(e.to_string())
        } else {
            ApiError::NetworkError(e.to_string())
        }
    }
}

impl ApiError {
    fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_BODY_BYTES {
            return body.to_string();
        }
        let end = (0..=MAX_BODY_BYTES)
            .rev()
            .find(|&i| body.is_char_boundary(i))
            .unwrap_or(0);
        format!("{}... ({} bytes total)", &body[..end], body.len())
    }

    /// Map a non-success status. Only 401 counts as a token rejection.
    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        let body = Self::truncate_body(body);
        match status.as_u16() {
            401 => ApiError::Unauthorized,
            403 => ApiError::AccessDenied(body),
            404 => ApiError::NotFound(body),
            429 => ApiError::RateLimited,
            code @ 500..=599 => ApiError::ServerError(format!("{} {}", code, body)),
            _ => ApiError::InvalidResponse(format!("{}: {}", status, body)),
        }
    }

    pub fn is_unauthorized(&self) -> bool {
        matches!(self, ApiError::Unauthorized)
    }
}
