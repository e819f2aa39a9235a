//! Client error types

use anagrafe_core::ErrorResponse;
use reqwest::StatusCode;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Maximum number of error body characters kept as a message.
const MAX_ERROR_CHARS: usize = 200;

const FALLBACK_UNAUTHORIZED: &str = "Invalid credentials. Please try again.";
const FALLBACK_SESSION_EXPIRED: &str = "Your session has expired. Please log in again.";
const FALLBACK_CONFLICT: &str = "User already registered. Try a different codice fiscale.";
const FALLBACK_UNKNOWN: &str = "Unknown error. Please try again later.";

/// Failure classes surfaced to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad credentials or an expired session that could not be refreshed
    Unauthorized,
    /// Duplicate identity
    Conflict,
    /// Malformed request
    ValidationFailed,
    /// Everything else
    NetworkOrServerError,
}

/// An error status returned by the backend
#[derive(Debug, Clone)]
pub struct ApiError {
    pub status: u16,
    /// Backend message, else the sanitized body, else the status reason
    pub message: String,
    /// Parsed error body, when the backend sent one
    pub payload: Option<ErrorResponse>,
}

impl ApiError {
    /// Build from a status and the raw response body
    pub fn from_body(status: StatusCode, body: &str) -> Self {
        let payload = serde_json::from_str::<ErrorResponse>(body).ok();
        let message = payload
            .as_ref()
            .and_then(|payload| payload.message.as_deref())
            .map(str::trim)
            .filter(|message| !message.is_empty())
            .map_or_else(|| sanitize_body(status, body), str::to_string);

        Self {
            status: status.as_u16(),
            message,
            payload,
        }
    }

    /// The `message` field of the backend error body, if any
    pub fn backend_message(&self) -> Option<&str> {
        self.payload
            .as_ref()
            .and_then(|payload| payload.message.as_deref())
            .filter(|message| !message.trim().is_empty())
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// Client error types
#[derive(Debug, Error)]
pub enum ClientError {
    /// Network or request error
    #[error("Request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// 401 from the backend
    #[error("Authentication failed: {0}")]
    Unauthorized(ApiError),

    #[error("Forbidden: {0}")]
    Forbidden(ApiError),

    #[error("Resource not found: {0}")]
    NotFound(ApiError),

    /// Duplicate identity
    #[error("Conflict: {0}")]
    Conflict(ApiError),

    /// 400 or 422 from the backend
    #[error("Validation failed: {0}")]
    ValidationFailed(ApiError),

    /// Any other error status
    #[error("Server error {}: {}", .0.status, .0.message)]
    ServerError(ApiError),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    /// The access token cannot be sent as a header value
    #[error("Invalid authorization header: {0}")]
    InvalidHeader(#[from] reqwest::header::InvalidHeaderValue),

    /// A refresh was needed but no refresh token is stored
    #[error("No refresh token available")]
    NoRefreshToken,

    /// The session ended, changed or was dropped while a refresh was in flight
    #[error("Session ended during token refresh")]
    SessionClosed,

    /// The shared token refresh failed; the session has been cleared
    #[error("Token refresh failed: {0}")]
    RefreshFailed(#[source] Arc<ClientError>),
}

impl ClientError {
    /// Create error from HTTP status code and response body
    pub fn from_status(status: StatusCode, body: &str) -> Self {
        let error = ApiError::from_body(status, body);
        match status.as_u16() {
            400 | 422 => Self::ValidationFailed(error),
            401 => Self::Unauthorized(error),
            403 => Self::Forbidden(error),
            404 => Self::NotFound(error),
            409 => Self::Conflict(error),
            _ => Self::ServerError(error),
        }
    }

    /// The backend error behind this failure, looking through refresh failures
    pub fn api_error(&self) -> Option<&ApiError> {
        match self {
            Self::Unauthorized(error)
            | Self::Forbidden(error)
            | Self::NotFound(error)
            | Self::Conflict(error)
            | Self::ValidationFailed(error)
            | Self::ServerError(error) => Some(error),
            Self::RefreshFailed(inner) => inner.api_error(),
            _ => None,
        }
    }

    /// HTTP status of the backend error, if there was one
    pub fn status(&self) -> Option<u16> {
        self.api_error().map(|error| error.status)
    }

    /// Failure class of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Unauthorized(_)
            | Self::NoRefreshToken
            | Self::SessionClosed
            | Self::RefreshFailed(_) => ErrorKind::Unauthorized,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::ValidationFailed(_) => ErrorKind::ValidationFailed,
            _ => ErrorKind::NetworkOrServerError,
        }
    }

    /// Whether the caller should be sent back to the login entry point
    pub fn requires_login(&self) -> bool {
        self.kind() == ErrorKind::Unauthorized
    }

    /// Message to show to the end user
    ///
    /// The backend's own message wins; otherwise a fallback for the failure class.
    pub fn user_message(&self) -> String {
        if let Some(message) = self.api_error().and_then(ApiError::backend_message) {
            return message.to_string();
        }

        let fallback = match self {
            Self::NoRefreshToken | Self::SessionClosed | Self::RefreshFailed(_) => {
                FALLBACK_SESSION_EXPIRED
            }
            Self::Unauthorized(_) => FALLBACK_UNAUTHORIZED,
            Self::Conflict(_) => FALLBACK_CONFLICT,
            _ => FALLBACK_UNKNOWN,
        };
        fallback.to_string()
    }
}

/// Trim and truncate an error body; empty bodies fall back to the status reason.
fn sanitize_body(status: StatusCode, body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        status
            .canonical_reason()
            .unwrap_or("Request failed")
            .to_string()
    } else {
        trimmed.chars().take(MAX_ERROR_CHARS).collect()
    }
}
