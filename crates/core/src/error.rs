//! Error types shared across crates

use thiserror::Error;

/// Failure to read the claims of an access token.
///
/// Never fatal: a token that cannot be decoded is simply treated as having no
/// usable expiry.
#[derive(Debug, Error)]
pub enum TokenDecodeError {
    #[error("token has no payload segment")]
    MissingPayload,

    #[error("payload is not valid base64url: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("payload is not a JSON claims object: {0}")]
    Json(#[from] serde_json::Error),

    #[error("token carries no exp claim")]
    MissingExpiry,

    #[error("exp claim {0} is out of range")]
    ExpiryOutOfRange(i64),
}

/// A role string that is neither `ADMIN` nor `UTENTE`
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown role: {0}")]
pub struct UnknownRole(pub String);
