//! Access token claim decoding
//!
//! Claims are read without verifying the signature. The expiry is used to
//! schedule refreshes and to answer "am I still logged in" locally; the backend
//! still validates every token it receives.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::error::TokenDecodeError;

/// Claims carried in the payload segment of an access token
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Claims {
    /// Subject
    #[serde(default)]
    pub sub: Option<String>,
    /// Expiration time, seconds since the epoch
    #[serde(default)]
    pub exp: Option<i64>,
    /// Issued at, seconds since the epoch
    #[serde(default)]
    pub iat: Option<i64>,
}

/// Decode the payload segment of `token`
pub fn decode_claims(token: &str) -> Result<Claims, TokenDecodeError> {
    let payload = token
        .split('.')
        .nth(1)
        .filter(|segment| !segment.is_empty())
        .ok_or(TokenDecodeError::MissingPayload)?;

    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('='))?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Expiry instant of `token`
pub fn expires_at(token: &str) -> Result<DateTime<Utc>, TokenDecodeError> {
    let exp = decode_claims(token)?
        .exp
        .ok_or(TokenDecodeError::MissingExpiry)?;
    DateTime::from_timestamp(exp, 0).ok_or(TokenDecodeError::ExpiryOutOfRange(exp))
}

/// Whether `token` is still valid at `now`. Undecodable tokens are never valid.
pub fn is_token_valid(token: &str, now: DateTime<Utc>) -> bool {
    expires_at(token).is_ok_and(|expiry| now.timestamp_millis() < expiry.timestamp_millis())
}
