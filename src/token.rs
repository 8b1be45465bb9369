//! Access-token inspection.
//!
//! Tokens are three base64url segments (`header.payload.signature`). Only
//! the payload is decoded and the signature is never checked; the backend
//! remains the authority. These helpers exist to schedule refreshes.

use base64::engine::general_purpose::{URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;

use crate::error::TokenError;

/// Claims read from a token payload. Times are Unix seconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenClaims {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    /// Every other claim.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TokenClaims {
    /// Expiry in Unix milliseconds.
    pub fn expires_at(&self) -> Option<u64> {
        self.exp.map(|s| s.saturating_mul(1000))
    }

    /// Issue time in Unix milliseconds.
    pub fn issued_at(&self) -> Option<u64> {
        self.iat.map(|s| s.saturating_mul(1000))
    }

    /// Lifetime the issuer granted, if both claims are present.
    pub fn lifetime(&self) -> Option<Duration> {
        match (self.iat, self.exp) {
            (Some(iat), Some(exp)) if exp >= iat => Some(Duration::from_secs(exp - iat)),
            _ => None,
        }
    }
}

/// Decode the payload of `token` without verifying its signature.
pub fn decode_claims(token: &str) -> Result<TokenClaims, TokenError> {
    let segments: Vec<&str> = token.trim().split('.').collect();
    if segments.len() != 3 {
        return Err(TokenError::Malformed(segments.len()));
    }

    let payload = segments[1];
    let bytes = if payload.ends_with('=') {
        URL_SAFE.decode(payload)
    } else {
        URL_SAFE_NO_PAD.decode(payload)
    }
    .map_err(|e| TokenError::Encoding(e.to_string()))?;

    serde_json::from_slice(&bytes).map_err(|e| TokenError::Claims(e.to_string()))
}

/// Whether `token` has expired at `now_ms`. Invalid tokens count as expired,
/// tokens without `exp` never expire.
pub fn is_expired(token: &str, now_ms: u64) -> bool {
    match decode_claims(token) {
        Ok(claims) => claims.expires_at().is_some_and(|exp| now_ms >= exp),
        Err(_) => true,
    }
}

/// Time left before expiry, `None` if invalid, already expired, or no `exp`.
pub fn time_until_expiry(token: &str, now_ms: u64) -> Option<Duration> {
    let exp = decode_claims(token).ok()?.expires_at()?;
    exp.checked_sub(now_ms)
        .filter(|left| *left > 0)
        .map(Duration::from_millis)
}

/// Whether `token` should be refreshed: at most `threshold` remains, or
/// the token is invalid or expired.
pub fn needs_refresh(token: &str, now_ms: u64, threshold: Duration) -> bool {
    match decode_claims(token) {
        Ok(claims) => match claims.expires_at() {
            Some(exp) => exp.saturating_sub(now_ms) <= threshold.as_millis() as u64,
            None => false,
        },
        Err(_) => true,
    }
}
