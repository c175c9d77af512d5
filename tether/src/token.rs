//! Decoding of access token claims
//!
//! Access tokens are compact, three-segment tokens. Only the payload segment
//! is read here; no signature is checked. The token was obtained over a
//! credentialed channel controlled by the issuing service, and verifying it
//! is that service's job.

use base64::{
    alphabet,
    engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig},
    Engine,
};
use serde::{Deserialize, Serialize};
use std::{borrow::Cow, time::Duration};
use tether_clock::{UnixMillis, UnixTime};
use thiserror::Error;

use crate::{AccessTokenRef, OrgId};

const PAYLOAD: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// The token could not be decoded into claims
#[derive(Debug, Error)]
pub enum MalformedToken {
    /// The token is not made up of three dot-separated segments
    #[error("malformed token: expected three dot-separated segments")]
    Structure,
    /// The payload segment is not valid base64url
    #[error("malformed token payload encoding")]
    Encoding(#[source] base64::DecodeError),
    /// The payload segment does not contain a claims object
    #[error("malformed token claims")]
    Claims(#[source] serde_json::Error),
}

/// Organization context carried in the token
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrgClaims {
    /// Organization ID
    pub id: OrgId,
    /// Display name
    pub name: String,
    /// URL-friendly name
    pub slug: String,
    /// The subject's role within the organization
    pub role: String,
}

/// The decoded payload of an access token
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Claims {
    /// Subject (user) ID
    pub sub: String,
    /// Email address
    #[serde(default)]
    pub email: String,
    /// Display name
    #[serde(default)]
    pub name: Option<String>,
    /// Avatar image URL
    #[serde(default)]
    pub avatar_url: Option<String>,
    /// Currently selected organization
    #[serde(default)]
    pub org: Option<OrgClaims>,
    /// Whether the subject is a platform super-admin
    #[serde(default)]
    pub is_super_admin: bool,
    /// Application-specific role
    #[serde(default)]
    pub app_role: Option<String>,
    /// Expiry
    pub exp: UnixTime,
}

impl Claims {
    /// The token's expiry at millisecond resolution
    #[inline]
    pub fn expiry(&self) -> UnixMillis {
        self.exp.as_millis()
    }

    /// Whether the token remains valid for strictly longer than `margin` after `now`
    #[inline]
    pub fn valid_beyond(&self, now: UnixMillis, margin: Duration) -> bool {
        self.expiry() > now + margin
    }
}

/// Decodes the claims carried in an access token
///
/// Decoding is deterministic and performs no verification of any kind.
///
/// # Errors
///
/// Returns [`MalformedToken`] when the token does not have exactly three
/// segments, or when its payload is not base64url-encoded JSON claims.
pub fn decode(token: &AccessTokenRef) -> Result<Claims, MalformedToken> {
    let mut segments = token.as_str().split('.');
    let payload = match (segments.next(), segments.next(), segments.next(), segments.next()) {
        (Some(_), Some(payload), Some(_), None) => payload,
        _ => return Err(MalformedToken::Structure),
    };

    let payload = if payload.contains(['+', '/']) {
        Cow::Owned(payload.replace('+', "-").replace('/', "_"))
    } else {
        Cow::Borrowed(payload)
    };

    let json = PAYLOAD
        .decode(payload.as_bytes())
        .map_err(MalformedToken::Encoding)?;

    serde_json::from_slice(&json).map_err(MalformedToken::Claims)
}
