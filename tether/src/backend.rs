//! The auth service as seen by a session

use async_trait::async_trait;
use thiserror::Error;

use crate::{AccessTokenRef, ClientIdRef, OrgIdRef, Organization, ResolvedConfig};

pub mod dto;
pub mod http;

pub use dto::{AppDiscovery, ProviderInfo, ProvidersResponse, TokenResponse};
pub use http::HttpAuthBackend;

/// An error while talking to the auth service
#[derive(Debug, Error)]
pub enum BackendError {
    /// The auth service answered with a non-success status
    #[error("auth service responded with {status}: {body}")]
    ErrorWithBody {
        /// The response status
        status: reqwest::StatusCode,
        /// The response body, as text
        body: String,
    },
    /// Unable to deserialize the response body
    #[error("error deserializing response body from auth service")]
    BodyDeserialize(#[from] serde_json::Error),
    /// Unable to read the response
    #[error("error reading response body")]
    BodyRead(#[source] reqwest::Error),
    /// Unable to send the request
    #[error("error sending request to auth service")]
    RequestSend(#[source] reqwest::Error),
    /// The configured base URL cannot have a path appended
    #[error("cannot build endpoint from base URL {url:?}")]
    InvalidUrl {
        /// The base URL
        url: String,
    },
}

impl BackendError {
    /// The status code, when the auth service answered with a non-success status
    pub fn status(&self) -> Option<reqwest::StatusCode> {
        match self {
            Self::ErrorWithBody { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// The body of a non-success response
    pub fn body(&self) -> Option<&str> {
        match self {
            Self::ErrorWithBody { body, .. } => Some(body),
            _ => None,
        }
    }
}

/// The calls a session makes against the auth service
///
/// Calls marked as cookie-authenticated rely on the transport to carry the
/// session cookie set by the server.
#[async_trait]
pub trait AuthBackend: Send + Sync {
    /// Looks up the application URLs registered for a client
    async fn discover(
        &self,
        auth_url: &str,
        client_id: &ClientIdRef,
    ) -> Result<AppDiscovery, BackendError>;

    /// Exchanges the session cookie for a fresh access token
    async fn refresh(&self, config: &ResolvedConfig) -> Result<TokenResponse, BackendError>;

    /// Lists the organizations the token's subject belongs to
    async fn organizations(
        &self,
        config: &ResolvedConfig,
        token: &AccessTokenRef,
    ) -> Result<Vec<Organization>, BackendError>;

    /// Ends the server-side session
    async fn logout(&self, config: &ResolvedConfig) -> Result<(), BackendError>;

    /// Switches the session to another organization, returning the newly issued token
    async fn switch_organization(
        &self,
        config: &ResolvedConfig,
        org_id: &OrgIdRef,
    ) -> Result<TokenResponse, BackendError>;

    /// Exchanges an authorization code, establishing the session cookie
    ///
    /// Only the response status matters. The token for the new session is
    /// obtained by refreshing afterwards.
    async fn exchange_code(&self, config: &ResolvedConfig, code: &str) -> Result<(), BackendError>;

    /// Lists the sign-in providers available to a client
    async fn providers(
        &self,
        auth_url: &str,
        client_id: &ClientIdRef,
    ) -> Result<ProvidersResponse, BackendError>;
}
