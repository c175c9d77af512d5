//! Session configuration

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::{ClientId, ClientIdRef};

/// The auth service used when none is configured
pub const DEFAULT_AUTH_URL: &str = "https://auth.tony.codes";

/// A configuration that cannot be used to start a session
#[derive(Debug, Error)]
pub enum ConfigurationError {
    /// No client ID was provided
    #[error("missing required config: client ID registered with the auth service")]
    MissingClientId,
    /// A URL was provided but could not be parsed as an absolute URL
    #[error("invalid {field}: {value:?} is not a valid absolute URL (include the scheme, e.g. \"https://\")")]
    InvalidUrl {
        /// The offending configuration field
        field: &'static str,
        /// The value as provided
        value: String,
        /// Why parsing failed, if it failed outright
        #[source]
        source: Option<url::ParseError>,
    },
}

/// Configuration as provided by the application
///
/// Only the client ID is required. The remaining URLs are resolved by the
/// [`EndpointResolver`](crate::EndpointResolver) when they are not given.
///
/// ```
/// use tether::AuthConfig;
///
/// let config: AuthConfig = serde_json::from_str(r#"{
///     "clientId": "my-app",
///     "appUrl": "https://app.example.com",
///     "requireOrg": false
/// }"#).unwrap();
///
/// assert_eq!(config.client_id().as_str(), "my-app");
/// assert!(!config.require_org());
/// config.validate().unwrap();
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthConfig {
    client_id: ClientId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    auth_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    app_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    api_url: Option<String>,
    #[serde(default = "require_org_default")]
    require_org: bool,
}

const fn require_org_default() -> bool {
    true
}

impl AuthConfig {
    /// Constructs a configuration with only a client ID
    pub fn new(client_id: impl Into<ClientId>) -> Self {
        Self {
            client_id: client_id.into(),
            auth_url: None,
            app_url: None,
            api_url: None,
            require_org: require_org_default(),
        }
    }

    /// Sets the auth service URL
    pub fn with_auth_url(mut self, auth_url: impl Into<String>) -> Self {
        self.auth_url = Some(auth_url.into());
        self
    }

    /// Sets this application's base URL, skipping discovery
    pub fn with_app_url(mut self, app_url: impl Into<String>) -> Self {
        self.app_url = Some(app_url.into());
        self
    }

    /// Sets the base URL of the API that proxies the session endpoints
    pub fn with_api_url(mut self, api_url: impl Into<String>) -> Self {
        self.api_url = Some(api_url.into());
        self
    }

    /// Sets whether an organization is required for the session to count as
    /// authenticated
    pub fn with_require_org(mut self, require_org: bool) -> Self {
        self.require_org = require_org;
        self
    }

    /// The client ID
    #[inline]
    pub fn client_id(&self) -> &ClientIdRef {
        &self.client_id
    }

    /// The explicitly configured auth service URL
    #[inline]
    pub fn auth_url(&self) -> Option<&str> {
        self.auth_url.as_deref()
    }

    /// The explicitly configured application URL
    #[inline]
    pub fn app_url(&self) -> Option<&str> {
        self.app_url.as_deref()
    }

    /// The explicitly configured API URL
    #[inline]
    pub fn api_url(&self) -> Option<&str> {
        self.api_url.as_deref()
    }

    /// Whether an organization is required for the session to count as authenticated
    #[inline]
    pub fn require_org(&self) -> bool {
        self.require_org
    }

    /// Checks that the configuration can be used at all
    ///
    /// # Errors
    ///
    /// Returns an error if the client ID is empty or if any provided URL is
    /// not an absolute URL.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.client_id.as_str().trim().is_empty() {
            return Err(ConfigurationError::MissingClientId);
        }

        check_url("authUrl", self.auth_url.as_deref())?;
        check_url("appUrl", self.app_url.as_deref())?;
        check_url("apiUrl", self.api_url.as_deref())?;

        Ok(())
    }

    /// Logs common misconfigurations that are not fatal
    pub(crate) fn lint(&self, origin: Option<&str>) {
        if let Some(origin) = origin {
            let host = Url::parse(origin)
                .ok()
                .and_then(|u| u.host_str().map(str::to_owned))
                .unwrap_or_default();
            let looks_like_production = !host.contains("test") && !host.contains("localhost");

            if looks_like_production
                && self.auth_url.as_deref().map_or(false, |u| u.contains("localhost"))
            {
                tracing::warn!(
                    auth_url = self.auth_url.as_deref(),
                    origin,
                    "auth URL points at localhost but the app appears to be in production"
                );
            }
        }

        for (field, value) in [
            ("authUrl", &self.auth_url),
            ("appUrl", &self.app_url),
            ("apiUrl", &self.api_url),
        ] {
            if let Some(value) = value.as_deref().filter(|v| v.ends_with('/')) {
                tracing::warn!(
                    field,
                    value,
                    "configured URL has a trailing slash, which may produce double slashes"
                );
            }
        }
    }
}

fn check_url(field: &'static str, value: Option<&str>) -> Result<(), ConfigurationError> {
    let value = match value {
        Some(v) => v,
        None => return Ok(()),
    };

    match Url::parse(value) {
        Ok(url) if !url.cannot_be_a_base() => Ok(()),
        Ok(_) => Err(ConfigurationError::InvalidUrl {
            field,
            value: value.to_owned(),
            source: None,
        }),
        Err(source) => Err(ConfigurationError::InvalidUrl {
            field,
            value: value.to_owned(),
            source: Some(source),
        }),
    }
}

/// A configuration with every endpoint populated
///
/// Produced by the [`EndpointResolver`](crate::EndpointResolver). It is never
/// modified after construction; re-resolution produces a new value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedConfig {
    client_id: ClientId,
    auth_url: String,
    app_url: String,
    api_url: String,
}

impl ResolvedConfig {
    /// Constructs a fully resolved configuration directly
    pub fn new(
        client_id: impl Into<ClientId>,
        auth_url: impl Into<String>,
        app_url: impl Into<String>,
        api_url: impl Into<String>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            auth_url: auth_url.into(),
            app_url: app_url.into(),
            api_url: api_url.into(),
        }
    }

    /// The client ID
    #[inline]
    pub fn client_id(&self) -> &ClientIdRef {
        &self.client_id
    }

    /// The auth service URL
    #[inline]
    pub fn auth_url(&self) -> &str {
        &self.auth_url
    }

    /// This application's base URL
    #[inline]
    pub fn app_url(&self) -> &str {
        &self.app_url
    }

    /// The base URL of the API proxying the session endpoints
    #[inline]
    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    /// The redirect URI registered for the OAuth callback
    pub fn redirect_uri(&self) -> String {
        format!("{}/auth/callback", self.app_url)
    }
}
