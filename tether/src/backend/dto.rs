//! DTOs for interacting with the auth service

use serde::{Deserialize, Serialize};

use crate::{AccessToken, OrgIdRef, Organization, ProviderId};

/// A response carrying a newly issued access token
#[derive(Debug, Deserialize, Serialize)]
pub struct TokenResponse {
    /// The access token
    pub access_token: AccessToken,
}

/// Application URLs registered for a client
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppDiscovery {
    /// The application's base URL
    #[serde(default)]
    pub app_url: Option<String>,
    /// The base URL of the API proxying the session endpoints
    #[serde(default)]
    pub api_url: Option<String>,
}

/// A sign-in provider
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct ProviderInfo {
    /// Provider ID
    pub id: ProviderId,
    /// Display name
    pub name: String,
    /// Whether the provider can currently be used to sign in
    pub enabled: bool,
}

/// The sign-in options available to a client
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvidersResponse {
    /// Available providers
    #[serde(default)]
    pub providers: Vec<ProviderInfo>,
    /// Whether email sign-in is enabled
    #[serde(default)]
    pub email_enabled: bool,
}

#[derive(Debug, Deserialize)]
pub(crate) struct OrganizationList {
    #[serde(default)]
    pub organizations: Vec<Organization>,
}

#[derive(Debug, Serialize)]
pub(crate) struct SwitchOrganization<'a> {
    pub org_id: &'a OrgIdRef,
}

/// The body of a failed code exchange
#[derive(Debug, Default, Deserialize)]
pub(crate) struct ErrorBody {
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}
