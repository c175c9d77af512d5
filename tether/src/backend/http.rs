//! An auth backend that talks to the auth service over HTTP

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use url::Url;

use super::{
    dto::{OrganizationList, SwitchOrganization},
    AppDiscovery, AuthBackend, BackendError, ProvidersResponse, TokenResponse,
};
use crate::{AccessTokenRef, ClientIdRef, OrgIdRef, Organization, ResolvedConfig};

/// An [`AuthBackend`] backed by a [`reqwest::Client`]
///
/// The client must keep cookies between requests, as the refresh, logout,
/// organization switch, and code exchange calls are authenticated by the
/// session cookie the auth service sets.
#[derive(Clone, Debug)]
pub struct HttpAuthBackend {
    client: Client,
}

impl HttpAuthBackend {
    /// Constructs a backend with a cookie-keeping client
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be initialized.
    pub fn new() -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .user_agent(concat!("tether/", env!("CARGO_PKG_VERSION")))
            .cookie_store(true)
            .build()?;

        Ok(Self { client })
    }

    /// Constructs a backend from an existing client
    pub fn from_client(client: Client) -> Self {
        Self { client }
    }
}

fn endpoint(base: &str, segments: &[&str]) -> Result<Url, BackendError> {
    let invalid = || BackendError::InvalidUrl {
        url: base.to_owned(),
    };

    let mut url = Url::parse(base).map_err(|_| invalid())?;
    url.path_segments_mut()
        .map_err(|_| invalid())?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

async fn checked(resp: Response) -> Result<Response, BackendError> {
    tracing::debug!(
        response.status = resp.status().as_u16(),
        "received response from auth service"
    );

    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.map_err(BackendError::BodyRead)?;
        return Err(BackendError::ErrorWithBody { status, body });
    }

    Ok(resp)
}

#[tracing::instrument(err, skip(request, url), fields(http.url = %url))]
async fn send_for_json<T: DeserializeOwned>(
    request: RequestBuilder,
    url: &Url,
) -> Result<T, BackendError> {
    let resp = request.send().await.map_err(BackendError::RequestSend)?;
    let body = checked(resp)
        .await?
        .bytes()
        .await
        .map_err(BackendError::BodyRead)?;
    Ok(serde_json::from_slice(&body)?)
}

/// Sends the request, caring only whether it succeeded
#[tracing::instrument(err, skip(request, url), fields(http.url = %url))]
async fn send_for_status(request: RequestBuilder, url: &Url) -> Result<(), BackendError> {
    let resp = request.send().await.map_err(BackendError::RequestSend)?;
    checked(resp).await?;
    Ok(())
}

#[async_trait]
impl AuthBackend for HttpAuthBackend {
    async fn discover(
        &self,
        auth_url: &str,
        client_id: &ClientIdRef,
    ) -> Result<AppDiscovery, BackendError> {
        let url = endpoint(auth_url, &["api", "client-apps", client_id.as_str(), "config"])?;
        send_for_json(self.client.get(url.clone()), &url).await
    }

    async fn refresh(&self, config: &ResolvedConfig) -> Result<TokenResponse, BackendError> {
        let url = endpoint(config.api_url(), &["auth", "refresh"])?;
        let request = self
            .client
            .post(url.clone())
            .header(reqwest::header::CONTENT_TYPE, "application/json");
        send_for_json(request, &url).await
    }

    async fn organizations(
        &self,
        config: &ResolvedConfig,
        token: &AccessTokenRef,
    ) -> Result<Vec<Organization>, BackendError> {
        let url = endpoint(config.auth_url(), &["api", "organizations"])?;
        let request = self.client.get(url.clone()).bearer_auth(token.as_str());
        let list: OrganizationList = send_for_json(request, &url).await?;
        Ok(list.organizations)
    }

    async fn logout(&self, config: &ResolvedConfig) -> Result<(), BackendError> {
        let url = endpoint(config.api_url(), &["auth", "logout"])?;
        send_for_status(self.client.post(url.clone()), &url).await
    }

    async fn switch_organization(
        &self,
        config: &ResolvedConfig,
        org_id: &OrgIdRef,
    ) -> Result<TokenResponse, BackendError> {
        let url = endpoint(config.api_url(), &["auth", "switch-org"])?;
        let request = self
            .client
            .post(url.clone())
            .json(&SwitchOrganization { org_id });
        send_for_json(request, &url).await
    }

    async fn exchange_code(
        &self,
        config: &ResolvedConfig,
        code: &str,
    ) -> Result<(), BackendError> {
        let mut url = endpoint(config.api_url(), &["auth", "callback"])?;
        url.query_pairs_mut().append_pair("code", code);
        send_for_status(self.client.get(url.clone()), &url).await
    }

    async fn providers(
        &self,
        auth_url: &str,
        client_id: &ClientIdRef,
    ) -> Result<ProvidersResponse, BackendError> {
        let mut url = endpoint(auth_url, &["providers"])?;
        url.query_pairs_mut()
            .append_pair("client_id", client_id.as_str());
        send_for_json(self.client.get(url.clone()), &url).await
    }
}
