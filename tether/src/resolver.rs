//! Resolution of the endpoints a session talks to

use std::{error, sync::Arc};

use crate::{backend::AuthBackend, AuthConfig, ResolvedConfig, DEFAULT_AUTH_URL};

/// Fills in the endpoints an [`AuthConfig`] leaves unset
///
/// Resolution never fails. An explicit value always wins. Otherwise the app
/// URL is discovered from the auth service, falling back to the host's origin
/// and finally to the auth URL itself. The API URL defaults to the app URL.
#[derive(Clone)]
pub struct EndpointResolver {
    backend: Arc<dyn AuthBackend>,
    origin: Option<String>,
}

impl std::fmt::Debug for EndpointResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("EndpointResolver")
            .field("origin", &self.origin)
            .finish_non_exhaustive()
    }
}

impl EndpointResolver {
    /// Constructs a resolver that discovers through `backend`
    ///
    /// `origin` is the origin the application is served from, if known.
    pub fn new(backend: Arc<dyn AuthBackend>, origin: Option<String>) -> Self {
        Self { backend, origin }
    }

    /// Resolves without touching the network
    ///
    /// Only possible when the app URL is explicitly configured. Returns `None`
    /// when discovery would be needed.
    pub fn resolve_explicit(config: &AuthConfig) -> Option<ResolvedConfig> {
        let app_url = config.app_url()?;
        let auth_url = config.auth_url().unwrap_or(DEFAULT_AUTH_URL);
        let api_url = config.api_url().unwrap_or(app_url);

        Some(ResolvedConfig::new(
            config.client_id().to_owned(),
            auth_url,
            app_url,
            api_url,
        ))
    }

    /// Resolves every endpoint
    ///
    /// Makes at most one discovery call, and only when the app URL is not
    /// explicitly configured.
    pub async fn resolve(&self, config: &AuthConfig) -> ResolvedConfig {
        if let Some(resolved) = Self::resolve_explicit(config) {
            tracing::debug!(app_url = resolved.app_url(), "app URL configured, skipping discovery");
            return resolved;
        }

        let auth_url = config.auth_url().unwrap_or(DEFAULT_AUTH_URL);

        let (discovered_app, discovered_api) =
            match self.backend.discover(auth_url, config.client_id()).await {
                Ok(discovery) => {
                    tracing::debug!(
                        app_url = discovery.app_url.as_deref(),
                        api_url = discovery.api_url.as_deref(),
                        "discovered app configuration"
                    );
                    (discovery.app_url, discovery.api_url)
                }
                Err(error) => {
                    tracing::warn!(
                        error = (&error as &dyn error::Error),
                        client_id = config.client_id().as_str(),
                        "unable to discover app configuration, falling back"
                    );
                    (None, None)
                }
            };

        let app_url = discovered_app
            .or_else(|| self.origin.clone())
            .unwrap_or_else(|| auth_url.to_owned());

        let api_url = config
            .api_url()
            .map(str::to_owned)
            .or(discovered_api)
            .unwrap_or_else(|| app_url.clone());

        ResolvedConfig::new(config.client_id().to_owned(), auth_url, app_url, api_url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::AppDiscovery,
        test::{Calls, FakeBackend},
    };

    fn resolver(backend: &Arc<FakeBackend>, origin: Option<&str>) -> EndpointResolver {
        EndpointResolver::new(backend.clone(), origin.map(str::to_owned))
    }

    mod when_app_url_is_explicit {
        use super::*;

        #[tokio::test]
        async fn skips_discovery() {
            let backend = FakeBackend::new();
            let config = AuthConfig::new("x").with_app_url("https://a.test");

            let resolved = resolver(&backend, Some("https://origin.test"))
                .resolve(&config)
                .await;

            assert_eq!(
                resolved,
                ResolvedConfig::new("x", DEFAULT_AUTH_URL, "https://a.test", "https://a.test")
            );
            assert_eq!(Calls::get(&backend.calls.discover), 0);
        }

        #[test]
        fn resolves_synchronously() {
            let config = AuthConfig::new("x")
                .with_app_url("https://a.test")
                .with_api_url("https://api.a.test");

            let resolved = EndpointResolver::resolve_explicit(&config).unwrap();

            assert_eq!(resolved.auth_url(), DEFAULT_AUTH_URL);
            assert_eq!(resolved.api_url(), "https://api.a.test");
        }

        #[test]
        fn cannot_resolve_synchronously_without_it() {
            assert_eq!(EndpointResolver::resolve_explicit(&AuthConfig::new("x")), None);
        }
    }

    mod when_discovery_succeeds {
        use super::*;

        #[tokio::test]
        async fn adopts_discovered_urls() {
            let backend = FakeBackend::new();
            *backend.discovery.lock() = Some(AppDiscovery {
                app_url: Some(String::from("https://app.test")),
                api_url: Some(String::from("https://api.test")),
            });

            let resolved = resolver(&backend, Some("https://origin.test"))
                .resolve(&AuthConfig::new("x").with_auth_url("https://auth.test"))
                .await;

            assert_eq!(resolved.app_url(), "https://app.test");
            assert_eq!(resolved.api_url(), "https://api.test");
            assert_eq!(backend.last_auth_url.lock().as_deref(), Some("https://auth.test"));
        }

        #[tokio::test]
        async fn explicit_api_url_wins() {
            let backend = FakeBackend::new();
            *backend.discovery.lock() = Some(AppDiscovery {
                app_url: Some(String::from("https://app.test")),
                api_url: Some(String::from("https://api.test")),
            });

            let resolved = resolver(&backend, None)
                .resolve(&AuthConfig::new("x").with_api_url("https://mine.test"))
                .await;

            assert_eq!(resolved.api_url(), "https://mine.test");
        }

        #[tokio::test]
        async fn partial_discovery_falls_back_for_the_rest() {
            let backend = FakeBackend::new();
            *backend.discovery.lock() = Some(AppDiscovery::default());

            let resolved = resolver(&backend, Some("https://origin.test"))
                .resolve(&AuthConfig::new("x"))
                .await;

            assert_eq!(resolved.app_url(), "https://origin.test");
            assert_eq!(resolved.api_url(), "https://origin.test");
        }
    }

    mod when_discovery_fails {
        use super::*;

        #[tokio::test]
        #[tracing_test::traced_test]
        async fn falls_back_to_origin() {
            let backend = FakeBackend::new();

            let resolved = resolver(&backend, Some("https://origin.test"))
                .resolve(&AuthConfig::new("x"))
                .await;

            assert_eq!(
                resolved,
                ResolvedConfig::new(
                    "x",
                    DEFAULT_AUTH_URL,
                    "https://origin.test",
                    "https://origin.test"
                )
            );
            assert_eq!(Calls::get(&backend.calls.discover), 1);
            assert!(logs_contain("unable to discover app configuration"));
        }

        #[tokio::test]
        async fn falls_back_to_auth_url_without_origin() {
            let backend = FakeBackend::new();

            let resolved = resolver(&backend, None)
                .resolve(&AuthConfig::new("x").with_auth_url("https://auth.test"))
                .await;

            assert_eq!(resolved.app_url(), "https://auth.test");
            assert_eq!(resolved.api_url(), "https://auth.test");
        }
    }
}
