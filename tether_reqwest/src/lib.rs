//! Middleware to automatically attach the session's access token to outgoing requests
//!
//! When using [`ClientWithMiddleware`](reqwest_middleware::ClientWithMiddleware),
//! include the [`SessionTokenMiddleware`] in the middleware stack to send the
//! current access token of a [`SessionController`] with each outbound request
//! to the session's own services. The token is obtained through
//! [`get_access_token()`](SessionController::get_access_token), so a token
//! close to expiry is refreshed before it is sent.
//!
//! By default the token only goes to the origins of the session's resolved
//! API and auth service URLs (see [`SessionOrigins`]). Requests to any other
//! origin, including other hosts reached over HTTPS, are sent untouched.
//!
//! If a request already has an `Authorization` header by the time the
//! middleware executes, the existing value is left in place, allowing
//! overrides to be specified as required. If no session can be established,
//! the request is sent without one.
//!
//! ```
//! use std::sync::Arc;
//! use reqwest::Client;
//! use reqwest_middleware::ClientBuilder;
//! use tether::{backend::HttpAuthBackend, AuthConfig, SessionController};
//! use tether_reqwest::SessionTokenMiddleware;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let backend = Arc::new(HttpAuthBackend::new()?);
//! let session = SessionController::builder(AuthConfig::new("my-app"), backend)
//!     .build()
//!     .await?;
//! let api = session.config().api_url().to_owned();
//!
//! let client = ClientBuilder::new(Client::default())
//!     .with(SessionTokenMiddleware::new(session))
//!     .build();
//!
//! let req = client.get(format!("{api}/projects"));
//! # async move { req
//!     .send()
//!     .await
//!     .unwrap();
//! # };
//! # Ok(())
//! # }
//! ```
//!
//! The middleware can also be configured with a different predicate. This is
//! useful when a trusted backend lives outside the session's own origins.
//! Predicates can be composed to express more complex requirements.
//!
//! ```
//! use tether::SessionController;
//! use tether_reqwest::{ExactHostMatch, HttpsOnly, SessionOrigins, SessionTokenMiddleware};
//! use predicates::prelude::PredicateBooleanExt;
//!
//! # fn configure(session: SessionController) {
//! let trusted = SessionOrigins::new(&session)
//!     .or(HttpsOnly.and(ExactHostMatch::new("reports.example.com")));
//!
//! SessionTokenMiddleware::new(session).with_predicate(trusted);
//! # }
//! ```

#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    missing_copy_implementations,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

use std::{error, fmt};

use bytes::{BufMut, BytesMut};
use predicates::{prelude::*, reflection};
use reqwest::{header, Request, Response, Url};
use reqwest_middleware::{Middleware, Next, Result};
use tether::{AccessTokenRef, SessionController};
use tether_clock::{Clock, System};

/// A middleware that injects the session's access token into outgoing requests
#[derive(Clone, Debug)]
pub struct SessionTokenMiddleware<P, C = System> {
    session: SessionController<C>,
    predicate: P,
}

impl<C> SessionTokenMiddleware<SessionOrigins<C>, C> {
    /// Construct a new middleware from a session
    ///
    /// By default, this middleware only sends its token to the session's API
    /// and auth service origins. To change this behavior, provide a custom
    /// predicate with [`with_predicate()`][Self::with_predicate()].
    pub fn new(session: SessionController<C>) -> Self {
        Self {
            predicate: SessionOrigins::new(&session),
            session,
        }
    }
}

impl<P, C> SessionTokenMiddleware<P, C> {
    /// Replaces the current predicate
    pub fn with_predicate<Q>(self, predicate: Q) -> SessionTokenMiddleware<Q, C> {
        SessionTokenMiddleware {
            session: self.session,
            predicate,
        }
    }
}

impl<P, C> SessionTokenMiddleware<P, C>
where
    C: Clock + Send + Sync + 'static,
{
    async fn authorization(&self) -> Option<header::HeaderValue> {
        let Some(token) = self.session.get_access_token().await else {
            tracing::debug!("no session available, sending request without a token");
            return None;
        };

        match bearer(&token) {
            Ok(value) => Some(value),
            Err(error) => {
                tracing::warn!(
                    error = (&error as &dyn error::Error),
                    "access token cannot be sent as a header value"
                );
                None
            }
        }
    }
}

fn bearer(
    token: &AccessTokenRef,
) -> std::result::Result<header::HeaderValue, header::InvalidHeaderValue> {
    let mut header_value = BytesMut::with_capacity(token.as_str().len() + 7);
    header_value.put_slice(b"Bearer ");
    header_value.put_slice(token.as_str().as_bytes());
    let mut value = header::HeaderValue::from_maybe_shared(header_value.freeze())?;
    value.set_sensitive(true);
    Ok(value)
}

#[async_trait::async_trait]
impl<P, C> Middleware for SessionTokenMiddleware<P, C>
where
    P: Predicate<Request> + Send + Sync + 'static,
    C: Clock + Send + Sync + 'static,
{
    async fn handle(
        &self,
        mut req: Request,
        extensions: &mut http::Extensions,
        next: Next<'_>,
    ) -> Result<Response> {
        if req.headers().contains_key(header::AUTHORIZATION) {
            return next.run(req, extensions).await;
        }

        if self.predicate.eval(&req) {
            if let Some(value) = self.authorization().await {
                req.headers_mut().insert(header::AUTHORIZATION, value);
            }
        } else {
            tracing::trace!(url = %req.url(), "request is outside the token's audience");
        }

        next.run(req, extensions).await
    }
}

/// Explains a predicate result that disagrees with `expected`
fn mismatch<'a>(
    predicate: &'a dyn reflection::PredicateReflection,
    result: bool,
    expected: bool,
    name: &'static str,
    observed: impl FnOnce() -> String,
) -> Option<reflection::Case<'a>> {
    (result != expected).then(|| {
        reflection::Case::new(Some(predicate), result)
            .add_product(reflection::Product::new(name, observed()))
    })
}

/// Only attach an access token to the origins the session itself talks to
///
/// A request matches when its scheme, host, and port equal those of the
/// session's resolved API URL or auth service URL. The endpoints are read
/// on every evaluation, so a session that re-resolves its configuration is
/// followed without rebuilding the middleware.
#[derive(Clone, Debug)]
pub struct SessionOrigins<C = System> {
    session: SessionController<C>,
}

impl<C> SessionOrigins<C> {
    /// Scope tokens to the endpoints of `session`
    pub fn new(session: &SessionController<C>) -> Self {
        Self {
            session: session.clone(),
        }
    }
}

impl<C> Predicate<Request> for SessionOrigins<C> {
    fn eval(&self, req: &Request) -> bool {
        let config = self.session.config();
        let origin = req.url().origin();

        let matches = [config.api_url(), config.auth_url()]
            .into_iter()
            .filter_map(|base| Url::parse(base).ok())
            .any(|base| base.origin() == origin);
        matches
    }

    fn find_case(&self, expected: bool, req: &Request) -> Option<reflection::Case> {
        mismatch(self, self.eval(req), expected, "origin", || {
            req.url().origin().ascii_serialization()
        })
    }
}

impl<C> reflection::PredicateReflection for SessionOrigins<C> {}
impl<C> fmt::Display for SessionOrigins<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("origin is the session's API or auth service")
    }
}

/// Only attach an access token if the request is being sent over HTTPS
#[derive(Clone, Copy, Debug)]
pub struct HttpsOnly;

impl Predicate<Request> for HttpsOnly {
    #[inline]
    fn eval(&self, req: &Request) -> bool {
        req.url().scheme() == "https"
    }

    fn find_case(&self, expected: bool, req: &Request) -> Option<reflection::Case> {
        mismatch(self, self.eval(req), expected, "scheme", || {
            req.url().scheme().to_owned()
        })
    }
}

impl reflection::PredicateReflection for HttpsOnly {}
impl fmt::Display for HttpsOnly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("scheme is https")
    }
}

/// Only attach an access token if the request is being sent to the exact host specified
#[derive(Clone, Debug)]
pub struct ExactHostMatch {
    host: String,
}

impl ExactHostMatch {
    /// Construct a new predicate from a host string
    pub fn new(host: impl Into<String>) -> Self {
        Self { host: host.into() }
    }
}

impl Predicate<Request> for ExactHostMatch {
    #[inline]
    fn eval(&self, req: &Request) -> bool {
        req.url().host_str() == Some(&self.host)
    }

    fn find_case(&self, expected: bool, req: &Request) -> Option<reflection::Case> {
        mismatch(self, self.eval(req), expected, "host", || {
            req.url().host_str().unwrap_or("<no host>").to_owned()
        })
    }
}

impl reflection::PredicateReflection for ExactHostMatch {}
impl fmt::Display for ExactHostMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "host == {}", self.host)
    }
}
