//! Completion of a sign-in on return from the auth service

use std::{
    error,
    sync::atomic::{AtomicBool, Ordering},
};

use tether_clock::{Clock, System};
use thiserror::Error;
use url::{form_urlencoded, Url};

use crate::{
    backend::{dto::ErrorBody, BackendError},
    login, OAuthState, SessionController,
};

/// The message used when the code exchange fails without reaching the auth service
pub const EXCHANGE_FAILED: &str = "Authentication failed";

/// Explains a failed code exchange in the auth service's own words
///
/// A JSON body contributes its `error` or `message` field. Any other body
/// is used as is. Without either, the status is reported.
fn exchange_failure(error: &BackendError) -> String {
    let (status, body) = match error {
        BackendError::ErrorWithBody { status, body } => (*status, body.as_str()),
        _ => return String::from(EXCHANGE_FAILED),
    };

    let stated = match serde_json::from_str::<ErrorBody>(body) {
        Ok(parsed) => parsed
            .error
            .filter(|e| !e.is_empty())
            .or(parsed.message.filter(|m| !m.is_empty())),
        Err(_) if !body.trim().is_empty() => Some(body.to_owned()),
        Err(_) => None,
    };

    stated.unwrap_or_else(|| match status.canonical_reason() {
        Some(reason) => format!("Callback failed: {} {}", status.as_u16(), reason),
        None => format!("Callback failed: {}", status.as_u16()),
    })
}

/// The query parameters the auth service redirects back with
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CallbackParams {
    /// The authorization code
    pub code: Option<String>,
    /// The `state` value sent with the login redirect
    pub state: Option<OAuthState>,
    /// An error reported by the auth service or identity provider
    pub error: Option<String>,
}

impl CallbackParams {
    /// Parses the parameters out of a query string
    ///
    /// A leading `?` is ignored. Empty values are treated as absent.
    pub fn from_query(query: &str) -> Self {
        let query = query.strip_prefix('?').unwrap_or(query);
        let mut params = Self::default();

        for (key, value) in form_urlencoded::parse(query.as_bytes()) {
            if value.is_empty() {
                continue;
            }

            match &*key {
                "code" => params.code = Some(value.into_owned()),
                "state" => params.state = Some(OAuthState::new(value.into_owned())),
                "error" => params.error = Some(value.into_owned()),
                _ => {}
            }
        }

        params
    }

    /// Parses the parameters out of a full callback URL
    pub fn from_url(url: &Url) -> Self {
        Self::from_query(url.query().unwrap_or_default())
    }
}

/// Why a sign-in could not be completed
#[derive(Debug, Error, PartialEq, Eq)]
pub enum OAuthCallbackError {
    /// The auth service or identity provider reported an error
    #[error("sign-in failed: {error}")]
    Provider {
        /// The reported error
        error: String,
        /// Where the user was headed when signing in
        return_to: String,
    },
    /// No authorization code was returned
    #[error("Missing authorization code")]
    MissingCode,
    /// The returned state does not match the state sent with the login redirect
    #[error("sign-in state does not match the pending login")]
    InvalidState,
    /// The authorization code could not be exchanged
    #[error("{0}")]
    Exchange(String),
    /// The code was exchanged, but no session could be established afterwards
    #[error("signed in, but no session could be established")]
    SessionNotEstablished,
    /// This callback has already been handled
    #[error("sign-in callback already handled")]
    AlreadyHandled,
}

impl OAuthCallbackError {
    /// The login page URL to send the user to after a provider error
    ///
    /// The error is passed along as the `error` parameter, and the return
    /// path as `returnTo` unless it is `/`. Returns `None` for other kinds of
    /// error or when `origin` is not a valid URL.
    pub fn login_redirect(&self, origin: &str) -> Option<Url> {
        let (error, return_to) = match self {
            Self::Provider { error, return_to } => (error, return_to),
            _ => return None,
        };

        let mut url = Url::parse(origin).ok()?.join("/login").ok()?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("error", error);
            if return_to != "/" {
                query.append_pair("returnTo", return_to);
            }
        }

        Some(url)
    }
}

/// Completes a sign-in for a session
///
/// Mount one per callback page load; a handler completes at most one sign-in.
#[derive(Debug)]
pub struct AuthCallback<C = System> {
    session: SessionController<C>,
    handled: AtomicBool,
}

impl<C> AuthCallback<C>
where
    C: Clock + Send + Sync + 'static,
{
    /// Constructs a handler completing sign-ins for `session`
    pub fn new(session: SessionController<C>) -> Self {
        Self {
            session,
            handled: AtomicBool::new(false),
        }
    }

    /// Completes the sign-in
    ///
    /// The authorization code is exchanged, establishing the server-side
    /// session, and the local session is then refreshed from it. On success
    /// the path the user was headed to when signing in is returned.
    ///
    /// # Errors
    ///
    /// Returns an error if the sign-in could not be completed. The error is
    /// also recorded as the session's login error.
    pub async fn handle(&self, params: &CallbackParams) -> Result<String, OAuthCallbackError> {
        if self.handled.swap(true, Ordering::SeqCst) {
            return Err(OAuthCallbackError::AlreadyHandled);
        }

        let result = self.complete(params).await;

        match &result {
            Ok(return_to) => {
                tracing::info!(return_to = return_to.as_str(), "sign-in complete");
                self.session.finish_login(None);
            }
            Err(error) => {
                tracing::warn!(error = (error as &dyn error::Error), "sign-in failed");
                self.session.finish_login(Some(error.to_string()));
            }
        }

        result
    }

    /// Completes the sign-in and navigates accordingly
    ///
    /// On success the host is sent to the return path. After a provider
    /// error it is sent to the login page.
    ///
    /// # Errors
    ///
    /// Returns an error if the sign-in could not be completed.
    pub async fn handle_and_redirect(
        &self,
        params: &CallbackParams,
    ) -> Result<String, OAuthCallbackError> {
        let host = self.session.host();
        let result = self.handle(params).await;

        match &result {
            Ok(return_to) => host.navigate(return_to),
            Err(error) => {
                let redirect = host
                    .origin()
                    .and_then(|origin| error.login_redirect(&origin));
                if let Some(redirect) = redirect {
                    host.navigate(redirect.as_str());
                }
            }
        }

        result
    }

    async fn complete(&self, params: &CallbackParams) -> Result<String, OAuthCallbackError> {
        let expected = self.session.take_login_state();

        if let Some(error) = &params.error {
            return Err(OAuthCallbackError::Provider {
                error: error.clone(),
                return_to: login::return_to(params.state.as_deref()),
            });
        }

        let code = params
            .code
            .as_deref()
            .ok_or(OAuthCallbackError::MissingCode)?;

        if let Some(expected) = expected {
            if params.state.as_ref() != Some(&expected) {
                return Err(OAuthCallbackError::InvalidState);
            }
        }

        let config = self.session.config();
        self.session
            .backend()
            .exchange_code(&config, code)
            .await
            .map_err(|error| {
                tracing::debug!(
                    error = (&error as &dyn error::Error),
                    "authorization code exchange rejected"
                );
                OAuthCallbackError::Exchange(exchange_failure(&error))
            })?;

        self.session
            .refresh_session()
            .await
            .ok_or(OAuthCallbackError::SessionNotEstablished)?;

        Ok(login::return_to(params.state.as_deref()))
    }
}
