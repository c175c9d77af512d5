//! Client-side session management against a hosted auth service
//!
//! A session is derived from a short-lived access token. The token is
//! obtained from the auth service using a session cookie, decoded (never
//! verified) to learn who the user is and which organization they are acting
//! for, and refreshed in the background a minute before it expires. Consumers
//! observe the session through whole snapshots, so the user, organization,
//! roles, and token they see always agree with each other.
//!
//! # General Flow
//!
//! On application start-up, build a [`SessionController`] from an
//! [`AuthConfig`]. Only the client ID is required; the remaining endpoints are
//! discovered from the auth service by the [`EndpointResolver`] when they are
//! not configured.
//!
//! Connecting attempts a first refresh. If the user already has a session
//! cookie, the session comes up authenticated and keeps itself fresh from
//! then on. Otherwise, [`login`](SessionController::login) sends the user to
//! the auth service, and an [`AuthCallback`] completes the sign-in when they
//! return.
//!
//! ```
//! use std::sync::Arc;
//! use tether::{backend::HttpAuthBackend, AuthConfig, SessionController};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = AuthConfig::new("my-app").with_app_url("https://app.example.com");
//! let backend = Arc::new(HttpAuthBackend::new()?);
//!
//! let session = SessionController::builder(config, backend)
//! # ;/* Commented out due to this trying to interact with the world.
//!     .connect()
//!     .await?;
//!
//! if let Some(token) = session.get_access_token().await {
//!     tracing::info!(token = format_args!("{:#?}", token), "signed in");
//! }
//! # */
//! # Ok(())
//! # }
//! ```
//!
//! Sign-in pages can list the available identity providers through a
//! [`ProviderList`](providers::ProviderList), which is backed by a shared
//! cache that serves stale lists while revalidating them.
//!
//! # Features
//!
//! * `rustls-tls` (default): use `rustls` for the HTTP backend
//! * `default-tls`: use the platform's native TLS for the HTTP backend

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

pub mod backend;
mod braids;
mod callback;
mod config;
mod controller;
mod host;
pub mod login;
pub mod providers;
mod resolver;
mod state;
pub mod token;
mod watcher;


pub use braids::*;
pub use callback::{AuthCallback, CallbackParams, OAuthCallbackError, EXCHANGE_FAILED};
pub use config::{AuthConfig, ConfigurationError, ResolvedConfig, DEFAULT_AUTH_URL};
pub use controller::{
    refresh_delay, SessionBuilder, SessionController, TokenRequestError, MIN_REFRESH_DELAY,
    TOKEN_EXPIRY_MARGIN,
};
pub use host::{HeadlessHost, Host, StaticHost};
pub use resolver::EndpointResolver;
pub use state::{Organization, SessionPhase, SessionState, User, DEFAULT_ORG_ROLE};
pub use watcher::{BorrowedSession, SessionPublisherQuit, SessionWatcher};
