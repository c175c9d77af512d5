//! The session lifecycle

use std::{
    error, fmt, mem,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use tether_clock::{Clock, System, UnixMillis};
use thiserror::Error;
use tokio::{sync::watch, task::JoinHandle, time::Instant};

use crate::{
    backend::{AuthBackend, BackendError, TokenResponse},
    login::{self, LoginState},
    token::{self, Claims, MalformedToken},
    AccessToken, AuthConfig, ConfigurationError, EndpointResolver, HeadlessHost, Host, OAuthState,
    OrgIdRef, ProviderIdRef, ResolvedConfig, SessionPhase, SessionState,
    SessionWatcher,
};

/// A cached token is only handed out while it stays valid for longer than this
pub const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(60);

/// The shortest delay before a scheduled refresh
pub const MIN_REFRESH_DELAY: Duration = Duration::from_secs(10);

/// How long to wait before refreshing a token expiring at `expiry`
///
/// Aims for [`TOKEN_EXPIRY_MARGIN`] ahead of expiry, but never sooner than
/// [`MIN_REFRESH_DELAY`].
pub fn refresh_delay(expiry: UnixMillis, now: UnixMillis) -> Duration {
    expiry
        .saturating_duration_since(now)
        .saturating_sub(TOKEN_EXPIRY_MARGIN)
        .max(MIN_REFRESH_DELAY)
}

/// The auth service did not produce a usable token
#[derive(Debug, Error)]
pub enum TokenRequestError {
    /// The request failed
    #[error("auth service request failed")]
    Backend(#[from] BackendError),
    /// The issued token could not be decoded
    #[error("auth service issued an unreadable token")]
    Malformed(#[from] MalformedToken),
}

fn decoded(response: TokenResponse) -> Result<(AccessToken, Claims), TokenRequestError> {
    let claims = token::decode(&response.access_token)?;
    Ok((response.access_token, claims))
}

/// Holds the session in the refreshing phase until dropped
///
/// A refresh that is abandoned part way restores the prior phase.
struct RefreshGuard<'a> {
    phase: &'a Mutex<SessionPhase>,
    prior: SessionPhase,
    finished: bool,
}

impl<'a> RefreshGuard<'a> {
    fn acquire(phase: &'a Mutex<SessionPhase>) -> Option<Self> {
        let mut current = phase.lock();
        if *current == SessionPhase::Refreshing {
            return None;
        }

        let prior = mem::replace(&mut *current, SessionPhase::Refreshing);
        Some(Self {
            phase,
            prior,
            finished: false,
        })
    }

    fn finish(mut self, next: SessionPhase) {
        *self.phase.lock() = next;
        self.finished = true;
    }
}

impl Drop for RefreshGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            *self.phase.lock() = self.prior;
        }
    }
}

struct ScheduledRefresh {
    generation: u64,
    deadline: Instant,
    handle: JoinHandle<()>,
}

struct Inner<C> {
    config: AuthConfig,
    resolved: ArcSwap<ResolvedConfig>,
    backend: Arc<dyn AuthBackend>,
    host: Arc<dyn Host>,
    clock: C,
    state: watch::Sender<Arc<SessionState>>,
    phase: Mutex<SessionPhase>,
    timer: Mutex<Option<ScheduledRefresh>>,
    generation: AtomicU64,
    alive: AtomicBool,
    pending_login: Mutex<Option<OAuthState>>,
}

impl<C> Drop for Inner<C> {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.get_mut().take() {
            timer.handle.abort();
        }
    }
}

/// Builds a [`SessionController`]
pub struct SessionBuilder<C = System> {
    config: AuthConfig,
    backend: Arc<dyn AuthBackend>,
    host: Arc<dyn Host>,
    resolved: Option<ResolvedConfig>,
    clock: C,
}

impl<C: fmt::Debug> fmt::Debug for SessionBuilder<C> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SessionBuilder")
            .field("config", &self.config)
            .field("resolved", &self.resolved)
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}

impl SessionBuilder<System> {
    fn new(config: AuthConfig, backend: Arc<dyn AuthBackend>) -> Self {
        Self {
            config,
            backend,
            host: Arc::new(HeadlessHost),
            resolved: None,
            clock: System,
        }
    }
}

impl<C> SessionBuilder<C>
where
    C: Clock + Send + Sync + 'static,
{
    /// Sets the environment the session runs in
    ///
    /// Defaults to a [`HeadlessHost`].
    pub fn host(mut self, host: Arc<dyn Host>) -> Self {
        self.host = host;
        self
    }

    /// Uses an already resolved configuration instead of resolving one
    pub fn resolved(mut self, resolved: ResolvedConfig) -> Self {
        self.resolved = Some(resolved);
        self
    }

    /// Sets a custom clock to be used
    ///
    /// Useful for testing purposes
    pub fn clock<D>(self, clock: D) -> SessionBuilder<D> {
        SessionBuilder {
            config: self.config,
            backend: self.backend,
            host: self.host,
            resolved: self.resolved,
            clock,
        }
    }

    /// Validates the configuration and resolves its endpoints
    ///
    /// The session is not started; call [`SessionController::start`] to load it.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is unusable.
    pub async fn build(self) -> Result<SessionController<C>, ConfigurationError> {
        self.config.validate()?;

        let origin = self.host.origin();
        self.config.lint(origin.as_deref());

        let resolved = match self.resolved {
            Some(resolved) => resolved,
            None => {
                EndpointResolver::new(self.backend.clone(), origin)
                    .resolve(&self.config)
                    .await
            }
        };

        tracing::debug!(
            client_id = resolved.client_id().as_str(),
            auth_url = resolved.auth_url(),
            app_url = resolved.app_url(),
            api_url = resolved.api_url(),
            "resolved session endpoints"
        );

        let (state, _) = watch::channel(Arc::new(SessionState::default()));

        Ok(SessionController {
            inner: Arc::new(Inner {
                config: self.config,
                resolved: ArcSwap::from_pointee(resolved),
                backend: self.backend,
                host: self.host,
                clock: self.clock,
                state,
                phase: Mutex::new(SessionPhase::Idle),
                timer: Mutex::new(None),
                generation: AtomicU64::new(0),
                alive: AtomicBool::new(true),
                pending_login: Mutex::new(None),
            }),
        })
    }

    /// Builds the session and starts it
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is unusable. Failing to establish
    /// a session is not an error; the session is simply unauthenticated.
    pub async fn connect(self) -> Result<SessionController<C>, ConfigurationError> {
        let session = self.build().await?;
        session.start().await;
        Ok(session)
    }
}

/// A handle to a client-side session
///
/// The session is derived from a short-lived access token that is refreshed
/// in the background shortly before it expires. Handles are cheap to clone
/// and all share the same session. The session is torn down once every
/// handle has been dropped or [`shutdown`](Self::shutdown) is called.
pub struct SessionController<C = System> {
    inner: Arc<Inner<C>>,
}

impl<C> Clone for SessionController<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<C: fmt::Debug> fmt::Debug for SessionController<C> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SessionController")
            .field("config", &**self.inner.resolved.load())
            .field("phase", &*self.inner.phase.lock())
            .field("clock", &self.inner.clock)
            .finish_non_exhaustive()
    }
}

impl SessionController<System> {
    /// Begins building a session for `config` that talks to `backend`
    pub fn builder(config: AuthConfig, backend: Arc<dyn AuthBackend>) -> SessionBuilder<System> {
        SessionBuilder::new(config, backend)
    }
}

impl<C> SessionController<C>
where
    C: Clock + Send + Sync + 'static,
{
    /// Loads the session
    ///
    /// Attempts a refresh and, when that yields a token, loads the list of
    /// organizations. The loading flag is cleared once done.
    pub async fn start(&self) -> Option<AccessToken> {
        let token = self.refresh_token().await;

        if let Some(token) = &token {
            self.fetch_organizations(token).await;
        }

        if self.is_alive() {
            self.modify(|s| s.set_loading(false));
        }

        token
    }

    /// Gets an access token that remains valid for at least another minute
    ///
    /// The cached token is returned when it qualifies. Otherwise a refresh is
    /// attempted. Returns `None` when no session can be established, or when
    /// another refresh is already in flight.
    pub async fn get_access_token(&self) -> Option<AccessToken> {
        let current = self.inner.state.borrow().access_token().map(ToOwned::to_owned);

        if let Some(token) = current {
            match token::decode(&token) {
                Ok(claims) if claims.valid_beyond(self.inner.clock.now(), TOKEN_EXPIRY_MARGIN) => {
                    return Some(token);
                }
                Ok(claims) => {
                    tracing::debug!(expiry = claims.expiry().0, "cached token near expiry");
                }
                Err(error) => {
                    tracing::debug!(
                        error = (&error as &dyn error::Error),
                        "cached token unreadable"
                    );
                }
            }
        }

        self.refresh_token().await
    }

    /// Refreshes the session now
    ///
    /// Returns `None` if the refresh failed or another refresh is already in
    /// flight.
    pub async fn refresh_session(&self) -> Option<AccessToken> {
        self.refresh_token().await
    }

    async fn refresh_token(&self) -> Option<AccessToken> {
        if !self.is_alive() {
            return None;
        }

        let guard = match RefreshGuard::acquire(&self.inner.phase) {
            Some(guard) => guard,
            None => {
                tracing::debug!("refresh already in flight");
                return None;
            }
        };

        tracing::debug!("refreshing session");
        let config = self.inner.resolved.load_full();
        let result = self
            .inner
            .backend
            .refresh(&config)
            .await
            .map_err(TokenRequestError::from)
            .and_then(decoded);

        if !self.is_alive() {
            tracing::debug!("session shut down, discarding refresh result");
            return None;
        }

        match result {
            Ok((token, claims)) => {
                let require_org = self.inner.config.require_org();
                self.update(|s| s.with_token(token.clone(), &claims, require_org));
                guard.finish(SessionPhase::Authenticated);

                let delay = refresh_delay(claims.expiry(), self.inner.clock.now());
                self.schedule_refresh(delay);

                tracing::info!(
                    subject = %claims.sub,
                    expiry = claims.expiry().0,
                    refresh_in_ms = delay.as_millis() as u64,
                    "session refreshed"
                );

                Some(token)
            }
            Err(error) => {
                tracing::warn!(
                    error = (&error as &dyn error::Error),
                    "unable to refresh session"
                );

                self.cancel_scheduled_refresh();
                self.update(SessionState::without_token);
                guard.finish(SessionPhase::Unauthenticated);

                None
            }
        }
    }

    fn schedule_refresh(&self, delay: Duration) {
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let deadline = Instant::now() + delay;
        let weak = Arc::downgrade(&self.inner);

        let handle = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            run_scheduled_refresh(weak, generation).await;
        });

        let prior = self.inner.timer.lock().replace(ScheduledRefresh {
            generation,
            deadline,
            handle,
        });

        if let Some(prior) = prior {
            prior.handle.abort();
        }

        tracing::trace!(generation, delay_ms = delay.as_millis() as u64, "scheduled refresh");
    }

    fn cancel_scheduled_refresh(&self) {
        if let Some(timer) = self.inner.timer.lock().take() {
            tracing::trace!(generation = timer.generation, "cancelled scheduled refresh");
            timer.handle.abort();
        }
    }

    /// How long until the next scheduled refresh, if one is scheduled
    pub fn scheduled_refresh_in(&self) -> Option<Duration> {
        self.inner
            .timer
            .lock()
            .as_ref()
            .map(|t| t.deadline.saturating_duration_since(Instant::now()))
    }

    /// Redirects to the auth service to sign in
    ///
    /// The current path is carried through the redirect so the user can be
    /// returned there once signed in. When `provider` is given, the auth
    /// service sends the user straight to that provider.
    ///
    /// The session reports a login in progress only if the host can navigate.
    pub fn login(&self, provider: Option<&ProviderIdRef>) {
        let config = self.inner.resolved.load();
        let state = LoginState::generate(&self.inner.host.current_path()).encode();
        let url = login::authorize_url(&config, &state, provider);

        *self.inner.pending_login.lock() = Some(state);
        let navigating = self.inner.host.can_navigate();
        self.modify(|s| {
            s.set_logging_in(navigating);
            s.set_login_error(None);
        });

        tracing::info!(
            provider = provider.map(|p| p.as_str()),
            navigating,
            "redirecting to sign in"
        );
        self.inner.host.navigate(&url);
    }

    /// Signs out
    ///
    /// The server-side session is ended on a best-effort basis. The local
    /// session is cleared regardless of whether that succeeds.
    pub async fn logout(&self) {
        self.modify(|s| s.set_logging_out(true));

        let config = self.inner.resolved.load_full();
        if let Err(error) = self.inner.backend.logout(&config).await {
            tracing::warn!(
                error = (&error as &dyn error::Error),
                "unable to end server-side session, clearing local session anyway"
            );
        }

        self.cancel_scheduled_refresh();
        {
            let mut phase = self.inner.phase.lock();
            if *phase != SessionPhase::Refreshing {
                *phase = SessionPhase::Unauthenticated;
            }
        }
        self.update(SessionState::signed_out);

        tracing::info!("logged out");
    }

    /// Switches the session to another organization
    ///
    /// On success the whole session is derived anew from the issued token.
    /// The refresh schedule is left as it was.
    ///
    /// # Errors
    ///
    /// Returns an error if the switch is refused or the issued token cannot
    /// be read. The session is left untouched in that case.
    pub async fn switch_organization(&self, org_id: &OrgIdRef) -> Result<(), TokenRequestError> {
        let config = self.inner.resolved.load_full();
        let result = self
            .inner
            .backend
            .switch_organization(&config, org_id)
            .await
            .map_err(TokenRequestError::from)
            .and_then(decoded);

        let (token, claims) = match result {
            Ok(issued) => issued,
            Err(error) => {
                tracing::warn!(
                    error = (&error as &dyn error::Error),
                    org_id = org_id.as_str(),
                    "unable to switch organization"
                );
                return Err(error);
            }
        };

        if !self.is_alive() {
            return Ok(());
        }

        let require_org = self.inner.config.require_org();
        self.update(|s| s.with_token(token, &claims, require_org));
        {
            let mut phase = self.inner.phase.lock();
            if *phase != SessionPhase::Refreshing {
                *phase = SessionPhase::Authenticated;
            }
        }

        tracing::info!(org_id = org_id.as_str(), "switched organization");
        Ok(())
    }

    /// Reloads the list of organizations the user belongs to
    ///
    /// Failures are logged and otherwise ignored.
    pub async fn reload_organizations(&self) {
        let token = self.inner.state.borrow().access_token().map(ToOwned::to_owned);
        if let Some(token) = token {
            self.fetch_organizations(&token).await;
        }
    }

    async fn fetch_organizations(&self, token: &AccessToken) {
        let config = self.inner.resolved.load_full();
        match self.inner.backend.organizations(&config, token).await {
            Ok(organizations) if self.is_alive() => {
                tracing::debug!(count = organizations.len(), "loaded organizations");
                self.modify(|s| s.set_organizations(organizations));
            }
            Ok(_) => {}
            Err(error) => {
                tracing::warn!(
                    error = (&error as &dyn error::Error),
                    "unable to load organizations"
                );
            }
        }
    }

    /// Re-runs endpoint resolution against the auth service
    pub async fn reresolve(&self) {
        let resolver = EndpointResolver::new(self.inner.backend.clone(), self.inner.host.origin());
        let resolved = resolver.resolve(&self.inner.config).await;
        self.inner.resolved.store(Arc::new(resolved));
    }

    /// Tears the session down
    ///
    /// The scheduled refresh is cancelled and the results of any calls still
    /// in flight are discarded. Dropping every handle has the same effect.
    pub fn shutdown(&self) {
        if self.inner.alive.swap(false, Ordering::SeqCst) {
            self.cancel_scheduled_refresh();
            tracing::debug!("session shut down");
        }
    }
}

impl<C> SessionController<C> {
    /// The current session snapshot
    pub fn state(&self) -> Arc<SessionState> {
        self.inner.state.borrow().clone()
    }

    /// Subscribes to changes to the session
    pub fn subscribe(&self) -> SessionWatcher {
        SessionWatcher::new(self.inner.state.subscribe())
    }

    /// Where the refresh state machine currently sits
    pub fn phase(&self) -> SessionPhase {
        *self.inner.phase.lock()
    }

    /// The endpoints in use
    pub fn config(&self) -> Arc<ResolvedConfig> {
        self.inner.resolved.load_full()
    }

    /// The configuration the session was created with
    pub fn auth_config(&self) -> &AuthConfig {
        &self.inner.config
    }

    /// Whether the session has not been shut down
    pub fn is_alive(&self) -> bool {
        self.inner.alive.load(Ordering::SeqCst)
    }

    pub(crate) fn backend(&self) -> &dyn AuthBackend {
        &*self.inner.backend
    }

    pub(crate) fn backend_handle(&self) -> Arc<dyn AuthBackend> {
        self.inner.backend.clone()
    }

    pub(crate) fn host(&self) -> &dyn Host {
        &*self.inner.host
    }

    /// Takes the state registered by the most recent login
    pub(crate) fn take_login_state(&self) -> Option<OAuthState> {
        self.inner.pending_login.lock().take()
    }

    pub(crate) fn finish_login(&self, error: Option<String>) {
        self.modify(|s| {
            s.set_logging_in(false);
            s.set_login_error(error);
        });
    }

    /// Publishes a new snapshot derived from the current one
    fn update(&self, derive: impl FnOnce(&SessionState) -> SessionState) {
        self.inner.state.send_modify(|state| {
            let next = derive(state);
            *state = Arc::new(next);
        });
    }

    fn modify(&self, change: impl FnOnce(&mut SessionState)) {
        self.update(|state| {
            let mut next = state.clone();
            change(&mut next);
            next
        });
    }
}

async fn run_scheduled_refresh<C>(weak: Weak<Inner<C>>, generation: u64)
where
    C: Clock + Send + Sync + 'static,
{
    let inner = match weak.upgrade() {
        Some(inner) => inner,
        None => return,
    };

    {
        let mut timer = inner.timer.lock();
        match timer.as_ref() {
            Some(t) if t.generation == generation => {
                timer.take();
            }
            _ => {
                tracing::trace!(generation, "scheduled refresh superseded");
                return;
            }
        }
    }

    tracing::debug!(generation, "scheduled refresh due");
    SessionController { inner }.refresh_token().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::{self, Calls, FakeBackend, RecordingHost, ORG_ACME, T0};
    use tether_clock::TestClock;

    async fn session(backend: &Arc<FakeBackend>) -> (SessionController<TestClock>, TestClock) {
        let clock = TestClock::new(T0);
        let session = SessionController::builder(AuthConfig::new("client"), backend.clone())
            .resolved(test::resolved())
            .clock(clock.clone())
            .build()
            .await
            .unwrap();
        (session, clock)
    }

    #[test]
    fn refresh_delay_targets_a_minute_before_expiry() {
        assert_eq!(
            refresh_delay(T0 + Duration::from_secs(120), T0),
            Duration::from_secs(60)
        );
    }

    #[test]
    fn refresh_delay_has_a_floor() {
        assert_eq!(refresh_delay(T0 + Duration::from_secs(5), T0), MIN_REFRESH_DELAY);
        assert_eq!(refresh_delay(T0 - Duration::from_secs(5), T0), MIN_REFRESH_DELAY);
    }

    mod start {
        use super::*;

        #[tokio::test(start_paused = true)]
        async fn establishes_session_and_loads_organizations() {
            let token = test::token_expiring(ORG_ACME, T0, Duration::from_secs(3600));
            let backend = FakeBackend::issuing(token.clone());
            *backend.organizations.lock() = Some(vec![test::organization("org_acme")]);
            let (session, _) = session(&backend).await;

            assert!(session.state().is_loading());
            assert_eq!(session.phase(), SessionPhase::Idle);

            assert_eq!(session.start().await, Some(token.clone()));

            let state = session.state();
            assert!(state.is_authenticated());
            assert!(!state.is_loading());
            assert_eq!(state.access_token(), Some(&*token));
            assert_eq!(state.organizations().len(), 1);
            assert_eq!(session.phase(), SessionPhase::Authenticated);
            assert_eq!(backend.last_bearer.lock().as_deref(), Some(token.as_str()));
        }

        #[tokio::test(start_paused = true)]
        async fn without_session_skips_organizations() {
            let backend = FakeBackend::new();
            let (session, _) = session(&backend).await;

            assert_eq!(session.start().await, None);

            let state = session.state();
            assert!(!state.is_authenticated());
            assert!(!state.is_loading());
            assert_eq!(Calls::get(&backend.calls.organizations), 0);
            assert_eq!(session.phase(), SessionPhase::Unauthenticated);
        }

        #[tokio::test(start_paused = true)]
        #[tracing_test::traced_test]
        async fn tolerates_failing_organization_list() {
            let token = test::token_expiring(ORG_ACME, T0, Duration::from_secs(3600));
            let backend = FakeBackend::issuing(token);
            let (session, _) = session(&backend).await;

            session.start().await;

            assert!(session.state().is_authenticated());
            assert!(session.state().organizations().is_empty());
            assert!(logs_contain("unable to load organizations"));
        }

        #[tokio::test(start_paused = true)]
        async fn token_without_org_needs_require_org_off() {
            let token = test::token_expiring(None, T0, Duration::from_secs(3600));
            let backend = FakeBackend::issuing(token);

            let (strict, _) = session(&backend).await;
            strict.start().await;
            assert!(!strict.state().is_authenticated());

            let lenient = SessionController::builder(
                AuthConfig::new("client").with_require_org(false),
                backend.clone(),
            )
            .resolved(test::resolved())
            .clock(TestClock::new(T0))
            .build()
            .await
            .unwrap();
            lenient.start().await;
            assert!(lenient.state().is_authenticated());
        }
    }

    mod get_access_token {
        use super::*;

        #[tokio::test(start_paused = true)]
        async fn returns_cached_token_without_network() {
            let token = test::token_expiring(ORG_ACME, T0, Duration::from_secs(61));
            let backend = FakeBackend::issuing(token.clone());
            let (session, _) = session(&backend).await;
            session.start().await;

            assert_eq!(session.get_access_token().await, Some(token));
            assert_eq!(Calls::get(&backend.calls.refresh), 1);
        }

        #[tokio::test(start_paused = true)]
        async fn refreshes_once_when_near_expiry() {
            let stale = test::token_expiring(ORG_ACME, T0, Duration::from_secs(60));
            let backend = FakeBackend::issuing(stale);
            let (session, _) = session(&backend).await;
            session.start().await;

            let fresh = test::token_expiring(ORG_ACME, T0, Duration::from_secs(3600));
            backend.set_refresh(Some(fresh.clone()));

            assert_eq!(session.get_access_token().await, Some(fresh));
            assert_eq!(Calls::get(&backend.calls.refresh), 2);
        }

        #[tokio::test(start_paused = true)]
        async fn refreshes_once_when_expired() {
            let token = test::token_expiring(ORG_ACME, T0, Duration::from_secs(3600));
            let backend = FakeBackend::issuing(token);
            let (session, clock) = session(&backend).await;
            session.start().await;

            clock.advance(Duration::from_secs(7200));
            session.get_access_token().await;

            assert_eq!(Calls::get(&backend.calls.refresh), 2);
        }

        #[tokio::test(start_paused = true)]
        async fn refreshes_without_a_token() {
            let token = test::token_expiring(ORG_ACME, T0, Duration::from_secs(3600));
            let backend = FakeBackend::issuing(token.clone());
            let (session, _) = session(&backend).await;

            assert_eq!(session.get_access_token().await, Some(token));
            assert_eq!(Calls::get(&backend.calls.refresh), 1);
        }
    }

    mod refresh {
        use super::*;

        #[tokio::test(start_paused = true)]
        async fn is_single_flight() {
            let token = test::token_expiring(ORG_ACME, T0, Duration::from_secs(3600));
            let backend = FakeBackend::issuing(token.clone());
            let gate = backend.gate_refresh();
            let (session, _) = session(&backend).await;

            let first = tokio::spawn({
                let session = session.clone();
                async move { session.refresh_session().await }
            });
            test::settle().await;
            assert_eq!(session.phase(), SessionPhase::Refreshing);

            assert_eq!(session.refresh_session().await, None);

            gate.notify_one();
            assert_eq!(first.await.unwrap(), Some(token));
            assert_eq!(Calls::get(&backend.calls.refresh), 1);
            assert_eq!(session.phase(), SessionPhase::Authenticated);
        }

        #[tokio::test(start_paused = true)]
        async fn schedules_next_refresh_a_minute_before_expiry() {
            let token = test::token_expiring(ORG_ACME, T0, Duration::from_secs(120));
            let backend = FakeBackend::issuing(token);
            let (session, _) = session(&backend).await;
            session.start().await;

            assert_eq!(session.scheduled_refresh_in(), Some(Duration::from_secs(60)));

            tokio::time::advance(Duration::from_secs(59)).await;
            test::settle().await;
            assert_eq!(Calls::get(&backend.calls.refresh), 1);

            tokio::time::advance(Duration::from_secs(1)).await;
            test::settle().await;
            assert_eq!(Calls::get(&backend.calls.refresh), 2);
            assert_eq!(session.scheduled_refresh_in(), Some(Duration::from_secs(60)));
        }

        #[tokio::test(start_paused = true)]
        async fn waits_at_least_ten_seconds() {
            let token = test::token_expiring(ORG_ACME, T0, Duration::from_secs(5));
            let backend = FakeBackend::issuing(token);
            let (session, _) = session(&backend).await;
            session.start().await;

            assert_eq!(session.scheduled_refresh_in(), Some(MIN_REFRESH_DELAY));

            tokio::time::advance(Duration::from_secs(9)).await;
            test::settle().await;
            assert_eq!(Calls::get(&backend.calls.refresh), 1);
        }

        #[tokio::test(start_paused = true)]
        async fn rescheduling_replaces_the_prior_timer() {
            let token = test::token_expiring(ORG_ACME, T0, Duration::from_secs(120));
            let backend = FakeBackend::issuing(token);
            let (session, _) = session(&backend).await;
            session.start().await;
            session.refresh_session().await;
            session.refresh_session().await;

            tokio::time::advance(Duration::from_secs(60)).await;
            test::settle().await;

            assert_eq!(Calls::get(&backend.calls.refresh), 4);
        }

        #[tokio::test(start_paused = true)]
        #[tracing_test::traced_test]
        async fn failure_clears_session_and_stops_refreshing() {
            let token = test::token_expiring(ORG_ACME, T0, Duration::from_secs(120));
            let backend = FakeBackend::issuing(token);
            let (session, _) = session(&backend).await;
            session.start().await;

            backend.set_refresh(None);
            assert_eq!(session.refresh_session().await, None);

            let state = session.state();
            assert!(!state.is_authenticated());
            assert_eq!(state.access_token(), None);
            assert_eq!(state.user(), None);
            assert_eq!(state.organization(), None);
            assert!(!state.is_admin() && !state.is_owner() && !state.is_super_admin());
            assert_eq!(session.phase(), SessionPhase::Unauthenticated);
            assert_eq!(session.scheduled_refresh_in(), None);
            assert!(logs_contain("unable to refresh session"));

            tokio::time::advance(Duration::from_secs(3600)).await;
            test::settle().await;
            assert_eq!(Calls::get(&backend.calls.refresh), 2);
        }

        #[tokio::test(start_paused = true)]
        async fn unreadable_token_counts_as_failure() {
            let backend = FakeBackend::issuing(AccessToken::from_static("not-a-token"));
            let (session, _) = session(&backend).await;

            assert_eq!(session.refresh_session().await, None);
            assert!(!session.state().is_authenticated());
            assert_eq!(session.phase(), SessionPhase::Unauthenticated);
        }

        #[tokio::test(start_paused = true)]
        async fn abandoned_refresh_releases_the_guard() {
            let token = test::token_expiring(ORG_ACME, T0, Duration::from_secs(3600));
            let backend = FakeBackend::issuing(token);
            backend.gate_refresh();
            let (session, _) = session(&backend).await;

            let pending = tokio::spawn({
                let session = session.clone();
                async move { session.refresh_session().await }
            });
            test::settle().await;
            pending.abort();
            test::settle().await;

            assert_eq!(session.phase(), SessionPhase::Idle);
        }
    }

    mod logout {
        use super::*;

        #[tokio::test(start_paused = true)]
        async fn clears_session_even_when_the_call_fails() {
            let token = test::token_expiring(ORG_ACME, T0, Duration::from_secs(3600));
            let backend = FakeBackend::issuing(token);
            *backend.organizations.lock() = Some(vec![test::organization("org_acme")]);
            let (session, _) = session(&backend).await;
            session.start().await;

            session.logout().await;

            let state = session.state();
            assert_eq!(Calls::get(&backend.calls.logout), 1);
            assert!(!state.is_authenticated());
            assert!(!state.is_logging_out());
            assert_eq!(state.access_token(), None);
            assert!(state.organizations().is_empty());
            assert_eq!(session.scheduled_refresh_in(), None);
            assert_eq!(session.phase(), SessionPhase::Unauthenticated);
        }
    }

    mod switch_organization {
        use super::*;

        #[tokio::test(start_paused = true)]
        async fn rederives_the_session() {
            let token = test::token_expiring(ORG_ACME, T0, Duration::from_secs(3600));
            let backend = FakeBackend::issuing(token);
            let (session, _) = session(&backend).await;
            session.start().await;

            let other = test::token_expiring(Some(("org_beta", "member")), T0, Duration::from_secs(3600));
            *backend.switch_token.lock() = Some(other.clone());

            session
                .switch_organization(&crate::OrgId::from_static("org_beta"))
                .await
                .unwrap();

            let state = session.state();
            assert_eq!(backend.last_org.lock().as_deref(), Some("org_beta"));
            assert_eq!(state.organization().unwrap().id.as_str(), "org_beta");
            assert_eq!(state.org_role(), "member");
            assert!(!state.is_admin());
            assert_eq!(state.access_token(), Some(&*other));
        }

        #[tokio::test(start_paused = true)]
        async fn failure_leaves_state_identical() {
            let token = test::token_expiring(ORG_ACME, T0, Duration::from_secs(3600));
            let backend = FakeBackend::issuing(token);
            let (session, _) = session(&backend).await;
            session.start().await;
            let before = session.state();

            let result = session
                .switch_organization(&crate::OrgId::from_static("org_beta"))
                .await;

            assert!(matches!(result, Err(TokenRequestError::Backend(_))));
            assert_eq!(*session.state(), *before);
        }

        #[tokio::test(start_paused = true)]
        async fn unreadable_token_leaves_state_identical() {
            let token = test::token_expiring(ORG_ACME, T0, Duration::from_secs(3600));
            let backend = FakeBackend::issuing(token);
            let (session, _) = session(&backend).await;
            session.start().await;
            let before = session.state();

            *backend.switch_token.lock() = Some(AccessToken::from_static("garbage"));
            let result = session
                .switch_organization(&crate::OrgId::from_static("org_beta"))
                .await;

            assert!(matches!(result, Err(TokenRequestError::Malformed(_))));
            assert_eq!(*session.state(), *before);
        }
    }

    mod login {
        use super::*;

        #[tokio::test(start_paused = true)]
        async fn navigates_to_authorize_with_return_path() {
            let backend = FakeBackend::new();
            let host = RecordingHost::new(Some("https://app.test"), "/settings");
            let session = SessionController::builder(AuthConfig::new("client"), backend.clone())
                .resolved(test::resolved())
                .host(host.clone())
                .build()
                .await
                .unwrap();

            session.login(Some(&crate::ProviderId::from_static("github")));

            let url = url::Url::parse(&host.last_navigation().unwrap()).unwrap();
            assert_eq!(url.path(), "/authorize");
            let state = url
                .query_pairs()
                .find(|(k, _)| k == "state")
                .map(|(_, v)| OAuthState::new(v.into_owned()))
                .unwrap();
            assert_eq!(LoginState::decode(&state).unwrap().return_to(), "/settings");
            assert_eq!(session.take_login_state(), Some(state));
            assert!(session.state().is_logging_in());
            assert_eq!(session.state().login_error(), None);
        }

        #[tokio::test(start_paused = true)]
        async fn headless_hosts_do_not_report_a_login_in_progress() {
            let backend = FakeBackend::new();
            let (session, _) = session(&backend).await;

            session.login(None);

            assert!(!session.state().is_logging_in());
            assert!(session.take_login_state().is_some());
        }
    }

    mod shutdown {
        use super::*;

        #[tokio::test(start_paused = true)]
        async fn cancels_the_scheduled_refresh() {
            let token = test::token_expiring(ORG_ACME, T0, Duration::from_secs(120));
            let backend = FakeBackend::issuing(token);
            let (session, _) = session(&backend).await;
            session.start().await;

            session.shutdown();
            assert_eq!(session.scheduled_refresh_in(), None);

            tokio::time::advance(Duration::from_secs(3600)).await;
            test::settle().await;
            assert_eq!(Calls::get(&backend.calls.refresh), 1);
        }

        #[tokio::test(start_paused = true)]
        async fn discards_results_still_in_flight() {
            let token = test::token_expiring(ORG_ACME, T0, Duration::from_secs(3600));
            let backend = FakeBackend::issuing(token);
            let gate = backend.gate_refresh();
            let (session, _) = session(&backend).await;

            let pending = tokio::spawn({
                let session = session.clone();
                async move { session.refresh_session().await }
            });
            test::settle().await;

            session.shutdown();
            gate.notify_one();

            assert_eq!(pending.await.unwrap(), None);
            assert_eq!(session.state().access_token(), None);
            assert_eq!(session.scheduled_refresh_in(), None);
        }

        #[tokio::test(start_paused = true)]
        async fn dropping_every_handle_closes_watchers() {
            let backend = FakeBackend::new();
            let (session, _) = session(&backend).await;
            let mut watcher = session.subscribe();

            drop(session);

            assert!(watcher.changed().await.is_err());
        }
    }

    #[tokio::test]
    async fn build_rejects_invalid_config() {
        let result = SessionController::builder(AuthConfig::new(""), FakeBackend::new())
            .build()
            .await;

        assert!(matches!(result, Err(ConfigurationError::MissingClientId)));
    }

    #[tokio::test]
    async fn build_resolves_endpoints() {
        let backend = FakeBackend::new();
        let session = SessionController::builder(AuthConfig::new("x"), backend.clone())
            .host(RecordingHost::new(Some("https://origin.test"), "/"))
            .build()
            .await
            .unwrap();

        assert_eq!(session.config().app_url(), "https://origin.test");
        assert_eq!(Calls::get(&backend.calls.discover), 1);

        *backend.discovery.lock() = Some(crate::backend::AppDiscovery {
            app_url: Some(String::from("https://app.test")),
            api_url: None,
        });
        session.reresolve().await;

        assert_eq!(session.config().app_url(), "https://app.test");
        assert_eq!(session.config().api_url(), "https://app.test");
    }
}
