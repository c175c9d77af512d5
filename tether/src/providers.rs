//! Sign-in provider discovery with stale-while-revalidate caching
//!
//! Provider lists change rarely, so an entry is served from the cache for up
//! to [`PROVIDER_CACHE_TTL`] without touching the network. Past that, the
//! stale entry is still served while a fresh copy is fetched in the
//! background.

use std::{
    collections::HashMap,
    error, fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use arc_swap::ArcSwap;
use once_cell::sync::Lazy;
use tether_clock::{Clock, System, UnixMillis};
use thiserror::Error;
use tokio::sync::watch;

use crate::{
    backend::{AuthBackend, BackendError, ProviderInfo, ProvidersResponse},
    ClientId, ClientIdRef, SessionController,
};

/// How long a cached provider list is served without revalidation
pub const PROVIDER_CACHE_TTL: Duration = Duration::from_secs(60);

static GLOBAL: Lazy<Arc<ProviderCache>> = Lazy::new(|| Arc::new(ProviderCache::new()));

/// The provider list could not be fetched
#[derive(Debug, Error)]
pub enum ProviderFetchError {
    /// The auth service answered with a non-success status
    #[error("Failed to fetch providers: {status}")]
    Status {
        /// The response status
        status: u16,
        /// The underlying error
        #[source]
        source: BackendError,
    },
    /// The auth service could not be reached or its answer could not be read
    #[error("Failed to fetch providers")]
    Transport(#[source] BackendError),
}

impl From<BackendError> for ProviderFetchError {
    fn from(source: BackendError) -> Self {
        match source.status() {
            Some(status) => Self::Status {
                status: status.as_u16(),
                source,
            },
            None => Self::Transport(source),
        }
    }
}

/// A cached provider list
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProviderCacheEntry {
    /// Available providers
    pub providers: Vec<ProviderInfo>,
    /// Whether email sign-in is enabled
    pub email_enabled: bool,
    /// When the list was fetched
    pub fetched_at: UnixMillis,
}

impl ProviderCacheEntry {
    /// Whether the entry has outlived [`PROVIDER_CACHE_TTL`] at `now`
    pub fn is_stale(&self, now: UnixMillis) -> bool {
        now.saturating_duration_since(self.fetched_at) > PROVIDER_CACHE_TTL
    }
}

/// The outcome of a cache lookup
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CacheLookup {
    /// Nothing is cached
    Miss,
    /// A cached entry exists but should be revalidated
    Stale(Arc<ProviderCacheEntry>),
    /// A cached entry exists and can be used as is
    Fresh(Arc<ProviderCacheEntry>),
}

/// A cache of provider lists, keyed by auth service and client
///
/// Entries are only ever replaced wholesale. Readers never block writers.
pub struct ProviderCache<C = System> {
    entries: ArcSwap<HashMap<String, Arc<ProviderCacheEntry>>>,
    clock: C,
}

impl<C: fmt::Debug> fmt::Debug for ProviderCache<C> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ProviderCache")
            .field("entries", &self.entries.load().len())
            .field("clock", &self.clock)
            .finish()
    }
}

impl Default for ProviderCache<System> {
    fn default() -> Self {
        Self::new()
    }
}

impl ProviderCache<System> {
    /// Constructs an empty cache
    pub fn new() -> Self {
        Self::with_clock(System)
    }

    /// The process-wide cache
    pub fn global() -> Arc<Self> {
        GLOBAL.clone()
    }
}

impl<C: Clock> ProviderCache<C> {
    /// Constructs an empty cache using the given clock
    pub fn with_clock(clock: C) -> Self {
        Self {
            entries: ArcSwap::default(),
            clock,
        }
    }

    /// The cache key for a client of an auth service
    pub fn key(auth_url: &str, client_id: &ClientIdRef) -> String {
        format!("{}::{}", auth_url, client_id.as_str())
    }

    /// Gets the cached entry, regardless of age
    pub fn get(&self, key: &str) -> Option<Arc<ProviderCacheEntry>> {
        self.entries.load().get(key).cloned()
    }

    /// Gets the cached entry along with whether it is still fresh
    pub fn lookup(&self, key: &str) -> CacheLookup {
        match self.get(key) {
            None => CacheLookup::Miss,
            Some(entry) if entry.is_stale(self.clock.now()) => CacheLookup::Stale(entry),
            Some(entry) => CacheLookup::Fresh(entry),
        }
    }

    /// Caches a freshly fetched list, replacing any prior entry
    pub fn insert(&self, key: &str, list: ProvidersResponse) -> Arc<ProviderCacheEntry> {
        let entry = Arc::new(ProviderCacheEntry {
            providers: list.providers,
            email_enabled: list.email_enabled,
            fetched_at: self.clock.now(),
        });

        self.entries.rcu(|entries| {
            let mut entries = HashMap::clone(entries);
            entries.insert(key.to_owned(), entry.clone());
            entries
        });

        entry
    }

    /// Removes the entry
    pub fn evict(&self, key: &str) {
        self.entries.rcu(|entries| {
            let mut entries = HashMap::clone(entries);
            entries.remove(key);
            entries
        });
    }

    /// Fetches the provider list and caches it
    ///
    /// # Errors
    ///
    /// Returns an error if the list cannot be fetched. The cache is left as
    /// it was.
    pub async fn fetch(
        &self,
        backend: &dyn AuthBackend,
        auth_url: &str,
        client_id: &ClientIdRef,
    ) -> Result<Arc<ProviderCacheEntry>, ProviderFetchError> {
        let list = backend.providers(auth_url, client_id).await?;
        Ok(self.insert(&Self::key(auth_url, client_id), list))
    }
}

/// What a provider list currently shows
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProviderView {
    /// Available providers
    pub providers: Vec<ProviderInfo>,
    /// Whether email sign-in is enabled
    pub email_enabled: bool,
    /// Whether a fetch the view is waiting on is in flight
    pub is_loading: bool,
    /// The error from the most recent failed fetch
    pub error: Option<String>,
}

impl Default for ProviderView {
    fn default() -> Self {
        Self {
            providers: Vec::new(),
            email_enabled: false,
            is_loading: true,
            error: None,
        }
    }
}

struct ListInner<C> {
    cache: Arc<ProviderCache<C>>,
    backend: Arc<dyn AuthBackend>,
    auth_url: String,
    client_id: ClientId,
    key: String,
    view: watch::Sender<ProviderView>,
    mounted: AtomicBool,
    revalidating: AtomicBool,
}

impl<C: Clock> ListInner<C> {
    fn is_mounted(&self) -> bool {
        self.mounted.load(Ordering::SeqCst)
    }

    fn show(&self, entry: &ProviderCacheEntry) {
        if !self.is_mounted() {
            return;
        }

        self.view.send_modify(|view| {
            view.providers = entry.providers.clone();
            view.email_enabled = entry.email_enabled;
            view.is_loading = false;
            view.error = None;
        });
    }

    async fn fetch(&self) -> Result<Arc<ProviderCacheEntry>, ProviderFetchError> {
        self.cache
            .fetch(&*self.backend, &self.auth_url, &self.client_id)
            .await
    }

    async fn load(&self) {
        if self.is_mounted() {
            self.view.send_modify(|view| view.is_loading = true);
        }

        match self.fetch().await {
            Ok(entry) => self.show(&entry),
            Err(error) => {
                tracing::warn!(
                    error = (&error as &dyn error::Error),
                    key = self.key.as_str(),
                    "unable to fetch providers"
                );

                if self.is_mounted() {
                    self.view.send_modify(|view| {
                        view.is_loading = false;
                        view.error = Some(error.to_string());
                    });
                }
            }
        }
    }

    async fn revalidate(&self) {
        match self.fetch().await {
            Ok(entry) => {
                tracing::debug!(key = self.key.as_str(), "revalidated providers");
                self.show(&entry);
            }
            Err(error) => {
                tracing::warn!(
                    error = (&error as &dyn error::Error),
                    key = self.key.as_str(),
                    "unable to revalidate providers, keeping cached list"
                );
            }
        }
    }
}

/// The sign-in providers for one client, as shown by a consumer
///
/// Mirrors the shared [`ProviderCache`]. Mount it to populate the view, call
/// [`on_focus`](Self::on_focus) when the consumer regains focus, and unmount
/// it when the consumer goes away. Results arriving after unmounting are
/// ignored.
pub struct ProviderList<C = System> {
    inner: Arc<ListInner<C>>,
}

impl<C> Clone for ProviderList<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<C> fmt::Debug for ProviderList<C> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ProviderList")
            .field("key", &self.inner.key)
            .field("view", &*self.inner.view.borrow())
            .finish_non_exhaustive()
    }
}

impl ProviderList<System> {
    /// Constructs a list backed by the process-wide cache
    pub fn new(
        backend: Arc<dyn AuthBackend>,
        auth_url: impl Into<String>,
        client_id: ClientId,
    ) -> Self {
        Self::with_cache(ProviderCache::global(), backend, auth_url, client_id)
    }

    /// Constructs a list for the client and auth service of a session
    pub fn for_session<D>(session: &SessionController<D>) -> Self {
        let config = session.config();
        Self::new(
            session.backend_handle(),
            config.auth_url(),
            config.client_id().to_owned(),
        )
    }
}

impl<C> ProviderList<C>
where
    C: Clock + Send + Sync + 'static,
{
    /// Constructs a list backed by `cache`
    pub fn with_cache(
        cache: Arc<ProviderCache<C>>,
        backend: Arc<dyn AuthBackend>,
        auth_url: impl Into<String>,
        client_id: ClientId,
    ) -> Self {
        let auth_url = auth_url.into();
        let key = ProviderCache::<C>::key(&auth_url, &client_id);
        let (view, _) = watch::channel(ProviderView::default());

        Self {
            inner: Arc::new(ListInner {
                cache,
                backend,
                auth_url,
                client_id,
                key,
                view,
                mounted: AtomicBool::new(true),
                revalidating: AtomicBool::new(false),
            }),
        }
    }

    /// Populates the view
    ///
    /// A fresh cached list is shown as is. A stale one is shown while it is
    /// revalidated in the background. Without a cached list, one is fetched
    /// and the view shows as loading until it arrives.
    pub async fn mount(&self) {
        match self.inner.cache.lookup(&self.inner.key) {
            CacheLookup::Fresh(entry) => {
                tracing::trace!(key = self.inner.key.as_str(), "providers fresh in cache");
                self.inner.show(&entry);
            }
            CacheLookup::Stale(entry) => {
                self.inner.show(&entry);

                if self.inner.revalidating.swap(true, Ordering::SeqCst) {
                    tracing::trace!(
                        key = self.inner.key.as_str(),
                        "revalidation already in flight"
                    );
                    return;
                }

                tracing::debug!(key = self.inner.key.as_str(), "providers stale, revalidating");
                let inner = self.inner.clone();
                tokio::spawn(async move {
                    inner.revalidate().await;
                    inner.revalidating.store(false, Ordering::SeqCst);
                });
            }
            CacheLookup::Miss => {
                tracing::debug!(key = self.inner.key.as_str(), "providers not cached, fetching");
                self.inner.load().await;
            }
        }
    }

    /// Re-checks the cached list after the consumer regains focus
    pub async fn on_focus(&self) {
        self.mount().await;
    }

    /// Discards the cached list and fetches a new one
    pub async fn refresh(&self) {
        self.inner.cache.evict(&self.inner.key);
        self.inner.load().await;
    }

    /// Stops updating the view
    pub fn unmount(&self) {
        self.inner.mounted.store(false, Ordering::SeqCst);
    }

    /// What the list currently shows
    pub fn view(&self) -> ProviderView {
        self.inner.view.borrow().clone()
    }

    /// Subscribes to changes to the view
    pub fn subscribe(&self) -> watch::Receiver<ProviderView> {
        self.inner.view.subscribe()
    }
}
