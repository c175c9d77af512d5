//! The environment a session runs in

use std::fmt;

/// The embedding environment
///
/// Supplies the facts a browser page would know about itself and performs
/// navigation on behalf of the session.
pub trait Host: Send + Sync {
    /// The origin the application is served from, if there is one
    fn origin(&self) -> Option<String>;

    /// The path currently displayed, used as the post-login return path
    fn current_path(&self) -> String;

    /// Navigates away to `url`
    fn navigate(&self, url: &str);

    /// Whether [`navigate`](Self::navigate) actually leaves the current page
    fn can_navigate(&self) -> bool {
        true
    }
}

/// A host with no origin and no navigation capability
///
/// Navigation requests are logged and otherwise ignored. Useful for
/// command-line and server-side consumers.
#[derive(Clone, Copy, Debug, Default)]
pub struct HeadlessHost;

impl Host for HeadlessHost {
    fn origin(&self) -> Option<String> {
        None
    }

    fn current_path(&self) -> String {
        String::from("/")
    }

    fn navigate(&self, url: &str) {
        tracing::info!(url, "navigation requested by headless host");
    }

    fn can_navigate(&self) -> bool {
        false
    }
}

/// A host with a fixed origin and path
#[derive(Clone)]
pub struct StaticHost<F> {
    origin: Option<String>,
    path: String,
    on_navigate: F,
    navigates: bool,
}

impl StaticHost<fn(&str)> {
    /// Constructs a host that reports `origin` and `path` and ignores navigation
    pub fn new(origin: Option<String>, path: impl Into<String>) -> Self {
        Self {
            origin,
            path: path.into(),
            on_navigate: |_| {},
            navigates: false,
        }
    }
}

impl<F> StaticHost<F> {
    /// Replaces the navigation handler
    pub fn on_navigate<G>(self, on_navigate: G) -> StaticHost<G>
    where
        G: Fn(&str) + Send + Sync,
    {
        StaticHost {
            origin: self.origin,
            path: self.path,
            on_navigate,
            navigates: true,
        }
    }
}

impl<F> fmt::Debug for StaticHost<F> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("StaticHost")
            .field("origin", &self.origin)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl<F> Host for StaticHost<F>
where
    F: Fn(&str) + Send + Sync,
{
    fn origin(&self) -> Option<String> {
        self.origin.clone()
    }

    fn current_path(&self) -> String {
        self.path.clone()
    }

    fn navigate(&self, url: &str) {
        (self.on_navigate)(url)
    }

    fn can_navigate(&self) -> bool {
        self.navigates
    }
}
