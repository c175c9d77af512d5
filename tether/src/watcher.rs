use crate::SessionState;
use std::{ops, sync::Arc};
use thiserror::Error;
use tokio::sync::watch;

/// A watcher that can be used to observe a session as it changes
///
/// Every change to the session is published as a whole new snapshot, so a
/// watcher never observes a partially applied update.
#[derive(Clone, Debug)]
pub struct SessionWatcher {
    watcher: watch::Receiver<Arc<SessionState>>,
}

/// An outstanding borrow of a session snapshot
///
/// This borrow should be held for as brief a time as possible, as outstanding
/// borrows will block the publication of new snapshots.
#[derive(Debug)]
pub struct BorrowedSession<'a> {
    inner: watch::Ref<'a, Arc<SessionState>>,
}

impl<'a> ops::Deref for BorrowedSession<'a> {
    type Target = SessionState;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

/// The session was torn down and will publish no further changes
#[derive(Clone, Copy, Debug, Error)]
#[error("session publisher has quit")]
pub struct SessionPublisherQuit;

impl From<watch::error::RecvError> for SessionPublisherQuit {
    fn from(_: watch::error::RecvError) -> Self {
        Self
    }
}

impl SessionWatcher {
    pub(crate) fn new(watcher: watch::Receiver<Arc<SessionState>>) -> Self {
        Self { watcher }
    }

    /// Borrows the current session snapshot
    ///
    /// This borrow should be short-lived as outstanding borrows will block
    /// the publisher being able to report new snapshots.
    pub fn session(&self) -> BorrowedSession {
        BorrowedSession {
            inner: self.watcher.borrow(),
        }
    }

    /// Clones out the current session snapshot
    pub fn snapshot(&self) -> Arc<SessionState> {
        self.watcher.borrow().clone()
    }

    /// A future that returns as ready whenever a new snapshot is published
    ///
    /// If the session is torn down, this function will return an error
    /// indicating that no new snapshots will be published.
    pub async fn changed(&mut self) -> Result<(), SessionPublisherQuit> {
        Ok(self.watcher.changed().await?)
    }

    /// Waits until a published snapshot satisfies `predicate`
    ///
    /// Returns immediately if the current snapshot already satisfies it.
    pub async fn wait_for(
        &mut self,
        mut predicate: impl FnMut(&SessionState) -> bool,
    ) -> Result<Arc<SessionState>, SessionPublisherQuit> {
        loop {
            {
                let current = self.watcher.borrow_and_update();
                if predicate(&current) {
                    return Ok(current.clone());
                }
            }

            self.changed().await?;
        }
    }
}
