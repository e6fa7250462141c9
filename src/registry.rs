use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::native::NativeBoundary;
use crate::session::lock;
use crate::{OwnerId, P4Error, P4Session, RecentResults, RecentResultsConfig, ResultBundle, SessionConfig};

/// One session per owner, all sharing a "last results" cache.
///
/// Each owner gets its own [`P4Session`] bound to it, so concurrent owners
/// never queue behind each other's run-locks.
///
/// # Example
///
/// ```rust,no_run
/// # use std::sync::Arc;
/// # use p4engine::{MockBoundary, OwnerId, SessionConfig, SessionRegistry};
/// # async fn demo() -> p4engine::Result<()> {
/// let registry = SessionRegistry::new(
///     Arc::new(MockBoundary::new()),
///     SessionConfig::new("localhost:6666"),
/// );
/// let owner = OwnerId::new();
/// let session = registry.session_for(owner);
/// session.run(owner, "info", &[]).await?;
/// assert!(registry.last_results(owner).is_some());
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("sessions", &self.len())
            .finish()
    }
}

struct RegistryInner {
    boundary: Arc<dyn NativeBoundary>,
    config: SessionConfig,
    recent: Arc<RecentResults>,
    sessions: Mutex<HashMap<OwnerId, P4Session>>,
}

impl SessionRegistry {
    /// Creates an empty registry.
    ///
    /// `config` is used for sessions created on demand.
    pub fn new(boundary: Arc<dyn NativeBoundary>, config: SessionConfig) -> Self {
        Self::with_recent_results(boundary, config, RecentResultsConfig::default())
    }

    /// Creates an empty registry with explicit cache bounds.
    pub fn with_recent_results(
        boundary: Arc<dyn NativeBoundary>,
        config: SessionConfig,
        recent: RecentResultsConfig,
    ) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                boundary,
                config,
                recent: Arc::new(RecentResults::new(recent)),
                sessions: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Returns (and creates if needed) the session bound to `owner`.
    pub fn session_for(&self, owner: OwnerId) -> P4Session {
        let mut sessions = lock(&self.inner.sessions);
        if let Some(session) = sessions.get(&owner)
            && !session.is_disposed()
        {
            return session.clone();
        }
        debug!(%owner, "creating session");
        let session = P4Session::builder(self.inner.boundary.clone(), self.inner.config.clone())
            .owner(owner)
            .recent_results(self.inner.recent.clone())
            .build();
        sessions.insert(owner, session.clone());
        session
    }

    /// Removes and closes the session bound to `owner`.
    pub async fn remove(&self, owner: OwnerId) -> Result<bool, P4Error> {
        let session = lock(&self.inner.sessions).remove(&owner);
        let Some(session) = session else {
            return Ok(false);
        };
        self.inner.recent.clear_owner(owner);
        session.close().await?;
        Ok(true)
    }

    /// Closes every session.
    pub async fn close_all(&self) -> Result<(), P4Error> {
        let sessions: Vec<P4Session> = lock(&self.inner.sessions)
            .drain()
            .map(|(_, session)| session)
            .collect();
        debug!(count = sessions.len(), "closing all sessions");
        for session in sessions {
            session.close().await?;
        }
        Ok(())
    }

    /// Returns the most recent bundle `owner` received.
    pub fn last_results(&self, owner: OwnerId) -> Option<Arc<ResultBundle>> {
        self.inner.recent.last(owner)
    }

    /// Returns the shared cache.
    pub fn recent_results(&self) -> &Arc<RecentResults> {
        &self.inner.recent
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        lock(&self.inner.sessions).len()
    }

    /// Returns `true` if no session has been created.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
