//! Session registry: the single source of truth for which users currently
//! hold an in-memory session.
//!
//! Reads (`get`, `list`, `status`) take the shared lock; `create`, `remove`
//! and the create path of `get_or_create` take the exclusive lock. The
//! existence check and the insert happen inside one exclusive critical
//! section, so two racing callers for the same absent user can never both
//! build a connection handle. The create path opens the user's SQLite
//! files while holding the exclusive lock, so reads for every user wait on
//! that disk I/O. Network I/O never happens under the lock.
//!
//! Removal runs under the session's operation lock: the session is torn
//! down first and its entry is dropped afterwards, and only if the entry
//! still points at that session. Until then `get_or_create` keeps returning
//! the retiring session, so a fresh session for the same user never opens
//! its stores before the old one has closed them.

use super::{Session, SessionStatus};
use crate::connection::ConnectionFactory;
use crate::error::{SessionError, UserId};
use crate::storage::StorageFactory;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

pub struct SessionRegistry {
    sessions: RwLock<HashMap<UserId, Arc<Session>>>,
    storage: Arc<dyn StorageFactory>,
    connector: Arc<dyn ConnectionFactory>,
}

impl SessionRegistry {
    pub fn new(storage: Arc<dyn StorageFactory>, connector: Arc<dyn ConnectionFactory>) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            storage,
            connector,
        }
    }

    pub fn get(&self, user_id: UserId) -> Option<Arc<Session>> {
        self.sessions.read().get(&user_id).cloned()
    }

    /// Create a session, or return the existing one unchanged.
    pub fn create(&self, user_id: UserId, username: &str) -> Result<Arc<Session>, SessionError> {
        let mut sessions = self.sessions.write();
        if let Some(existing) = sessions.get(&user_id) {
            tracing::debug!(user_id, username, "Session already exists");
            return Ok(Arc::clone(existing));
        }

        tracing::info!(user_id, username, "Creating session");
        let stores = Arc::new(
            self.storage
                .open(user_id)
                .map_err(|e| SessionError::storage(user_id, e))?,
        );
        let connection = match self.connector.build(user_id, Arc::clone(&stores)) {
            Ok(conn) => conn,
            Err(e) => {
                if let Err(close_err) = stores.close() {
                    tracing::warn!(user_id, "Failed to close stores after build error: {close_err}");
                }
                return Err(SessionError::storage(user_id, e));
            }
        };

        let session = Arc::new(Session::new(
            user_id,
            username.to_string(),
            Some(connection),
            stores,
        ));
        sessions.insert(user_id, Arc::clone(&session));
        tracing::info!(user_id, username, "Session created");
        Ok(session)
    }

    /// Existing session if present, otherwise create one.
    pub fn get_or_create(
        &self,
        user_id: UserId,
        username: &str,
    ) -> Result<Arc<Session>, SessionError> {
        if let Some(session) = self.get(user_id) {
            return Ok(session);
        }
        self.create(user_id, username)
    }

    /// Tear a session down (disconnect, close both stores), then detach it.
    pub async fn remove(&self, user_id: UserId) -> Result<(), SessionError> {
        let session = self.get(user_id).ok_or(SessionError::NotFound(user_id))?;
        let _ops = session.lock_ops().await;
        self.ensure_current(&session)?;

        if session.connection().is_none() {
            tracing::warn!(user_id, "Removing session without a connection handle");
        }
        self.retire_locked(&session).await?;

        tracing::info!(user_id, username = session.username(), "Session removed");
        Ok(())
    }

    /// Whether `session` is still the live entry for its user.
    pub(crate) fn is_current(&self, session: &Arc<Session>) -> bool {
        !session.is_retired()
            && self
                .sessions
                .read()
                .get(&session.user_id())
                .is_some_and(|current| Arc::ptr_eq(current, session))
    }

    /// `NotFound` once `session` has been retired or replaced.
    pub(crate) fn ensure_current(&self, session: &Arc<Session>) -> Result<(), SessionError> {
        if self.is_current(session) {
            Ok(())
        } else {
            Err(SessionError::NotFound(session.user_id()))
        }
    }

    /// Tear down `session` and drop its entry. The caller holds the
    /// session's operation lock.
    pub(crate) async fn retire_locked(&self, session: &Arc<Session>) -> Result<(), SessionError> {
        let closed = session.teardown().await;
        self.remove_session(session);
        closed.map_err(|e| SessionError::storage(session.user_id(), e))
    }

    /// Drop the entry for `session`'s user only if it is this exact session.
    pub(crate) fn remove_session(&self, session: &Arc<Session>) -> bool {
        let mut sessions = self.sessions.write();
        match sessions.get(&session.user_id()) {
            Some(current) if Arc::ptr_eq(current, session) => {
                sessions.remove(&session.user_id());
                true
            }
            _ => false,
        }
    }

    /// Snapshot of all sessions; unaffected by later creates or removes.
    pub fn list(&self) -> HashMap<UserId, Arc<Session>> {
        self.sessions.read().clone()
    }

    pub fn status(&self, user_id: UserId) -> SessionStatus {
        self.get(user_id)
            .map(|session| session.status())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    /// Detach every session at once (shutdown path).
    pub(crate) fn drain(&self) -> Vec<Arc<Session>> {
        self.sessions.write().drain().map(|(_, s)| s).collect()
    }

    /// Insert a session that has no connection handle.
    #[cfg(test)]
    pub(crate) fn insert_uninitialized(&self, user_id: UserId, username: &str) {
        let stores = Arc::new(crate::storage::StorePair::in_memory().unwrap());
        let session = Session::new(user_id, username.to_string(), None, stores);
        self.sessions.write().insert(user_id, Arc::new(session));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::fake::FakeConnector;
    use crate::connection::Connection;
    use crate::storage::SqliteStorageFactory;
    use tempfile::TempDir;

    fn registry() -> (TempDir, Arc<FakeConnector>, SessionRegistry) {
        let tmp = TempDir::new().unwrap();
        let connector = Arc::new(FakeConnector::default());
        let registry = SessionRegistry::new(
            Arc::new(SqliteStorageFactory::new(tmp.path(), true)),
            connector.clone(),
        );
        (tmp, connector, registry)
    }

    #[test]
    fn create_is_idempotent() {
        let (_tmp, connector, registry) = registry();

        let first = registry.create(1, "alice").unwrap();
        let second = registry.create(1, "alice").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(connector.build_count(), 1);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn concurrent_get_or_create_builds_exactly_one_handle() {
        let (_tmp, connector, registry) = registry();
        let registry = Arc::new(registry);

        let sessions: Vec<Arc<Session>> = std::thread::scope(|scope| {
            let workers: Vec<_> = (0..16)
                .map(|_| {
                    let registry = Arc::clone(&registry);
                    scope.spawn(move || registry.get_or_create(7, "grace").unwrap())
                })
                .collect();
            workers.into_iter().map(|w| w.join().unwrap()).collect()
        });

        assert_eq!(connector.build_count(), 1);
        assert!(sessions.iter().all(|s| Arc::ptr_eq(s, &sessions[0])));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn distinct_users_get_distinct_sessions() {
        let (_tmp, connector, registry) = registry();
        let a = registry.get_or_create(1, "a").unwrap();
        let b = registry.get_or_create(2, "b").unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(connector.build_count(), 2);
    }

    #[tokio::test]
    async fn remove_then_create_builds_fresh_handle() {
        let (_tmp, connector, registry) = registry();
        let old = registry.create(3, "carol").unwrap();
        connector.handle(3).unwrap().connect().await.unwrap();

        registry.remove(3).await.unwrap();
        assert!(registry.get(3).is_none());
        assert!(old.is_retired());
        assert!(old.stores().is_closed());
        assert!(!connector.handle(3).unwrap().is_connected());

        let fresh = registry.create(3, "carol").unwrap();
        assert!(!Arc::ptr_eq(&old, &fresh));
        assert_eq!(connector.build_count(), 2);
        assert!(!fresh.stores().is_closed());
    }

    #[tokio::test]
    async fn remove_missing_user_is_not_found() {
        let (_tmp, _connector, registry) = registry();
        assert!(matches!(
            registry.remove(99).await,
            Err(SessionError::NotFound(99))
        ));
    }

    #[tokio::test]
    async fn remove_tolerates_missing_handle_and_prior_disconnect() {
        let (_tmp, connector, registry) = registry();
        registry.insert_uninitialized(4, "dave");
        registry.remove(4).await.unwrap();

        registry.create(5, "erin").unwrap();
        let handle = connector.handle(5).unwrap();
        handle.disconnect().await;
        registry.remove(5).await.unwrap();
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn remove_waits_for_running_operation() {
        let (_tmp, _connector, registry) = registry();
        let registry = Arc::new(registry);
        let session = registry.create(6, "frank").unwrap();

        let guard = session.lock_ops().await;
        let remover = tokio::spawn({
            let registry = Arc::clone(&registry);
            async move { registry.remove(6).await }
        });
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }

        let visible = registry.get_or_create(6, "frank").unwrap();
        assert!(Arc::ptr_eq(&visible, &session));
        assert!(!session.stores().is_closed());

        drop(guard);
        remover.await.unwrap().unwrap();
        assert!(registry.get(6).is_none());
        assert!(session.is_retired());
        assert!(session.stores().is_closed());
    }

    #[tokio::test]
    async fn stale_session_cannot_detach_its_replacement() {
        let (_tmp, _connector, registry) = registry();
        let old = registry.create(7, "grace").unwrap();
        registry.remove(7).await.unwrap();
        let fresh = registry.create(7, "grace").unwrap();

        assert!(!registry.is_current(&old));
        assert!(matches!(
            registry.ensure_current(&old),
            Err(SessionError::NotFound(7))
        ));
        assert!(!registry.remove_session(&old));
        assert!(registry.is_current(&fresh));
        assert!(registry.get(7).is_some_and(|s| Arc::ptr_eq(&s, &fresh)));
    }

    #[test]
    fn list_is_a_snapshot() {
        let (_tmp, _connector, registry) = registry();
        registry.create(1, "a").unwrap();
        let snapshot = registry.list();
        registry.create(2, "b").unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(registry.list().len(), 2);
    }

    #[test]
    fn status_of_absent_user_is_empty() {
        let (_tmp, _connector, registry) = registry();
        assert_eq!(registry.status(42), SessionStatus::default());
    }

    #[test]
    fn storage_failure_leaves_no_entry() {
        let tmp = TempDir::new().unwrap();
        let blocker = tmp.path().join("not-a-dir");
        std::fs::write(&blocker, b"file").unwrap();
        let registry = SessionRegistry::new(
            Arc::new(SqliteStorageFactory::new(&blocker, true)),
            Arc::new(FakeConnector::default()),
        );

        let err = registry.create(1, "a").unwrap_err();
        assert_eq!(err.kind(), "storage");
        assert!(registry.get(1).is_none());
    }
}
