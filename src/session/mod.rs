//! Per-user sessions.
//!
//! A [`Session`] binds a registered user to one connection handle and the
//! storage pair that handle persists into. Sessions live in the
//! [`SessionRegistry`]; lifecycle operations (reconnect, soft disconnect,
//! hard clear, logout, pairing) are exposed by [`SessionManager`].
//!
//! ## State
//! `Absent → Created(disconnected) → Connected(not logged in) → Connected(logged in)`.
//! Soft disconnect returns a connected session to `Created` with its
//! credentials intact; hard clear and logout take any state to `Absent`.

pub mod manager;
pub mod registry;

pub use manager::{PairingCode, RemoteLogout, SessionManager, TeardownReport};
pub use registry::SessionRegistry;

use crate::connection::Connection;
use crate::error::{SessionError, StorageError, UserId};
use crate::storage::StorePair;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::{Mutex, MutexGuard};

/// Status derived on demand from a connection handle. Never stored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SessionStatus {
    pub is_connected: bool,
    pub is_logged_in: bool,
    pub device_id: String,
}

impl SessionStatus {
    pub fn derive(connection: Option<&dyn Connection>) -> Self {
        let Some(conn) = connection else {
            return Self::default();
        };
        let status = Self {
            is_connected: conn.is_connected(),
            is_logged_in: conn.is_logged_in(),
            device_id: conn.device_id().unwrap_or_default(),
        };
        if !status.is_consistent() {
            tracing::error!(
                is_connected = status.is_connected,
                "Connection reports logged in without a device identity"
            );
        }
        status
    }

    /// A logged-in device always carries a platform-assigned identity.
    pub fn is_consistent(&self) -> bool {
        !self.is_logged_in || !self.device_id.is_empty()
    }

    pub fn label(&self) -> &'static str {
        match (self.is_connected, self.is_logged_in) {
            (true, true) => "CONNECTED & LOGGED IN",
            (true, false) => "CONNECTED (NOT LOGGED IN)",
            (false, true) => "LOGGED IN (NOT CONNECTED)",
            (false, false) => "DISCONNECTED",
        }
    }
}

/// In-memory binding of a user to a connection handle and its stores.
pub struct Session {
    user_id: UserId,
    username: String,
    connection: Option<Arc<dyn Connection>>,
    stores: Arc<StorePair>,
    ops: Mutex<()>,
    retired: AtomicBool,
    created_at: u64,
}

impl Session {
    pub(crate) fn new(
        user_id: UserId,
        username: String,
        connection: Option<Arc<dyn Connection>>,
        stores: Arc<StorePair>,
    ) -> Self {
        Self {
            user_id,
            username,
            connection,
            stores,
            ops: Mutex::new(()),
            retired: AtomicBool::new(false),
            created_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
        }
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    /// Unix timestamp (seconds) at which the session was created.
    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    pub fn connection(&self) -> Option<&Arc<dyn Connection>> {
        self.connection.as_ref()
    }

    /// The connection handle, or `NotInitialized` for a partially built session.
    pub fn require_connection(&self) -> Result<&Arc<dyn Connection>, SessionError> {
        self.connection
            .as_ref()
            .ok_or(SessionError::NotInitialized(self.user_id))
    }

    pub fn stores(&self) -> &StorePair {
        &self.stores
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus::derive(self.connection.as_deref())
    }

    /// True once the registry has removed this session.
    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::SeqCst)
    }

    /// Serialize a lifecycle operation against this session.
    pub(crate) async fn lock_ops(&self) -> MutexGuard<'_, ()> {
        self.ops.lock().await
    }

    /// Non-blocking variant used by sweeps; `None` while another operation runs.
    pub(crate) fn try_lock_ops(&self) -> Option<MutexGuard<'_, ()>> {
        self.ops.try_lock().ok()
    }

    /// Final teardown after removal: disconnect (best effort) and close stores.
    pub(crate) async fn retire(&self) -> Result<(), StorageError> {
        let _ops = self.lock_ops().await;
        self.teardown().await
    }

    /// Teardown for a caller that already holds the operation lock.
    pub(crate) async fn teardown(&self) -> Result<(), StorageError> {
        self.retired.store(true, Ordering::SeqCst);
        if let Some(conn) = &self.connection {
            conn.disconnect().await;
        }
        self.stores.close()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("user_id", &self.user_id)
            .field("username", &self.username)
            .field("initialized", &self.connection.is_some())
            .field("retired", &self.is_retired())
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::fake::FakeConnection;

    fn fake_session(user_id: UserId) -> (Session, Arc<FakeConnection>) {
        let stores = Arc::new(StorePair::in_memory().unwrap());
        let conn = Arc::new(FakeConnection::new(user_id, Arc::clone(&stores)).unwrap());
        let handle: Arc<dyn Connection> = conn.clone();
        let session = Session::new(user_id, format!("user{user_id}"), Some(handle), stores);
        (session, conn)
    }

    #[test]
    fn absent_connection_derives_empty_status() {
        let status = SessionStatus::derive(None);
        assert_eq!(status, SessionStatus::default());
        assert_eq!(status.label(), "DISCONNECTED");
    }

    #[tokio::test]
    async fn logged_in_status_carries_device_id() {
        let (session, conn) = fake_session(1);
        conn.mark_paired("628111:3@s.whatsapp.net");
        conn.connect().await.unwrap();

        let status = session.status();
        assert!(status.is_connected && status.is_logged_in);
        assert_eq!(status.device_id, "628111:3@s.whatsapp.net");
        assert!(status.is_consistent());
        assert_eq!(status.label(), "CONNECTED & LOGGED IN");
    }

    #[test]
    fn logged_in_without_device_is_flagged_inconsistent() {
        let (session, conn) = fake_session(2);
        conn.override_logged_in(Some(true));
        let status = session.status();
        assert!(status.is_logged_in);
        assert!(!status.is_consistent());
    }

    #[test]
    fn status_invariant_holds_for_every_label() {
        for (is_connected, is_logged_in, device) in [
            (false, false, ""),
            (true, false, ""),
            (true, true, "d@s.whatsapp.net"),
            (false, true, "d@s.whatsapp.net"),
        ] {
            let status = SessionStatus {
                is_connected,
                is_logged_in,
                device_id: device.into(),
            };
            assert!(status.is_consistent(), "{}", status.label());
        }
    }

    #[test]
    fn partially_built_session_reports_not_initialized() {
        let stores = Arc::new(StorePair::in_memory().unwrap());
        let session = Session::new(9, "nine".into(), None, stores);
        assert!(matches!(
            session.require_connection(),
            Err(SessionError::NotInitialized(9))
        ));
        assert_eq!(session.status(), SessionStatus::default());
    }

    #[tokio::test]
    async fn retire_disconnects_and_closes_stores() {
        let (session, conn) = fake_session(3);
        conn.connect().await.unwrap();

        session.retire().await.unwrap();
        assert!(session.is_retired());
        assert!(!conn.is_connected());
        assert!(session.stores().is_closed());
    }

    #[tokio::test]
    async fn try_lock_ops_fails_while_operation_runs() {
        let (session, _conn) = fake_session(4);
        let guard = session.lock_ops().await;
        assert!(session.try_lock_ops().is_none());
        drop(guard);
        assert!(session.try_lock_ops().is_some());
    }
}
