//! Lifecycle operations exposed to the HTTP layer and the supervisors.
//!
//! Every operation resolves the session through the registry first and then
//! talks to the connection handle outside the registry lock, holding only
//! the session's own operation lock. Once that lock is held the session must
//! still be the registry's live entry for the user; an operation that queued
//! behind a removal reports `NotFound` instead of acting on a retired or
//! replaced session. Operations on different users never wait on each other.

use super::{Session, SessionRegistry, SessionStatus};
use crate::connection::{Connection, ConnectionEvent};
use crate::error::{SessionError, UserId};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;

/// Pairing code handed to the user to link their phone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PairingCode {
    pub code: String,
    pub timeout_secs: u64,
}

/// What happened to the remote device registration during a teardown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RemoteLogout {
    Completed,
    /// The session was not logged in; nothing to de-register.
    Skipped,
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TeardownReport {
    pub user_id: UserId,
    pub remote_logout: RemoteLogout,
}

pub struct SessionManager {
    registry: SessionRegistry,
    pairing_timeout: Duration,
}

impl SessionManager {
    pub fn new(registry: SessionRegistry, pairing_timeout: Duration) -> Self {
        Self {
            registry,
            pairing_timeout,
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Ensure a session exists for an authenticated identity.
    pub fn activate_session(
        &self,
        user_id: UserId,
        username: &str,
    ) -> Result<Arc<Session>, SessionError> {
        self.registry.get_or_create(user_id, username)
    }

    pub fn query_status(&self, user_id: UserId) -> SessionStatus {
        self.registry.status(user_id)
    }

    pub fn list_active(&self) -> HashMap<UserId, Arc<Session>> {
        self.registry.list()
    }

    fn existing(&self, user_id: UserId) -> Result<Arc<Session>, SessionError> {
        self.registry
            .get(user_id)
            .ok_or(SessionError::NotFound(user_id))
    }

    /// Connect an existing session's handle. Never creates a session.
    pub async fn manual_reconnect(&self, user_id: UserId) -> Result<(), SessionError> {
        let session = self.existing(user_id)?;
        let conn = Arc::clone(session.require_connection()?);

        let _ops = session.lock_ops().await;
        self.registry.ensure_current(&session)?;
        if conn.is_connected() {
            tracing::debug!(user_id, "Reconnect requested but session is already connected");
            return Ok(());
        }

        tracing::info!(user_id, username = session.username(), "Manual reconnect");
        conn.connect()
            .await
            .map_err(|e| SessionError::transport(user_id, e))
    }

    /// Close the network link but keep stored credentials and the registry entry.
    pub async fn soft_disconnect(&self, user_id: UserId) -> Result<(), SessionError> {
        let session = self.existing(user_id)?;
        let conn = Arc::clone(session.require_connection()?);

        let _ops = session.lock_ops().await;
        self.registry.ensure_current(&session)?;
        conn.disconnect().await;
        tracing::info!(
            user_id,
            username = session.username(),
            "Session disconnected; credentials retained"
        );
        Ok(())
    }

    /// De-register the device (best effort), purge local credentials and
    /// remove the session.
    pub async fn hard_clear(&self, user_id: UserId) -> Result<TeardownReport, SessionError> {
        let session = self.existing(user_id)?;
        let _ops = session.lock_ops().await;
        self.registry.ensure_current(&session)?;

        let remote_logout = remote_logout(&session).await;
        let purged = session.stores().purge();
        let retired = self.registry.retire_locked(&session).await;
        if let Err(e) = purged {
            tracing::error!(user_id, "Failed to purge stored credentials: {e}");
            return Err(SessionError::storage(user_id, e));
        }
        retired?;

        tracing::info!(user_id, username = session.username(), ?remote_logout, "Session cleared");
        Ok(TeardownReport {
            user_id,
            remote_logout,
        })
    }

    /// User-initiated logout: remote logout, then unconditional removal.
    pub async fn logout(&self, user_id: UserId) -> Result<TeardownReport, SessionError> {
        let session = self.existing(user_id)?;
        let _ops = session.lock_ops().await;
        self.registry.ensure_current(&session)?;

        let remote_logout = remote_logout(&session).await;
        self.registry.retire_locked(&session).await?;

        tracing::info!(user_id, username = session.username(), ?remote_logout, "User logged out");
        Ok(TeardownReport {
            user_id,
            remote_logout,
        })
    }

    /// Start a fresh pairing and wait for the first pairing code.
    pub async fn begin_pairing(
        &self,
        user_id: UserId,
        username: &str,
    ) -> Result<PairingCode, SessionError> {
        let session = self.activate_session(user_id, username)?;
        let conn = Arc::clone(session.require_connection()?);

        let _ops = session.lock_ops().await;
        self.registry.ensure_current(&session)?;
        if conn.is_logged_in() {
            return Err(SessionError::AlreadyLoggedIn(user_id));
        }

        conn.disconnect().await;
        let mut events = conn.subscribe();
        conn.connect()
            .await
            .map_err(|e| SessionError::transport(user_id, e))?;

        let wait = async {
            loop {
                match events.recv().await {
                    Ok(ConnectionEvent::PairingCode { code, timeout_secs }) => {
                        return Some(PairingCode { code, timeout_secs });
                    }
                    Ok(_) | Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => return None,
                }
            }
        };

        match tokio::time::timeout(self.pairing_timeout, wait).await {
            Ok(Some(code)) => {
                tracing::info!(user_id, username, "Pairing code issued");
                Ok(code)
            }
            _ => {
                tracing::warn!(user_id, username, "No pairing code before deadline");
                Err(SessionError::PairingTimeout(user_id))
            }
        }
    }

    /// Tear down every session. Called once at process exit.
    pub async fn shutdown(&self) {
        let sessions = self.registry.drain();
        let count = sessions.len();
        for session in sessions {
            if let Err(e) = session.retire().await {
                tracing::warn!(user_id = session.user_id(), "Failed to close stores: {e}");
            }
        }
        tracing::info!(count, "All sessions shut down");
    }
}

async fn remote_logout(session: &Session) -> RemoteLogout {
    let user_id = session.user_id();
    let Some(conn) = session.connection() else {
        tracing::warn!(user_id, "No connection handle; skipping remote logout");
        return RemoteLogout::Skipped;
    };
    if !conn.is_logged_in() {
        return RemoteLogout::Skipped;
    }
    match conn.logout().await {
        Ok(()) => RemoteLogout::Completed,
        Err(e) => {
            tracing::warn!(user_id, "Remote logout failed, continuing local cleanup: {e}");
            RemoteLogout::Failed {
                reason: e.to_string(),
            }
        }
    }
}
