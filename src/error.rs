//! Error taxonomy for the session core.
//!
//! Lifecycle callers get a [`SessionError`] whose [`kind`](SessionError::kind)
//! is stable enough to map onto HTTP status codes. Transport and storage
//! failures keep their own typed source so nothing above the core has to
//! parse error strings.

use thiserror::Error;

/// Registered-user identifier (row id in the user repository).
pub type UserId = i64;

/// Network-level failure reported by a connection handle.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("connection refused: {0}")]
    Refused(String),
    #[error("connection timed out")]
    Timeout,
    #[error("device is not paired")]
    NotPaired,
    #[error("handle has been retired")]
    Retired,
    #[error("{0}")]
    Other(String),
}

/// Failure opening, reading or closing a per-user store.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("store is closed")]
    Closed,
}

/// Errors surfaced by registry and lifecycle operations.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("no session for user {0}")]
    NotFound(UserId),
    #[error("connection handle not initialized for user {0}")]
    NotInitialized(UserId),
    #[error("transport failure for user {user_id}: {source}")]
    Transport {
        user_id: UserId,
        #[source]
        source: TransportError,
    },
    #[error("storage failure for user {user_id}: {source}")]
    Storage {
        user_id: UserId,
        #[source]
        source: StorageError,
    },
    #[error("user {0} is already logged in")]
    AlreadyLoggedIn(UserId),
    #[error("no pairing code received for user {0} before the deadline")]
    PairingTimeout(UserId),
}

impl SessionError {
    pub fn transport(user_id: UserId, source: TransportError) -> Self {
        Self::Transport { user_id, source }
    }

    pub fn storage(user_id: UserId, source: impl Into<StorageError>) -> Self {
        Self::Storage {
            user_id,
            source: source.into(),
        }
    }

    /// Stable, machine-readable error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::NotInitialized(_) => "not_initialized",
            Self::Transport { .. } => "transport",
            Self::Storage { .. } => "storage",
            Self::AlreadyLoggedIn(_) => "already_logged_in",
            Self::PairingTimeout(_) => "pairing_timeout",
        }
    }

    /// The user the failed operation targeted.
    pub fn user_id(&self) -> UserId {
        match self {
            Self::NotFound(id)
            | Self::NotInitialized(id)
            | Self::AlreadyLoggedIn(id)
            | Self::PairingTimeout(id) => *id,
            Self::Transport { user_id, .. } | Self::Storage { user_id, .. } => *user_id,
        }
    }
}
