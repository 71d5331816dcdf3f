//! SQLite-backed per-user store.
//!
//! Two flavours share one type:
//! - identity store: `device` (single row holding the paired device JID)
//! - key store: `keys` (named key material written during pairing)
//!
//! The connection sits behind a `parking_lot::Mutex<Option<_>>` so a store
//! can be closed through a shared reference; every call after `close`
//! fails with [`StorageError::Closed`].

use crate::error::StorageError;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// Which schema a store carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    Identity,
    Keys,
}

/// One persistent store scoped to a single user.
#[derive(Debug)]
pub struct SqliteStore {
    kind: StoreKind,
    path: Option<PathBuf>,
    conn: Mutex<Option<rusqlite::Connection>>,
}

impl SqliteStore {
    /// Open (or create) a file-backed store.
    pub fn open(path: &Path, kind: StoreKind) -> Result<Self, StorageError> {
        let conn = rusqlite::Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA busy_timeout = 5000;")?;
        Self::init_tables(&conn, kind)?;
        Ok(Self {
            kind,
            path: Some(path.to_path_buf()),
            conn: Mutex::new(Some(conn)),
        })
    }

    /// Create an in-memory store (for tests).
    pub fn open_in_memory(kind: StoreKind) -> Result<Self, StorageError> {
        let conn = rusqlite::Connection::open_in_memory()?;
        Self::init_tables(&conn, kind)?;
        Ok(Self {
            kind,
            path: None,
            conn: Mutex::new(Some(conn)),
        })
    }

    fn init_tables(conn: &rusqlite::Connection, kind: StoreKind) -> Result<(), StorageError> {
        match kind {
            StoreKind::Identity => conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS device (
                    slot INTEGER PRIMARY KEY CHECK (slot = 1),
                    jid TEXT NOT NULL,
                    push_name TEXT,
                    paired_at INTEGER NOT NULL
                );",
            )?,
            StoreKind::Keys => conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS keys (
                    name TEXT PRIMARY KEY,
                    material BLOB NOT NULL,
                    created_at INTEGER NOT NULL
                );",
            )?,
        }
        Ok(())
    }

    pub fn kind(&self) -> StoreKind {
        self.kind
    }

    /// Backing file, `None` for in-memory stores.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn is_closed(&self) -> bool {
        self.conn.lock().is_none()
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&rusqlite::Connection) -> Result<T, rusqlite::Error>,
    ) -> Result<T, StorageError> {
        let guard = self.conn.lock();
        let conn = guard.as_ref().ok_or(StorageError::Closed)?;
        Ok(f(conn)?)
    }

    /// Paired device identity, if any. Key stores never hold one.
    pub fn device_id(&self) -> Result<Option<String>, StorageError> {
        if self.kind != StoreKind::Identity {
            return Ok(None);
        }
        self.with_conn(|conn| {
            match conn.query_row("SELECT jid FROM device WHERE slot = 1", [], |row| row.get(0)) {
                Ok(jid) => Ok(Some(jid)),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                Err(e) => Err(e),
            }
        })
    }

    /// Record the paired device, replacing any previous identity.
    pub fn save_device(&self, jid: &str, push_name: Option<&str>) -> Result<(), StorageError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO device (slot, jid, push_name, paired_at) VALUES (1, ?1, ?2, ?3)
                 ON CONFLICT(slot) DO UPDATE SET
                    jid = excluded.jid,
                    push_name = excluded.push_name,
                    paired_at = excluded.paired_at",
                rusqlite::params![jid, push_name, epoch_secs() as i64],
            )
            .map(|_| ())
        })
    }

    /// Store named key material (key stores only; identity stores ignore it).
    pub fn put_key(&self, name: &str, material: &[u8]) -> Result<(), StorageError> {
        if self.kind != StoreKind::Keys {
            return Ok(());
        }
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO keys (name, material, created_at) VALUES (?1, ?2, ?3)",
                rusqlite::params![name, material, epoch_secs() as i64],
            )
            .map(|_| ())
        })
    }

    pub fn key_count(&self) -> Result<u64, StorageError> {
        if self.kind != StoreKind::Keys {
            return Ok(0);
        }
        self.with_conn(|conn| {
            conn.query_row("SELECT COUNT(*) FROM keys", [], |row| row.get::<_, i64>(0))
                .map(|n| n as u64)
        })
    }

    /// Delete every persisted row. The schema stays so the store remains usable.
    pub fn purge(&self) -> Result<(), StorageError> {
        let sql = match self.kind {
            StoreKind::Identity => "DELETE FROM device",
            StoreKind::Keys => "DELETE FROM keys",
        };
        self.with_conn(|conn| conn.execute(sql, []).map(|_| ()))
    }

    /// Close the underlying connection. Safe to call more than once.
    pub fn close(&self) -> Result<(), StorageError> {
        let Some(conn) = self.conn.lock().take() else {
            return Ok(());
        };
        conn.close().map_err(|(_, e)| StorageError::Sqlite(e))
    }
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn identity_roundtrip_survives_reopen() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("user_1_whatsapp.db");

        let store = SqliteStore::open(&path, StoreKind::Identity).unwrap();
        assert_eq!(store.device_id().unwrap(), None);
        store.save_device("6281:7@s.whatsapp.net", Some("phone")).unwrap();
        store.close().unwrap();

        let reopened = SqliteStore::open(&path, StoreKind::Identity).unwrap();
        assert_eq!(
            reopened.device_id().unwrap().as_deref(),
            Some("6281:7@s.whatsapp.net")
        );
    }

    #[test]
    fn save_device_replaces_previous_identity() {
        let store = SqliteStore::open_in_memory(StoreKind::Identity).unwrap();
        store.save_device("old@s.whatsapp.net", None).unwrap();
        store.save_device("new@s.whatsapp.net", None).unwrap();
        assert_eq!(store.device_id().unwrap().as_deref(), Some("new@s.whatsapp.net"));
    }

    #[test]
    fn purge_clears_rows_but_keeps_store_usable() {
        let keys = SqliteStore::open_in_memory(StoreKind::Keys).unwrap();
        keys.put_key("identity", b"secret").unwrap();
        keys.put_key("prekey:1", b"one").unwrap();
        assert_eq!(keys.key_count().unwrap(), 2);

        keys.purge().unwrap();
        assert_eq!(keys.key_count().unwrap(), 0);
        keys.put_key("identity", b"again").unwrap();
        assert_eq!(keys.key_count().unwrap(), 1);
    }

    #[test]
    fn closed_store_rejects_calls_and_close_is_idempotent() {
        let store = SqliteStore::open_in_memory(StoreKind::Identity).unwrap();
        store.close().unwrap();
        store.close().unwrap();
        assert!(store.is_closed());
        assert!(matches!(store.device_id(), Err(StorageError::Closed)));
        assert!(matches!(store.purge(), Err(StorageError::Closed)));
    }

    #[test]
    fn kind_mismatched_calls_are_noops() {
        let identity = SqliteStore::open_in_memory(StoreKind::Identity).unwrap();
        identity.put_key("ignored", b"x").unwrap();
        assert_eq!(identity.key_count().unwrap(), 0);

        let keys = SqliteStore::open_in_memory(StoreKind::Keys).unwrap();
        assert_eq!(keys.device_id().unwrap(), None);
    }
}
