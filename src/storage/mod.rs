//! Per-user storage pair.
//!
//! Every session owns two stores opened from a deterministic locator:
//! `user_{id}_whatsapp.db` (device identity) and, when key separation is
//! enabled, `user_{id}_keys.db` (key material). The session core owns the
//! handles but never looks inside beyond identity presence.

pub mod store;

pub use store::{SqliteStore, StoreKind};

use crate::error::{StorageError, UserId};
use std::path::{Path, PathBuf};

/// Where a user's stores live on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreLocator {
    pub user_id: UserId,
    pub identity_path: PathBuf,
    pub keys_path: Option<PathBuf>,
}

impl StoreLocator {
    pub fn for_user(base_dir: &Path, user_id: UserId, separate_keys: bool) -> Self {
        Self {
            user_id,
            identity_path: base_dir.join(format!("user_{user_id}_whatsapp.db")),
            keys_path: separate_keys.then(|| base_dir.join(format!("user_{user_id}_keys.db"))),
        }
    }
}

/// Identity store plus optional key store for one user.
#[derive(Debug)]
pub struct StorePair {
    pub identity: SqliteStore,
    pub keys: Option<SqliteStore>,
}

impl StorePair {
    pub fn new(identity: SqliteStore, keys: Option<SqliteStore>) -> Self {
        Self { identity, keys }
    }

    /// In-memory pair (for tests).
    pub fn in_memory() -> Result<Self, StorageError> {
        Ok(Self {
            identity: SqliteStore::open_in_memory(StoreKind::Identity)?,
            keys: Some(SqliteStore::open_in_memory(StoreKind::Keys)?),
        })
    }

    /// Device identity recorded at pairing time.
    pub fn device_id(&self) -> Result<Option<String>, StorageError> {
        self.identity.device_id()
    }

    /// Where key material goes: the key store when present, else nowhere.
    pub fn put_key(&self, name: &str, material: &[u8]) -> Result<(), StorageError> {
        match &self.keys {
            Some(keys) => keys.put_key(name, material),
            None => Ok(()),
        }
    }

    /// Remove all persisted identity and key material.
    pub fn purge(&self) -> Result<(), StorageError> {
        self.identity.purge()?;
        if let Some(keys) = &self.keys {
            keys.purge()?;
        }
        Ok(())
    }

    /// Close both stores. Both are attempted; the first failure is returned.
    pub fn close(&self) -> Result<(), StorageError> {
        let identity = self.identity.close();
        let keys = self.keys.as_ref().map_or(Ok(()), SqliteStore::close);
        identity.and(keys)
    }

    pub fn is_closed(&self) -> bool {
        self.identity.is_closed() && self.keys.as_ref().is_none_or(SqliteStore::is_closed)
    }
}

/// Opens the storage pair for a user.
pub trait StorageFactory: Send + Sync {
    fn open(&self, user_id: UserId) -> Result<StorePair, StorageError>;
}

/// File-backed factory rooted at a data directory.
#[derive(Debug, Clone)]
pub struct SqliteStorageFactory {
    base_dir: PathBuf,
    separate_keys: bool,
}

impl SqliteStorageFactory {
    pub fn new(base_dir: impl Into<PathBuf>, separate_keys: bool) -> Self {
        Self {
            base_dir: base_dir.into(),
            separate_keys,
        }
    }

    pub fn locator(&self, user_id: UserId) -> StoreLocator {
        StoreLocator::for_user(&self.base_dir, user_id, self.separate_keys)
    }
}

impl StorageFactory for SqliteStorageFactory {
    fn open(&self, user_id: UserId) -> Result<StorePair, StorageError> {
        std::fs::create_dir_all(&self.base_dir)?;
        let locator = self.locator(user_id);

        tracing::debug!(
            user_id,
            identity = %locator.identity_path.display(),
            keys = ?locator.keys_path,
            "Opening user stores"
        );

        let identity = SqliteStore::open(&locator.identity_path, StoreKind::Identity)?;
        let keys = match &locator.keys_path {
            Some(path) => match SqliteStore::open(path, StoreKind::Keys) {
                Ok(store) => Some(store),
                Err(e) => {
                    let _ = identity.close();
                    return Err(e);
                }
            },
            None => None,
        };
        Ok(StorePair::new(identity, keys))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn locator_is_deterministic_per_user() {
        let base = Path::new("/srv/storages");
        let a = StoreLocator::for_user(base, 42, true);
        let b = StoreLocator::for_user(base, 42, true);
        assert_eq!(a, b);
        assert_eq!(a.identity_path, base.join("user_42_whatsapp.db"));
        assert_eq!(a.keys_path.as_deref(), Some(base.join("user_42_keys.db").as_path()));

        let shared = StoreLocator::for_user(base, 42, false);
        assert!(shared.keys_path.is_none());
    }

    #[test]
    fn factory_creates_directory_and_both_files() {
        let tmp = TempDir::new().unwrap();
        let base = tmp.path().join("nested").join("storages");
        let factory = SqliteStorageFactory::new(&base, true);

        let pair = factory.open(5).unwrap();
        assert!(base.join("user_5_whatsapp.db").exists());
        assert!(base.join("user_5_keys.db").exists());
        assert!(pair.keys.is_some());
        pair.close().unwrap();
        assert!(pair.is_closed());
    }

    #[test]
    fn factory_without_key_separation_opens_identity_only() {
        let tmp = TempDir::new().unwrap();
        let factory = SqliteStorageFactory::new(tmp.path(), false);
        let pair = factory.open(9).unwrap();
        assert!(pair.keys.is_none());
        pair.put_key("ignored", b"x").unwrap();
        pair.close().unwrap();
    }

    #[test]
    fn purge_clears_identity_and_keys() {
        let pair = StorePair::in_memory().unwrap();
        pair.identity.save_device("dev@s.whatsapp.net", None).unwrap();
        pair.put_key("identity", b"k").unwrap();

        pair.purge().unwrap();
        assert_eq!(pair.device_id().unwrap(), None);
        assert_eq!(pair.keys.as_ref().unwrap().key_count().unwrap(), 0);
    }
}
