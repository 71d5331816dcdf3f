//! SQLite-backed user repository.
//!
//! Tables:
//! - `users`: id, username, password_hash, salt, is_active, created_at, updated_at

use super::{validate_password, validate_username, User, UserRepository, UserUpdate};
use crate::error::UserId;
use anyhow::{bail, Result};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

/// Number of SHA-256 iterations for password stretching.
#[cfg(not(test))]
const HASH_ITERATIONS: u32 = 100_000;
#[cfg(test)]
const HASH_ITERATIONS: u32 = 1_000;

const USER_COLUMNS: &str = "id, username, is_active, created_at, updated_at";

pub struct SqliteUserStore {
    conn: Mutex<rusqlite::Connection>,
}

impl SqliteUserStore {
    /// Open (or create) the user database at the given path.
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = rusqlite::Connection::open(db_path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;",
        )?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(rusqlite::Connection::open_in_memory()?)
    }

    fn init(conn: rusqlite::Connection) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                username TEXT NOT NULL UNIQUE COLLATE NOCASE,
                password_hash TEXT NOT NULL,
                salt TEXT NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn find(&self, clause: &str, param: &dyn rusqlite::ToSql) -> Result<Option<User>> {
        let conn = self.conn.lock();
        let row = conn.query_row(
            &format!("SELECT {USER_COLUMNS} FROM users WHERE {clause}"),
            [param],
            row_to_user,
        );
        match row {
            Ok(user) => Ok(Some(user)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

impl UserRepository for SqliteUserStore {
    fn create(&self, username: &str, password: &str) -> Result<User> {
        let username = username.trim();
        validate_username(username)?;
        validate_password(password)?;

        let salt = generate_salt();
        let password_hash = hash_password(password, &salt);
        let now = epoch_secs();

        let id = {
            let conn = self.conn.lock();
            let result = conn.execute(
                "INSERT INTO users (username, password_hash, salt, is_active, created_at, updated_at)
                 VALUES (?1, ?2, ?3, 1, ?4, ?4)",
                rusqlite::params![username, password_hash, salt, now],
            );
            match result {
                Ok(_) => conn.last_insert_rowid(),
                Err(e) if is_unique_violation(&e) => {
                    bail!("Username '{username}' is already taken")
                }
                Err(e) => return Err(e.into()),
            }
        };

        tracing::info!(user_id = id, username, "User created");
        Ok(User {
            id,
            username: username.to_string(),
            is_active: true,
            created_at: now,
            updated_at: now,
        })
    }

    fn get_by_id(&self, id: UserId) -> Result<Option<User>> {
        self.find("id = ?1", &id)
    }

    fn get_by_username(&self, username: &str) -> Result<Option<User>> {
        self.find("username = ?1 COLLATE NOCASE", &username.trim())
    }

    fn get_all(&self) -> Result<Vec<User>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!("SELECT {USER_COLUMNS} FROM users ORDER BY id"))?;
        let users = stmt
            .query_map([], row_to_user)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(users)
    }

    fn update(&self, id: UserId, update: &UserUpdate) -> Result<User> {
        let Some(mut user) = self.get_by_id(id)? else {
            bail!("User {id} not found");
        };

        let now = epoch_secs();
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        if let Some(username) = update.username.as_deref().map(str::trim) {
            validate_username(username)?;
            let result = tx.execute(
                "UPDATE users SET username = ?1 WHERE id = ?2",
                rusqlite::params![username, id],
            );
            match result {
                Ok(_) => user.username = username.to_string(),
                Err(e) if is_unique_violation(&e) => {
                    bail!("Username '{username}' is already taken")
                }
                Err(e) => return Err(e.into()),
            }
        }
        if let Some(password) = update.password.as_deref() {
            validate_password(password)?;
            let salt = generate_salt();
            tx.execute(
                "UPDATE users SET password_hash = ?1, salt = ?2 WHERE id = ?3",
                rusqlite::params![hash_password(password, &salt), salt, id],
            )?;
        }
        if let Some(is_active) = update.is_active {
            tx.execute(
                "UPDATE users SET is_active = ?1 WHERE id = ?2",
                rusqlite::params![is_active, id],
            )?;
            user.is_active = is_active;
        }
        tx.execute(
            "UPDATE users SET updated_at = ?1 WHERE id = ?2",
            rusqlite::params![now, id],
        )?;
        tx.commit()?;

        user.updated_at = now;
        tracing::info!(user_id = id, username = %user.username, "User updated");
        Ok(user)
    }

    fn delete(&self, id: UserId) -> Result<bool> {
        let conn = self.conn.lock();
        let affected = conn.execute("DELETE FROM users WHERE id = ?1", [id])?;
        if affected > 0 {
            tracing::info!(user_id = id, "User deleted");
        }
        Ok(affected > 0)
    }

    fn validate_credentials(&self, username: &str, password: &str) -> Result<Option<User>> {
        let sql = format!(
            "SELECT {USER_COLUMNS}, password_hash, salt FROM users
             WHERE username = ?1 COLLATE NOCASE"
        );
        let row = self.conn.lock().query_row(&sql, [username.trim()], |row| {
            Ok((row_to_user(row)?, row.get::<_, String>(5)?, row.get::<_, String>(6)?))
        });

        match row {
            Ok((user, stored_hash, salt)) => {
                let attempt = hash_password(password, &salt);
                if !constant_time_eq(stored_hash.as_bytes(), attempt.as_bytes()) || !user.is_active {
                    return Ok(None);
                }
                Ok(Some(user))
            }
            Err(rusqlite::Error::QueryReturnedNoRows) => {
                // Dummy hash keeps unknown usernames indistinguishable by timing
                let _ = hash_password(password, "00000000000000000000000000000000");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        username: row.get(1)?,
        is_active: row.get(2)?,
        created_at: row.get(3)?,
        updated_at: row.get(4)?,
    })
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

fn generate_salt() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Hash a password with salt using iterated SHA-256.
fn hash_password(password: &str, salt: &str) -> String {
    let mut hash = Sha256::new();
    hash.update(salt.as_bytes());
    hash.update(password.as_bytes());
    let mut result = hash.finalize();

    for _ in 1..HASH_ITERATIONS {
        let mut h = Sha256::new();
        h.update(result);
        h.update(salt.as_bytes());
        result = h.finalize();
    }

    hex::encode(result)
}

/// Constant-time byte comparison.
pub(crate) fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

fn epoch_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

// ── Tests ───────────────────────────────────────────────────────────
