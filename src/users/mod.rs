//! Registered users.
//!
//! The session core only reads users (`get_all` for the boot sweep,
//! `validate_credentials` for activation); the admin surface also creates,
//! updates and deletes them.

pub mod store;

pub use store::SqliteUserStore;

use crate::error::UserId;
use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Minimum and maximum username length (characters).
pub const USERNAME_MIN_LEN: usize = 3;
pub const USERNAME_MAX_LEN: usize = 50;

/// Minimum password length (characters).
pub const PASSWORD_MIN_LEN: usize = 6;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct User {
    pub id: UserId,
    pub username: String,
    pub is_active: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Partial update; `None` fields are left untouched.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UserUpdate {
    pub username: Option<String>,
    pub password: Option<String>,
    pub is_active: Option<bool>,
}

pub trait UserRepository: Send + Sync {
    fn create(&self, username: &str, password: &str) -> Result<User>;

    fn get_by_id(&self, id: UserId) -> Result<Option<User>>;

    fn get_by_username(&self, username: &str) -> Result<Option<User>>;

    fn get_all(&self) -> Result<Vec<User>>;

    fn update(&self, id: UserId, update: &UserUpdate) -> Result<User>;

    /// Returns `false` when no such user existed.
    fn delete(&self, id: UserId) -> Result<bool>;

    /// The matching active user, or `None` for bad credentials.
    fn validate_credentials(&self, username: &str, password: &str) -> Result<Option<User>>;
}

pub fn validate_username(username: &str) -> Result<()> {
    let len = username.chars().count();
    if !(USERNAME_MIN_LEN..=USERNAME_MAX_LEN).contains(&len) {
        anyhow::bail!(
            "Username must be between {USERNAME_MIN_LEN} and {USERNAME_MAX_LEN} characters"
        );
    }
    Ok(())
}

pub fn validate_password(password: &str) -> Result<()> {
    if password.chars().count() < PASSWORD_MIN_LEN {
        anyhow::bail!("Password must be at least {PASSWORD_MIN_LEN} characters");
    }
    Ok(())
}
