//! Multi-tenant session manager for messaging-platform connections.
//!
//! Each registered user owns one persistent device session. The
//! [`session::SessionRegistry`] guarantees at most one session per user,
//! [`session::SessionManager`] exposes the lifecycle operations, the
//! [`supervisor`] sweeps keep sessions connected, and the [`gateway`] puts
//! an HTTP surface with an activation hook in front of it all.

pub mod config;
pub mod connection;
pub mod error;
pub mod gateway;
pub mod session;
pub mod storage;
pub mod supervisor;
pub mod users;

pub use config::Config;
pub use error::{SessionError, StorageError, TransportError, UserId};
pub use session::{SessionManager, SessionRegistry, SessionStatus};
