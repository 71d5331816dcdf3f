//! Connection handle capability.
//!
//! The messaging platform client is opaque to the session core: it only
//! needs to connect, disconnect, report status, log out, expose the paired
//! device identity, and publish pairing events. Concrete transports plug in
//! through [`ConnectionFactory`].

pub mod loopback;

#[cfg(test)]
pub mod fake;

pub use loopback::{LoopbackConnection, LoopbackConnector};

use crate::error::{StorageError, TransportError, UserId};
use crate::storage::StorePair;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Capacity of each handle's event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 32;

/// Events published by a connection handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ConnectionEvent {
    /// A code the user must enter (or scan) on their phone.
    PairingCode { code: String, timeout_secs: u64 },
    /// Pairing completed; the handle now carries a device identity.
    PairSuccess { device_id: String },
    /// The device was de-registered from the platform.
    LoggedOut,
    /// The network link dropped or was closed.
    Disconnected,
}

/// Live or potentially-live link to the messaging platform for one user.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Open the network link. Idempotent when already connected.
    async fn connect(&self) -> Result<(), TransportError>;

    /// Close the network link, keeping persisted identity intact.
    async fn disconnect(&self);

    fn is_connected(&self) -> bool;

    fn is_logged_in(&self) -> bool;

    /// De-register this device on the platform.
    async fn logout(&self) -> Result<(), TransportError>;

    /// Platform-assigned device identity once paired.
    fn device_id(&self) -> Option<String>;

    fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent>;
}

/// Builds a connection handle bound to a user's storage pair.
pub trait ConnectionFactory: Send + Sync {
    fn build(
        &self,
        user_id: UserId,
        stores: Arc<StorePair>,
    ) -> Result<Arc<dyn Connection>, StorageError>;
}
