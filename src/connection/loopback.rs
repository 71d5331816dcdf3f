//! Loopback transport.
//!
//! Used when the process runs without a platform link: connecting always
//! succeeds, and an unpaired device is issued a pairing code and paired on
//! the spot. Pairing writes a device identity and key material into the
//! user's storage pair, so restarts resume the same device exactly like a
//! real client would, and logout purges both stores.

use super::{Connection, ConnectionEvent, ConnectionFactory, EVENT_CHANNEL_CAPACITY};
use crate::error::{StorageError, TransportError, UserId};
use crate::storage::StorePair;
use async_trait::async_trait;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Seconds a loopback pairing code is advertised as valid.
const PAIRING_CODE_TTL_SECS: u64 = 60;

pub struct LoopbackConnection {
    user_id: UserId,
    stores: Arc<StorePair>,
    connected: AtomicBool,
    device: Mutex<Option<String>>,
    events: broadcast::Sender<ConnectionEvent>,
}

impl LoopbackConnection {
    pub fn new(user_id: UserId, stores: Arc<StorePair>) -> Result<Self, StorageError> {
        let device = stores.device_id()?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Self {
            user_id,
            stores,
            connected: AtomicBool::new(false),
            device: Mutex::new(device),
            events,
        })
    }

    fn pair(&self) -> Result<String, TransportError> {
        let nonce = uuid::Uuid::new_v4();
        let digest = Sha256::digest(format!("{}:{nonce}", self.user_id).as_bytes());
        let hex = hex::encode(digest.as_slice()).to_ascii_uppercase();
        let code = format!("{}-{}", &hex[..4], &hex[4..8]);

        let _ = self.events.send(ConnectionEvent::PairingCode {
            code,
            timeout_secs: PAIRING_CODE_TTL_SECS,
        });

        let device_id = format!("{}.{}:1@loopback.local", self.user_id, &hex[8..16]);
        let store_err = |e: StorageError| TransportError::Other(format!("device store: {e}"));
        self.stores
            .identity
            .save_device(&device_id, Some("loopback"))
            .map_err(store_err)?;
        self.stores
            .put_key("identity", digest.as_slice())
            .map_err(store_err)?;

        tracing::info!(user_id = self.user_id, device_id = %device_id, "Loopback device paired");
        Ok(device_id)
    }
}

#[async_trait]
impl Connection for LoopbackConnection {
    async fn connect(&self) -> Result<(), TransportError> {
        if self.stores.is_closed() {
            return Err(TransportError::Retired);
        }
        if self.connected.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let needs_pairing = self.device.lock().is_none();
        if needs_pairing {
            match self.pair() {
                Ok(device_id) => {
                    *self.device.lock() = Some(device_id.clone());
                    let _ = self.events.send(ConnectionEvent::PairSuccess { device_id });
                }
                Err(e) => {
                    self.connected.store(false, Ordering::SeqCst);
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    async fn disconnect(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            let _ = self.events.send(ConnectionEvent::Disconnected);
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn is_logged_in(&self) -> bool {
        self.device.lock().is_some()
    }

    async fn logout(&self) -> Result<(), TransportError> {
        if self.device.lock().is_none() {
            return Err(TransportError::NotPaired);
        }
        self.stores
            .purge()
            .map_err(|e| TransportError::Other(format!("device store: {e}")))?;
        *self.device.lock() = None;
        self.connected.store(false, Ordering::SeqCst);
        let _ = self.events.send(ConnectionEvent::LoggedOut);
        Ok(())
    }

    fn device_id(&self) -> Option<String> {
        self.device.lock().clone()
    }

    fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }
}

/// Factory for [`LoopbackConnection`] handles.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoopbackConnector;

impl ConnectionFactory for LoopbackConnector {
    fn build(
        &self,
        user_id: UserId,
        stores: Arc<StorePair>,
    ) -> Result<Arc<dyn Connection>, StorageError> {
        Ok(Arc::new(LoopbackConnection::new(user_id, stores)?))
    }
}
