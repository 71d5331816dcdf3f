//! Scriptable connection handle for unit tests.

use super::{Connection, ConnectionEvent, ConnectionFactory, EVENT_CHANNEL_CAPACITY};
use crate::error::{StorageError, TransportError, UserId};
use crate::storage::StorePair;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

pub struct FakeConnection {
    pub user_id: UserId,
    stores: Arc<StorePair>,
    connected: AtomicBool,
    device: Mutex<Option<String>>,
    logged_in_override: Mutex<Option<bool>>,
    connect_error: Mutex<Option<TransportError>>,
    logout_error: Mutex<Option<TransportError>>,
    pairing_code: Mutex<Option<String>>,
    pub connect_calls: AtomicUsize,
    pub disconnect_calls: AtomicUsize,
    pub logout_calls: AtomicUsize,
    events: broadcast::Sender<ConnectionEvent>,
}

impl FakeConnection {
    pub fn new(user_id: UserId, stores: Arc<StorePair>) -> Result<Self, StorageError> {
        let device = stores.device_id()?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Self {
            user_id,
            stores,
            connected: AtomicBool::new(false),
            device: Mutex::new(device),
            logged_in_override: Mutex::new(None),
            connect_error: Mutex::new(None),
            logout_error: Mutex::new(None),
            pairing_code: Mutex::new(None),
            connect_calls: AtomicUsize::new(0),
            disconnect_calls: AtomicUsize::new(0),
            logout_calls: AtomicUsize::new(0),
            events,
        })
    }

    /// Simulate a completed pairing: persist identity + keys.
    pub fn mark_paired(&self, device_id: &str) {
        self.stores.identity.save_device(device_id, None).unwrap();
        self.stores.put_key("identity", device_id.as_bytes()).unwrap();
        *self.device.lock() = Some(device_id.to_string());
    }

    /// Simulate the platform dropping the socket.
    pub fn drop_link(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    pub fn fail_connect_with(&self, err: Option<TransportError>) {
        *self.connect_error.lock() = err;
    }

    pub fn fail_logout_with(&self, err: Option<TransportError>) {
        *self.logout_error.lock() = err;
    }

    /// Code published on the next connect while unpaired.
    pub fn issue_pairing_code(&self, code: &str) {
        *self.pairing_code.lock() = Some(code.to_string());
    }

    /// Force `is_logged_in` regardless of stored identity.
    pub fn override_logged_in(&self, value: Option<bool>) {
        *self.logged_in_override.lock() = value;
    }

    pub fn connects(&self) -> usize {
        self.connect_calls.load(Ordering::SeqCst)
    }

    pub fn disconnects(&self) -> usize {
        self.disconnect_calls.load(Ordering::SeqCst)
    }

    pub fn logouts(&self) -> usize {
        self.logout_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connection for FakeConnection {
    async fn connect(&self) -> Result<(), TransportError> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.connect_error.lock().clone() {
            return Err(err);
        }
        self.connected.store(true, Ordering::SeqCst);
        if self.device.lock().is_none() {
            if let Some(code) = self.pairing_code.lock().clone() {
                let _ = self.events.send(ConnectionEvent::PairingCode {
                    code,
                    timeout_secs: 60,
                });
            }
        }
        Ok(())
    }

    async fn disconnect(&self) {
        self.disconnect_calls.fetch_add(1, Ordering::SeqCst);
        if self.connected.swap(false, Ordering::SeqCst) {
            let _ = self.events.send(ConnectionEvent::Disconnected);
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn is_logged_in(&self) -> bool {
        if let Some(forced) = *self.logged_in_override.lock() {
            return forced;
        }
        self.device.lock().is_some()
    }

    async fn logout(&self) -> Result<(), TransportError> {
        self.logout_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.logout_error.lock().clone() {
            return Err(err);
        }
        if self.device.lock().take().is_none() {
            return Err(TransportError::NotPaired);
        }
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

/// Factory that records every handle it builds.
#[derive(Default)]
pub struct FakeConnector {
    pub builds: AtomicUsize,
    handles: Mutex<Vec<Arc<FakeConnection>>>,
}

impl FakeConnector {
    pub fn build_count(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }

    /// Most recently built handle for a user.
    pub fn handle(&self, user_id: UserId) -> Option<Arc<FakeConnection>> {
        self.handles
            .lock()
            .iter()
            .rev()
            .find(|h| h.user_id == user_id)
            .cloned()
    }
}

impl ConnectionFactory for FakeConnector {
    fn build(
        &self,
        user_id: UserId,
        stores: Arc<StorePair>,
    ) -> Result<Arc<dyn Connection>, StorageError> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        let handle = Arc::new(FakeConnection::new(user_id, stores)?);
        self.handles.lock().push(Arc::clone(&handle));
        Ok(handle)
    }
}
