//! Live device sessions.
//!
//! Every accepted connection holds a [`ConnectionGuard`] for its lifetime, so
//! the registry can report how many connections are open. Once a session
//! authenticates it registers an outbound channel under its device id, which
//! lets the API push a relay command to that one device.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use fieldlink_types::{DeviceId, Outbound};
use tokio::sync::{RwLock, mpsc};
use tracing::debug;
use uuid::Uuid;

/// Why a command could not be delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    #[error("device {0} is not connected")]
    NotConnected(DeviceId),
    #[error("device {0} disconnected before the command was queued")]
    Disconnected(DeviceId),
}

struct Route {
    connection_id: Uuid,
    sender: mpsc::Sender<Outbound>,
}

/// Registry of open connections and authenticated devices.
#[derive(Default)]
pub struct SessionRegistry {
    routes: RwLock<HashMap<DeviceId, Route>>,
    connections: Arc<AtomicUsize>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a new connection until the returned guard is dropped.
    pub fn connect(&self) -> ConnectionGuard {
        self.connections.fetch_add(1, Ordering::SeqCst);
        ConnectionGuard {
            connections: Arc::clone(&self.connections),
        }
    }

    /// Number of open device connections, authenticated or not.
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Number of devices with an authenticated session.
    pub async fn authenticated_count(&self) -> usize {
        self.routes.read().await.len()
    }

    /// Whether a device currently has an authenticated session.
    pub async fn is_connected(&self, device_id: DeviceId) -> bool {
        self.routes.read().await.contains_key(&device_id)
    }

    /// Route commands for `device_id` to this connection.
    ///
    /// A newer connection for the same device replaces the older route; the
    /// replaced connection id is returned.
    pub async fn register(
        &self,
        device_id: DeviceId,
        connection_id: Uuid,
        sender: mpsc::Sender<Outbound>,
    ) -> Option<Uuid> {
        let previous = self.routes.write().await.insert(
            device_id,
            Route {
                connection_id,
                sender,
            },
        );
        debug!("Registered route for device {}", device_id);
        previous.map(|route| route.connection_id)
    }

    /// Remove the route for `device_id` if it still belongs to `connection_id`.
    pub async fn unregister(&self, device_id: DeviceId, connection_id: Uuid) -> bool {
        let mut routes = self.routes.write().await;
        match routes.get(&device_id) {
            Some(route) if route.connection_id == connection_id => {
                routes.remove(&device_id);
                debug!("Removed route for device {}", device_id);
                true
            }
            _ => false,
        }
    }

    /// Queue a frame for a connected device.
    pub async fn send(&self, device_id: DeviceId, frame: Outbound) -> Result<(), DeliveryError> {
        let sender = self
            .routes
            .read()
            .await
            .get(&device_id)
            .map(|route| route.sender.clone())
            .ok_or(DeliveryError::NotConnected(device_id))?;

        sender
            .send(frame)
            .await
            .map_err(|_| DeliveryError::Disconnected(device_id))
    }
}

/// Keeps a connection counted in [`SessionRegistry::connection_count`].
pub struct ConnectionGuard {
    connections: Arc<AtomicUsize>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.connections.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fieldlink_types::RelayState;

    #[test]
    fn test_connection_guard_counts() {
        let registry = SessionRegistry::new();
        assert_eq!(registry.connection_count(), 0);

        let first = registry.connect();
        let second = registry.connect();
        assert_eq!(registry.connection_count(), 2);

        drop(first);
        assert_eq!(registry.connection_count(), 1);
        drop(second);
        assert_eq!(registry.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_send_to_registered_device() {
        let registry = SessionRegistry::new();
        let (tx, mut rx) = mpsc::channel(4);

        assert!(registry.register(42, Uuid::new_v4(), tx).await.is_none());
        assert!(registry.is_connected(42).await);

        registry
            .send(42, Outbound::relay(RelayState::On))
            .await
            .unwrap();
        assert_eq!(rx.recv().await, Some(Outbound::relay(RelayState::On)));
    }

    #[tokio::test]
    async fn test_send_to_unknown_device() {
        let registry = SessionRegistry::new();
        let result = registry.send(7, Outbound::relay(RelayState::Off)).await;
        assert_eq!(result, Err(DeliveryError::NotConnected(7)));
    }

    #[tokio::test]
    async fn test_send_after_receiver_dropped() {
        let registry = SessionRegistry::new();
        let (tx, rx) = mpsc::channel(1);
        registry.register(42, Uuid::new_v4(), tx).await;
        drop(rx);

        let result = registry.send(42, Outbound::relay(RelayState::Off)).await;
        assert_eq!(result, Err(DeliveryError::Disconnected(42)));
    }

    #[tokio::test]
    async fn test_stale_unregister_keeps_newer_route() {
        let registry = SessionRegistry::new();
        let old_conn = Uuid::new_v4();
        let new_conn = Uuid::new_v4();
        let (old_tx, _old_rx) = mpsc::channel(1);
        let (new_tx, mut new_rx) = mpsc::channel(1);

        registry.register(42, old_conn, old_tx).await;
        assert_eq!(registry.register(42, new_conn, new_tx).await, Some(old_conn));

        // The old connection closing must not evict the newer one
        assert!(!registry.unregister(42, old_conn).await);
        assert_eq!(registry.authenticated_count().await, 1);

        registry
            .send(42, Outbound::relay(RelayState::On))
            .await
            .unwrap();
        assert!(new_rx.recv().await.is_some());

        assert!(registry.unregister(42, new_conn).await);
        assert_eq!(registry.authenticated_count().await, 0);
    }
}
