//! Application state shared across handlers and device sessions.

use std::sync::Arc;

use async_trait::async_trait;
use fieldlink_store::Store;
use fieldlink_types::{DeviceId, SensorSample};
use time::OffsetDateTime;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::warn;

use crate::auth::TokenIssuer;
use crate::config::Config;
use crate::registry::SessionRegistry;
use crate::session::{DeviceGateway, GatewayError};

/// Shared application state.
pub struct AppState {
    /// The data store (wrapped in Mutex for thread-safe access).
    pub store: Mutex<Store>,
    /// Configuration as loaded at startup.
    pub config: Config,
    /// Open device connections and their command routes.
    pub registry: SessionRegistry,
    /// Bearer token issuer for the account API.
    pub tokens: TokenIssuer,
    /// Cancelled when the process begins shutting down.
    pub shutdown: CancellationToken,
    /// Device connection tasks, awaited on shutdown.
    pub connections: TaskTracker,
}

impl AppState {
    /// Create new application state.
    ///
    /// Without a configured `auth.jwt_secret` a random secret is used, so
    /// issued bearer tokens stop working when the process restarts.
    pub fn new(store: Store, config: Config) -> Arc<Self> {
        let ttl = config.auth.token_ttl_secs;
        let tokens = match &config.auth.jwt_secret {
            Some(secret) => TokenIssuer::new(secret, ttl),
            None => {
                warn!("No auth.jwt_secret configured; using an ephemeral signing key");
                TokenIssuer::ephemeral(ttl)
            }
        };

        Arc::new(Self {
            store: Mutex::new(store),
            config,
            registry: SessionRegistry::new(),
            tokens,
            shutdown: CancellationToken::new(),
            connections: TaskTracker::new(),
        })
    }
}

#[async_trait]
impl DeviceGateway for AppState {
    async fn find_device_by_token(&self, token: &str) -> Result<Option<DeviceId>, GatewayError> {
        let store = self.store.lock().await;
        Ok(store.find_device_by_token(token)?)
    }

    async fn insert_reading(
        &self,
        device_id: DeviceId,
        sample: &SensorSample,
        recorded_at: OffsetDateTime,
    ) -> Result<i64, GatewayError> {
        let store = self.store.lock().await;
        Ok(store.insert_reading(device_id, sample, recorded_at)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fieldlink_store::NewDevice;
    use fieldlink_types::RelayState;

    fn test_state() -> Arc<AppState> {
        let store = Store::open_in_memory().unwrap();
        AppState::new(store, Config::default())
    }

    #[tokio::test]
    async fn test_app_state_new() {
        let state = test_state();
        assert_eq!(state.registry.connection_count(), 0);
        assert!(!state.shutdown.is_cancelled());

        let store = state.store.lock().await;
        assert_eq!(store.count_readings(None).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_app_state_uses_configured_secret() {
        let mut config = Config::default();
        config.auth.jwt_secret = Some("configured-secret-key".to_string());
        let state = AppState::new(Store::open_in_memory().unwrap(), config);

        let token = state.tokens.issue(1, "farmer").unwrap();
        let other = TokenIssuer::new("configured-secret-key", 60);
        assert_eq!(other.verify(&token).unwrap().sub, "1");
    }

    #[tokio::test]
    async fn test_gateway_over_store() {
        let state = test_state();
        let device_id = {
            let store = state.store.lock().await;
            let account = store
                .create_account("farmer", "farmer@example.com", "hash")
                .unwrap();
            store
                .create_device(&NewDevice {
                    account_id: account.id,
                    name: "greenhouse",
                    device_type: None,
                    token: "T1",
                })
                .unwrap()
                .id
        };

        assert_eq!(
            state.find_device_by_token("T1").await.unwrap(),
            Some(device_id)
        );
        assert_eq!(state.find_device_by_token("BAD").await.unwrap(), None);

        let sample = SensorSample {
            temperature: 21.0,
            humidity: 55.0,
            light_level: 300.0,
            soil_moisture: 35.0,
            co2_ppm: 420.0,
            rain_analog: 1023.0,
            relay_status: RelayState::Off,
        };
        state
            .insert_reading(device_id, &sample, OffsetDateTime::now_utc())
            .await
            .unwrap();

        let err = state
            .insert_reading(device_id + 1, &sample, OffsetDateTime::now_utc())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::DeviceGone(_)));
    }
}
