//! Sensor device gateway and account REST API.
//!
//! This crate provides a service that:
//! - Accepts persistent connections from field sensor devices over WebSocket
//!   (`/ws`) or raw newline-delimited JSON on TCP
//! - Authenticates each connection once with the device's pre-shared token
//! - Stores streamed sensor readings and acknowledges each one
//! - Echoes relay commands and lets owners push relay commands to a live device
//! - Exposes a REST API for accounts, devices, readings and statistics
//!
//! # Device Protocol
//!
//! ```text
//! -> {"type":"auth","device_token":"T1"}
//! <- {"status":"Authorized","deviceId":42}
//! -> {"type":"sensor_reading","temperature":25.3,"humidity":60,"light_level":100,
//!     "soil_moisture":40,"co2_ppm":410,"rain_analog":0,"relay_status":1}
//! <- {"status":"DataReceived","timestamp":"2026-03-01T12:30:00Z"}
//! -> {"type":"control_relay","relay_status":0}
//! <- {"type":"relay_control","relay_status":0}
//! ```
//!
//! An unknown token gets `{"status":"Unauthorized"}` and the connection is
//! closed. Malformed or out-of-order messages get
//! `{"status":"error","message":...}` and the connection stays open.
//!
//! # REST API Endpoints
//!
//! - `GET /api/health` - Service health check (no auth required)
//! - `POST /api/auth/register`, `POST /api/auth/login` - Accounts
//! - `POST /api/auth/change-password`, `DELETE /api/auth/account`
//! - `POST /api/device/add-device` - Register a device
//! - `GET /api/device/my-devices` - List the caller's devices
//! - `GET|PUT|DELETE /api/device/{id}` - Manage one device
//! - `GET /api/device/{id}/readings` - Query readings with filters
//! - `GET /api/device/{id}/latest`, `GET /api/device/{id}/stats`
//! - `POST /api/device/{id}/relay` - Push a relay command to a live device
//!
//! # Configuration
//!
//! The service reads configuration from `~/.config/fieldlink/server.toml`:
//!
//! ```toml
//! [server]
//! bind = "127.0.0.1:3000"
//!
//! [storage]
//! path = "~/.local/share/fieldlink/data.db"
//!
//! [auth]
//! jwt_secret = "change-me-to-a-long-random-string"
//! token_ttl_secs = 3600
//!
//! [session]
//! auth_timeout_secs = 30
//! tcp_bind = "0.0.0.0:3001"
//! max_frame_bytes = 8192
//! ```

use std::sync::Arc;

use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub mod api;
pub mod auth;
pub mod config;
pub mod connection;
pub mod registry;
pub mod session;
pub mod state;
pub mod tcp;
pub mod ws;

pub use config::{
    AuthConfig, Config, ConfigError, ServerConfig, SessionConfig, StorageConfig, ValidationError,
};
pub use registry::SessionRegistry;
pub use session::{DeviceGateway, GatewayError, Session, SessionState};
pub use state::AppState;

/// Build the HTTP application: REST API plus the `/ws` device endpoint.
///
/// Serve it with `into_make_service_with_connect_info::<SocketAddr>()` so
/// device sessions can log their peer address.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .merge(api::router())
        .merge(ws::router())
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}
