//! REST API endpoints for accounts and their devices.
//!
//! Every route except `/api/health`, `/api/auth/register` and
//! `/api/auth/login` requires a bearer token (see [`AuthUser`]). Device routes
//! only ever see devices owned by the caller; someone else's device id is
//! reported as not found.
//!
//! # Lock Acquisition
//!
//! Handlers take `state.store` for the duration of their database work only.
//! Password hashing runs on the blocking pool before the lock is taken.
//!
//! # Error Handling
//!
//! All endpoints return structured JSON errors via [`AppError`]. Store errors
//! return HTTP 500 with a fixed message and the detail is logged; duplicate
//! emails and device tokens return 409.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
};
use fieldlink_store::{NewDevice, ReadingQuery, ReadingStats, Store, StoredDevice, StoredReading};
use fieldlink_types::{DeviceId, Outbound, RelayState};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{error, info};

use crate::auth::{self, AuthError, AuthUser};
use crate::registry::DeliveryError;
use crate::state::AppState;

/// Shortest accepted password.
pub const MIN_PASSWORD_LEN: usize = 8;

/// Create the API router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/health", get(health))
        // Accounts
        .route("/api/auth/register", post(register))
        .route("/api/auth/login", post(login))
        .route("/api/auth/change-password", post(change_password))
        .route("/api/auth/account", delete(delete_account))
        // Devices
        .route("/api/device/add-device", post(add_device))
        .route("/api/device/register-device", post(add_device))
        .route("/api/device/my-devices", get(my_devices))
        .route(
            "/api/device/{id}",
            get(get_device).put(update_device).delete(delete_device),
        )
        .route("/api/device/{id}/readings", get(get_readings))
        .route("/api/device/{id}/latest", get(get_latest_reading))
        .route("/api/device/{id}/stats", get(get_stats))
        .route("/api/device/{id}/relay", post(send_relay))
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    /// Open device connections, authenticated or not.
    pub active_sessions: usize,
    /// Devices with an authenticated session.
    pub connected_devices: usize,
}

/// Health check endpoint.
async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        timestamp: OffsetDateTime::now_utc(),
        active_sessions: state.registry.connection_count(),
        connected_devices: state.registry.authenticated_count().await,
    })
}

// ==========================================================================
// Accounts
// ==========================================================================

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub username: String,
    pub email: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct ChangePasswordRequest {
    pub current_password: String,
    pub new_password: String,
}

/// Public view of an account.
#[derive(Debug, Serialize)]
pub struct UserSummary {
    pub id: i64,
    pub username: String,
}

#[derive(Debug, Serialize)]
pub struct RegisterResponse {
    pub message: &'static str,
    pub user: UserSummary,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub message: &'static str,
    pub token: String,
    pub user: UserSummary,
}

fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

fn validate_password(field: &str, password: &str) -> Result<(), AppError> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(AppError::BadRequest(format!(
            "{} must be at least {} characters",
            field, MIN_PASSWORD_LEN
        )));
    }
    Ok(())
}

/// Hash on the blocking pool; Argon2 is deliberately expensive.
async fn hash_password(password: String) -> Result<String, AppError> {
    tokio::task::spawn_blocking(move || auth::hash_password(&password))
        .await
        .map_err(|e| AppError::Internal(format!("Hashing task failed: {}", e)))?
        .map_err(AppError::from)
}

async fn verify_password(password: String, hash: String) -> Result<bool, AppError> {
    tokio::task::spawn_blocking(move || auth::verify_password(&password, &hash))
        .await
        .map_err(|e| AppError::Internal(format!("Hashing task failed: {}", e)))?
        .map_err(AppError::from)
}

/// Register a new account.
///
/// # Errors
///
/// - [`AppError::BadRequest`] if a field is empty or the password is too short
/// - [`AppError::Conflict`] if the email is already registered
async fn register(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<RegisterResponse>), AppError> {
    let username = req.username.trim();
    let email = normalize_email(&req.email);

    if username.is_empty() || email.is_empty() || req.password.is_empty() {
        return Err(AppError::BadRequest(
            "username, email and password are required".to_string(),
        ));
    }
    validate_password("password", &req.password)?;

    let password_hash = hash_password(req.password).await?;

    let store = state.store.lock().await;
    let account = store.create_account(username, &email, &password_hash)?;

    Ok((
        StatusCode::CREATED,
        Json(RegisterResponse {
            message: "Register user Success",
            user: UserSummary {
                id: account.id,
                username: account.username,
            },
        }),
    ))
}

/// Exchange email and password for a bearer token.
///
/// Unknown emails and wrong passwords get the same 401 response.
async fn login(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, AppError> {
    let rejected = || AppError::Unauthorized("Email or password failed".to_string());

    let account = {
        let store = state.store.lock().await;
        store.find_account_by_email(&normalize_email(&req.email))?
    }
    .ok_or_else(rejected)?;

    if !verify_password(req.password, account.password_hash.clone()).await? {
        return Err(rejected());
    }

    let token = state.tokens.issue(account.id, &account.username)?;
    info!("Account {} logged in", account.id);

    Ok(Json(LoginResponse {
        message: "Login success",
        token,
        user: UserSummary {
            id: account.id,
            username: account.username,
        },
    }))
}

/// Change the caller's password.
async fn change_password(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Json(req): Json<ChangePasswordRequest>,
) -> Result<StatusCode, AppError> {
    validate_password("new_password", &req.new_password)?;

    let account = {
        let store = state.store.lock().await;
        store.get_account(user.account_id)?
    }
    .ok_or_else(|| AppError::Unauthorized("Account no longer exists".to_string()))?;

    if !verify_password(req.current_password, account.password_hash).await? {
        return Err(AppError::Unauthorized(
            "Current password is incorrect".to_string(),
        ));
    }

    let password_hash = hash_password(req.new_password).await?;
    let store = state.store.lock().await;
    store.update_password(user.account_id, &password_hash)?;

    info!("Account {} changed password", user.account_id);
    Ok(StatusCode::NO_CONTENT)
}

/// Delete the caller's account with all its devices and readings.
async fn delete_account(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
) -> Result<StatusCode, AppError> {
    let store = state.store.lock().await;
    if !store.delete_account(user.account_id)? {
        return Err(AppError::NotFound(format!(
            "Account not found: {}",
            user.account_id
        )));
    }
    Ok(StatusCode::NO_CONTENT)
}

// ==========================================================================
// Devices
// ==========================================================================

#[derive(Debug, Deserialize)]
pub struct AddDeviceRequest {
    pub device_name: String,
    #[serde(default)]
    pub device_type: Option<String>,
    pub device_token: String,
}

#[derive(Debug, Deserialize)]
pub struct UpdateDeviceRequest {
    #[serde(default)]
    pub device_name: Option<String>,
    #[serde(default)]
    pub device_type: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct DeviceResponse {
    pub message: &'static str,
    pub device: StoredDevice,
}

/// Fetch a device the caller owns.
fn owned_device(store: &Store, user: &AuthUser, id: DeviceId) -> Result<StoredDevice, AppError> {
    store
        .get_device(id)?
        .filter(|device| device.account_id == user.account_id)
        .ok_or_else(|| AppError::NotFound(format!("Device not found: {}", id)))
}

/// Register a device under the caller's account.
///
/// Served on both `/api/device/add-device` and `/api/device/register-device`.
async fn add_device(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Json(req): Json<AddDeviceRequest>,
) -> Result<(StatusCode, Json<DeviceResponse>), AppError> {
    let name = req.device_name.trim();
    if name.is_empty() || req.device_token.is_empty() {
        return Err(AppError::BadRequest(
            "device_name and device_token are required".to_string(),
        ));
    }
    let device_type = req
        .device_type
        .as_deref()
        .map(str::trim)
        .filter(|t| !t.is_empty());

    let store = state.store.lock().await;
    let device = store.create_device(&NewDevice {
        account_id: user.account_id,
        name,
        device_type,
        token: &req.device_token,
    })?;

    Ok((
        StatusCode::CREATED,
        Json(DeviceResponse {
            message: "Device added successfully",
            device,
        }),
    ))
}

/// List the caller's devices.
async fn my_devices(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
) -> Result<Json<Vec<StoredDevice>>, AppError> {
    let store = state.store.lock().await;
    Ok(Json(store.list_devices(user.account_id)?))
}

async fn get_device(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(id): Path<DeviceId>,
) -> Result<Json<StoredDevice>, AppError> {
    let store = state.store.lock().await;
    Ok(Json(owned_device(&store, &user, id)?))
}

/// Rename or retype a device. Omitted fields keep their value.
async fn update_device(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(id): Path<DeviceId>,
    Json(req): Json<UpdateDeviceRequest>,
) -> Result<Json<DeviceResponse>, AppError> {
    let name = req.device_name.as_deref().map(str::trim);
    if name.is_some_and(str::is_empty) {
        return Err(AppError::BadRequest(
            "device_name cannot be empty".to_string(),
        ));
    }

    let store = state.store.lock().await;
    owned_device(&store, &user, id)?;
    let device = store
        .update_device(id, name, req.device_type.as_deref().map(str::trim))?
        .ok_or_else(|| AppError::NotFound(format!("Device not found: {}", id)))?;

    Ok(Json(DeviceResponse {
        message: "Device updated successfully",
        device,
    }))
}

/// Delete a device and its readings.
///
/// A live session for the device is not closed; its next reading fails to
/// persist and is dropped.
async fn delete_device(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(id): Path<DeviceId>,
) -> Result<StatusCode, AppError> {
    let store = state.store.lock().await;
    owned_device(&store, &user, id)?;
    store.delete_device(id)?;
    Ok(StatusCode::NO_CONTENT)
}

// ==========================================================================
// Readings
// ==========================================================================

/// Query parameters for readings.
#[derive(Debug, Deserialize, Default)]
pub struct ReadingsQuery {
    pub since: Option<i64>,
    pub until: Option<i64>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

impl ReadingsQuery {
    /// Validate the query parameters.
    /// Returns an error if a timestamp is out of range or `since > until`.
    pub fn validate(&self) -> Result<(), AppError> {
        if let Some(since) = self.since {
            parse_timestamp("since", since)?;
        }
        if let Some(until) = self.until {
            parse_timestamp("until", until)?;
        }
        if let (Some(since), Some(until)) = (self.since, self.until)
            && since > until
        {
            return Err(AppError::BadRequest(format!(
                "Invalid time range: 'since' ({}) must be less than or equal to 'until' ({})",
                since, until
            )));
        }
        Ok(())
    }

    /// Store query for one device with the time range applied.
    fn to_query(&self, device_id: DeviceId) -> Result<ReadingQuery, AppError> {
        let mut query = ReadingQuery::new().device(device_id);

        if let Some(since) = self.since {
            query = query.since(parse_timestamp("since", since)?);
        }
        if let Some(until) = self.until {
            query = query.until(parse_timestamp("until", until)?);
        }

        Ok(query)
    }
}

fn parse_timestamp(field: &str, secs: i64) -> Result<OffsetDateTime, AppError> {
    OffsetDateTime::from_unix_timestamp(secs).map_err(|_| {
        AppError::BadRequest(format!("Invalid '{}' timestamp: {}", field, secs))
    })
}

/// Paginated response wrapper with metadata.
#[derive(Debug, Serialize)]
pub struct PaginatedResponse<T> {
    /// The data items.
    pub data: Vec<T>,
    /// Pagination metadata.
    pub pagination: PaginationMeta,
}

/// Pagination metadata.
#[derive(Debug, Serialize)]
pub struct PaginationMeta {
    /// Number of items returned.
    pub count: usize,
    /// Offset from the beginning.
    pub offset: u32,
    /// Maximum items requested (if specified).
    pub limit: Option<u32>,
    /// Whether there are more items available.
    pub has_more: bool,
}

/// Get readings for a device, newest first.
///
/// # Query Parameters
///
/// - `since`: Unix timestamp to filter readings from (inclusive)
/// - `until`: Unix timestamp to filter readings until (inclusive)
/// - `limit`: Maximum number of readings to return
/// - `offset`: Number of readings to skip (for pagination)
async fn get_readings(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(id): Path<DeviceId>,
    Query(params): Query<ReadingsQuery>,
) -> Result<Json<PaginatedResponse<StoredReading>>, AppError> {
    params.validate()?;

    let mut query = params.to_query(id)?;

    // Request one extra item to determine if there are more
    if let Some(limit) = params.limit {
        query = query.limit(limit.saturating_add(1));
    }
    if let Some(offset) = params.offset {
        query = query.offset(offset);
    }

    let store = state.store.lock().await;
    owned_device(&store, &user, id)?;
    let mut readings = store.query_readings(&query)?;

    let has_more = params.limit.is_some_and(|l| readings.len() > l as usize);
    if has_more {
        readings.pop();
    }

    Ok(Json(PaginatedResponse {
        pagination: PaginationMeta {
            count: readings.len(),
            offset: params.offset.unwrap_or(0),
            limit: params.limit,
            has_more,
        },
        data: readings,
    }))
}

async fn get_latest_reading(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(id): Path<DeviceId>,
) -> Result<Json<StoredReading>, AppError> {
    let store = state.store.lock().await;
    owned_device(&store, &user, id)?;
    let reading = store
        .get_latest_reading(id)?
        .ok_or_else(|| AppError::NotFound(format!("No readings for device: {}", id)))?;
    Ok(Json(reading))
}

/// Summary statistics for a device over an optional time range.
///
/// `limit` and `offset` are accepted but ignored.
async fn get_stats(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(id): Path<DeviceId>,
    Query(params): Query<ReadingsQuery>,
) -> Result<Json<ReadingStats>, AppError> {
    params.validate()?;

    let store = state.store.lock().await;
    owned_device(&store, &user, id)?;
    let query = params.to_query(id)?;
    Ok(Json(store.reading_stats(&query)?))
}

// ==========================================================================
// Relay commands
// ==========================================================================

#[derive(Debug, Deserialize)]
pub struct RelayRequest {
    pub relay_status: RelayState,
}

#[derive(Debug, Serialize)]
pub struct RelayResponse {
    pub message: &'static str,
    pub device_id: DeviceId,
    pub relay_status: RelayState,
}

/// Push a relay command to one of the caller's connected devices.
async fn send_relay(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(id): Path<DeviceId>,
    Json(req): Json<RelayRequest>,
) -> Result<(StatusCode, Json<RelayResponse>), AppError> {
    {
        let store = state.store.lock().await;
        owned_device(&store, &user, id)?;
    }

    state
        .registry
        .send(id, Outbound::relay(req.relay_status))
        .await
        .map_err(AppError::from)?;

    info!("Queued relay {} for device {}", req.relay_status, id);
    Ok((
        StatusCode::ACCEPTED,
        Json(RelayResponse {
            message: "Relay command sent",
            device_id: id,
            relay_status: req.relay_status,
        }),
    ))
}

// ==========================================================================
// Errors
// ==========================================================================

/// Application error type.
#[derive(Debug)]
pub enum AppError {
    NotFound(String),
    BadRequest(String),
    Unauthorized(String),
    Conflict(String),
    Store(fieldlink_store::Error),
    Internal(String),
}

impl From<fieldlink_store::Error> for AppError {
    fn from(e: fieldlink_store::Error) -> Self {
        match e {
            fieldlink_store::Error::Conflict(what) => {
                AppError::Conflict(format!("{} already exists", what))
            }
            other => AppError::Store(other),
        }
    }
}

impl From<DeliveryError> for AppError {
    fn from(e: DeliveryError) -> Self {
        AppError::Conflict(e.to_string())
    }
}

impl From<AuthError> for AppError {
    fn from(e: AuthError) -> Self {
        AppError::Internal(e.to_string())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let (status, message) = match self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            AppError::Store(e) => {
                error!("Store error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
            AppError::Internal(msg) => {
                error!("Internal error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };

        let body = serde_json::json!({
            "error": message,
        });

        (status, Json(body)).into_response()
    }
}
