//! Data models for stored data.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use fieldlink_types::{DeviceId, RelayState, SensorSample};

/// An account that owns devices.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredAccount {
    /// Database row ID.
    pub id: i64,
    /// Display name.
    pub username: String,
    /// Login email (unique).
    pub email: String,
    /// PHC-formatted password hash. Never serialized.
    #[serde(skip_serializing, default)]
    pub password_hash: String,
    /// When the account was registered.
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// A device registered by an account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredDevice {
    /// Database row ID; this is the `deviceId` reported to the device on auth.
    pub id: DeviceId,
    /// Owning account.
    pub account_id: i64,
    /// Friendly name.
    pub name: String,
    /// Free-form hardware type (e.g. "esp32").
    pub device_type: Option<String>,
    /// Pre-shared connection token.
    pub token: String,
    /// When the device was registered.
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Fields needed to register a device.
#[derive(Debug, Clone)]
pub struct NewDevice<'a> {
    pub account_id: i64,
    pub name: &'a str,
    pub device_type: Option<&'a str>,
    pub token: &'a str,
}

/// A reading stored in the database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredReading {
    /// Database row ID.
    pub id: i64,
    /// Device that reported the sample.
    pub device_id: DeviceId,
    /// Server receive time.
    #[serde(with = "time::serde::rfc3339")]
    pub recorded_at: OffsetDateTime,
    pub temperature: f64,
    pub humidity: f64,
    pub light_level: f64,
    pub soil_moisture: f64,
    pub co2_ppm: f64,
    pub rain_analog: f64,
    pub relay_status: RelayState,
}

impl StoredReading {
    /// The sensor values without storage metadata.
    pub fn sample(&self) -> SensorSample {
        SensorSample {
            temperature: self.temperature,
            humidity: self.humidity,
            light_level: self.light_level,
            soil_moisture: self.soil_moisture,
            co2_ppm: self.co2_ppm,
            rain_analog: self.rain_analog,
            relay_status: self.relay_status,
        }
    }
}

/// Minimum, maximum and mean of one numeric column.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FieldStats {
    pub min: f64,
    pub max: f64,
    pub avg: f64,
}

/// Summary statistics over a set of readings.
///
/// Every per-field entry is `None` when `count` is zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadingStats {
    /// Number of readings summarized.
    pub count: u64,
    /// Oldest reading time in the set.
    #[serde(with = "time::serde::rfc3339::option")]
    pub first_at: Option<OffsetDateTime>,
    /// Newest reading time in the set.
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_at: Option<OffsetDateTime>,
    pub temperature: Option<FieldStats>,
    pub humidity: Option<FieldStats>,
    pub light_level: Option<FieldStats>,
    pub soil_moisture: Option<FieldStats>,
    pub co2_ppm: Option<FieldStats>,
    pub rain_analog: Option<FieldStats>,
    /// Fraction of readings with the relay switched on.
    pub relay_on_ratio: Option<f64>,
}
