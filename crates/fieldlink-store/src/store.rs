//! Main store implementation.

use std::path::Path;

use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row};
use time::OffsetDateTime;
use tracing::{debug, info};

use fieldlink_types::{DeviceId, RelayState, SensorSample};

use crate::error::{Error, Result, is_foreign_key_violation, is_unique_violation};
use crate::models::{
    FieldStats, NewDevice, ReadingStats, StoredAccount, StoredDevice, StoredReading,
};
use crate::queries::{READING_COLUMNS, ReadingQuery};
use crate::schema;

/// SQLite-based store for accounts, devices and sensor readings.
pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open or create a database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            std::fs::create_dir_all(parent).map_err(|e| Error::CreateDirectory {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        info!("Opening database at {}", path.display());
        let conn = Connection::open(path)?;

        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;",
        )?;

        schema::initialize(&conn)?;

        Ok(Self { conn })
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        schema::initialize(&conn)?;
        Ok(Self { conn })
    }
}

fn timestamp_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<OffsetDateTime> {
    let secs: i64 = row.get(idx)?;
    OffsetDateTime::from_unix_timestamp(secs)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Integer, Box::new(e)))
}

fn relay_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<RelayState> {
    let raw: u8 = row.get(idx)?;
    RelayState::try_from(raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Integer, Box::new(e)))
}

fn account_from_row(row: &Row<'_>) -> rusqlite::Result<StoredAccount> {
    Ok(StoredAccount {
        id: row.get(0)?,
        username: row.get(1)?,
        email: row.get(2)?,
        password_hash: row.get(3)?,
        created_at: timestamp_at(row, 4)?,
    })
}

fn device_from_row(row: &Row<'_>) -> rusqlite::Result<StoredDevice> {
    Ok(StoredDevice {
        id: row.get(0)?,
        account_id: row.get(1)?,
        name: row.get(2)?,
        device_type: row.get(3)?,
        token: row.get(4)?,
        created_at: timestamp_at(row, 5)?,
    })
}

fn reading_from_row(row: &Row<'_>) -> rusqlite::Result<StoredReading> {
    Ok(StoredReading {
        id: row.get(0)?,
        device_id: row.get(1)?,
        recorded_at: timestamp_at(row, 2)?,
        temperature: row.get(3)?,
        humidity: row.get(4)?,
        light_level: row.get(5)?,
        soil_moisture: row.get(6)?,
        co2_ppm: row.get(7)?,
        rain_analog: row.get(8)?,
        relay_status: relay_at(row, 9)?,
    })
}

const ACCOUNT_COLUMNS: &str = "id, username, email, password_hash, created_at";
const DEVICE_COLUMNS: &str = "id, account_id, name, device_type, token, created_at";

// Account operations
impl Store {
    /// Register a new account.
    ///
    /// Returns [`Error::Conflict`] if the email is already taken.
    pub fn create_account(
        &self,
        username: &str,
        email: &str,
        password_hash: &str,
    ) -> Result<StoredAccount> {
        let now = OffsetDateTime::now_utc().unix_timestamp();

        self.conn
            .execute(
                "INSERT INTO accounts (username, email, password_hash, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![username, email, password_hash, now],
            )
            .map_err(|e| {
                if is_unique_violation(&e) {
                    Error::Conflict(format!("account with email {}", email))
                } else {
                    Error::Database(e)
                }
            })?;

        let id = self.conn.last_insert_rowid();
        info!("Created account {} ({})", id, username);

        self.get_account(id)?.ok_or(Error::AccountNotFound(id))
    }

    /// Get an account by ID.
    pub fn get_account(&self, id: i64) -> Result<Option<StoredAccount>> {
        let account = self
            .conn
            .query_row(
                &format!("SELECT {} FROM accounts WHERE id = ?", ACCOUNT_COLUMNS),
                [id],
                account_from_row,
            )
            .optional()?;
        Ok(account)
    }

    /// Look up an account by its login email.
    pub fn find_account_by_email(&self, email: &str) -> Result<Option<StoredAccount>> {
        let account = self
            .conn
            .query_row(
                &format!("SELECT {} FROM accounts WHERE email = ?", ACCOUNT_COLUMNS),
                [email],
                account_from_row,
            )
            .optional()?;
        Ok(account)
    }

    /// Replace an account's password hash.
    pub fn update_password(&self, id: i64, password_hash: &str) -> Result<()> {
        let updated = self.conn.execute(
            "UPDATE accounts SET password_hash = ?2 WHERE id = ?1",
            rusqlite::params![id, password_hash],
        )?;

        if updated == 0 {
            return Err(Error::AccountNotFound(id));
        }
        Ok(())
    }

    /// Delete an account together with its devices and their readings.
    ///
    /// Returns `false` if no such account existed.
    pub fn delete_account(&self, id: i64) -> Result<bool> {
        let deleted = self
            .conn
            .execute("DELETE FROM accounts WHERE id = ?", [id])?;
        if deleted > 0 {
            info!("Deleted account {}", id);
        }
        Ok(deleted > 0)
    }
}

// Device operations
impl Store {
    /// Register a device for an account.
    ///
    /// Returns [`Error::Conflict`] if the token is already in use and
    /// [`Error::AccountNotFound`] if the owner does not exist.
    pub fn create_device(&self, device: &NewDevice<'_>) -> Result<StoredDevice> {
        let now = OffsetDateTime::now_utc().unix_timestamp();

        self.conn
            .execute(
                "INSERT INTO devices (account_id, name, device_type, token, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![
                    device.account_id,
                    device.name,
                    device.device_type,
                    device.token,
                    now
                ],
            )
            .map_err(|e| {
                if is_unique_violation(&e) {
                    Error::Conflict("device token".to_string())
                } else if is_foreign_key_violation(&e) {
                    Error::AccountNotFound(device.account_id)
                } else {
                    Error::Database(e)
                }
            })?;

        let id = self.conn.last_insert_rowid();
        info!(
            "Registered device {} ({}) for account {}",
            id, device.name, device.account_id
        );

        self.get_device(id)?.ok_or(Error::DeviceNotFound(id))
    }

    /// Get a device by ID.
    pub fn get_device(&self, id: DeviceId) -> Result<Option<StoredDevice>> {
        let device = self
            .conn
            .query_row(
                &format!("SELECT {} FROM devices WHERE id = ?", DEVICE_COLUMNS),
                [id],
                device_from_row,
            )
            .optional()?;
        Ok(device)
    }

    /// List the devices owned by an account, oldest registration first.
    pub fn list_devices(&self, account_id: i64) -> Result<Vec<StoredDevice>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM devices WHERE account_id = ? ORDER BY id",
            DEVICE_COLUMNS
        ))?;

        let devices = stmt
            .query_map([account_id], device_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(devices)
    }

    /// Update a device's name and/or type. `None` leaves a field unchanged.
    ///
    /// Returns `None` if the device does not exist.
    pub fn update_device(
        &self,
        id: DeviceId,
        name: Option<&str>,
        device_type: Option<&str>,
    ) -> Result<Option<StoredDevice>> {
        let updated = self.conn.execute(
            "UPDATE devices SET
                name = COALESCE(?2, name),
                device_type = COALESCE(?3, device_type)
             WHERE id = ?1",
            rusqlite::params![id, name, device_type],
        )?;

        if updated == 0 {
            return Ok(None);
        }
        self.get_device(id)
    }

    /// Delete a device and its readings.
    ///
    /// Returns `false` if no such device existed.
    pub fn delete_device(&self, id: DeviceId) -> Result<bool> {
        let deleted = self.conn.execute("DELETE FROM devices WHERE id = ?", [id])?;
        if deleted > 0 {
            info!("Deleted device {}", id);
        }
        Ok(deleted > 0)
    }

    /// Resolve a connection token to the device it belongs to.
    ///
    /// Tokens are compared for exact equality.
    pub fn find_device_by_token(&self, token: &str) -> Result<Option<DeviceId>> {
        let id = self
            .conn
            .query_row("SELECT id FROM devices WHERE token = ?", [token], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(id)
    }
}

// Reading operations
impl Store {
    /// Append a reading for a device.
    ///
    /// Returns [`Error::DeviceNotFound`] if the device has been deleted.
    pub fn insert_reading(
        &self,
        device_id: DeviceId,
        sample: &SensorSample,
        recorded_at: OffsetDateTime,
    ) -> Result<i64> {
        self.conn
            .execute(
                "INSERT INTO readings (device_id, recorded_at, temperature, humidity,
                 light_level, soil_moisture, co2_ppm, rain_analog, relay_status)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                rusqlite::params![
                    device_id,
                    recorded_at.unix_timestamp(),
                    sample.temperature,
                    sample.humidity,
                    sample.light_level,
                    sample.soil_moisture,
                    sample.co2_ppm,
                    sample.rain_analog,
                    u8::from(sample.relay_status),
                ],
            )
            .map_err(|e| {
                if is_foreign_key_violation(&e) {
                    Error::DeviceNotFound(device_id)
                } else {
                    Error::Database(e)
                }
            })?;

        Ok(self.conn.last_insert_rowid())
    }

    /// Query readings with filters.
    pub fn query_readings(&self, query: &ReadingQuery) -> Result<Vec<StoredReading>> {
        let sql = query.build_sql();
        let (_, params) = query.build_where();

        debug!("Executing query: {}", sql);

        let params_ref: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();

        let mut stmt = self.conn.prepare(&sql)?;
        let readings = stmt
            .query_map(params_ref.as_slice(), reading_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(readings)
    }

    /// Get the latest reading for a device.
    pub fn get_latest_reading(&self, device_id: DeviceId) -> Result<Option<StoredReading>> {
        let query = ReadingQuery::new().device(device_id).limit(1);
        let mut readings = self.query_readings(&query)?;
        Ok(readings.pop())
    }

    /// Count readings, optionally for a single device.
    pub fn count_readings(&self, device_id: Option<DeviceId>) -> Result<u64> {
        let count: i64 = match device_id {
            Some(id) => self.conn.query_row(
                "SELECT COUNT(*) FROM readings WHERE device_id = ?",
                [id],
                |row| row.get(0),
            )?,
            None => self
                .conn
                .query_row("SELECT COUNT(*) FROM readings", [], |row| row.get(0))?,
        };

        Ok(count as u64)
    }

    /// Summarize the readings matched by a query.
    ///
    /// Only the device and time-range filters apply; ordering and pagination
    /// are ignored.
    pub fn reading_stats(&self, query: &ReadingQuery) -> Result<ReadingStats> {
        let (where_clause, params) = query.build_where();
        let sql = format!(
            "SELECT COUNT(*), MIN(recorded_at), MAX(recorded_at),
                MIN(temperature), MAX(temperature), AVG(temperature),
                MIN(humidity), MAX(humidity), AVG(humidity),
                MIN(light_level), MAX(light_level), AVG(light_level),
                MIN(soil_moisture), MAX(soil_moisture), AVG(soil_moisture),
                MIN(co2_ppm), MAX(co2_ppm), AVG(co2_ppm),
                MIN(rain_analog), MAX(rain_analog), AVG(rain_analog),
                AVG(relay_status)
             FROM readings {}",
            where_clause
        );

        let params_ref: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();

        let stats = self.conn.query_row(&sql, params_ref.as_slice(), |row| {
            let field = |base: usize| -> rusqlite::Result<Option<FieldStats>> {
                let min: Option<f64> = row.get(base)?;
                let max: Option<f64> = row.get(base + 1)?;
                let avg: Option<f64> = row.get(base + 2)?;
                Ok(match (min, max, avg) {
                    (Some(min), Some(max), Some(avg)) => Some(FieldStats { min, max, avg }),
                    _ => None,
                })
            };
            let optional_time = |idx: usize| -> rusqlite::Result<Option<OffsetDateTime>> {
                match row.get::<_, Option<i64>>(idx)? {
                    Some(_) => timestamp_at(row, idx).map(Some),
                    None => Ok(None),
                }
            };

            Ok(ReadingStats {
                count: row.get::<_, i64>(0)? as u64,
                first_at: optional_time(1)?,
                last_at: optional_time(2)?,
                temperature: field(3)?,
                humidity: field(6)?,
                light_level: field(9)?,
                soil_moisture: field(12)?,
                co2_ppm: field(15)?,
                rain_analog: field(18)?,
                relay_on_ratio: row.get(21)?,
            })
        })?;

        Ok(stats)
    }
}
