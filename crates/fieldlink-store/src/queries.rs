//! Query builder for stored readings.
//!
//! # Example
//!
//! ```
//! use fieldlink_store::{ReadingQuery, Store};
//! use time::{Duration, OffsetDateTime};
//!
//! let store = Store::open_in_memory()?;
//! let yesterday = OffsetDateTime::now_utc() - Duration::hours(24);
//!
//! let query = ReadingQuery::new()
//!     .device(42)
//!     .since(yesterday)
//!     .limit(50)
//!     .offset(0);
//!
//! let readings = store.query_readings(&query)?;
//! assert!(readings.is_empty());
//! # Ok::<(), fieldlink_store::Error>(())
//! ```

use time::OffsetDateTime;

use fieldlink_types::DeviceId;

/// Columns selected for a [`StoredReading`](crate::StoredReading), in row order.
pub(crate) const READING_COLUMNS: &str = "id, device_id, recorded_at, temperature, humidity, \
     light_level, soil_moisture, co2_ppm, rain_analog, relay_status";

/// Fluent query builder for readings.
///
/// Used by [`Store::query_readings`](crate::Store::query_readings) and
/// [`Store::reading_stats`](crate::Store::reading_stats). Results are ordered
/// newest first.
#[derive(Debug, Default, Clone)]
pub struct ReadingQuery {
    /// Filter by device ID.
    pub device_id: Option<DeviceId>,
    /// Filter readings recorded at or after this time.
    pub since: Option<OffsetDateTime>,
    /// Filter readings recorded at or before this time.
    pub until: Option<OffsetDateTime>,
    /// Maximum number of results.
    pub limit: Option<u32>,
    /// Offset for pagination.
    pub offset: Option<u32>,
}

impl ReadingQuery {
    /// Create a new query: all devices, no time range, no limit.
    pub fn new() -> Self {
        Self::default()
    }

    /// Only include readings from the specified device.
    pub fn device(mut self, device_id: DeviceId) -> Self {
        self.device_id = Some(device_id);
        self
    }

    /// Filter to readings recorded at or after this time.
    pub fn since(mut self, time: OffsetDateTime) -> Self {
        self.since = Some(time);
        self
    }

    /// Filter to readings recorded at or before this time.
    pub fn until(mut self, time: OffsetDateTime) -> Self {
        self.until = Some(time);
        self
    }

    /// Limit the maximum number of results returned.
    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Skip the first N results.
    pub fn offset(mut self, offset: u32) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Build the SQL WHERE clause and parameters.
    pub(crate) fn build_where(&self) -> (String, Vec<Box<dyn rusqlite::ToSql>>) {
        let mut conditions = Vec::new();
        let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(device_id) = self.device_id {
            conditions.push("device_id = ?");
            params.push(Box::new(device_id));
        }

        if let Some(since) = self.since {
            conditions.push("recorded_at >= ?");
            params.push(Box::new(since.unix_timestamp()));
        }

        if let Some(until) = self.until {
            conditions.push("recorded_at <= ?");
            params.push(Box::new(until.unix_timestamp()));
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        (where_clause, params)
    }

    /// Build the full SQL query.
    ///
    /// Row id breaks ties between readings recorded in the same second.
    pub(crate) fn build_sql(&self) -> String {
        let (where_clause, _) = self.build_where();

        let mut sql = format!(
            "SELECT {} FROM readings {} ORDER BY recorded_at DESC, id DESC",
            READING_COLUMNS, where_clause
        );

        if let Some(limit) = self.limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }

        if let Some(offset) = self.offset {
            // SQLite only accepts OFFSET after LIMIT
            if self.limit.is_none() {
                sql.push_str(" LIMIT -1");
            }
            sql.push_str(&format!(" OFFSET {}", offset));
        }

        sql
    }
}
