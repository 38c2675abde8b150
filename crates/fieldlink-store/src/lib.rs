//! Local persistence for the fieldlink gateway.
//!
//! This crate provides SQLite-based storage for accounts, the sensor devices
//! they register, and the readings those devices stream in.
//!
//! # Features
//!
//! - Accounts with unique login emails
//! - Devices with unique pre-shared connection tokens
//! - Append-only sensor readings stamped with server receive time
//! - Query by device and time range, with pagination and summary statistics
//!
//! Deleting an account removes its devices; deleting a device removes its
//! readings.
//!
//! # Example
//!
//! ```no_run
//! use fieldlink_store::{ReadingQuery, Store};
//!
//! let store = Store::open(fieldlink_store::default_db_path())?;
//!
//! if let Some(device_id) = store.find_device_by_token("T1")? {
//!     let recent = store.query_readings(&ReadingQuery::new().device(device_id).limit(10))?;
//!     println!("{} recent readings", recent.len());
//! }
//! # Ok::<(), fieldlink_store::Error>(())
//! ```

mod error;
mod models;
mod queries;
mod schema;
mod store;

pub use error::{Error, Result};
pub use models::{
    FieldStats, NewDevice, ReadingStats, StoredAccount, StoredDevice, StoredReading,
};
pub use queries::ReadingQuery;
pub use store::Store;

/// Default database path following platform conventions.
///
/// - Linux: `~/.local/share/fieldlink/data.db`
/// - macOS: `~/Library/Application Support/fieldlink/data.db`
/// - Windows: `C:\Users\<user>\AppData\Local\fieldlink\data.db`
pub fn default_db_path() -> std::path::PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join("fieldlink")
        .join("data.db")
}
