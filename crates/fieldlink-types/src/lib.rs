//! Wire protocol types for fieldlink sensor devices.
//!
//! This crate holds the message types exchanged between an embedded sensor
//! device and the fieldlink service, shared by the service and by tooling that
//! speaks to it.
//!
//! # Example
//!
//! ```
//! use fieldlink_types::{Inbound, Outbound, Reply};
//!
//! let msg = Inbound::parse(r#"{"type":"auth","device_token":"T1"}"#, 8192)?;
//! assert_eq!(msg.kind(), "auth");
//!
//! let reply: Outbound = Reply::Authorized { device_id: 42 }.into();
//! assert_eq!(reply.encode()?, r#"{"status":"Authorized","deviceId":42}"#);
//! # Ok::<(), fieldlink_types::ProtocolError>(())
//! ```

pub mod error;
pub mod protocol;

pub use error::{ProtocolError, ProtocolResult};
pub use protocol::{
    Command, DeviceId, Inbound, Outbound, RelayState, RelayStateError, Reply, SensorSample,
};
